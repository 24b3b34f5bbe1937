//! This module is a raft-specific commit log that wraps the generic commit log. The generic log
//! only knows about bytes and indexes; this one knows about terms, commits, and snapshots.

mod log;
mod log_entry;

pub(crate) use log_entry::get_configuration;
pub(crate) use log_entry::put_configuration;
pub(crate) use log_entry::EntryPayload;
pub(crate) use log_entry::WriteAheadLogEntry;

pub(super) use log::WriteAheadLog;
