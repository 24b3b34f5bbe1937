use crate::commitlog;
use crate::replica::{ClusterConfiguration, ReplicaId, ReplicaInfoBlob, ReplicaMetadata, Term};
use bytes::{Buf, BufMut, Bytes};
use std::convert::TryFrom;
use std::io;
use std::net::Ipv4Addr;

/// Byte representation:
///
/// ```text
/// |                                         1                           |
/// | 0 | 1 | 2 | 3 | 4 | 5 | 6 | 7 | 8 | 9 | 0 | 1 | 2 | 3 | 4 | 5 | ... |
/// +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+-...-+
/// |Vrs|       Term (8 bytes)          |Knd|   Payload (variable)    ... |
/// +---+-------------------------------+---+-------------------------...-+
/// ```
///
/// * `Vrs` - version of the serialized payload
/// * `Term` - raft leadership term when this entry was created
/// * `Knd` - payload kind: command, configuration, or no-op
///
/// Not needed:
///
/// * Checksum is not needed, it's guaranteed by underlying commitlog.
/// * Total size is not needed, the underlying commitlog will give us the correctly allocated array.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct WriteAheadLogEntry {
    pub(crate) term: Term,
    pub(crate) payload: EntryPayload,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum EntryPayload {
    /// A client command for the state machine. `(client_id, call_id)` identifies the request
    /// across retries.
    Command {
        client_id: String,
        call_id: u64,
        data: Bytes,
    },
    Configuration(ClusterConfiguration),
    /// Appended by every new leader to commit entries of earlier terms.
    NoOp,
}

impl WriteAheadLogEntry {
    /// Roughly how many bytes this entry takes on the wire, used to bound batches.
    pub(crate) fn approx_size(&self) -> usize {
        let payload_size = match &self.payload {
            EntryPayload::Command { client_id, data, .. } => client_id.len() + 8 + data.len(),
            EntryPayload::Configuration(configuration) => 64 * configuration.voters().count(),
            EntryPayload::NoOp => 0,
        };
        1 + 8 + 1 + payload_size
    }
}

const RAFT_LOG_ENTRY_FORMAT_VERSION: u8 = 2;

const KIND_COMMAND: u8 = 1;
const KIND_CONFIGURATION: u8 = 2;
const KIND_NO_OP: u8 = 3;

impl commitlog::Entry for WriteAheadLogEntry {}

impl From<WriteAheadLogEntry> for Vec<u8> {
    fn from(entry: WriteAheadLogEntry) -> Self {
        let mut buf = Vec::with_capacity(entry.approx_size());
        buf.put_u8(RAFT_LOG_ENTRY_FORMAT_VERSION);
        buf.put_u64_le(entry.term.as_u64());

        match entry.payload {
            EntryPayload::Command {
                client_id,
                call_id,
                data,
            } => {
                buf.put_u8(KIND_COMMAND);
                put_string(&mut buf, &client_id);
                buf.put_u64_le(call_id);
                buf.put_slice(&data);
            }
            EntryPayload::Configuration(configuration) => {
                buf.put_u8(KIND_CONFIGURATION);
                put_configuration(&mut buf, &configuration);
            }
            EntryPayload::NoOp => buf.put_u8(KIND_NO_OP),
        }

        buf
    }
}

impl TryFrom<Vec<u8>> for WriteAheadLogEntry {
    type Error = io::Error;

    fn try_from(bytes: Vec<u8>) -> Result<Self, Self::Error> {
        let mut buf = bytes.as_slice();
        ensure_remaining(&buf, 1 + 8 + 1)?;

        let version = buf.get_u8();
        if version != RAFT_LOG_ENTRY_FORMAT_VERSION {
            return Err(malformed(format!("Unknown log entry version {}", version)));
        }
        let term = Term::new(buf.get_u64_le());

        let payload = match buf.get_u8() {
            KIND_COMMAND => {
                let client_id = get_string(&mut buf)?;
                ensure_remaining(&buf, 8)?;
                let call_id = buf.get_u64_le();
                EntryPayload::Command {
                    client_id,
                    call_id,
                    data: Bytes::copy_from_slice(buf),
                }
            }
            KIND_CONFIGURATION => EntryPayload::Configuration(get_configuration(&mut buf)?),
            KIND_NO_OP => EntryPayload::NoOp,
            kind => return Err(malformed(format!("Unknown log entry kind {}", kind))),
        };

        Ok(WriteAheadLogEntry { term, payload })
    }
}

pub(crate) fn put_configuration(buf: &mut Vec<u8>, configuration: &ClusterConfiguration) {
    put_members(buf, configuration.members());
    match configuration.old_members() {
        Some(old_members) => {
            buf.put_u8(1);
            put_members(buf, old_members);
        }
        None => buf.put_u8(0),
    }
}

pub(crate) fn get_configuration(buf: &mut &[u8]) -> io::Result<ClusterConfiguration> {
    let members = get_members(buf)?;
    ensure_remaining(buf, 1)?;
    match buf.get_u8() {
        0 => Ok(ClusterConfiguration::stable(members)),
        _ => Ok(ClusterConfiguration::joint(get_members(buf)?, members)),
    }
}

fn put_members(buf: &mut Vec<u8>, members: &[ReplicaMetadata]) {
    buf.put_u16_le(members.len() as u16);
    for member in members {
        put_string(buf, member.replica_id().as_str());
        buf.put_u32(u32::from(member.ip_addr()));
        buf.put_u16_le(member.port());
        buf.put_u128_le(member.info_blob().into_inner());
    }
}

fn get_members(buf: &mut &[u8]) -> io::Result<Vec<ReplicaMetadata>> {
    ensure_remaining(buf, 2)?;
    let num_members = buf.get_u16_le() as usize;

    let mut members = Vec::with_capacity(num_members);
    for _ in 0..num_members {
        let replica_id = ReplicaId::new(get_string(buf)?);
        ensure_remaining(buf, 4 + 2 + 16)?;
        let ip_addr = Ipv4Addr::from(buf.get_u32());
        let port = buf.get_u16_le();
        let info_blob = ReplicaInfoBlob::new(buf.get_u128_le());
        members.push(ReplicaMetadata::new(replica_id, ip_addr, port, info_blob));
    }

    Ok(members)
}

fn put_string(buf: &mut Vec<u8>, s: &str) {
    buf.put_u16_le(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn get_string(buf: &mut &[u8]) -> io::Result<String> {
    ensure_remaining(buf, 2)?;
    let len = buf.get_u16_le() as usize;
    ensure_remaining(buf, len)?;

    let s = String::from_utf8(buf[..len].to_vec()).map_err(|_| malformed("String is not utf-8".to_string()))?;
    buf.advance(len);
    Ok(s)
}

fn ensure_remaining(buf: &&[u8], len: usize) -> io::Result<()> {
    if buf.len() < len {
        Err(malformed(format!("Expected {} more bytes, found {}", len, buf.len())))
    } else {
        Ok(())
    }
}

fn malformed(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: &str, port: u16) -> ReplicaMetadata {
        ReplicaMetadata::new(
            ReplicaId::new(id),
            Ipv4Addr::new(10, 0, 0, 7),
            port,
            ReplicaInfoBlob::new(u128::MAX - port as u128),
        )
    }

    fn round_trip(entry: WriteAheadLogEntry) {
        let bytes: Vec<u8> = entry.clone().into();
        assert_eq!(WriteAheadLogEntry::try_from(bytes).unwrap(), entry);
    }

    #[test]
    fn payload_kinds_survive_serialization() {
        round_trip(WriteAheadLogEntry {
            term: Term::new(3),
            payload: EntryPayload::Command {
                client_id: "client-üñí".to_string(),
                call_id: 42,
                data: Bytes::from_static(b"set x=1"),
            },
        });
        round_trip(WriteAheadLogEntry {
            term: Term::new(4),
            payload: EntryPayload::NoOp,
        });
        round_trip(WriteAheadLogEntry {
            term: Term::new(5),
            payload: EntryPayload::Configuration(ClusterConfiguration::joint(
                vec![member("a", 1), member("b", 2)],
                vec![member("b", 2), member("c", 3)],
            )),
        });
    }

    #[test]
    fn rejects_truncated_and_unknown_entries() {
        let bytes: Vec<u8> = WriteAheadLogEntry {
            term: Term::new(1),
            payload: EntryPayload::Configuration(ClusterConfiguration::stable(vec![member("a", 1)])),
        }
        .into();

        let truncated = bytes[..bytes.len() - 3].to_vec();
        assert!(WriteAheadLogEntry::try_from(truncated).is_err());

        let mut unknown_kind = bytes.clone();
        unknown_kind[9] = 99;
        assert!(WriteAheadLogEntry::try_from(unknown_kind).is_err());

        let mut old_version = bytes;
        old_version[0] = 1;
        assert!(WriteAheadLogEntry::try_from(old_version).is_err());
    }
}
