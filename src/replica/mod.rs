mod applier;
mod cluster;
mod election;
mod local_state;
mod peer_sender;
mod replica;
mod replica_api;
mod replica_wiring;
mod retry_cache;
mod snapshot;
mod write_ahead_log;

pub(crate) use applier::ApplierOutput;
pub(crate) use cluster::ClusterConfiguration;
pub(crate) use cluster::ReplicaId;
pub(crate) use cluster::ReplicaInfoBlob;
pub(crate) use cluster::ReplicaMetadata;
pub(crate) use election::ElectionStateChangeListener;
pub(crate) use election::ElectionStateSnapshot;
pub(crate) use local_state::Term;
pub(crate) use replica::Replica;
pub(crate) use replica::ReplicaOptions;
pub(crate) use replica_api::*;
pub(crate) use replica_wiring::create_replica;
pub(crate) use replica_wiring::ReplicaStorage;
pub(crate) use replica_wiring::ReplicaWiringConfig;
pub(crate) use snapshot::SnapshotMetadata;
pub(crate) use write_ahead_log::EntryPayload;
pub(crate) use write_ahead_log::WriteAheadLogEntry;
