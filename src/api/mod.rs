//! This mod is meant to hold most of the code for the library's client-facing API.
mod client;
mod event_bus;
mod options;
mod replicated_log;
mod state_machine;
mod types;
mod wiring;

pub use client::ChangeMembershipError;
pub use client::RaftClient;
pub use client::ReplicaExited;
pub use client::SnapshotInfo;
pub use client::TakeSnapshotError;
pub use event_bus::RaftElectionState;
pub use event_bus::RaftEvent;
pub use event_bus::RaftEventListener;
pub use options::RaftOptions;
pub use options::RaftOptionsError;
pub use replicated_log::ReplicatedLog;
pub use replicated_log::SubmitError;
pub use replicated_log::SubmitInput;
pub use replicated_log::SubmitOutput;
pub use state_machine::StateMachine;
pub use state_machine::StateMachineError;
pub use types::RaftLeaderInfo;
pub use types::RaftMemberInfo;
pub use types::RaftMemberInfoBlob;
pub use types::RaftPeerStatus;
pub use types::RaftRole;
pub use types::RaftStatus;
pub use wiring::try_create_raft_client;
pub use wiring::RaftClientConfig;
pub use wiring::RaftClientCreationError;
