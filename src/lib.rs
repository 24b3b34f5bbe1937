mod actor;
mod api;
mod commitlog;
mod replica;
mod server;
mod transport;
mod grpc {
    include!("../generated/raft.rs");
}

pub use api::try_create_raft_client;
pub use api::ChangeMembershipError;
pub use api::RaftClient;
pub use api::RaftClientConfig;
pub use api::RaftClientCreationError;
pub use api::RaftElectionState;
pub use api::RaftEvent;
pub use api::RaftEventListener;
pub use api::RaftLeaderInfo;
pub use api::RaftMemberInfo;
pub use api::RaftMemberInfoBlob;
pub use api::RaftOptions;
pub use api::RaftOptionsError;
pub use api::RaftPeerStatus;
pub use api::RaftRole;
pub use api::RaftStatus;
pub use api::ReplicaExited;
pub use api::ReplicatedLog;
pub use api::SnapshotInfo;
pub use api::StateMachine;
pub use api::StateMachineError;
pub use api::SubmitError;
pub use api::SubmitInput;
pub use api::SubmitOutput;
pub use api::TakeSnapshotError;
pub use transport::LocalNetwork;
pub use transport::RaftNetwork;

// Learning 1: `create::{root_mod}` should not have any code. Just `mod` and `pub use` statements.
// Learning 2: All `mod` statements, anywhere, should not be `pub`. Only export `pub` via individual
//             use statements.
//
// This keeps the `crate::{root_mod}` root_mod only responsible for exporting types to the rest of
// crate, and allows me to organize my root_mod impl however I want.
