use crate::actor::ActorClient;
use crate::api::types::RaftLeaderInfo;
use crate::replica;
use bytes::Bytes;
use tokio::time::Duration;

/// ReplicatedLog is the replicated log for external application to submit commands to.
#[derive(Clone)]
pub struct ReplicatedLog {
    actor_client: ActorClient,
    request_timeout: Duration,
}

impl ReplicatedLog {
    pub(crate) fn new(actor_client: ActorClient, request_timeout: Duration) -> Self {
        ReplicatedLog {
            actor_client,
            request_timeout,
        }
    }

    /// Replicates `command`, waits until it's applied to the (leader's) state machine, and returns
    /// what the state machine returned.
    ///
    /// Requests are identified by `(client_id, call_id)`. Submitting the same pair again, whether
    /// the first attempt succeeded, failed or is still running, never applies the command twice:
    /// the retry gets the original result. So retrying with the same `call_id` after a retryable
    /// error is always safe.
    pub async fn submit(&self, input: SubmitInput) -> Result<SubmitOutput, SubmitError> {
        let replica_input = replica::SubmitInput {
            client_id: input.client_id,
            call_id: input.call_id,
            data: input.command,
        };

        match tokio::time::timeout(self.request_timeout, self.actor_client.submit(replica_input)).await {
            Ok(result) => result.map(SubmitOutput::from).map_err(SubmitError::from),
            Err(_) => Err(SubmitError::Timeout),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubmitInput {
    pub client_id: String,
    pub call_id: u64,
    pub command: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmitOutput {
    pub applied_index: u64,
    /// What the state machine returned when it applied the command.
    pub result: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("I'm not leader")]
    NotLeader(Option<RaftLeaderInfo>),

    // Can be retried with exponential backoff with recommended initial delay of 200ms. Likely an
    // election is in progress.
    #[error("Cluster is in a tough shape. No one is leader.")]
    NoLeader,

    #[error("Request was not applied within the request timeout")]
    Timeout,

    #[error("Leader lost leadership before the request was applied")]
    LeadershipLost,

    #[error("Too many requests in flight")]
    RetryCacheFull,

    #[error("Replica halted: {0}")]
    Halted(String),

    // Replica logic runs on a background task. This error is returned if the task has exited.
    #[error("Replica task has exited")]
    ReplicaExited,
}

impl SubmitError {
    /// True if submitting again (with the same call id) may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SubmitError::NotLeader(_)
            | SubmitError::NoLeader
            | SubmitError::Timeout
            | SubmitError::LeadershipLost
            | SubmitError::RetryCacheFull => true,
            SubmitError::Halted(_) | SubmitError::ReplicaExited => false,
        }
    }
}

// ------- Conversions --------

impl From<replica::SubmitOutput> for SubmitOutput {
    fn from(internal_output: replica::SubmitOutput) -> Self {
        SubmitOutput {
            applied_index: internal_output.applied_index.as_u64(),
            result: internal_output.result,
        }
    }
}

impl From<replica::SubmitError> for SubmitError {
    fn from(internal_error: replica::SubmitError) -> Self {
        match internal_error {
            replica::SubmitError::LeaderRedirect(leader_info) => {
                SubmitError::NotLeader(Some(RaftLeaderInfo::from(leader_info)))
            }
            replica::SubmitError::NoLeader => SubmitError::NoLeader,
            replica::SubmitError::LeadershipLost => SubmitError::LeadershipLost,
            replica::SubmitError::RetryCacheFull => SubmitError::RetryCacheFull,
            replica::SubmitError::Halted(reason) => SubmitError::Halted(reason),
            replica::SubmitError::ActorExited => SubmitError::ReplicaExited,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_terminal_errors_are_not_retryable() {
        assert!(SubmitError::NotLeader(None).is_retryable());
        assert!(SubmitError::Timeout.is_retryable());
        assert!(SubmitError::LeadershipLost.is_retryable());
        assert!(!SubmitError::Halted("disk".into()).is_retryable());
        assert!(!SubmitError::ReplicaExited.is_retryable());
    }
}
