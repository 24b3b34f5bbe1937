use bytes::Bytes;

/// StateMachine is the application specific view of applying the replicated logs in sequential
/// consistent order.
///
/// All methods are called from a single background task, one at a time, so implementations don't
/// need interior locking.
pub trait StateMachine: Send + 'static {
    /// apply is called only when its guaranteed that the provided command has been committed
    /// (i.e. replicated to a majority). Because of this guarantee, you will never need to reverse
    /// a command once you've been asked to apply it, so your impl of applying a command need not be
    /// reversible. Commands are applied in log order, each exactly once per replica (retried
    /// client requests are de-duplicated before they get here).
    ///
    /// The returned blob is handed back to the client that submitted the command.
    ///
    /// Returning an error is fatal: the replica halts and stops participating in the cluster, since
    /// the state machine can no longer be trusted to match the other replicas.
    fn apply(&mut self, index: u64, command: Bytes) -> Result<Bytes, StateMachineError>;

    /// Serialize the state machine. Everything applied so far must be included.
    fn take_snapshot(&mut self) -> Result<Bytes, StateMachineError>;

    /// Replace the state machine's state with a snapshot taken (possibly by another replica) right
    /// after applying `last_included_index`.
    fn install_snapshot(&mut self, last_included_index: u64, snapshot: Bytes) -> Result<(), StateMachineError>;
}

#[derive(Debug, thiserror::Error)]
#[error("State machine failure: {message}")]
pub struct StateMachineError {
    message: String,
}

impl StateMachineError {
    pub fn new(message: impl Into<String>) -> Self {
        StateMachineError {
            message: message.into(),
        }
    }
}
