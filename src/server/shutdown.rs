use tokio::sync::oneshot;

/// The replica holds the handle. Dropping it (on shutdown, or when the replica goes away
/// without one) stops the RPC server.
pub(crate) struct RpcServerShutdownHandle {
    _tx: oneshot::Sender<()>,
}

pub(crate) struct RpcServerShutdownSignal {
    rx: oneshot::Receiver<()>,
}

pub(crate) fn shutdown_signal() -> (RpcServerShutdownHandle, RpcServerShutdownSignal) {
    let (tx, rx) = oneshot::channel();

    (RpcServerShutdownHandle { _tx: tx }, RpcServerShutdownSignal { rx })
}

impl RpcServerShutdownSignal {
    /// Resolves once the handle is dropped.
    pub(crate) async fn wait(self) {
        // Nothing is ever sent: the sender going away is the signal.
        let _ = self.rx.await;
    }
}
