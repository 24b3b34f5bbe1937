use crate::actor::WeakActorClient;
use crate::api::StateMachine;
use crate::commitlog::Index;
use crate::replica::retry_cache::RetryKey;
use crate::replica::snapshot::Snapshot;
use crate::replica::{ClusterConfiguration, Term};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A committed log entry, on its way to the state machine.
#[derive(Debug)]
pub(crate) struct ApplyItem {
    pub(crate) index: Index,
    /// None for entries that don't reach the state machine: no-ops, configurations and
    /// duplicates of already applied commands.
    pub(crate) command: Option<(RetryKey, Bytes)>,
}

#[derive(Debug)]
pub(crate) enum ApplierInput {
    Apply(Vec<ApplyItem>),
    /// Snapshot once everything sent before this is applied, which is exactly up to `index`.
    TakeSnapshot {
        index: Index,
        term: Term,
        configuration: ClusterConfiguration,
    },
    InstallSnapshot(Arc<Snapshot>),
}

#[derive(Debug)]
pub(crate) struct AppliedEntry {
    pub(crate) index: Index,
    pub(crate) key: Option<RetryKey>,
    pub(crate) result: Bytes,
}

#[derive(Debug)]
pub(crate) enum ApplierOutput {
    EntriesApplied(Vec<AppliedEntry>),
    /// The state machine failed. Applier has stopped, nothing more will be applied.
    ApplyFailed { index: Index, reason: String },
    SnapshotTaken(Result<Snapshot, String>),
    SnapshotInstalled { index: Index, result: Result<(), String> },
}

/// ApplierHandle feeds the applier task. Dropping it stops the task once it's drained its queue.
pub(crate) struct ApplierHandle {
    sender: mpsc::UnboundedSender<ApplierInput>,
}

#[derive(Debug, thiserror::Error)]
#[error("Applier task has exited")]
pub(crate) struct ApplierExited;

impl ApplierHandle {
    pub(crate) fn send(&self, input: ApplierInput) -> Result<(), ApplierExited> {
        self.sender.send(input).map_err(|_| ApplierExited)
    }
}

/// Applier owns the application's state machine and applies committed entries to it in order,
/// off of the replica actor's task. Results are posted back to the actor.
pub(crate) struct Applier {
    logger: slog::Logger,
    receiver: mpsc::UnboundedReceiver<ApplierInput>,
    state_machine: Box<dyn StateMachine>,
    actor_client: WeakActorClient,
}

impl Applier {
    pub(crate) fn spawn(
        logger: slog::Logger,
        state_machine: Box<dyn StateMachine>,
        actor_client: WeakActorClient,
    ) -> ApplierHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let applier = Applier {
            logger,
            receiver: rx,
            state_machine,
            actor_client,
        };
        tokio::task::spawn(applier.run());

        ApplierHandle { sender: tx }
    }

    async fn run(mut self) {
        while let Some(input) = self.receiver.recv().await {
            let outputs = self.handle(input);
            let halted = outputs
                .iter()
                .any(|output| matches!(output, ApplierOutput::ApplyFailed { .. }));

            for output in outputs {
                if self.actor_client.applier_output(output).await.is_err() {
                    slog::info!(self.logger, "Replica actor exited. Stopping applier.");
                    return;
                }
            }

            if halted {
                slog::error!(self.logger, "State machine failed. Stopping applier.");
                return;
            }
        }
    }

    fn handle(&mut self, input: ApplierInput) -> Vec<ApplierOutput> {
        match input {
            ApplierInput::Apply(items) => self.apply(items),
            ApplierInput::TakeSnapshot {
                index,
                term,
                configuration,
            } => {
                let result = self
                    .state_machine
                    .take_snapshot()
                    .map(|data| Snapshot::new(index, term, configuration, data))
                    .map_err(|e| e.to_string());
                vec![ApplierOutput::SnapshotTaken(result)]
            }
            ApplierInput::InstallSnapshot(snapshot) => {
                let index = snapshot.metadata.last_included_index;
                let result = self
                    .state_machine
                    .install_snapshot(index.as_u64(), snapshot.data.clone())
                    .map_err(|e| e.to_string());
                vec![ApplierOutput::SnapshotInstalled { index, result }]
            }
        }
    }

    fn apply(&mut self, items: Vec<ApplyItem>) -> Vec<ApplierOutput> {
        let mut applied = Vec::with_capacity(items.len());

        for item in items {
            match item.command {
                None => applied.push(AppliedEntry {
                    index: item.index,
                    key: None,
                    result: Bytes::new(),
                }),
                Some((key, data)) => match self.state_machine.apply(item.index.as_u64(), data) {
                    Ok(result) => applied.push(AppliedEntry {
                        index: item.index,
                        key: Some(key),
                        result,
                    }),
                    Err(e) => {
                        slog::error!(self.logger, "Failed to apply entry {:?}: {}", item.index, e);
                        let mut outputs = Vec::with_capacity(2);
                        if !applied.is_empty() {
                            outputs.push(ApplierOutput::EntriesApplied(applied));
                        }
                        outputs.push(ApplierOutput::ApplyFailed {
                            index: item.index,
                            reason: e.to_string(),
                        });
                        return outputs;
                    }
                },
            }
        }

        vec![ApplierOutput::EntriesApplied(applied)]
    }
}
