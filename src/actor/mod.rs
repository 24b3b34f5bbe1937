use crate::replica;
use crate::replica::ApplierOutput;
use std::fmt::Debug;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};

// Design choice: Disk interaction is synchronous, on the actor's task. The state machine is
//                applied on its own task (see `Applier`), and results come back as events.
#[derive(Debug)]
pub(crate) enum Event {
    // Leader: Append to log, remember callback in retry cache, replicate.
    // Candidate: Reject request.
    // Follower: Redirect.
    Submit(
        replica::SubmitInput,
        Callback<replica::SubmitOutput, replica::SubmitError>,
    ),

    // Leader: Grant vote if applicable (includes write to disk). Transition to follower.
    // Candidate: Grant vote if applicable (includes write to disk). Transition to follower.
    // Follower: Grant vote if applicable (includes write to disk).
    RequestVote(
        replica::RequestVoteInput,
        Callback<replica::RequestVoteOutput, replica::RequestVoteError>,
    ),

    // Leader: discard
    // (Pre)Candidate: Update local state. Transition to candidate/leader if quorum vote.
    // Follower: discard
    RequestVoteReplyFromPeer(replica::RequestVoteReplyFromPeer),

    // Leader: Transition to follower if applicable. Clean up log. Respond to request.
    // Candidate: Transition to follower if applicable. Clean up log. Respond to request.
    // Follower: Write to disk then respond. Reset timeout.
    AppendEntries(
        replica::AppendEntriesInput,
        Callback<replica::AppendEntriesOutput, replica::AppendEntriesError>,
    ),

    // Leader: Update peer progress. If committed, dispatch to applier.
    // Candidate: discard
    // Follower: discard
    AppendEntriesReplyFromPeer(replica::AppendEntriesReplyFromPeer),

    // Same as AppendEntries, but the leader no longer has the entries we need.
    InstallSnapshot(
        replica::InstallSnapshotInput,
        Callback<replica::InstallSnapshotOutput, replica::InstallSnapshotError>,
    ),
    InstallSnapshotReplyFromPeer(replica::InstallSnapshotReplyFromPeer),

    // Leader: Send AppendEntries (or heartbeat) to one peer.
    // Candidate: discard
    // Follower: discard
    LeaderTimer(replica::LeaderTimerTick),

    // Leader: discard
    // Candidate: Start a new election.
    // Follower: Start a new election.
    FollowerTimeout(replica::ElectionTimeoutTick),

    // Any: results of applying committed entries, taking or installing snapshots.
    Applier(ApplierOutput),

    Status(oneshot::Sender<replica::ReplicaStatus>),
    TakeSnapshot(Callback<replica::TakeSnapshotOutput, replica::TakeSnapshotError>),
    ChangeMembership(
        replica::ChangeMembershipInput,
        Callback<replica::ChangeMembershipOutput, replica::ChangeMembershipError>,
    ),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug)]
pub(crate) struct Callback<O: Debug, E: Debug>(oneshot::Sender<Result<O, E>>);

impl<O: Debug, E: Debug> Callback<O, E> {
    pub(crate) fn send(self, message: Result<O, E>) {
        let _ = self.0.send(message);
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Replica actor has exited")]
pub(crate) struct ActorExited;

/// ActorClient is the strong handle. The actor runs as long as any ActorClient is alive, so only
/// the application-facing API holds one.
#[derive(Clone)]
pub(crate) struct ActorClient {
    sender: Arc<mpsc::Sender<Event>>,
}

/// WeakActorClient is held by everything the actor itself spawns (timers, peer calls, the applier,
/// the RPC server), so those don't keep the actor alive after the application lets go of it.
#[derive(Clone)]
pub(crate) struct WeakActorClient {
    sender: Weak<mpsc::Sender<Event>>,
}

impl ActorClient {
    pub(crate) fn new(buffer_size: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(buffer_size);

        (ActorClient { sender: Arc::new(tx) }, rx)
    }

    pub(crate) fn weak(&self) -> WeakActorClient {
        WeakActorClient {
            sender: Arc::downgrade(&self.sender),
        }
    }

    pub(crate) async fn submit(
        &self,
        input: replica::SubmitInput,
    ) -> Result<replica::SubmitOutput, replica::SubmitError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::Submit(input, Callback(tx)))
            .await
            .map_err(|_| replica::SubmitError::ActorExited)?;

        rx.await.unwrap_or(Err(replica::SubmitError::ActorExited))
    }

    pub(crate) async fn status(&self) -> Result<replica::ReplicaStatus, ActorExited> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::Status(tx)).await?;

        rx.await.map_err(|_| ActorExited)
    }

    pub(crate) async fn take_snapshot(&self) -> Result<replica::TakeSnapshotOutput, replica::TakeSnapshotError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::TakeSnapshot(Callback(tx)))
            .await
            .map_err(|_| replica::TakeSnapshotError::ActorExited)?;

        rx.await.unwrap_or(Err(replica::TakeSnapshotError::ActorExited))
    }

    pub(crate) async fn change_membership(
        &self,
        input: replica::ChangeMembershipInput,
    ) -> Result<replica::ChangeMembershipOutput, replica::ChangeMembershipError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::ChangeMembership(input, Callback(tx)))
            .await
            .map_err(|_| replica::ChangeMembershipError::ActorExited)?;

        rx.await.unwrap_or(Err(replica::ChangeMembershipError::ActorExited))
    }

    /// Stops the replica and waits until it has stopped. Calling it on an already stopped replica
    /// is a no-op.
    pub(crate) async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.send(Event::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn send(&self, event: Event) -> Result<(), ActorExited> {
        self.sender.send(event).await.map_err(|_| ActorExited)
    }
}

impl WeakActorClient {
    pub(crate) async fn request_vote(
        &self,
        input: replica::RequestVoteInput,
    ) -> Result<replica::RequestVoteOutput, replica::RequestVoteError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::RequestVote(input, Callback(tx)))
            .await
            .map_err(|_| replica::RequestVoteError::ActorExited)?;

        rx.await.unwrap_or(Err(replica::RequestVoteError::ActorExited))
    }

    pub(crate) async fn append_entries(
        &self,
        input: replica::AppendEntriesInput,
    ) -> Result<replica::AppendEntriesOutput, replica::AppendEntriesError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::AppendEntries(input, Callback(tx)))
            .await
            .map_err(|_| replica::AppendEntriesError::ActorExited)?;

        rx.await.unwrap_or(Err(replica::AppendEntriesError::ActorExited))
    }

    pub(crate) async fn install_snapshot(
        &self,
        input: replica::InstallSnapshotInput,
    ) -> Result<replica::InstallSnapshotOutput, replica::InstallSnapshotError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::InstallSnapshot(input, Callback(tx)))
            .await
            .map_err(|_| replica::InstallSnapshotError::ActorExited)?;

        rx.await.unwrap_or(Err(replica::InstallSnapshotError::ActorExited))
    }

    pub(crate) async fn notify_request_vote_reply_from_peer(
        &self,
        input: replica::RequestVoteReplyFromPeer,
    ) -> Result<(), ActorExited> {
        self.send(Event::RequestVoteReplyFromPeer(input)).await
    }

    pub(crate) async fn notify_append_entries_reply_from_peer(
        &self,
        input: replica::AppendEntriesReplyFromPeer,
    ) -> Result<(), ActorExited> {
        self.send(Event::AppendEntriesReplyFromPeer(input)).await
    }

    pub(crate) async fn notify_install_snapshot_reply_from_peer(
        &self,
        input: replica::InstallSnapshotReplyFromPeer,
    ) -> Result<(), ActorExited> {
        self.send(Event::InstallSnapshotReplyFromPeer(input)).await
    }

    pub(crate) async fn leader_timer(&self, input: replica::LeaderTimerTick) -> Result<(), ActorExited> {
        self.send(Event::LeaderTimer(input)).await
    }

    pub(crate) async fn follower_timeout(&self, tick: replica::ElectionTimeoutTick) -> Result<(), ActorExited> {
        self.send(Event::FollowerTimeout(tick)).await
    }

    pub(crate) async fn applier_output(&self, output: ApplierOutput) -> Result<(), ActorExited> {
        self.send(Event::Applier(output)).await
    }

    async fn send(&self, event: Event) -> Result<(), ActorExited> {
        // Upgrade only for the duration of the send, so we never hold the actor open.
        let sender = match self.sender.upgrade() {
            Some(sender) => sender,
            None => return Err(ActorExited),
        };

        sender.send(event).await.map_err(|_| ActorExited)
    }
}

/// ReplicaActor is replica logic in actor model.
pub(crate) struct ReplicaActor {
    logger: slog::Logger,
    receiver: mpsc::Receiver<Event>,
    replica: replica::Replica,
}

impl ReplicaActor {
    pub(crate) fn new(logger: slog::Logger, receiver: mpsc::Receiver<Event>, replica: replica::Replica) -> Self {
        ReplicaActor {
            logger,
            receiver,
            replica,
        }
    }

    pub(crate) async fn run_event_loop(mut self) {
        while let Some(event) = self.receiver.recv().await {
            if let Event::Shutdown(callback) = event {
                self.replica.shutdown();
                // Replica (and with it every timer and peer task) must be gone before we ack.
                drop(self.replica);
                let _ = callback.send(());
                slog::info!(self.logger, "Replica shut down");
                return;
            }

            self.handle_event(event);
        }

        self.replica.shutdown();
        slog::info!(self.logger, "Actor queue closed. Replica event loop exited.");
    }

    // This must NOT be async. Any long running work must be spawned on another actor
    // and/or come as a callback to this actor.
    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Submit(input, callback) => {
                self.replica.handle_submit(input, callback);
            }
            Event::RequestVote(input, callback) => {
                let result = self.replica.server_handle_request_vote(input);
                callback.send(result);
            }
            Event::RequestVoteReplyFromPeer(input) => {
                self.replica.handle_request_vote_reply_from_peer(input);
            }
            Event::AppendEntries(input, callback) => {
                let result = self.replica.server_handle_append_entries(input);
                callback.send(result);
            }
            Event::AppendEntriesReplyFromPeer(input) => {
                self.replica.handle_append_entries_reply_from_peer(input);
            }
            Event::InstallSnapshot(input, callback) => {
                let result = self.replica.server_handle_install_snapshot(input);
                callback.send(result);
            }
            Event::InstallSnapshotReplyFromPeer(input) => {
                self.replica.handle_install_snapshot_reply_from_peer(input);
            }
            Event::LeaderTimer(input) => {
                self.replica.handle_leader_timer(input);
            }
            Event::FollowerTimeout(tick) => {
                self.replica.handle_follower_timeout(tick);
            }
            Event::Applier(output) => {
                self.replica.handle_applier_output(output);
            }
            Event::Status(callback) => {
                let _ = callback.send(self.replica.status());
            }
            Event::TakeSnapshot(callback) => {
                self.replica.handle_take_snapshot(callback);
            }
            Event::ChangeMembership(input, callback) => {
                self.replica.handle_change_membership(input, callback);
            }
            Event::Shutdown(callback) => {
                // Handled by the event loop.
                let _ = callback.send(());
            }
        }
    }
}
