use crate::actor::WeakActorClient;
use crate::replica::replica_api::{
    AppendEntriesInput, AppendEntriesReplyFromPeer, AppendEntriesReplyFromPeerDescriptor,
    AppendEntriesReplyFromPeerError, InstallSnapshotInput, InstallSnapshotReplyFromPeer,
    InstallSnapshotReplyFromPeerError,
};
use crate::replica::ReplicaId;
use crate::transport::PeerClient;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// PeerSender is the leader's outbound pipeline to one follower. Requests go out in the order they
/// are queued, with up to `max_in_flight` AppendEntries awaiting a reply at once. Replies are
/// posted back to the actor in the same order the requests were sent, whatever order they arrive in.
///
/// InstallSnapshot chunks travel alone: everything sent before a chunk is answered first, and
/// nothing after it goes out until the chunk is answered.
///
/// Queued requests belong to an epoch. When the leader gives up on what's in flight (e.g. the
/// follower rejected a request), it bumps the epoch and everything still queued is dropped
/// without being sent.
pub(crate) struct PeerSender {
    queue: mpsc::UnboundedSender<PeerRequest>,
    epoch: Arc<AtomicU64>,
}

enum PeerRequest {
    AppendEntries {
        epoch: u64,
        input: AppendEntriesInput,
        descriptor: AppendEntriesReplyFromPeerDescriptor,
    },
    InstallSnapshot {
        epoch: u64,
        input: InstallSnapshotInput,
        seq_no: u64,
    },
}

enum PeerReply {
    AppendEntries(AppendEntriesReplyFromPeer),
    InstallSnapshot(InstallSnapshotReplyFromPeer),
}

/// One peer's end of the wire, cloned into every request's task.
#[derive(Clone)]
struct PeerRpc {
    logger: slog::Logger,
    peer_id: ReplicaId,
    client: Arc<dyn PeerClient>,
    rpc_timeout: Duration,
}

struct PeerSenderTask {
    logger: slog::Logger,
    queue: mpsc::UnboundedReceiver<PeerRequest>,
    epoch: Arc<AtomicU64>,
    rpc: PeerRpc,
    max_in_flight: usize,
    in_flight: VecDeque<JoinHandle<PeerReply>>,
    actor_client: WeakActorClient,
}

impl PeerSender {
    pub(crate) fn spawn(
        logger: slog::Logger,
        peer_id: ReplicaId,
        client: Arc<dyn PeerClient>,
        rpc_timeout: Duration,
        max_in_flight: usize,
        actor_client: WeakActorClient,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let epoch = Arc::new(AtomicU64::new(0));

        let task = PeerSenderTask {
            logger: logger.clone(),
            queue: rx,
            epoch: epoch.clone(),
            rpc: PeerRpc {
                logger,
                peer_id,
                client,
                rpc_timeout,
            },
            max_in_flight: max_in_flight.max(1),
            in_flight: VecDeque::new(),
            actor_client,
        };
        tokio::task::spawn(task.run());

        PeerSender { queue: tx, epoch }
    }

    /// Drops every request queued so far that hasn't been sent yet.
    pub(crate) fn discard_queued(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn send_append_entries(
        &self,
        input: AppendEntriesInput,
        descriptor: AppendEntriesReplyFromPeerDescriptor,
    ) {
        let _ = self.queue.send(PeerRequest::AppendEntries {
            epoch: self.epoch.load(Ordering::Acquire),
            input,
            descriptor,
        });
    }

    pub(crate) fn send_install_snapshot(&self, input: InstallSnapshotInput, seq_no: u64) {
        let _ = self.queue.send(PeerRequest::InstallSnapshot {
            epoch: self.epoch.load(Ordering::Acquire),
            input,
            seq_no,
        });
    }
}

impl PeerSenderTask {
    async fn run(mut self) {
        // Exits once the leader drops its PeerSender (no longer leader, or peer removed).
        loop {
            let window_open = self.in_flight.len() < self.max_in_flight;
            let awaiting_reply = !self.in_flight.is_empty();

            tokio::select! {
                // Replies first, so a full window drains before we look at the queue again.
                biased;

                reply = next_reply(&mut self.in_flight), if awaiting_reply => {
                    if !self.deliver(reply).await {
                        return;
                    }
                }
                request = self.queue.recv(), if window_open => {
                    let request = match request {
                        Some(request) => request,
                        None => return,
                    };
                    if !self.dispatch(request).await {
                        return;
                    }
                }
            }
        }
    }

    async fn dispatch(&mut self, request: PeerRequest) -> bool {
        let current_epoch = self.epoch.load(Ordering::Acquire);
        match request {
            PeerRequest::AppendEntries { epoch, .. } | PeerRequest::InstallSnapshot { epoch, .. }
                if epoch != current_epoch =>
            {
                true
            }
            PeerRequest::AppendEntries { input, descriptor, .. } => {
                let rpc = self.rpc.clone();
                let call = tokio::task::spawn(async move {
                    PeerReply::AppendEntries(rpc.append_entries(input, descriptor).await)
                });
                self.in_flight.push_back(call);
                true
            }
            PeerRequest::InstallSnapshot { input, seq_no, .. } => {
                while !self.in_flight.is_empty() {
                    let reply = next_reply(&mut self.in_flight).await;
                    if !self.deliver(reply).await {
                        return false;
                    }
                }
                let reply = PeerReply::InstallSnapshot(self.rpc.install_snapshot(input, seq_no).await);
                self.deliver(Some(reply)).await
            }
        }
    }

    /// False once the actor is gone.
    async fn deliver(&self, reply: Option<PeerReply>) -> bool {
        let result = match reply {
            Some(PeerReply::AppendEntries(reply)) => {
                self.actor_client.notify_append_entries_reply_from_peer(reply).await
            }
            Some(PeerReply::InstallSnapshot(reply)) => {
                self.actor_client.notify_install_snapshot_reply_from_peer(reply).await
            }
            // The leader notices the gap by seq number and resends.
            None => return true,
        };

        if result.is_err() {
            slog::debug!(self.logger, "Actor exited. Stopping peer sender.");
            return false;
        }
        true
    }
}

/// Waits for the oldest request in flight. None if its task died without replying.
async fn next_reply(in_flight: &mut VecDeque<JoinHandle<PeerReply>>) -> Option<PeerReply> {
    let oldest = in_flight.front_mut()?;
    let joined = oldest.await;
    in_flight.pop_front();
    joined.ok()
}

impl PeerRpc {
    async fn append_entries(
        self,
        input: AppendEntriesInput,
        descriptor: AppendEntriesReplyFromPeerDescriptor,
    ) -> AppendEntriesReplyFromPeer {
        slog::debug!(
            self.logger,
            "ClientWire - AppendEntries seq {} prev {:?} entries {} commit {:?}",
            descriptor.seq_no,
            input.leader_previous_log_entry,
            input.new_entries.len(),
            input.leader_commit_index
        );
        let rpc_reply = tokio::time::timeout(self.rpc_timeout, self.client.append_entries(input)).await;
        slog::debug!(self.logger, "ClientWire - seq {} {:?}", descriptor.seq_no, rpc_reply);

        let result = match rpc_reply {
            Ok(result) => result,
            Err(_timeout) => Err(AppendEntriesReplyFromPeerError::RetryableFailure(
                "Timed out calling AppendEntries".into(),
            )),
        };

        AppendEntriesReplyFromPeer { descriptor, result }
    }

    async fn install_snapshot(&self, input: InstallSnapshotInput, seq_no: u64) -> InstallSnapshotReplyFromPeer {
        let term = input.leader_term;
        let last_included_index = input.metadata.last_included_index;
        let end_offset = input.offset + input.data.len() as u64;
        let done = input.done;

        slog::debug!(
            self.logger,
            "ClientWire - InstallSnapshot seq {} index {:?} offset {} len {} done {}",
            seq_no,
            last_included_index,
            input.offset,
            input.data.len(),
            done
        );
        let rpc_reply = tokio::time::timeout(self.rpc_timeout, self.client.install_snapshot(input)).await;
        slog::debug!(self.logger, "ClientWire - {:?}", rpc_reply);

        let result = match rpc_reply {
            Ok(result) => result,
            Err(_timeout) => Err(InstallSnapshotReplyFromPeerError::RetryableFailure(
                "Timed out calling InstallSnapshot".into(),
            )),
        };

        InstallSnapshotReplyFromPeer {
            peer_id: self.peer_id.clone(),
            term,
            seq_no,
            last_included_index,
            end_offset,
            done,
            result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{ActorClient, Event};
    use crate::replica::{RequestVoteInput, RequestVoteResult, Term};
    use std::sync::Mutex;
    use tokio::sync::oneshot;

    /// Holds every AppendEntries until the test releases it.
    #[derive(Default)]
    struct HeldPeerClient {
        held: Mutex<Vec<(Option<u64>, oneshot::Sender<()>)>>,
    }

    impl HeldPeerClient {
        fn held(&self) -> usize {
            self.held.lock().unwrap().len()
        }

        /// Answers the request whose previous entry index is `prev`.
        fn release(&self, prev: u64) {
            let mut held = self.held.lock().unwrap();
            let position = held.iter().position(|(p, _)| *p == Some(prev)).unwrap();
            let (_, tx) = held.remove(position);
            tx.send(()).unwrap();
        }
    }

    #[async_trait::async_trait]
    impl PeerClient for HeldPeerClient {
        async fn request_vote(&self, _input: RequestVoteInput) -> RequestVoteResult {
            RequestVoteResult::VoteNotGranted
        }

        async fn append_entries(&self, input: AppendEntriesInput) -> Result<(), AppendEntriesReplyFromPeerError> {
            let (tx, rx) = oneshot::channel();
            let prev = input.leader_previous_log_entry.map(|(_, index)| index.as_u64());
            self.held.lock().unwrap().push((prev, tx));
            let _ = rx.await;
            Ok(())
        }

        async fn install_snapshot(
            &self,
            _input: InstallSnapshotInput,
        ) -> Result<(), InstallSnapshotReplyFromPeerError> {
            Ok(())
        }
    }

    fn append(seq_no: u64) -> (AppendEntriesInput, AppendEntriesReplyFromPeerDescriptor) {
        let prev = Some(crate::commitlog::Index::new(seq_no));
        let input = AppendEntriesInput {
            leader_term: Term::new(1),
            leader_id: ReplicaId::new("leader"),
            leader_previous_log_entry: prev.map(|index| (Term::new(1), index)),
            leader_commit_index: None,
            new_entries: Vec::new(),
        };
        let descriptor = AppendEntriesReplyFromPeerDescriptor {
            peer_id: ReplicaId::new("peer"),
            term: Term::new(1),
            seq_no,
            previous_log_entry_index: prev,
            num_log_entries: 0,
        };
        (input, descriptor)
    }

    async fn next_seq_no(rx: &mut mpsc::Receiver<Event>) -> u64 {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("No reply within 5s")
            .expect("Actor queue closed");
        match event {
            Event::AppendEntriesReplyFromPeer(reply) => reply.descriptor.seq_no,
            other => panic!("Expected AppendEntries reply, got {:?}", other),
        }
    }

    async fn wait_for_held(client: &HeldPeerClient, expected: usize) {
        for _ in 0..500 {
            if client.held() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("Expected {} held requests, have {}", expected, client.held());
    }

    #[tokio::test]
    async fn keeps_window_full_and_replies_in_send_order() {
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let (actor_client, mut rx) = ActorClient::new(10);
        let client = Arc::new(HeldPeerClient::default());
        let sender = PeerSender::spawn(
            logger,
            ReplicaId::new("peer"),
            client.clone(),
            Duration::from_secs(5),
            3,
            actor_client.weak(),
        );

        for seq_no in 1..=4 {
            let (input, descriptor) = append(seq_no);
            sender.send_append_entries(input, descriptor);
        }

        // Three go out together, the fourth waits for room in the window.
        wait_for_held(&client, 3).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(client.held(), 3);

        // The follower answers out of order, the actor still hears in order.
        client.release(2);
        client.release(3);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());

        client.release(1);
        assert_eq!(next_seq_no(&mut rx).await, 1);
        assert_eq!(next_seq_no(&mut rx).await, 2);
        assert_eq!(next_seq_no(&mut rx).await, 3);

        wait_for_held(&client, 1).await;
        client.release(4);
        assert_eq!(next_seq_no(&mut rx).await, 4);
    }

    #[tokio::test]
    async fn discarded_requests_are_never_sent() {
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let (actor_client, mut rx) = ActorClient::new(10);
        let client = Arc::new(HeldPeerClient::default());
        let sender = PeerSender::spawn(
            logger,
            ReplicaId::new("peer"),
            client.clone(),
            Duration::from_secs(5),
            1,
            actor_client.weak(),
        );

        for seq_no in 1..=3 {
            let (input, descriptor) = append(seq_no);
            sender.send_append_entries(input, descriptor);
        }
        wait_for_held(&client, 1).await;

        // 2 and 3 are still queued behind the full window.
        sender.discard_queued();
        let (input, descriptor) = append(4);
        sender.send_append_entries(input, descriptor);

        client.release(1);
        assert_eq!(next_seq_no(&mut rx).await, 1);
        wait_for_held(&client, 1).await;
        client.release(4);
        assert_eq!(next_seq_no(&mut rx).await, 4);
    }
}
