use crate::actor::Event;
use crate::replica::{ElectionTimeoutTick, LeaderTimerTick};
use tokio::sync::mpsc;
use tokio::time::Duration;

/// Stands in for the actor: reads what timers post to its queue.
pub(super) struct ActorQueueReader {
    rx: mpsc::Receiver<Event>,
}

impl ActorQueueReader {
    pub(super) fn new(rx: mpsc::Receiver<Event>) -> Self {
        ActorQueueReader { rx }
    }

    async fn next(&mut self) -> Event {
        tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .expect("No event within 5s")
            .expect("Actor queue closed")
    }

    pub(super) async fn expect_leader_tick(&mut self, expected: LeaderTimerTick) {
        match self.next().await {
            Event::LeaderTimer(tick) => assert_eq!(tick, expected),
            other => panic!("Expected leader tick, got {:?}", other),
        }
    }

    pub(super) async fn expect_follower_timeout(&mut self) -> ElectionTimeoutTick {
        match self.next().await {
            Event::FollowerTimeout(tick) => tick,
            other => panic!("Expected follower timeout, got {:?}", other),
        }
    }

    pub(super) async fn expect_quiet(&mut self) {
        if let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(10), self.rx.recv()).await {
            panic!("Expected no event, got {:?}", event);
        }
    }
}
