use crate::replica::LeaderRedirectInfo;
use tokio::sync::watch;

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum ElectionStateSnapshot {
    Leader,
    Candidate,
    PreCandidate,
    Follower(LeaderRedirectInfo),
    FollowerNoLeader,
    /// Terminal. The replica no longer takes part in the cluster.
    Halted(String),
}

pub(super) fn new(initial_state: ElectionStateSnapshot) -> (ElectionStateChangeNotifier, ElectionStateChangeListener) {
    let (snd, rcv) = watch::channel(initial_state);

    (ElectionStateChangeNotifier { snd }, ElectionStateChangeListener { rcv })
}

pub(super) struct ElectionStateChangeNotifier {
    snd: watch::Sender<ElectionStateSnapshot>,
}

impl ElectionStateChangeNotifier {
    pub(super) fn notify_new_state(&self, new_state: ElectionStateSnapshot) {
        // Re-entering the same state (e.g. a candidate starting another round) isn't news.
        if *self.snd.borrow() != new_state {
            let _ = self.snd.send(new_state);
        }
    }
}

#[derive(Clone)]
pub(crate) struct ElectionStateChangeListener {
    rcv: watch::Receiver<ElectionStateSnapshot>,
}

impl ElectionStateChangeListener {
    /// Waits for the next state change. Returns None once the replica is gone.
    pub(crate) async fn next(&mut self) -> Option<ElectionStateSnapshot> {
        match self.rcv.changed().await {
            Ok(_) => Some(self.rcv.borrow().clone()),
            Err(_) => None,
        }
    }

    pub(crate) fn current(&self) -> ElectionStateSnapshot {
        self.rcv.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn listener_sees_changes_but_not_repeats() {
        let (notifier, mut listener) = new(ElectionStateSnapshot::FollowerNoLeader);
        assert_eq!(listener.current(), ElectionStateSnapshot::FollowerNoLeader);

        notifier.notify_new_state(ElectionStateSnapshot::Candidate);
        notifier.notify_new_state(ElectionStateSnapshot::Candidate);
        assert_eq!(listener.next().await, Some(ElectionStateSnapshot::Candidate));

        notifier.notify_new_state(ElectionStateSnapshot::Leader);
        assert_eq!(listener.next().await, Some(ElectionStateSnapshot::Leader));

        drop(notifier);
        assert_eq!(listener.next().await, None);
    }
}
