use crate::api::types::RaftLeaderInfo;
use crate::replica::ElectionStateChangeListener;
use crate::replica::ElectionStateSnapshot;

/// An event that happened, as observed by the local raft replica.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RaftEvent {
    /// An event of leader election or timeout. Consuming this event type is subtle. It doesn't queue
    /// intermediate events. If there are multiple events between when application awaits the next event,
    /// those events will be clobbered into only the most recent event.
    Election(RaftElectionState),
    /// The replica hit an unrecoverable error (failed disk write, or a state machine that failed to
    /// apply a committed entry) and stopped taking part in the cluster. Operators need to look at it.
    Halted(String),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RaftElectionState {
    Leader,
    Candidate,
    PreCandidate,
    Follower(RaftLeaderInfo),
    FollowerNoLeader,
}

#[derive(Clone)]
pub struct RaftEventListener {
    election_state_change_listener: ElectionStateChangeListener,
}

impl RaftEventListener {
    pub(crate) fn new(election_state_change_listener: ElectionStateChangeListener) -> Self {
        RaftEventListener {
            election_state_change_listener,
        }
    }

    /// `next_event()` returns the next event that this local raft replica observes. Returns None
    /// once the replica has been shut down.
    pub async fn next_event(&mut self) -> Option<RaftEvent> {
        self.election_state_change_listener.next().await.map(RaftEvent::from)
    }

    /// The most recent event, without waiting.
    pub fn current(&self) -> RaftEvent {
        RaftEvent::from(self.election_state_change_listener.current())
    }
}

// ------- Conversions --------

impl From<ElectionStateSnapshot> for RaftEvent {
    fn from(election_state: ElectionStateSnapshot) -> Self {
        let state = match election_state {
            ElectionStateSnapshot::Leader => RaftElectionState::Leader,
            ElectionStateSnapshot::Candidate => RaftElectionState::Candidate,
            ElectionStateSnapshot::PreCandidate => RaftElectionState::PreCandidate,
            ElectionStateSnapshot::Follower(leader) => RaftElectionState::Follower(RaftLeaderInfo::from(leader)),
            ElectionStateSnapshot::FollowerNoLeader => RaftElectionState::FollowerNoLeader,
            ElectionStateSnapshot::Halted(reason) => return RaftEvent::Halted(reason),
        };

        RaftEvent::Election(state)
    }
}
