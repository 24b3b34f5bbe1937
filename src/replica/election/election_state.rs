use crate::actor::WeakActorClient;
use crate::commitlog::Index;
use crate::replica::cluster::Peer;
use crate::replica::election::leader_state::PeerSpawnContext;
use crate::replica::election::state_change_listener::ElectionStateChangeNotifier;
use crate::replica::election::timers::FollowerTimerHandle;
use crate::replica::election::{state_change_listener, LeaderStateTracker};
use crate::replica::{
    ElectionStateChangeListener, ElectionStateSnapshot, ElectionTimeoutTick, LeaderRedirectInfo, ReplicaId, Term,
};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

#[derive(Clone)]
pub(crate) struct ElectionConfig {
    pub my_replica_id: ReplicaId,
    pub leader_heartbeat_duration: Duration,
    pub follower_min_timeout: Duration,
    pub follower_max_timeout: Duration,
    pub rpc_timeout: Duration,
    pub outstanding_appends_max: usize,
}

/// ElectionState is responsible for holding state specific to the stage in an election. Its
/// methods are responsible for "what" to do. It is NOT responsible for validating anything
/// specific to logs, terms, peers, etc. or knowing "when" to do something.
pub(crate) struct ElectionState {
    logger: slog::Logger,
    state: State,
    config: ElectionConfig,
    actor_client: WeakActorClient,
    state_change_notifier: ElectionStateChangeNotifier,
}

impl ElectionState {
    /// `new_follower()` creates a new ElectionState instance that starts out as a follower.
    pub(crate) fn new_follower(
        logger: slog::Logger,
        config: ElectionConfig,
        actor_client: WeakActorClient,
    ) -> (Self, ElectionStateChangeListener) {
        let initial_state = State::Follower(FollowerState::new(None, &config, actor_client.clone()));
        let (notifier, listener) = state_change_listener::new(Self::current_state_impl(&initial_state));

        let election_state = Self {
            logger,
            state: initial_state,
            config,
            actor_client,
            state_change_notifier: notifier,
        };

        (election_state, listener)
    }

    pub(crate) fn transition_to_follower(&mut self, new_leader: Option<LeaderRedirectInfo>) {
        if self.is_halted() {
            return;
        }
        self.state = State::Follower(FollowerState::new(new_leader, &self.config, self.actor_client.clone()));
        self.notify_new_state();
    }

    /// Pre-vote round: we ask peers whether they'd vote for us, without bumping our term.
    pub(crate) fn transition_to_pre_candidate_and_vote_for_self(&mut self) {
        if self.is_halted() {
            return;
        }
        let mut cs = CandidateState::new(&self.config, self.actor_client.clone());
        cs.add_received_vote(self.config.my_replica_id.clone());

        self.state = State::PreCandidate(cs);
        self.notify_new_state();
    }

    pub(crate) fn transition_to_candidate_and_vote_for_self(&mut self) {
        if self.is_halted() {
            return;
        }
        let mut cs = CandidateState::new(&self.config, self.actor_client.clone());
        cs.add_received_vote(self.config.my_replica_id.clone());

        self.state = State::Candidate(cs);
        self.notify_new_state();
    }

    /// Every peer in `peers` gets replicated to starting right after `latest_index`.
    pub(crate) fn transition_to_leader(&mut self, term: Term, peers: Vec<Peer>, latest_index: Option<Index>) {
        if self.is_halted() {
            return;
        }
        let mut tracker = LeaderStateTracker::new(PeerSpawnContext {
            logger: self.logger.clone(),
            term,
            heartbeat_duration: self.config.leader_heartbeat_duration,
            rpc_timeout: self.config.rpc_timeout,
            outstanding_appends_max: self.config.outstanding_appends_max,
            actor_client: self.actor_client.clone(),
        });

        let next_index = latest_index.map(|i| i.plus(1)).unwrap_or_else(Index::start_index);
        for peer in peers {
            tracker.add_peer(peer, next_index, false);
        }

        self.state = State::Leader(LeaderState { tracker });
        self.notify_new_state();
    }

    /// Terminal: drops all timers and peer tasks. There's no way back.
    pub(crate) fn transition_to_halted(&mut self, reason: String) {
        if self.is_halted() {
            return;
        }
        self.state = State::Halted(reason);
        self.notify_new_state();
    }

    pub(crate) fn current_state(&self) -> ElectionStateSnapshot {
        Self::current_state_impl(&self.state)
    }

    fn current_state_impl(state: &State) -> ElectionStateSnapshot {
        match state {
            State::Leader(_) => ElectionStateSnapshot::Leader,
            State::Candidate(_) => ElectionStateSnapshot::Candidate,
            State::PreCandidate(_) => ElectionStateSnapshot::PreCandidate,
            State::Follower(FollowerState { leader: None, .. }) => ElectionStateSnapshot::FollowerNoLeader,
            State::Follower(FollowerState {
                leader: Some(leader_info),
                ..
            }) => ElectionStateSnapshot::Follower(leader_info.clone()),
            State::Halted(reason) => ElectionStateSnapshot::Halted(reason.clone()),
        }
    }

    fn notify_new_state(&self) {
        self.state_change_notifier
            .notify_new_state(Self::current_state_impl(&self.state));
    }

    pub(crate) fn is_leader(&self) -> bool {
        matches!(self.state, State::Leader(_))
    }

    pub(crate) fn is_halted(&self) -> bool {
        matches!(self.state, State::Halted(_))
    }

    pub(crate) fn halted_reason(&self) -> Option<&str> {
        match &self.state {
            State::Halted(reason) => Some(reason),
            _ => None,
        }
    }

    /// The leader we're following, if we know one.
    pub(crate) fn known_leader(&self) -> Option<&LeaderRedirectInfo> {
        match &self.state {
            State::Follower(FollowerState { leader, .. }) => leader.as_ref(),
            _ => None,
        }
    }

    /// False for a timeout that was queued before the timer was reset or replaced.
    pub(crate) fn is_current_timeout(&self, tick: ElectionTimeoutTick) -> bool {
        match &self.state {
            State::Follower(fs) => fs.follower_timeout_tracker.is_current(tick),
            State::Candidate(cs) | State::PreCandidate(cs) => cs.follower_timeout_tracker.is_current(tick),
            _ => false,
        }
    }

    pub(crate) fn reset_timeout_if_follower(&self) {
        if let State::Follower(fs) = &self.state {
            fs.reset_timeout();
        }
    }

    pub(crate) fn set_leader_if_unknown(&mut self, leader: &LeaderRedirectInfo) {
        if let State::Follower(fs) = &mut self.state {
            if fs.leader.is_none() {
                fs.leader.replace(leader.clone());
                self.notify_new_state();
            }
        }
    }

    /// Records a granted vote. Returns everyone who voted for us so far, or None if we're no
    /// longer in the matching stage of the election.
    pub(crate) fn add_vote_if_candidate(
        &mut self,
        pre_vote: bool,
        vote_from: ReplicaId,
    ) -> Option<&HashSet<ReplicaId>> {
        match (&mut self.state, pre_vote) {
            (State::PreCandidate(cs), true) | (State::Candidate(cs), false) => {
                cs.add_received_vote(vote_from);
                Some(&cs.received_votes_from)
            }
            _ => None,
        }
    }

    pub(crate) fn leader_state(&self) -> Option<&LeaderStateTracker> {
        if let State::Leader(ls) = &self.state {
            Some(&ls.tracker)
        } else {
            None
        }
    }

    pub(crate) fn leader_state_mut(&mut self) -> Option<&mut LeaderStateTracker> {
        if let State::Leader(ls) = &mut self.state {
            Some(&mut ls.tracker)
        } else {
            None
        }
    }
}

impl fmt::Debug for ElectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            State::Leader(_) => write!(f, "Leader"),
            State::Candidate(_) => write!(f, "Candidate"),
            State::PreCandidate(_) => write!(f, "PreCandidate"),
            State::Follower(FollowerState {
                leader: Some(leader_info),
                ..
            }) => write!(f, "Follower(Leader={:?})", leader_info.replica_id),
            State::Follower(FollowerState { leader: None, .. }) => write!(f, "Follower(Leader=None)"),
            State::Halted(reason) => write!(f, "Halted({})", reason),
        }
    }
}

enum State {
    Leader(LeaderState),
    Candidate(CandidateState),
    PreCandidate(CandidateState),
    Follower(FollowerState),
    Halted(String),
}

struct LeaderState {
    tracker: LeaderStateTracker,
}

struct CandidateState {
    received_votes_from: HashSet<ReplicaId>,
    // Election timed out without a winner: start another round.
    follower_timeout_tracker: FollowerTimerHandle,
}

struct FollowerState {
    leader: Option<LeaderRedirectInfo>,
    follower_timeout_tracker: FollowerTimerHandle,
}

impl CandidateState {
    fn new(config: &ElectionConfig, actor_client: WeakActorClient) -> Self {
        Self {
            received_votes_from: HashSet::with_capacity(3),
            follower_timeout_tracker: FollowerTimerHandle::spawn_timer_task(
                config.follower_min_timeout,
                config.follower_max_timeout,
                actor_client,
            ),
        }
    }

    fn add_received_vote(&mut self, vote_from: ReplicaId) {
        self.received_votes_from.insert(vote_from);
    }
}

impl FollowerState {
    fn new(leader: Option<LeaderRedirectInfo>, config: &ElectionConfig, actor_client: WeakActorClient) -> Self {
        Self {
            leader,
            follower_timeout_tracker: FollowerTimerHandle::spawn_timer_task(
                config.follower_min_timeout,
                config.follower_max_timeout,
                actor_client,
            ),
        }
    }

    fn reset_timeout(&self) {
        self.follower_timeout_tracker.reset_timeout();
    }
}
