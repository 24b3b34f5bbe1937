use crate::actor::{ActorExited, WeakActorClient};
use crate::replica::election::timers::clock::{Clock, TokioClock};
use crate::replica::{ElectionTimeoutTick, LeaderTimerTick, ReplicaId, Term};
use rand::Rng;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::{Duration, Instant};

/// What a timer tells the actor when it fires, and when it fires next if nobody pushes it back.
enum Alarm {
    /// Leader: time to send AppendEntries (possibly empty) to one peer.
    Heartbeat { tick: LeaderTimerTick, every: Duration },
    /// Follower or candidate: no word from a leader, time to start an election.
    ElectionTimeout {
        within: RangeInclusive<Duration>,
        generation: u64,
    },
}

impl Alarm {
    fn next_delay(&self) -> Duration {
        match self {
            Alarm::Heartbeat { every, .. } => *every,
            Alarm::ElectionTimeout { within, .. } => rand::thread_rng().gen_range(within.clone()),
        }
    }

    async fn ring(&self, actor_client: &WeakActorClient, epoch: u64) -> Result<(), ActorExited> {
        match self {
            Alarm::Heartbeat { tick, .. } => actor_client.leader_timer(tick.clone()).await,
            Alarm::ElectionTimeout { generation, .. } => {
                let tick = ElectionTimeoutTick {
                    generation: *generation,
                    epoch,
                };
                actor_client.follower_timeout(tick).await
            }
        }
    }
}

// Shared between a handle and its task.
#[derive(Default)]
struct Slot {
    // Set by `push_back()`, consumed by the task. None once the task has slept past it.
    deadline: Option<Instant>,
    // Bumped by every `push_back()`. A ring carries the epoch it was armed in.
    epoch: u64,
    cancelled: bool,
}

/// A timer task that rings the actor whenever its deadline passes without being pushed back.
/// The task exits once the handle is dropped, or once the actor is gone.
struct TimerHandle<C: Clock> {
    slot: Arc<Mutex<Slot>>,
    alarm: Arc<Alarm>,
    clock: C,
}

impl<C: Clock> TimerHandle<C> {
    /// `armed == false` rings right away.
    fn spawn(alarm: Alarm, actor_client: WeakActorClient, clock: C, armed: bool) -> Self {
        let handle = TimerHandle {
            slot: Arc::new(Mutex::new(Slot::default())),
            alarm: Arc::new(alarm),
            clock,
        };
        if armed {
            handle.push_back();
        }

        let task = TimerTask {
            slot: handle.slot.clone(),
            alarm: handle.alarm.clone(),
            clock: handle.clock.clone(),
            actor_client,
        };
        tokio::spawn(task.run());

        handle
    }

    fn push_back(&self) {
        let deadline = self.clock.now() + self.alarm.next_delay();
        let mut slot = lock(&self.slot);
        slot.deadline = Some(deadline);
        slot.epoch += 1;
    }

    fn epoch(&self) -> u64 {
        lock(&self.slot).epoch
    }
}

impl<C: Clock> Drop for TimerHandle<C> {
    fn drop(&mut self) {
        lock(&self.slot).cancelled = true;
    }
}

struct TimerTask<C: Clock> {
    slot: Arc<Mutex<Slot>>,
    alarm: Arc<Alarm>,
    clock: C,
    actor_client: WeakActorClient,
}

impl<C: Clock> TimerTask<C> {
    async fn run(mut self) {
        loop {
            let (deadline, epoch) = {
                let mut slot = lock(&self.slot);
                if slot.cancelled {
                    return;
                }
                (slot.deadline.take(), slot.epoch)
            };

            match deadline {
                // Someone pushed the deadline since we last looked. Sleep until then and look again.
                Some(deadline) => self.clock.sleep_until(deadline).await,
                None => {
                    if self.alarm.ring(&self.actor_client, epoch).await.is_err() {
                        return;
                    }
                    // Ring again later unless the actor pushes it back in the meantime.
                    let next = self.clock.now() + self.alarm.next_delay();
                    let mut slot = lock(&self.slot);
                    if slot.deadline.is_none() {
                        slot.deadline = Some(next);
                    }
                }
            }
        }
    }
}

// Critical sections only touch plain fields, so a poisoned lock still holds a valid slot.
fn lock(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Per-peer heartbeat of a leader. Rings right away when started, so a new leader (or a newly
/// added peer) hears from us without waiting a full heartbeat.
pub(crate) struct LeaderTimerHandle<C: Clock = TokioClock> {
    timer: TimerHandle<C>,
}

impl LeaderTimerHandle {
    pub(crate) fn spawn_timer_task(
        heartbeat_duration: Duration,
        actor_client: WeakActorClient,
        peer_id: ReplicaId,
        term: Term,
    ) -> Self {
        Self::with_clock(heartbeat_duration, actor_client, peer_id, term, TokioClock)
    }
}

impl<C: Clock> LeaderTimerHandle<C> {
    fn with_clock(
        heartbeat_duration: Duration,
        actor_client: WeakActorClient,
        peer_id: ReplicaId,
        term: Term,
        clock: C,
    ) -> Self {
        let alarm = Alarm::Heartbeat {
            tick: LeaderTimerTick { peer_id, term },
            every: heartbeat_duration,
        };

        LeaderTimerHandle {
            timer: TimerHandle::spawn(alarm, actor_client, clock, false),
        }
    }

    /// We just sent this peer something, so it doesn't need a heartbeat for a while.
    pub(crate) fn reset_heartbeat_timer(&self) {
        self.timer.push_back();
    }
}

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Election timeout of a follower or candidate. Each (re)arm draws a fresh random timeout from
/// `[min_timeout, max_timeout]`, so candidates of a split vote don't keep colliding.
///
/// Every handle has its own generation, and every reset starts a new epoch. A timeout that was
/// queued before a reset or before the handle was replaced is stale, see `is_current()`.
pub(crate) struct FollowerTimerHandle<C: Clock = TokioClock> {
    timer: TimerHandle<C>,
    generation: u64,
}

impl FollowerTimerHandle {
    pub(crate) fn spawn_timer_task(
        min_timeout: Duration,
        max_timeout: Duration,
        actor_client: WeakActorClient,
    ) -> Self {
        Self::with_clock(min_timeout, max_timeout, actor_client, TokioClock)
    }
}

impl<C: Clock> FollowerTimerHandle<C> {
    fn with_clock(min_timeout: Duration, max_timeout: Duration, actor_client: WeakActorClient, clock: C) -> Self {
        let generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
        let alarm = Alarm::ElectionTimeout {
            within: min_timeout..=max_timeout,
            generation,
        };

        // Armed from the start, or a fresh follower would call an election right away.
        FollowerTimerHandle {
            timer: TimerHandle::spawn(alarm, actor_client, clock, true),
            generation,
        }
    }

    /// We heard from the leader (or granted a vote).
    pub(crate) fn reset_timeout(&self) {
        self.timer.push_back();
    }

    /// Whether `tick` was rung by this handle since its last reset.
    pub(crate) fn is_current(&self, tick: ElectionTimeoutTick) -> bool {
        tick.generation == self.generation && tick.epoch == self.timer.epoch()
    }
}
