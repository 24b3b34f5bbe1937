use tokio::time::Instant;

/// Source of time for the replica's timers. Tests drive a `ManualClock` instead of waiting on
/// the wall clock.
#[async_trait::async_trait]
pub(crate) trait Clock: Clone + Send + Sync + 'static {
    fn now(&self) -> Instant;

    /// Returns once `now() >= deadline`.
    async fn sleep_until(&mut self, deadline: Instant);
}

#[derive(Copy, Clone)]
pub(crate) struct TokioClock;

#[async_trait::async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep_until(&mut self, deadline: Instant) {
        tokio::time::sleep_until(deadline).await;
    }
}

#[cfg(test)]
pub(super) use manual::{manual_clock, ManualClock, ManualClockHandle};
