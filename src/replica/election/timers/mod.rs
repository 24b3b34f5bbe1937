mod clock;
mod timer;

#[cfg(test)]
mod test_utils;

pub(super) use timer::FollowerTimerHandle;
pub(super) use timer::LeaderTimerHandle;
