use crate::commitlog::{LogSyncPolicy, SegmentedLogOptions};
use crate::replica::ReplicaOptions;
use std::collections::HashMap;
use std::convert::TryFrom;
use tokio::time::Duration;

/// Tuning knobs. Anything left as `None` gets a default.
#[derive(Clone, Debug, Default)]
pub struct RaftOptions {
    pub leader_heartbeat_duration: Option<Duration>,
    pub follower_min_timeout: Option<Duration>,
    pub follower_max_timeout: Option<Duration>,
    /// Timeout of a single RequestVote/AppendEntries/InstallSnapshot call to a peer.
    pub rpc_timeout: Option<Duration>,
    /// How long `ReplicatedLog::submit()` waits for the command to be applied.
    pub request_timeout: Option<Duration>,
    /// A peer that hasn't answered for this long is reported unhealthy.
    pub rpc_slowness_timeout: Option<Duration>,
    pub pre_vote: Option<bool>,

    pub retry_cache_capacity: Option<usize>,
    pub retry_cache_expiry: Option<Duration>,

    /// A new member is promoted to voter once it is within this many entries of the leader.
    pub staging_catchup_gap: Option<u64>,

    pub log_segment_size_max: Option<u64>,
    pub log_segment_cache_num_max: Option<usize>,
    /// fsync after this many appended entries. 0 means fsync every append.
    pub log_force_sync_num: Option<u64>,
    pub log_queue_size: Option<usize>,

    pub append_entries_batch_byte_limit: Option<usize>,
    pub append_entries_batch_entry_limit: Option<usize>,
    pub leader_outstanding_appends_max: Option<usize>,

    pub snapshot_chunk_size_max: Option<usize>,
    pub snapshot_auto_trigger_enabled: Option<bool>,
    /// Applied entries since the last snapshot that trigger a new one.
    pub snapshot_auto_trigger_threshold: Option<u64>,
    pub snapshot_retention_entries: Option<u64>,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RaftOptionsError {
    #[error("Illegal options: {0}")]
    Illegal(&'static str),
    #[error("Property {key} has unparseable value {value:?}")]
    UnparseableProperty { key: String, value: String },
}

const KB: u64 = 1024;
const MB: u64 = 1024 * KB;
const GB: u64 = 1024 * MB;

impl RaftOptions {
    /// Reads options from `raft.server.*` / `raft.grpc.*` properties. Unknown keys are ignored,
    /// missing keys stay `None`.
    ///
    /// Durations take a `ms`, `s` or `min` suffix (no suffix means ms). Sizes take a `KB`, `MB`
    /// or `GB` suffix (binary units, no suffix means bytes).
    pub fn from_properties(properties: &HashMap<String, String>) -> Result<RaftOptions, RaftOptionsError> {
        let p = PropertyReader { properties };

        Ok(RaftOptions {
            leader_heartbeat_duration: None,
            follower_min_timeout: p.duration("raft.server.rpc.timeout.min")?,
            follower_max_timeout: p.duration("raft.server.rpc.timeout.max")?,
            rpc_timeout: None,
            request_timeout: p.duration("raft.server.rpc.request.timeout")?,
            rpc_slowness_timeout: p.duration("raft.server.rpc.slowness.timeout")?,
            pre_vote: p.parsed("raft.server.leaderelection.pre-vote")?,
            retry_cache_capacity: p.parsed("raft.server.retrycache.capacity")?,
            retry_cache_expiry: p.duration("raft.server.retrycache.expirytime")?,
            staging_catchup_gap: p.parsed("raft.server.staging.catchup.gap")?,
            log_segment_size_max: p.size("raft.server.log.segment.size.max")?,
            log_segment_cache_num_max: p.parsed("raft.server.log.segment.cache.num.max")?,
            log_force_sync_num: p.parsed("raft.server.log.force.sync.num")?,
            log_queue_size: p.parsed("raft.server.log.queue.size")?,
            append_entries_batch_byte_limit: p
                .size("raft.server.log.appender.buffer.byte-limit")?
                .map(|size| size as usize),
            append_entries_batch_entry_limit: p.parsed("raft.server.log.appender.buffer.element-limit")?,
            leader_outstanding_appends_max: p.parsed("raft.grpc.server.leader.outstanding.appends.max")?,
            snapshot_chunk_size_max: p
                .size("raft.server.log.appender.snapshot.chunk.size.max")?
                .map(|size| size as usize),
            snapshot_auto_trigger_enabled: p.parsed("raft.server.snapshot.auto.trigger.enabled")?,
            snapshot_auto_trigger_threshold: p.parsed("raft.server.snapshot.auto.trigger.threshold")?,
            snapshot_retention_entries: p.parsed("raft.server.snapshot.retention.entries")?,
        })
    }
}

struct PropertyReader<'a> {
    properties: &'a HashMap<String, String>,
}

impl<'a> PropertyReader<'a> {
    fn get(&self, key: &str) -> Option<&'a str> {
        self.properties.get(key).map(|value| value.trim())
    }

    fn unparseable(key: &str, value: &str) -> RaftOptionsError {
        RaftOptionsError::UnparseableProperty {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    fn parsed<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>, RaftOptionsError> {
        match self.get(key) {
            None => Ok(None),
            Some(value) => value.parse().map(Some).map_err(|_| Self::unparseable(key, value)),
        }
    }

    fn duration(&self, key: &str) -> Result<Option<Duration>, RaftOptionsError> {
        match self.get(key) {
            None => Ok(None),
            Some(value) => parse_duration(value).map(Some).ok_or_else(|| Self::unparseable(key, value)),
        }
    }

    fn size(&self, key: &str) -> Result<Option<u64>, RaftOptionsError> {
        match self.get(key) {
            None => Ok(None),
            Some(value) => parse_size(value).map(Some).ok_or_else(|| Self::unparseable(key, value)),
        }
    }
}

fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    // "ms" before "s", and "min" before anything else that ends in a letter.
    let (number, unit_millis) = if let Some(number) = value.strip_suffix("ms") {
        (number, 1)
    } else if let Some(number) = value.strip_suffix("min") {
        (number, 60_000)
    } else if let Some(number) = value.strip_suffix('s') {
        (number, 1000)
    } else {
        (value, 1)
    };

    let number: u64 = number.trim().parse().ok()?;
    number.checked_mul(unit_millis).map(Duration::from_millis)
}

fn parse_size(value: &str) -> Option<u64> {
    let value = value.trim();
    let upper = value.to_ascii_uppercase();
    let (number, unit) = if upper.ends_with("GB") {
        (&value[..value.len() - 2], GB)
    } else if upper.ends_with("MB") {
        (&value[..value.len() - 2], MB)
    } else if upper.ends_with("KB") {
        (&value[..value.len() - 2], KB)
    } else {
        (value, 1)
    };

    let number: u64 = number.trim().parse().ok()?;
    number.checked_mul(unit)
}

pub(super) struct RaftOptionsValidated {
    pub(super) replica: ReplicaOptions,
    pub(super) log: SegmentedLogOptions,
    pub(super) request_timeout: Duration,
    pub(super) retry_cache_capacity: usize,
    pub(super) retry_cache_expiry: Duration,
}

impl RaftOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        let replica = &self.replica;
        if replica.leader_heartbeat_duration >= replica.follower_min_timeout {
            return Err("Follower minimum timeout must be greater than leader's heartbeat");
        }
        if replica.follower_min_timeout >= replica.follower_max_timeout {
            return Err("Follower minimum timeout must be less than maximum timeout");
        }
        if replica.rpc_timeout >= replica.follower_min_timeout {
            return Err("RPC timeout must be less than the follower's minimum timeout");
        }
        if self.request_timeout == Duration::from_millis(0) {
            return Err("Request timeout must be positive");
        }
        if self.retry_cache_capacity == 0 {
            return Err("Retry cache capacity must be positive");
        }
        if replica.append_entries_batch_byte_limit == 0 || replica.append_entries_batch_entry_limit == 0 {
            return Err("AppendEntries batch limits must be positive");
        }
        if replica.leader_outstanding_appends_max == 0 {
            return Err("Leader must allow at least one outstanding AppendEntries per peer");
        }
        if replica.snapshot_chunk_size_max == 0 {
            return Err("Snapshot chunk size must be positive");
        }
        if replica.snapshot_auto_trigger_threshold == Some(0) {
            return Err("Auto snapshot threshold must be positive");
        }
        if self.log.segment_size_max < KB {
            return Err("Log segment size must be at least 1KB");
        }
        if self.log.segment_cache_num_max == 0 {
            return Err("Log segment cache must hold at least one segment");
        }
        if self.log.queue_size == 0 {
            return Err("Log queue size must be positive");
        }

        Ok(())
    }
}

impl TryFrom<RaftOptions> for RaftOptionsValidated {
    type Error = &'static str;

    fn try_from(options: RaftOptions) -> Result<Self, Self::Error> {
        let auto_snapshot = options.snapshot_auto_trigger_enabled.unwrap_or(false);
        let auto_snapshot_threshold = options.snapshot_auto_trigger_threshold.unwrap_or(400_000);

        let sync_policy = match options.log_force_sync_num.unwrap_or(128) {
            0 => LogSyncPolicy::EveryAppend,
            n => LogSyncPolicy::EveryNEntries(n),
        };

        // Unset timings follow the follower's minimum timeout, so overriding just that stays valid.
        let follower_min_timeout = options.follower_min_timeout.unwrap_or(Duration::from_millis(150));
        let values = RaftOptionsValidated {
            replica: ReplicaOptions {
                leader_heartbeat_duration: options.leader_heartbeat_duration.unwrap_or(follower_min_timeout / 2),
                follower_min_timeout,
                follower_max_timeout: options.follower_max_timeout.unwrap_or(follower_min_timeout * 2),
                rpc_timeout: options.rpc_timeout.unwrap_or(follower_min_timeout * 2 / 3),
                rpc_slowness_timeout: options.rpc_slowness_timeout.unwrap_or(Duration::from_secs(60)),
                pre_vote: options.pre_vote.unwrap_or(true),
                append_entries_batch_byte_limit: options
                    .append_entries_batch_byte_limit
                    .unwrap_or(4 * MB as usize),
                append_entries_batch_entry_limit: options.append_entries_batch_entry_limit.unwrap_or(1024),
                leader_outstanding_appends_max: options.leader_outstanding_appends_max.unwrap_or(128),
                staging_catchup_gap: options.staging_catchup_gap.unwrap_or(1000),
                snapshot_chunk_size_max: options.snapshot_chunk_size_max.unwrap_or(16 * MB as usize),
                snapshot_auto_trigger_threshold: if auto_snapshot {
                    Some(auto_snapshot_threshold)
                } else {
                    None
                },
                snapshot_retention_entries: options.snapshot_retention_entries.unwrap_or(1024),
            },
            log: SegmentedLogOptions {
                segment_size_max: options.log_segment_size_max.unwrap_or(8 * MB),
                segment_cache_num_max: options.log_segment_cache_num_max.unwrap_or(6),
                sync_policy,
                queue_size: options.log_queue_size.unwrap_or(4096),
            },
            request_timeout: options.request_timeout.unwrap_or(Duration::from_secs(3)),
            retry_cache_capacity: options.retry_cache_capacity.unwrap_or(4096),
            retry_cache_expiry: options.retry_cache_expiry.unwrap_or(Duration::from_secs(60)),
        };

        values.validate()?;
        Ok(values)
    }
}
