use crate::actor::WeakActorClient;
use crate::api::StateMachine;
use crate::commitlog::{InMemoryLog, Index, Log, SegmentedDiskLog, SegmentedLogOptions};
use crate::replica::applier::{Applier, ApplierInput};
use crate::replica::cluster::ClusterTracker;
use crate::replica::election::{ElectionConfig, ElectionState};
use crate::replica::local_state::{FileLocalState, PersistentLocalState, VolatileLocalState};
use crate::replica::replica::ReplicaConfig;
use crate::replica::retry_cache::RetryCache;
use crate::replica::snapshot::SnapshotStore;
use crate::replica::write_ahead_log::WriteAheadLog;
use crate::replica::{
    ClusterConfiguration, ElectionStateChangeListener, Replica, ReplicaId, ReplicaOptions, WriteAheadLogEntry,
};
use crate::server::RpcServerShutdownHandle;
use crate::transport::RaftTransport;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::Duration;

/// Where a replica keeps its term, vote, log and snapshots.
pub(crate) enum ReplicaStorage {
    /// Nothing survives a restart.
    InMemory,
    /// `<directory>/meta`, `<directory>/log/` and `<directory>/snapshot/`.
    Directory {
        directory: PathBuf,
        log_options: SegmentedLogOptions,
    },
}

pub(crate) struct ReplicaWiringConfig {
    pub(crate) logger: slog::Logger,
    pub(crate) my_replica_id: ReplicaId,
    /// Used unless a snapshot or the log says otherwise.
    pub(crate) initial_configuration: ClusterConfiguration,
    pub(crate) transport: Arc<dyn RaftTransport>,
    pub(crate) storage: ReplicaStorage,
    pub(crate) state_machine: Box<dyn StateMachine>,
    pub(crate) server_shutdown_handle: Option<RpcServerShutdownHandle>,
    pub(crate) actor_client: WeakActorClient,
    pub(crate) retry_cache_capacity: usize,
    pub(crate) retry_cache_expiry: Duration,
    pub(crate) options: ReplicaOptions,
}

/// Recovers a replica from its storage: term and vote, then the latest snapshot, then the log
/// on top of it. The replica starts out as follower.
pub(crate) fn create_replica(config: ReplicaWiringConfig) -> io::Result<(Replica, ElectionStateChangeListener)> {
    let logger = config.logger;
    let my_replica_id = config.my_replica_id;

    let (local_state, log, snapshot_store) = open_storage(&logger, &my_replica_id, config.storage)?;

    let snapshot_metadata = snapshot_store.latest_metadata().cloned();
    let snapshot_floor = snapshot_metadata
        .as_ref()
        .map(|metadata| (metadata.last_included_term, metadata.last_included_index));
    let write_ahead_log = WriteAheadLog::new(logger.clone(), log, snapshot_floor)?;

    // Configuration: the snapshot's, then every configuration entry after it.
    let mut cluster_tracker = ClusterTracker::new(
        my_replica_id.clone(),
        config.initial_configuration,
        config.transport,
    );
    let replay_from = match &snapshot_metadata {
        Some(metadata) => {
            cluster_tracker.reset(Some(metadata.last_included_index), metadata.configuration.clone());
            metadata.last_included_index.plus(1)
        }
        None => Index::start_index(),
    };
    for (index, configuration) in write_ahead_log.configurations_from(replay_from)? {
        cluster_tracker.on_configuration_appended(index, configuration);
    }
    slog::info!(
        logger,
        "Recovered term {:?}, configuration {:?}",
        local_state.current_term(),
        cluster_tracker.current()
    );

    let applier = Applier::spawn(logger.clone(), config.state_machine, config.actor_client.clone());
    if let Some(snapshot) = snapshot_store.latest() {
        slog::info!(
            logger,
            "Restoring state machine from snapshot at {:?}",
            snapshot.metadata.last_included_index
        );
        applier
            .send(ApplierInput::InstallSnapshot(snapshot))
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    }

    let options = config.options;
    let (election_state, election_state_change_listener) = ElectionState::new_follower(
        logger.clone(),
        ElectionConfig {
            my_replica_id: my_replica_id.clone(),
            leader_heartbeat_duration: options.leader_heartbeat_duration,
            follower_min_timeout: options.follower_min_timeout,
            follower_max_timeout: options.follower_max_timeout,
            rpc_timeout: options.rpc_timeout,
            outstanding_appends_max: options.leader_outstanding_appends_max,
        },
        config.actor_client.clone(),
    );

    let replica = Replica::new(ReplicaConfig {
        logger,
        cluster_tracker,
        local_state,
        election_state,
        write_ahead_log,
        retry_cache: RetryCache::new(config.retry_cache_capacity, config.retry_cache_expiry),
        applier,
        snapshot_store,
        actor_client: config.actor_client,
        server_shutdown_handle: config.server_shutdown_handle,
        options,
    });

    Ok((replica, election_state_change_listener))
}

#[allow(clippy::type_complexity)]
fn open_storage(
    logger: &slog::Logger,
    my_replica_id: &ReplicaId,
    storage: ReplicaStorage,
) -> io::Result<(
    Box<dyn PersistentLocalState>,
    Box<dyn Log<WriteAheadLogEntry>>,
    SnapshotStore,
)> {
    match storage {
        ReplicaStorage::InMemory => Ok((
            Box::new(VolatileLocalState::new(my_replica_id.clone())),
            Box::new(InMemoryLog::create()),
            SnapshotStore::in_memory(logger.clone()),
        )),
        ReplicaStorage::Directory { directory, log_options } => {
            slog::info!(logger, "Opening replica storage at {:?}", directory);
            let local_state = FileLocalState::open(&directory, my_replica_id.clone())?;
            let log = SegmentedDiskLog::open(logger.clone(), directory.join("log"), log_options)?;
            let snapshot_store = SnapshotStore::open(logger.clone(), directory.join("snapshot"))?;

            Ok((Box::new(local_state), Box::new(log), snapshot_store))
        }
    }
}
