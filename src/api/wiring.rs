use crate::actor::{ActorClient, ReplicaActor};
use crate::api::client::RaftClient;
use crate::api::event_bus::RaftEventListener;
use crate::api::options::{RaftOptions, RaftOptionsValidated};
use crate::api::replicated_log::ReplicatedLog;
use crate::api::state_machine::StateMachine;
use crate::api::types::RaftMemberInfo;
use crate::replica::{ClusterConfiguration, ReplicaId, ReplicaMetadata, ReplicaStorage, ReplicaWiringConfig};
use crate::server::RpcServer;
use crate::transport::{GrpcTransport, RaftNetwork, RaftTransport};
use crate::{replica, server};
use std::collections::HashSet;
use std::convert::TryFrom;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

const ACTOR_QUEUE_SIZE: usize = 256;

pub struct RaftClientConfig {
    pub my_replica_id: String,
    /// The cluster to start with. Ignored once the replica's storage records a configuration.
    /// A replica that is about to be added to a running cluster lists the current members plus
    /// itself.
    pub cluster_members: Vec<RaftMemberInfo>,
    /// A directory where we can create files and sub-directories for term/vote, the log and
    /// snapshots. `None` keeps everything in memory and nothing survives a restart.
    pub storage_directory: Option<PathBuf>,
    pub info_logger: slog::Logger,
    pub options: RaftOptions,
    pub network: RaftNetwork,
    pub state_machine: Box<dyn StateMachine>,
}

#[derive(Debug, thiserror::Error)]
pub enum RaftClientCreationError {
    #[error("Invalid cluster info: {0}")]
    InvalidClusterInfo(String),
    #[error("Illegal options for configuring client: {0}")]
    IllegalClientOptions(String),
    #[error("Storage initialization failure")]
    StorageInitialization(io::Error),
    #[error("my replica ID not in cluster config")]
    MeNotInCluster,
}

/// Creates the local replica, starts it as a follower and returns the handle to it. Must be
/// called from within a tokio runtime.
pub async fn try_create_raft_client(config: RaftClientConfig) -> Result<RaftClient, RaftClientCreationError> {
    let root_logger = config
        .info_logger
        .new(slog::o!("ReplicaId" => config.my_replica_id.clone()));

    validate_members(&config.cluster_members)?;
    let my_member_info = my_info(&config.my_replica_id, &config.cluster_members)
        .ok_or(RaftClientCreationError::MeNotInCluster)?;
    let my_server_addr = ReplicaMetadata::from(my_member_info.clone()).socket_addr();

    let options = RaftOptionsValidated::try_from(config.options)
        .map_err(|e| RaftClientCreationError::IllegalClientOptions(e.to_string()))?;

    let my_replica_id = ReplicaId::new(config.my_replica_id);
    let cluster_members = config.cluster_members.into_iter().map(ReplicaMetadata::from).collect();

    let (actor_client, actor_queue_rx) = ActorClient::new(ACTOR_QUEUE_SIZE);

    // Only the gRPC network needs a server. The local network calls into the actor directly.
    let transport: Arc<dyn RaftTransport>;
    let mut server_shutdown_handle = None;
    let mut server_shutdown_signal = None;
    match &config.network {
        RaftNetwork::Grpc => {
            let (handle, signal) = server::shutdown_signal();
            server_shutdown_handle = Some(handle);
            server_shutdown_signal = Some(signal);
            transport = Arc::new(GrpcTransport);
        }
        RaftNetwork::Local(network) => {
            network.register(my_replica_id.clone(), actor_client.weak());
            transport = Arc::new(network.clone());
        }
    }

    let storage = match config.storage_directory {
        Some(directory) => ReplicaStorage::Directory {
            directory,
            log_options: options.log.clone(),
        },
        None => ReplicaStorage::InMemory,
    };

    let (replica, election_state_change_listener) = replica::create_replica(ReplicaWiringConfig {
        logger: root_logger.clone(),
        my_replica_id,
        initial_configuration: ClusterConfiguration::stable(cluster_members),
        transport,
        storage,
        state_machine: config.state_machine,
        server_shutdown_handle,
        actor_client: actor_client.weak(),
        retry_cache_capacity: options.retry_cache_capacity,
        retry_cache_expiry: options.retry_cache_expiry,
        options: options.replica,
    })
    .map_err(RaftClientCreationError::StorageInitialization)?;

    let replica_actor = ReplicaActor::new(root_logger.clone(), actor_queue_rx, replica);
    tokio::spawn(replica_actor.run_event_loop());

    if let Some(signal) = server_shutdown_signal {
        let replica_raft_server = RpcServer::new(root_logger.clone(), actor_client.weak());
        tokio::spawn(replica_raft_server.run(my_server_addr, signal));
    }

    let replicated_log = ReplicatedLog::new(actor_client.clone(), options.request_timeout);
    let event_listener = RaftEventListener::new(election_state_change_listener);

    Ok(RaftClient {
        actor_client,
        replicated_log,
        event_listener,
    })
}

fn validate_members(cluster_members: &[RaftMemberInfo]) -> Result<(), RaftClientCreationError> {
    if cluster_members.is_empty() {
        return Err(RaftClientCreationError::InvalidClusterInfo(
            "Cluster has no members".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for member in cluster_members {
        if !seen.insert(member.replica_id.as_str()) {
            return Err(RaftClientCreationError::InvalidClusterInfo(format!(
                "Replica {} is listed more than once",
                member.replica_id
            )));
        }
    }

    Ok(())
}

fn my_info<'a>(my_replica_id: &str, cluster_members: &'a [RaftMemberInfo]) -> Option<&'a RaftMemberInfo> {
    cluster_members
        .iter()
        .find(|member_info| member_info.replica_id == my_replica_id)
}
