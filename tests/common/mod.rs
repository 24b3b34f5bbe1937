// Not every test binary uses every helper.
#![allow(dead_code)]

use bytes::{Buf, BufMut, Bytes, BytesMut};
use raft_consensus as raft;
use slog::Drain;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::time::{Duration, Instant};

/// Every command applied to a replica's state machine, in order.
#[derive(Clone, Default)]
pub struct AppliedCommands(Arc<Mutex<Vec<Bytes>>>);

impl AppliedCommands {
    pub fn get(&self) -> Vec<Bytes> {
        self.0.lock().unwrap().clone()
    }
}

/// Misbehaviour to inject into a replica's state machine while a test runs.
#[derive(Clone, Default)]
pub struct StateMachineFaults {
    snapshot_delay: Arc<Mutex<Duration>>,
    poisoned_command: Arc<Mutex<Option<Bytes>>>,
}

impl StateMachineFaults {
    /// Makes every snapshot take `delay`. The state machine blocks its thread meanwhile, so tests
    /// using this need a multi-threaded runtime.
    pub fn slow_snapshots(&self, delay: Duration) {
        *self.snapshot_delay.lock().unwrap() = delay;
    }

    /// Makes applying `command` fail.
    pub fn fail_on(&self, command: Bytes) {
        *self.poisoned_command.lock().unwrap() = Some(command);
    }
}

/// A state machine that remembers every command it was given. Applying returns how many commands
/// have been applied so far.
pub struct RecordingStateMachine {
    applied: AppliedCommands,
    faults: StateMachineFaults,
}

impl RecordingStateMachine {
    pub fn new() -> (Self, AppliedCommands) {
        let applied = AppliedCommands::default();
        (
            RecordingStateMachine {
                applied: applied.clone(),
                faults: StateMachineFaults::default(),
            },
            applied,
        )
    }

    pub fn with_faults(mut self, faults: StateMachineFaults) -> Self {
        self.faults = faults;
        self
    }
}

impl raft::StateMachine for RecordingStateMachine {
    fn apply(&mut self, _index: u64, command: Bytes) -> Result<Bytes, raft::StateMachineError> {
        if self.faults.poisoned_command.lock().unwrap().as_ref() == Some(&command) {
            return Err(raft::StateMachineError::new("Poisoned command"));
        }
        let mut applied = self.applied.0.lock().unwrap();
        applied.push(command);
        Ok(Bytes::from(applied.len().to_string()))
    }

    fn take_snapshot(&mut self) -> Result<Bytes, raft::StateMachineError> {
        let delay = *self.faults.snapshot_delay.lock().unwrap();
        if delay > Duration::from_millis(0) {
            std::thread::sleep(delay);
        }
        let applied = self.applied.0.lock().unwrap();
        let mut buf = BytesMut::new();
        for command in applied.iter() {
            buf.put_u32(command.len() as u32);
            buf.put_slice(command);
        }
        Ok(buf.freeze())
    }

    fn install_snapshot(
        &mut self,
        _last_included_index: u64,
        mut snapshot: Bytes,
    ) -> Result<(), raft::StateMachineError> {
        let mut commands = Vec::new();
        while snapshot.has_remaining() {
            if snapshot.remaining() < 4 {
                return Err(raft::StateMachineError::new("Truncated snapshot"));
            }
            let len = snapshot.get_u32() as usize;
            if snapshot.remaining() < len {
                return Err(raft::StateMachineError::new("Truncated snapshot"));
            }
            commands.push(snapshot.split_to(len));
        }

        *self.applied.0.lock().unwrap() = commands;
        Ok(())
    }
}

pub fn repl_id(id: usize) -> String {
    format!("replica-{}", id + 1)
}

pub fn member_info(port_base: u16, id: usize) -> raft::RaftMemberInfo {
    raft::RaftMemberInfo {
        replica_id: repl_id(id),
        ip_addr: Ipv4Addr::from([127, 0, 0, 1]),
        raft_internal_rpc_port: port_base + id as u16,
        peer_redirect_info_blob: raft::RaftMemberInfoBlob::new(4000 + id as u128),
    }
}

pub fn fast_options() -> raft::RaftOptions {
    raft::RaftOptions {
        leader_heartbeat_duration: Some(Duration::from_millis(50)),
        follower_min_timeout: Some(Duration::from_millis(300)),
        follower_max_timeout: Some(Duration::from_millis(600)),
        rpc_timeout: Some(Duration::from_millis(100)),
        request_timeout: Some(Duration::from_secs(2)),
        ..raft::RaftOptions::default()
    }
}

pub fn command(text: &str) -> Bytes {
    Bytes::from(text.to_string())
}

pub fn create_root_logger_for_stdout(replica_id: String) -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).use_file_location().build().fuse();
    let drain = slog_async::Async::new(drain).build().filter_level(slog::Level::Info).fuse();

    slog::Logger::root(drain, slog::o!("Test" => replica_id))
}

pub struct TestReplica {
    pub client: raft::RaftClient,
    pub applied: AppliedCommands,
    pub faults: StateMachineFaults,
}

/// A cluster of replicas in this process, on a `LocalNetwork`.
pub struct TestCluster {
    network: raft::LocalNetwork,
    members: Vec<raft::RaftMemberInfo>,
    options: raft::RaftOptions,
    storage_root: Option<TempDir>,
    replicas: HashMap<String, TestReplica>,
}

impl TestCluster {
    pub async fn in_memory(num_members: usize, options: raft::RaftOptions) -> Self {
        Self::start_all(num_members, options, None).await
    }

    pub async fn persistent(num_members: usize, options: raft::RaftOptions) -> Self {
        let storage_root = tempfile::tempdir().unwrap();
        Self::start_all(num_members, options, Some(storage_root)).await
    }

    async fn start_all(num_members: usize, options: raft::RaftOptions, storage_root: Option<TempDir>) -> Self {
        let mut cluster = TestCluster {
            network: raft::LocalNetwork::new(),
            members: (0..num_members).map(|i| member_info(0, i)).collect(),
            options,
            storage_root,
            replicas: HashMap::new(),
        };
        for i in 0..num_members {
            cluster.start(&repl_id(i)).await;
        }

        cluster
    }

    pub fn network(&self) -> &raft::LocalNetwork {
        &self.network
    }

    pub fn replica(&self, id: &str) -> &TestReplica {
        self.replicas.get(id).unwrap()
    }

    /// Ids of the running replicas.
    pub fn running(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.replicas.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn member_info(&self, id: &str) -> raft::RaftMemberInfo {
        self.members.iter().find(|m| m.replica_id == id).cloned().unwrap()
    }

    /// Starts (or restarts) `id` with the member list this cluster was created with, plus anything
    /// added since.
    pub async fn start(&mut self, id: &str) {
        let (state_machine, applied) = RecordingStateMachine::new();
        let faults = StateMachineFaults::default();
        let state_machine = state_machine.with_faults(faults.clone());
        let storage_directory = self.storage_root.as_ref().map(|root| root.path().join(id));

        let client = raft::try_create_raft_client(raft::RaftClientConfig {
            my_replica_id: id.to_string(),
            cluster_members: self.members.clone(),
            storage_directory,
            info_logger: create_root_logger_for_stdout(id.to_string()),
            options: self.options.clone(),
            network: raft::RaftNetwork::Local(self.network.clone()),
            state_machine: Box::new(state_machine),
        })
        .await
        .unwrap();

        self.replicas.insert(
            id.to_string(),
            TestReplica {
                client,
                applied,
                faults,
            },
        );
    }

    /// Starts a replica that isn't part of the cluster's configuration yet.
    pub async fn start_new_member(&mut self, id: usize) -> String {
        self.members.push(member_info(0, id));
        let replica_id = repl_id(id);
        self.start(&replica_id).await;
        replica_id
    }

    pub async fn stop(&mut self, id: &str) {
        let replica = self.replicas.remove(id).unwrap();
        replica.client.shutdown().await;
    }

    /// Waits until a majority of `among` agree on who the leader is.
    pub async fn wait_for_leader(&self, among: &[String], timeout: Duration) -> String {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(leader) = self.agreed_leader(among).await {
                return leader;
            }
            assert!(Instant::now() < deadline, "Timeout waiting for leader among {:?}", among);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn agreed_leader(&self, among: &[String]) -> Option<String> {
        let mut statuses = Vec::with_capacity(among.len());
        for id in among {
            if let Ok(status) = self.replica(id).client.status().await {
                statuses.push(status);
            }
        }

        let leader = statuses
            .iter()
            .filter(|s| s.role == raft::RaftRole::Leader)
            .max_by_key(|s| s.term)?;
        let agreeing = statuses
            .iter()
            .filter(|s| s.term == leader.term)
            .filter(|s| s.leader.as_ref().map(|l| l.replica_id.as_str()) == Some(leader.replica_id.as_str()))
            .count();

        if agreeing > among.len() / 2 {
            Some(leader.replica_id.clone())
        } else {
            None
        }
    }

    /// Submits to whoever leads `among`, retrying with the same call id until it's applied.
    pub async fn submit(&self, among: &[String], client_id: &str, call_id: u64, command: Bytes) -> raft::SubmitOutput {
        let deadline = Instant::now() + Duration::from_secs(20);
        loop {
            let leader = self.wait_for_leader(among, Duration::from_secs(10)).await;
            let result = self
                .replica(&leader)
                .client
                .replicated_log()
                .submit(raft::SubmitInput {
                    client_id: client_id.to_string(),
                    call_id,
                    command: command.clone(),
                })
                .await;

            match result {
                Ok(output) => return output,
                Err(e) if e.is_retryable() && Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(e) => panic!("Submit of ({}, {}) failed: {:?}", client_id, call_id, e),
            }
        }
    }

    /// Waits until `id` has applied exactly `expected`.
    pub async fn wait_for_applied(&self, id: &str, expected: &[Bytes], timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            let applied = self.replica(id).applied.get();
            if applied.len() >= expected.len() {
                assert_eq!(applied, expected, "{} applied unexpected commands", id);
                return;
            }
            assert!(
                Instant::now() < deadline,
                "Timeout waiting for {} to apply {} commands, has {}",
                id,
                expected.len(),
                applied.len()
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub async fn shutdown(self) {
        for (_, replica) in self.replicas {
            replica.client.shutdown().await;
        }
    }
}
