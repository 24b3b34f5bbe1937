mod common;

use bytes::Bytes;
use common::{create_root_logger_for_stdout, member_info, repl_id, RecordingStateMachine};
use raft_consensus as raft;
use std::collections::HashMap;
use std::error::Error;
use tokio::time::{Duration, Instant};

#[tokio::test]
async fn leader_election() -> Result<(), Box<dyn Error>> {
    let heartbeat_duration = Duration::from_millis(100);
    let num_members = 5;
    let mut clients = HashMap::with_capacity(num_members);
    for i in 0..num_members {
        let client_config = config(i, num_members, 4100, heartbeat_duration);
        let client_id = client_config.my_replica_id.clone();
        let client = raft::try_create_raft_client(client_config).await?;
        clients.insert(client_id, client);
    }

    let leader_id = discover_leader_id(&mut clients, Duration::from_secs(10)).await;

    // Try to find leader via redirect from any other replica.
    let (_, other_client) = clients.iter().find(|(id, _)| **id != leader_id).unwrap();
    let output = other_client
        .replicated_log()
        .submit(submit_input(1, Bytes::default()))
        .await;
    match output {
        Err(raft::SubmitError::NotLeader(Some(leader))) => assert_eq!(leader.replica_id, leader_id),
        // Either an election is still settling, or we got lucky and the other replica won it.
        Err(raft::SubmitError::NotLeader(None)) | Err(raft::SubmitError::NoLeader) | Ok(_) => {}
        Err(e) => panic!("Failed to find leader: {:?}", e),
    }

    // Confirm leader
    let output = clients
        .get(&leader_id)
        .unwrap()
        .replicated_log()
        .submit(submit_input(2, Bytes::default()))
        .await;
    if let Err(raft::SubmitError::NotLeader(_)) = output {
        panic!("wtf double redirect")
    }

    shutdown_all(clients).await;
    Ok(())
}

#[tokio::test]
async fn simple_commit() -> Result<(), Box<dyn Error>> {
    let num_members = 5;
    let heartbeat_duration = Duration::from_millis(100);
    let mut clients = HashMap::with_capacity(num_members);
    let mut applied = HashMap::with_capacity(num_members);
    for i in 0..num_members {
        let (state_machine, applied_commands) = RecordingStateMachine::new();
        let mut client_config = config(i, num_members, 4200, heartbeat_duration);
        client_config.state_machine = Box::new(state_machine);
        let client_id = client_config.my_replica_id.clone();
        let client = raft::try_create_raft_client(client_config).await?;
        clients.insert(client_id.clone(), client);
        applied.insert(client_id, applied_commands);
    }

    let mut expected = Vec::new();
    for (call_id, text) in ["Hello world", "it's me"].iter().enumerate() {
        let data_to_replicate = Bytes::from(text.to_string());
        let output = submit_until_accepted(&mut clients, call_id as u64, data_to_replicate.clone()).await;
        expected.push(data_to_replicate);
        assert_eq!(output.result, Bytes::from(expected.len().to_string()));

        // Assert that all replicas apply the entry.
        let deadline = Instant::now() + Duration::from_secs(10);
        for (id, applied_commands) in applied.iter() {
            while applied_commands.get().len() < expected.len() {
                assert!(Instant::now() < deadline, "{} didn't apply {:?}", id, text);
                sleep(heartbeat_duration).await;
            }
            assert_eq!(applied_commands.get(), expected);
        }
    }

    shutdown_all(clients).await;
    Ok(())
}

fn config(id: usize, num_members: usize, port_base: u16, heartbeat_duration: Duration) -> raft::RaftClientConfig {
    assert!(id < num_members, "ID must be in the range [0, {}]", num_members - 1);

    let mut cluster_members = Vec::with_capacity(num_members);
    for i in 0..num_members {
        cluster_members.push(member_info(port_base, i));
    }

    let (state_machine, _) = RecordingStateMachine::new();

    raft::RaftClientConfig {
        my_replica_id: repl_id(id),
        cluster_members,
        storage_directory: None,
        info_logger: create_root_logger_for_stdout(repl_id(id)),
        options: raft::RaftOptions {
            leader_heartbeat_duration: Some(heartbeat_duration),
            follower_min_timeout: Some(heartbeat_duration * 5),
            follower_max_timeout: Some(heartbeat_duration * 10),
            rpc_timeout: Some(heartbeat_duration * 2),
            ..raft::RaftOptions::default()
        },
        network: raft::RaftNetwork::Grpc,
        state_machine: Box::new(state_machine),
    }
}

fn submit_input(call_id: u64, command: Bytes) -> raft::SubmitInput {
    raft::SubmitInput {
        client_id: "integration-test".to_string(),
        call_id,
        command,
    }
}

async fn submit_until_accepted(
    clients: &mut HashMap<String, raft::RaftClient>,
    call_id: u64,
    command: Bytes,
) -> raft::SubmitOutput {
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        let leader_id = discover_leader_id(clients, Duration::from_secs(10)).await;
        let output = clients
            .get(&leader_id)
            .expect("Leader missing!")
            .replicated_log()
            .submit(submit_input(call_id, command.clone()))
            .await;

        match output {
            Ok(output) => return output,
            Err(e) if e.is_retryable() && Instant::now() < deadline => sleep(Duration::from_millis(100)).await,
            Err(e) => panic!("Submit failed: {:?}", e),
        }
    }
}

async fn discover_leader_id(clients: &mut HashMap<String, raft::RaftClient>, timeout: Duration) -> String {
    let (any_client_id, any_client) = clients.iter_mut().next().unwrap();
    let mut event_listener = any_client.event_listener();

    let deadline = Instant::now() + timeout;

    loop {
        match event_listener.current() {
            raft::RaftEvent::Election(raft::RaftElectionState::Leader) => return any_client_id.clone(),
            raft::RaftEvent::Election(raft::RaftElectionState::Follower(leader)) => return leader.replica_id,
            raft::RaftEvent::Election(_) => { /* Continue */ }
            raft::RaftEvent::Halted(reason) => panic!("Replica halted: {}", reason),
        }

        tokio::time::timeout_at(deadline, event_listener.next_event())
            .await
            .expect("Timeout waiting for leader election")
            .expect("Expected election event bus to be alive");
    }
}

async fn shutdown_all(clients: HashMap<String, raft::RaftClient>) {
    for (_, client) in clients {
        client.shutdown().await;
    }
}

async fn sleep(duration: Duration) {
    tokio::time::sleep(duration).await;
}
