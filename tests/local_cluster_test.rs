mod common;

use bytes::Bytes;
use common::{command, fast_options, TestCluster};
use raft_consensus as raft;
use std::error::Error;
use tokio::time::Duration;

const APPLY_TIMEOUT: Duration = Duration::from_secs(15);

fn commands(prefix: &str, n: usize) -> Vec<Bytes> {
    (0..n).map(|i| command(&format!("{}-{}", prefix, i))).collect()
}

#[tokio::test]
async fn five_node_partition_only_majority_commits() -> Result<(), Box<dyn Error>> {
    let cluster = TestCluster::in_memory(5, fast_options()).await;
    let all = cluster.running();

    let mut expected = Vec::new();
    let before = command("before-partition");
    cluster.submit(&all, "app", 1, before.clone()).await;
    expected.push(before);

    // Leader and one follower on the minority side.
    let old_leader = cluster.wait_for_leader(&all, Duration::from_secs(10)).await;
    let minority: Vec<String> = vec![
        old_leader.clone(),
        all.iter().find(|id| **id != old_leader).cloned().unwrap(),
    ];
    let majority: Vec<String> = all.iter().filter(|id| !minority.contains(id)).cloned().collect();
    let minority_refs: Vec<&str> = minority.iter().map(String::as_str).collect();
    let majority_refs: Vec<&str> = majority.iter().map(String::as_str).collect();
    cluster.network().partition(&minority_refs, &majority_refs);

    // The old leader can't commit anything.
    let stranded = cluster
        .replica(&old_leader)
        .client
        .replicated_log()
        .submit(raft::SubmitInput {
            client_id: "stranded".to_string(),
            call_id: 1,
            command: command("stranded"),
        })
        .await;
    match stranded {
        Ok(output) => panic!("Minority leader committed {:?}", output),
        Err(e) => assert!(e.is_retryable(), "Unexpected error {:?}", e),
    }

    // The majority elects a new leader and keeps going.
    let new_leader = cluster.wait_for_leader(&majority, Duration::from_secs(10)).await;
    assert!(!minority.contains(&new_leader));
    for (i, c) in commands("during-partition", 3).into_iter().enumerate() {
        cluster.submit(&majority, "app", 10 + i as u64, c.clone()).await;
        expected.push(c);
    }

    // Once healed, everyone converges on the majority's history.
    cluster.network().heal();
    for id in &all {
        cluster.wait_for_applied(id, &expected, APPLY_TIMEOUT).await;
    }

    let status = cluster.replica(&old_leader).client.status().await?;
    assert_ne!(status.role, raft::RaftRole::Leader);

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn retry_after_leader_crash_is_applied_once() -> Result<(), Box<dyn Error>> {
    let mut cluster = TestCluster::in_memory(3, fast_options()).await;
    let all = cluster.running();

    let first = cluster.submit(&all, "app", 7, command("once")).await;
    assert_eq!(first.result, Bytes::from("1"));

    let leader = cluster.wait_for_leader(&all, Duration::from_secs(10)).await;
    let survivors: Vec<String> = all.iter().filter(|id| **id != leader).cloned().collect();
    for id in &survivors {
        cluster.wait_for_applied(id, &[command("once")], APPLY_TIMEOUT).await;
    }
    cluster.stop(&leader).await;

    // Same client and call id on the new leader: the original result, nothing re-applied.
    let retried = cluster.submit(&survivors, "app", 7, command("once")).await;
    assert_eq!(retried, first);

    let next = cluster.submit(&survivors, "app", 8, command("twice")).await;
    assert_eq!(next.result, Bytes::from("2"));
    for id in &survivors {
        cluster
            .wait_for_applied(id, &[command("once"), command("twice")], APPLY_TIMEOUT)
            .await;
    }

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn lagging_follower_catches_up_from_snapshot() -> Result<(), Box<dyn Error>> {
    let options = raft::RaftOptions {
        snapshot_retention_entries: Some(0),
        ..fast_options()
    };
    let cluster = TestCluster::in_memory(3, options).await;
    let all = cluster.running();

    let leader = cluster.wait_for_leader(&all, Duration::from_secs(10)).await;
    let lagging = all.iter().find(|id| **id != leader).cloned().unwrap();
    let connected: Vec<String> = all.iter().filter(|id| **id != lagging).cloned().collect();
    cluster.network().isolate(&lagging);

    let expected = commands("while-away", 20);
    for (i, c) in expected.iter().enumerate() {
        cluster.submit(&connected, "app", i as u64, c.clone()).await;
    }

    let leader = cluster.wait_for_leader(&connected, Duration::from_secs(10)).await;
    let snapshot = cluster.replica(&leader).client.take_snapshot().await?;
    let status = cluster.replica(&leader).client.status().await?;
    assert_eq!(status.snapshot_index, snapshot.last_included_index);
    assert!(status.first_log_index > 1, "Log wasn't compacted: {:?}", status);

    // The entries the follower is missing are gone from the leader's log.
    cluster.network().heal();
    cluster.wait_for_applied(&lagging, &expected, APPLY_TIMEOUT).await;
    let lagging_status = cluster.replica(&lagging).client.status().await?;
    assert!(lagging_status.snapshot_index >= snapshot.last_included_index);

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn isolated_leader_entries_are_replaced() -> Result<(), Box<dyn Error>> {
    let cluster = TestCluster::in_memory(3, fast_options()).await;
    let all = cluster.running();

    let mut expected = vec![command("common")];
    cluster.submit(&all, "app", 1, command("common")).await;

    let old_leader = cluster.wait_for_leader(&all, Duration::from_secs(10)).await;
    let others: Vec<String> = all.iter().filter(|id| **id != old_leader).cloned().collect();
    cluster.network().isolate(&old_leader);

    // These land in the old leader's log only.
    let mut stranded = Vec::new();
    for i in 0..3 {
        let log = cluster.replica(&old_leader).client.replicated_log();
        stranded.push(tokio::spawn(async move {
            log.submit(raft::SubmitInput {
                client_id: "stranded".to_string(),
                call_id: i,
                command: Bytes::from(format!("stranded-{}", i)),
            })
            .await
        }));
    }

    for (i, c) in commands("other-side", 4).into_iter().enumerate() {
        cluster.submit(&others, "app", 10 + i as u64, c.clone()).await;
        expected.push(c);
    }
    for handle in stranded {
        assert!(handle.await?.is_err());
    }

    cluster.network().heal();
    for id in &all {
        cluster.wait_for_applied(id, &expected, APPLY_TIMEOUT).await;
    }

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn restarted_cluster_recovers_from_disk() -> Result<(), Box<dyn Error>> {
    let options = raft::RaftOptions {
        log_segment_size_max: Some(4 * 1024),
        snapshot_retention_entries: Some(2),
        ..fast_options()
    };
    let mut cluster = TestCluster::persistent(3, options).await;
    let all = cluster.running();

    let expected = commands("durable", 30);
    for (i, c) in expected[..20].iter().enumerate() {
        cluster.submit(&all, "app", i as u64, c.clone()).await;
    }
    let leader = cluster.wait_for_leader(&all, Duration::from_secs(10)).await;
    cluster.replica(&leader).client.take_snapshot().await?;
    let mut last_output = None;
    for (i, c) in expected[20..].iter().enumerate() {
        last_output = Some(cluster.submit(&all, "app", 20 + i as u64, c.clone()).await);
    }

    for id in &all {
        cluster.stop(id).await;
    }
    for id in &all {
        cluster.start(id).await;
    }

    // Fresh state machines get everything back: snapshot, then the log after it.
    for id in &all {
        cluster.wait_for_applied(id, &expected, APPLY_TIMEOUT).await;
    }

    // Replaying the log brings back what was applied for each call id after the snapshot, so a
    // late retry is still answered from it.
    let retried = cluster.submit(&all, "app", 29, expected[29].clone()).await;
    assert_eq!(Some(retried), last_output);

    let status = cluster.replica(&all[0]).client.status().await?;
    assert!(status.term > 1, "Term wasn't persisted: {:?}", status);

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn membership_change_adds_and_removes_members() -> Result<(), Box<dyn Error>> {
    let mut cluster = TestCluster::in_memory(3, fast_options()).await;
    let original = cluster.running();

    let mut expected = commands("before-join", 5);
    for (i, c) in expected.iter().enumerate() {
        cluster.submit(&original, "app", i as u64, c.clone()).await;
    }

    let joining = cluster.start_new_member(3).await;
    let leader = cluster.wait_for_leader(&original, Duration::from_secs(10)).await;
    let grown: Vec<raft::RaftMemberInfo> = original
        .iter()
        .chain(std::iter::once(&joining))
        .map(|id| cluster.member_info(id))
        .collect();
    cluster.replica(&leader).client.change_membership(grown).await?;

    let status = cluster.replica(&leader).client.status().await?;
    assert_eq!(status.members.len(), 4);
    assert_eq!(status.old_members, None);

    // The new member has the whole history and keeps up.
    let everyone = cluster.running();
    let c = command("after-join");
    cluster.submit(&everyone, "app", 100, c.clone()).await;
    expected.push(c);
    cluster.wait_for_applied(&joining, &expected, APPLY_TIMEOUT).await;

    // Remove one of the original followers.
    let leader = cluster.wait_for_leader(&everyone, Duration::from_secs(10)).await;
    let removed = original.iter().find(|id| **id != leader).cloned().unwrap();
    let shrunk: Vec<raft::RaftMemberInfo> = everyone
        .iter()
        .filter(|id| **id != removed)
        .map(|id| cluster.member_info(id))
        .collect();
    cluster.replica(&leader).client.change_membership(shrunk).await?;

    let status = cluster.replica(&leader).client.status().await?;
    assert_eq!(status.members.len(), 3);
    assert!(!status.members.contains(&removed));
    assert!(status.peers.iter().all(|p| p.replica_id != removed));

    cluster.stop(&removed).await;
    let remaining: Vec<String> = everyone.into_iter().filter(|id| *id != removed).collect();
    let c = command("after-leave");
    cluster.submit(&remaining, "app", 101, c.clone()).await;
    expected.push(c);
    for id in &remaining {
        cluster.wait_for_applied(id, &expected, APPLY_TIMEOUT).await;
    }

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn membership_change_rejects_bad_requests() -> Result<(), Box<dyn Error>> {
    let cluster = TestCluster::in_memory(3, fast_options()).await;
    let all = cluster.running();
    let leader = cluster.wait_for_leader(&all, Duration::from_secs(10)).await;
    let mut follower = None;
    for id in all.iter().filter(|id| **id != leader) {
        let status = cluster.replica(id).client.status().await?;
        if status.leader.map(|l| l.replica_id) == Some(leader.clone()) {
            follower = Some(id.clone());
        }
    }
    let follower = follower.unwrap();

    let members: Vec<raft::RaftMemberInfo> = all.iter().map(|id| cluster.member_info(id)).collect();
    match cluster.replica(&follower).client.change_membership(members).await {
        Err(raft::ChangeMembershipError::NotLeader(Some(info))) => assert_eq!(info.replica_id, leader),
        other => panic!("Expected redirect, got {:?}", other),
    }

    match cluster.replica(&leader).client.change_membership(vec![]).await {
        Err(raft::ChangeMembershipError::InvalidConfiguration(_)) => {}
        other => panic!("Expected invalid configuration, got {:?}", other),
    }

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn status_reports_replication_progress() -> Result<(), Box<dyn Error>> {
    let cluster = TestCluster::in_memory(3, fast_options()).await;
    let all = cluster.running();

    let output = cluster.submit(&all, "app", 1, command("tracked")).await;
    for id in &all {
        cluster.wait_for_applied(id, &[command("tracked")], APPLY_TIMEOUT).await;
    }

    let leader = cluster.wait_for_leader(&all, Duration::from_secs(10)).await;
    let status = cluster.replica(&leader).client.status().await?;
    assert_eq!(status.role, raft::RaftRole::Leader);
    assert_eq!(status.leader.map(|l| l.replica_id), Some(leader.clone()));
    assert!(status.commit_index >= output.applied_index);
    assert_eq!(status.members.len(), 3);
    assert_eq!(status.peers.len(), 2);
    for peer in &status.peers {
        assert!(peer.healthy, "{:?}", peer);
        assert!(peer.match_index >= output.applied_index, "{:?}", peer);
        assert!(peer.next_index > peer.match_index, "{:?}", peer);
    }

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn shut_down_replica_rejects_requests() -> Result<(), Box<dyn Error>> {
    let cluster = TestCluster::in_memory(1, fast_options()).await;
    let all = cluster.running();
    cluster.submit(&all, "app", 1, command("solo")).await;

    let client = cluster.replica(&all[0]).client.clone();
    let mut events = client.event_listener();
    client.shutdown().await;

    let result = client
        .replicated_log()
        .submit(raft::SubmitInput {
            client_id: "app".to_string(),
            call_id: 2,
            command: command("too late"),
        })
        .await;
    assert!(matches!(result, Err(raft::SubmitError::ReplicaExited)));
    assert!(client.status().await.is_err());
    assert_eq!(events.current(), raft::RaftEvent::Halted("Shut down".to_string()));
    assert_eq!(
        events.next_event().await,
        Some(raft::RaftEvent::Halted("Shut down".to_string()))
    );
    assert_eq!(events.next_event().await, None);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_local_snapshot_never_replaces_installed_one() -> Result<(), Box<dyn Error>> {
    let options = raft::RaftOptions {
        snapshot_retention_entries: Some(0),
        ..fast_options()
    };
    let cluster = TestCluster::in_memory(3, options).await;
    let all = cluster.running();

    let mut expected = vec![command("before")];
    cluster.submit(&all, "app", 0, command("before")).await;
    let leader = cluster.wait_for_leader(&all, Duration::from_secs(10)).await;
    let lagging = all.iter().find(|id| **id != leader).cloned().unwrap();
    let connected: Vec<String> = all.iter().filter(|id| **id != lagging).cloned().collect();
    cluster.wait_for_applied(&lagging, &expected, APPLY_TIMEOUT).await;

    cluster.network().isolate(&lagging);
    for (i, c) in commands("while-away", 19).into_iter().enumerate() {
        cluster.submit(&connected, "app", 1 + i as u64, c.clone()).await;
        expected.push(c);
    }
    let leader = cluster.wait_for_leader(&connected, Duration::from_secs(10)).await;
    let leader_snapshot = cluster.replica(&leader).client.take_snapshot().await?;

    // The follower starts snapshotting its short history, and the leader's snapshot lands meanwhile.
    cluster.replica(&lagging).faults.slow_snapshots(Duration::from_millis(1500));
    let lagging_client = cluster.replica(&lagging).client.clone();
    let local_snapshot = tokio::spawn(async move { lagging_client.take_snapshot().await });
    tokio::time::sleep(Duration::from_millis(200)).await;
    cluster.network().heal();

    cluster.wait_for_applied(&lagging, &expected, APPLY_TIMEOUT).await;
    let local_snapshot = local_snapshot.await??;
    assert!(
        local_snapshot.last_included_index >= leader_snapshot.last_included_index,
        "{:?} < {:?}",
        local_snapshot,
        leader_snapshot
    );
    let status = cluster.replica(&lagging).client.status().await?;
    assert!(status.snapshot_index >= leader_snapshot.last_included_index, "{:?}", status);

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn submit_without_quorum_times_out() -> Result<(), Box<dyn Error>> {
    // Shorter than check-quorum, so the leader still thinks it leads when the request gives up.
    let options = raft::RaftOptions {
        request_timeout: Some(Duration::from_millis(200)),
        ..fast_options()
    };
    let cluster = TestCluster::in_memory(3, options).await;
    let all = cluster.running();
    cluster.submit(&all, "app", 1, command("committed")).await;

    let leader = cluster.wait_for_leader(&all, Duration::from_secs(10)).await;
    cluster.network().isolate(&leader);

    let result = cluster
        .replica(&leader)
        .client
        .replicated_log()
        .submit(raft::SubmitInput {
            client_id: "app".to_string(),
            call_id: 2,
            command: command("stuck"),
        })
        .await;
    assert!(matches!(result, Err(raft::SubmitError::Timeout)), "{:?}", result);
    assert!(raft::SubmitError::Timeout.is_retryable());

    // The retry lands once a majority is reachable again.
    cluster.network().heal();
    let output = cluster.submit(&all, "app", 2, command("stuck")).await;
    assert_eq!(output.result, Bytes::from("2"));
    for id in &all {
        cluster
            .wait_for_applied(id, &[command("committed"), command("stuck")], APPLY_TIMEOUT)
            .await;
    }

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn failed_apply_halts_replica() -> Result<(), Box<dyn Error>> {
    let cluster = TestCluster::in_memory(1, fast_options()).await;
    let all = cluster.running();
    let id = all[0].clone();
    cluster.submit(&all, "app", 1, command("fine")).await;

    let replica = cluster.replica(&id);
    let mut events = replica.client.event_listener();
    replica.faults.fail_on(command("poison"));

    let log = replica.client.replicated_log();
    let submit = |call_id: u64, text: &str| {
        log.submit(raft::SubmitInput {
            client_id: "app".to_string(),
            call_id,
            command: command(text),
        })
    };

    // The second one is queued behind the poisoned command.
    let (poisoned, queued) = tokio::join!(submit(2, "poison"), submit(3, "queued"));
    assert!(matches!(poisoned, Err(raft::SubmitError::Halted(_))), "{:?}", poisoned);
    assert!(matches!(queued, Err(raft::SubmitError::Halted(_))), "{:?}", queued);

    let later = submit(4, "later").await;
    match later {
        Err(e @ raft::SubmitError::Halted(_)) => assert!(!e.is_retryable()),
        other => panic!("Expected halted, got {:?}", other),
    }

    let status = replica.client.status().await?;
    assert!(matches!(status.role, raft::RaftRole::Halted(_)), "{:?}", status);
    assert!(matches!(events.current(), raft::RaftEvent::Halted(_)));
    assert_eq!(replica.applied.get(), vec![command("fine")]);

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn halted_follower_leaves_majority_working() -> Result<(), Box<dyn Error>> {
    let cluster = TestCluster::in_memory(3, fast_options()).await;
    let all = cluster.running();
    let leader = cluster.wait_for_leader(&all, Duration::from_secs(10)).await;
    let broken = all.iter().find(|id| **id != leader).cloned().unwrap();
    cluster.replica(&broken).faults.fail_on(command("poison"));

    cluster.submit(&all, "app", 1, command("poison")).await;

    let deadline = tokio::time::Instant::now() + APPLY_TIMEOUT;
    loop {
        let status = cluster.replica(&broken).client.status().await?;
        if matches!(status.role, raft::RaftRole::Halted(_)) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "Follower never halted: {:?}", status);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let result = cluster
        .replica(&broken)
        .client
        .replicated_log()
        .submit(raft::SubmitInput {
            client_id: "app".to_string(),
            call_id: 2,
            command: command("to the broken one"),
        })
        .await;
    assert!(matches!(result, Err(raft::SubmitError::Halted(_))), "{:?}", result);

    let healthy: Vec<String> = all.iter().filter(|id| **id != broken).cloned().collect();
    let output = cluster.submit(&healthy, "app", 3, command("still going")).await;
    assert_eq!(output.result, Bytes::from("2"));

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn rejoining_follower_does_not_disrupt_leader() -> Result<(), Box<dyn Error>> {
    let cluster = TestCluster::in_memory(3, fast_options()).await;
    let all = cluster.running();
    cluster.submit(&all, "app", 1, command("steady")).await;

    let leader = cluster.wait_for_leader(&all, Duration::from_secs(10)).await;
    let term = cluster.replica(&leader).client.status().await?.term;
    let loner = all.iter().find(|id| **id != leader).cloned().unwrap();
    cluster.wait_for_applied(&loner, &[command("steady")], APPLY_TIMEOUT).await;
    assert_eq!(cluster.replica(&loner).client.status().await?.term, term);

    // Several election timeouts alone: pre-votes keep failing, the term stays put.
    cluster.network().isolate(&loner);
    tokio::time::sleep(Duration::from_secs(3)).await;
    let loner_status = cluster.replica(&loner).client.status().await?;
    assert_eq!(loner_status.term, term, "{:?}", loner_status);
    assert_ne!(loner_status.role, raft::RaftRole::Leader);

    cluster.network().heal();
    cluster.submit(&all, "app", 2, command("after")).await;
    cluster
        .wait_for_applied(&loner, &[command("steady"), command("after")], APPLY_TIMEOUT)
        .await;

    assert_eq!(cluster.wait_for_leader(&all, Duration::from_secs(10)).await, leader);
    for id in &all {
        let status = cluster.replica(id).client.status().await?;
        assert_eq!(status.term, term, "{:?}", status);
    }

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn retry_of_uncommitted_entry_on_new_leader_is_applied_once() -> Result<(), Box<dyn Error>> {
    let mut cluster = TestCluster::in_memory(3, fast_options()).await;
    let all = cluster.running();
    cluster.submit(&all, "app", 1, command("common")).await;

    let old_leader = cluster.wait_for_leader(&all, Duration::from_secs(10)).await;
    let heir = all.iter().find(|id| **id != old_leader).cloned().unwrap();
    let bystander = all.iter().find(|id| **id != old_leader && **id != heir).cloned().unwrap();
    for id in &all {
        cluster.wait_for_applied(id, &[command("common")], APPLY_TIMEOUT).await;
    }
    let heir_log_before = cluster.replica(&heir).client.status().await?.latest_log_index;

    // The heir receives the entry, but the old leader never learns it did.
    cluster.network().isolate(&bystander);
    cluster.network().cut(&heir, &old_leader);
    let log = cluster.replica(&old_leader).client.replicated_log();
    let first_try = tokio::spawn(async move {
        log.submit(raft::SubmitInput {
            client_id: "app".to_string(),
            call_id: 7,
            command: command("pending"),
        })
        .await
    });

    let deadline = tokio::time::Instant::now() + APPLY_TIMEOUT;
    loop {
        let status = cluster.replica(&heir).client.status().await?;
        if status.latest_log_index > heir_log_before {
            assert!(status.commit_index <= heir_log_before, "{:?}", status);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "Entry never reached {}", heir);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    cluster.stop(&old_leader).await;
    assert!(first_try.await?.is_err());
    cluster.network().heal();

    // Only the heir has the entry, so only it can win. It finds the entry pending in its log.
    let survivors = vec![heir.clone(), bystander.clone()];
    let retried = cluster.submit(&survivors, "app", 7, command("pending")).await;
    assert_eq!(retried.result, Bytes::from("2"));
    assert_eq!(cluster.wait_for_leader(&survivors, Duration::from_secs(10)).await, heir);

    let next = cluster.submit(&survivors, "app", 8, command("next")).await;
    assert_eq!(next.result, Bytes::from("3"));
    for id in &survivors {
        cluster
            .wait_for_applied(id, &[command("common"), command("pending"), command("next")], APPLY_TIMEOUT)
            .await;
    }

    cluster.shutdown().await;
    Ok(())
}
