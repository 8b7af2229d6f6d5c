mod test_harness;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use slurm_lite::catalog::{AdminState, NodeState};
use slurm_lite::persistence::{FileStateStore, MemoryStateStore, StateStore};
use slurm_lite::resources::ResourceVector;
use slurm_lite::scheduler::{ExitStatus, JobId, JobState, Principal, StateReason};
use slurm_lite::SchedError;
use test_harness::{cpus, test_config, TestCluster};

fn alice() -> Principal {
    Principal::user("alice")
}

/// Submit, launch, report exit, then accounting sees the final record.
#[tokio::test]
async fn test_submit_run_complete() {
    let cluster = TestCluster::start(&[("n1", 4)]);

    let id = cluster.handle.submit(cpus(2), alice()).await.unwrap();
    assert_eq!(id, JobId(1));
    cluster.wait_for_state(id, JobState::Running).await;

    let launches = cluster.executor.launches();
    assert_eq!(launches.len(), 1);
    assert_eq!(launches[0].job_id, id);
    assert_eq!(launches[0].run, 1);
    assert!(launches[0].allocation.contains_key("n1"));

    cluster
        .handle
        .notify_run_exited(id, 1, ExitStatus::Code(0))
        .await
        .unwrap();
    let view = cluster.wait_for_state(id, JobState::Completed).await;
    assert_eq!(view.nodes[0].available, ResourceVector::new(4, 8192));

    let records = cluster.accounting.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].state, JobState::Completed);
    assert!(records[0].nodes.contains("n1"));

    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_invalid_request_is_recorded() {
    let cluster = TestCluster::start(&[("n1", 4)]);

    let err = cluster.handle.submit(cpus(64), alice()).await.unwrap_err();
    let job_id = match err {
        SchedError::InvalidRequest { job_id, .. } => job_id,
        other => panic!("expected InvalidRequest, got {:?}", other),
    };
    let status = cluster.handle.query_status(Some(job_id)).unwrap();
    assert_eq!(status[0].state, JobState::Failed);
    assert!(matches!(status[0].reason, StateReason::InvalidRequest(_)));
    assert!(cluster.executor.launches().is_empty());

    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_query_status() {
    let cluster = TestCluster::start(&[("n1", 4)]);
    let a = cluster.handle.submit(cpus(4), alice()).await.unwrap();
    let b = cluster.handle.submit(cpus(4), alice()).await.unwrap();

    let all = cluster.handle.query_status(None).unwrap();
    assert_eq!(all.iter().map(|j| j.job_id).collect::<Vec<_>>(), vec![a, b]);
    assert_eq!(cluster.state_of(a), JobState::Running);
    let pending = &cluster.handle.query_status(Some(b)).unwrap()[0];
    assert_eq!(pending.state, JobState::Pending);
    assert_eq!(pending.reason, StateReason::Resources);

    assert_eq!(
        cluster.handle.query_status(Some(JobId(99))),
        Err(SchedError::UnknownJob(JobId(99)))
    );

    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cancel_terminates_running_job() {
    let cluster = TestCluster::start(&[("n1", 4)]);
    let id = cluster.handle.submit(cpus(4), alice()).await.unwrap();
    cluster.wait_for_state(id, JobState::Running).await;

    assert!(matches!(
        cluster.handle.cancel(id, Principal::user("bob")).await,
        Err(SchedError::PermissionDenied { .. })
    ));
    cluster
        .handle
        .cancel(id, Principal::operator("admin"))
        .await
        .unwrap();
    cluster.wait_for_state(id, JobState::Cancelled).await;

    let terminations = cluster.executor.terminations();
    assert_eq!(terminations.len(), 1);
    assert_eq!(terminations[0].0, id);

    // A late exit from the killed process is ignored.
    cluster
        .handle
        .notify_run_exited(id, 1, ExitStatus::Killed)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(cluster.state_of(id), JobState::Cancelled);

    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_time_limit_kills_job() {
    let cluster = TestCluster::start(&[("n1", 4)]);
    let id = cluster
        .handle
        .submit(cpus(1).with_time_limit(Duration::from_millis(100)), alice())
        .await
        .unwrap();

    let view = cluster.wait_for_state(id, JobState::Failed).await;
    assert_eq!(view.job(id).unwrap().reason, StateReason::TimeLimit);
    assert_eq!(cluster.executor.terminations().len(), 1);
    assert_eq!(view.nodes[0].available.cpus, 4);

    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_heartbeat_timeout_requeues() {
    let config = test_config().with_heartbeat_timeout(Duration::from_millis(200));
    let cluster = TestCluster::with_config(&[("n1", 4), ("n2", 4)], config);

    let id = cluster
        .handle
        .submit(cpus(4).with_requeue(true), alice())
        .await
        .unwrap();
    let view = cluster.wait_for_state(id, JobState::Running).await;
    let first = view.job(id).unwrap().nodes.iter().next().cloned().unwrap();
    let survivor = if first == "n1" { "n2" } else { "n1" };

    // Keep the survivor alive while the first node goes silent.
    let handle = cluster.handle.clone();
    let keepalive = tokio::spawn(async move {
        loop {
            if handle.notify_node_heartbeat(survivor, Utc::now()).await.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
    });

    let view = cluster
        .handle
        .wait_for(Duration::from_secs(5), |v| {
            v.job(id)
                .is_some_and(|j| j.state == JobState::Running && j.restarts == 1)
        })
        .await
        .unwrap();
    let job = view.job(id).unwrap();
    assert!(job.nodes.contains(survivor));
    let failed = view.nodes.iter().find(|n| n.name == first).unwrap();
    assert_eq!(failed.state, NodeState::Down);

    // The silent node comes back on its next heartbeat.
    cluster
        .handle
        .notify_node_heartbeat(first.clone(), Utc::now())
        .await.unwrap();
    cluster
        .handle
        .wait_for(Duration::from_secs(5), |v| {
            v.nodes.iter().any(|n| n.name == first && n.state == NodeState::Up)
        })
        .await
        .unwrap();

    keepalive.abort();
    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_heartbeat_timestamp_never_ahead_of_controller() {
    let cluster = TestCluster::start(&[("n1", 4)]);
    let before = cluster.handle.view().nodes[0].last_heartbeat;

    let future = Utc::now() + chrono::Duration::hours(1);
    cluster
        .handle
        .notify_node_heartbeat("n1", future)
        .await
        .unwrap();
    let stale = before - chrono::Duration::hours(1);
    cluster.handle.notify_node_heartbeat("n1", stale).await.unwrap();
    // A request behind the notifications forces a fresh view.
    cluster
        .handle
        .register_node("n2", ResourceVector::new(2, 8192), vec!["batch".into()])
        .await
        .unwrap();

    let seen = cluster.handle.view().nodes[0].last_heartbeat;
    assert!(seen >= before);
    assert!(seen <= Utc::now());

    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_drain_via_handle() {
    let cluster = TestCluster::start(&[("n1", 4)]);
    let id = cluster.handle.submit(cpus(1), alice()).await.unwrap();
    cluster.wait_for_state(id, JobState::Running).await;

    cluster
        .handle
        .set_node_admin_state("n1", AdminState::Drain)
        .await
        .unwrap();
    let queued = cluster.handle.submit(cpus(1), alice()).await.unwrap();
    assert_eq!(cluster.state_of(queued), JobState::Pending);

    cluster
        .handle
        .notify_exited(id, ExitStatus::Code(0))
        .await
        .unwrap();
    let view = cluster
        .handle
        .wait_for(Duration::from_secs(5), |v| v.nodes[0].state == NodeState::Drained)
        .await
        .unwrap();
    assert_eq!(view.job(queued).unwrap().state, JobState::Pending);

    cluster
        .handle
        .set_node_admin_state("n1", AdminState::Up)
        .await
        .unwrap();
    cluster.wait_for_state(queued, JobState::Running).await;

    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_register_and_deregister_nodes() {
    let cluster = TestCluster::start(&[("n1", 2)]);
    let id = cluster.handle.submit(cpus(2), alice()).await.unwrap();
    let waiting = cluster.handle.submit(cpus(2), alice()).await.unwrap();
    assert_eq!(cluster.state_of(waiting), JobState::Pending);

    cluster
        .handle
        .register_node("n2", ResourceVector::new(2, 8192), vec!["batch".into()])
        .await
        .unwrap();
    cluster.wait_for_state(waiting, JobState::Running).await;

    assert_eq!(
        cluster.handle.deregister_node("n1").await,
        Err(SchedError::NodeBusy("n1".into()))
    );
    cluster
        .handle
        .notify_exited(id, ExitStatus::Code(0))
        .await
        .unwrap();
    cluster.wait_for_state(id, JobState::Completed).await;
    cluster.handle.deregister_node("n1").await.unwrap();
    assert!(cluster.handle.view().nodes.iter().all(|n| n.name != "n1"));

    cluster.shutdown().await.unwrap();
}

// ---------------------------------------------------------------------------
// Persistence and recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_recover_from_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");

    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(&path));
    let cluster = TestCluster::recover(&[("n1", 4)], test_config(), store);
    let running = cluster.handle.submit(cpus(4), alice()).await.unwrap();
    let pending = cluster.handle.submit(cpus(2), alice()).await.unwrap();
    cluster.wait_for_state(running, JobState::Running).await;
    cluster.shutdown().await.unwrap();
    assert!(path.exists());

    // Restart from the saved file.
    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(&path));
    let cluster = TestCluster::recover(&[], test_config(), store);
    assert_eq!(cluster.state_of(running), JobState::Running);
    assert_eq!(cluster.state_of(pending), JobState::Pending);
    // Restored runs are not relaunched.
    assert!(cluster.executor.launches().is_empty());

    let next = cluster.handle.submit(cpus(1), alice()).await.unwrap();
    assert_eq!(next, JobId(3));

    cluster
        .handle
        .notify_run_exited(running, 1, ExitStatus::Code(0))
        .await
        .unwrap();
    cluster.wait_for_state(pending, JobState::Running).await;

    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_submit_acked_after_persist() {
    let store = Arc::new(MemoryStateStore::new());
    let cluster = TestCluster::recover(&[("n1", 4)], test_config(), store.clone());

    let id = cluster.handle.submit(cpus(1), alice()).await.unwrap();
    let blob = store.load().unwrap().expect("state persisted before ack");
    let text = String::from_utf8(blob).unwrap();
    assert!(text.contains(&format!("\"id\": {}", id.0)));

    let serialized = cluster.handle.serialize_state().await.unwrap();
    assert!(!serialized.is_empty());

    cluster.shutdown().await.unwrap();
}
