//! End-to-end campaign scenarios driven through the manager with the
//! simulated telephony provider.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use outdial::config::RetryPolicy;
use outdial::engine::db::{DbHandle, EngineDb};
use outdial::engine::manager::CampaignManager;
use outdial::engine::models::{
    CallJobStatus, CallOutcome, CampaignStatus, ContactSpec, CreateCampaignRequest,
};
use outdial::engine::placement::{PlacementClient, Script, SimulatedPlacementClient};
use outdial::engine::server::spawn_outcome_pump;

const DEADLINE: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(5);

struct Harness {
    manager: CampaignManager,
    client: Arc<SimulatedPlacementClient>,
}

fn harness() -> Harness {
    harness_with(DbHandle::new(EngineDb::new_in_memory().unwrap()), 2)
}

fn harness_with(db: DbHandle, retry_limit: u32) -> Harness {
    let (events_tx, _) = broadcast::channel::<String>(256);
    let (sim, outcome_rx) = SimulatedPlacementClient::new();
    let client = Arc::new(sim);
    let manager = CampaignManager::new(
        db,
        events_tx,
        Arc::clone(&client) as Arc<dyn PlacementClient>,
        RetryPolicy {
            limit: retry_limit,
            backoff_ms: 1,
        },
    );
    spawn_outcome_pump(manager.clone(), outcome_rx);
    Harness { manager, client }
}

fn phone(i: u32) -> String {
    format!("+1555200{:04}", i)
}

fn request(contacts: u32, max_concurrent: u32) -> CreateCampaignRequest {
    CreateCampaignRequest {
        name: "Flow test".to_string(),
        description: None,
        assistant_id: "asst_flow".to_string(),
        contacts: (0..contacts)
            .map(|i| ContactSpec {
                phone_number: phone(i),
                name: None,
                variables: Default::default(),
            })
            .collect(),
        max_concurrent_calls: max_concurrent,
        scheduled_at: None,
    }
}

/// Poll until `predicate` holds, panicking after the deadline.
async fn wait_until<F: Fn() -> bool>(what: &str, predicate: F) {
    let deadline = tokio::time::Instant::now() + DEADLINE;
    while !predicate() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}",
            what
        );
        tokio::time::sleep(POLL).await;
    }
}

/// Placement handles of jobs currently in progress.
fn in_progress_handles(manager: &CampaignManager, id: &str) -> Vec<String> {
    manager
        .jobs(id)
        .unwrap()
        .into_iter()
        .filter(|job| job.status == CallJobStatus::InProgress)
        .filter_map(|job| job.placement_id)
        .collect()
}

// ── Scenarios ────────────────────────────────────────────────────────

#[tokio::test]
async fn five_contacts_ceiling_two_completes_with_all_outcomes() {
    let h = harness();
    for i in 0..5 {
        h.client.script(
            &phone(i),
            Script::Resolve {
                outcome: CallOutcome::Answered,
                duration_secs: 10,
                delay_ms: 20,
            },
        );
    }

    let campaign = h.manager.create(request(5, 2)).await.unwrap();
    h.manager.start(&campaign.id).await.unwrap();

    // The concurrency ceiling holds at every observation point until the
    // queue drains and all five outcomes arrive.
    let deadline = tokio::time::Instant::now() + DEADLINE;
    loop {
        let active = h
            .manager
            .jobs(&campaign.id)
            .unwrap()
            .iter()
            .filter(|job| !job.status.is_terminal())
            .count();
        assert!(active <= 2, "ceiling violated: {} active jobs", active);

        let snapshot = h.manager.get_snapshot(&campaign.id).unwrap();
        if snapshot.status == CampaignStatus::Completed {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "campaign did not complete"
        );
        tokio::time::sleep(POLL).await;
    }

    let snapshot = h.manager.get_snapshot(&campaign.id).unwrap();
    assert_eq!(snapshot.calls_completed, 5);
    assert_eq!(snapshot.calls_answered, 5);
    assert_eq!(snapshot.calls_failed, 0);
    assert!(snapshot.ended_at.is_some());
}

#[tokio::test]
async fn rejected_contact_does_not_halt_the_run() {
    let h = harness();
    for i in [0u32, 2] {
        h.client.script(
            &phone(i),
            Script::Resolve {
                outcome: CallOutcome::Answered,
                duration_secs: 5,
                delay_ms: 0,
            },
        );
    }
    h.client.script(&phone(1), Script::Reject);

    let campaign = h.manager.create(request(3, 1)).await.unwrap();
    h.manager.start(&campaign.id).await.unwrap();

    let manager = h.manager.clone();
    let id = campaign.id.clone();
    wait_until("campaign completion", || {
        manager.get_snapshot(&id).unwrap().status == CampaignStatus::Completed
    })
    .await;

    let snapshot = h.manager.get_snapshot(&campaign.id).unwrap();
    assert_eq!(snapshot.calls_completed, 3);
    assert_eq!(snapshot.calls_failed, 1);
    assert_eq!(snapshot.calls_answered, 2);

    let jobs = h.manager.jobs(&campaign.id).unwrap();
    assert_eq!(jobs.len(), 3);
    assert_eq!(jobs[1].status, CallJobStatus::Failed);
    assert!(jobs[1].last_error.is_some());
    assert_eq!(jobs[0].status, CallJobStatus::Completed);
    assert_eq!(jobs[2].status, CallJobStatus::Completed);

    // The reconciler's durable records survive for analytics.
    let records = h.manager.call_records(&campaign.id).await.unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records[1].outcome, CallOutcome::Failed);
    assert_eq!(records[0].outcome, CallOutcome::Answered);
}

#[tokio::test]
async fn pause_stops_new_placements_until_resume() {
    let h = harness();
    for i in 0..4 {
        h.client.script(&phone(i), Script::Hold);
    }

    let campaign = h.manager.create(request(4, 2)).await.unwrap();
    h.manager.start(&campaign.id).await.unwrap();

    let manager = h.manager.clone();
    let id = campaign.id.clone();
    wait_until("two calls in progress", || {
        in_progress_handles(&manager, &id).len() == 2
    })
    .await;

    h.manager.pause(&campaign.id).await.unwrap();
    assert_eq!(
        h.manager.get_snapshot(&campaign.id).unwrap().status,
        CampaignStatus::Paused
    );

    // An in-flight call finishing while paused updates counters but must
    // not pull a new contact.
    let handle = in_progress_handles(&h.manager, &campaign.id).remove(0);
    h.manager
        .apply_outcome(&handle, CallOutcome::Answered, 15, None, None);

    let manager = h.manager.clone();
    let id = campaign.id.clone();
    wait_until("first outcome applied", || {
        manager.get_snapshot(&id).unwrap().calls_completed == 1
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let jobs = h.manager.jobs(&campaign.id).unwrap();
    assert_eq!(jobs.len(), 2, "paused campaign refilled a freed slot");
    let stats = h.manager.stats(&campaign.id).unwrap();
    assert_eq!(stats.pending, 2);

    h.manager.resume(&campaign.id).await.unwrap();
    let manager = h.manager.clone();
    let id = campaign.id.clone();
    wait_until("dispatch resumed", || manager.jobs(&id).unwrap().len() > 2).await;

    // Release everything still in flight until the campaign completes.
    let deadline = tokio::time::Instant::now() + DEADLINE;
    loop {
        if h.manager.get_snapshot(&campaign.id).unwrap().status == CampaignStatus::Completed {
            break;
        }
        for handle in in_progress_handles(&h.manager, &campaign.id) {
            h.manager
                .apply_outcome(&handle, CallOutcome::Answered, 5, None, None);
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "campaign did not complete after resume"
        );
        tokio::time::sleep(POLL).await;
    }

    let snapshot = h.manager.get_snapshot(&campaign.id).unwrap();
    assert_eq!(snapshot.calls_completed, 4);
    assert_eq!(snapshot.calls_answered, 4);
}

#[tokio::test]
async fn cancel_skips_undialed_contacts_and_never_completes() {
    let h = harness();
    for i in 0..4 {
        h.client.script(&phone(i), Script::Hold);
    }

    let campaign = h.manager.create(request(4, 1)).await.unwrap();
    h.manager.start(&campaign.id).await.unwrap();

    let manager = h.manager.clone();
    let id = campaign.id.clone();
    wait_until("first call in progress", || {
        in_progress_handles(&manager, &id).len() == 1
    })
    .await;

    let cancelled = h.manager.cancel(&campaign.id).await.unwrap();
    assert_eq!(cancelled.status, CampaignStatus::Cancelled);
    assert_eq!(cancelled.calls_skipped, 3);

    // The in-flight call still resolves to its real outcome.
    let handle = in_progress_handles(&h.manager, &campaign.id).remove(0);
    h.manager
        .apply_outcome(&handle, CallOutcome::Answered, 30, None, None);

    let manager = h.manager.clone();
    let id = campaign.id.clone();
    wait_until("in-flight outcome recorded", || {
        manager.get_snapshot(&id).unwrap().calls_completed == 1
    })
    .await;

    let snapshot = h.manager.get_snapshot(&campaign.id).unwrap();
    assert_eq!(snapshot.status, CampaignStatus::Cancelled);
    assert_eq!(snapshot.calls_answered, 1);
    assert_eq!(snapshot.calls_skipped, 3);

    let stats = h.manager.stats(&campaign.id).unwrap();
    assert_eq!(stats.skipped, 3);
    assert_eq!(stats.completed, 1);
}

#[tokio::test]
async fn duplicate_outcome_increments_counters_once() {
    let h = harness();
    for i in 0..2 {
        h.client.script(&phone(i), Script::Hold);
    }

    let campaign = h.manager.create(request(2, 2)).await.unwrap();
    h.manager.start(&campaign.id).await.unwrap();

    let manager = h.manager.clone();
    let id = campaign.id.clone();
    wait_until("both calls in progress", || {
        in_progress_handles(&manager, &id).len() == 2
    })
    .await;

    let handle = in_progress_handles(&h.manager, &campaign.id).remove(0);
    h.manager
        .apply_outcome(&handle, CallOutcome::Answered, 20, None, None);
    h.manager
        .apply_outcome(&handle, CallOutcome::Answered, 20, None, None);

    let manager = h.manager.clone();
    let id = campaign.id.clone();
    wait_until("outcome applied", || {
        manager.get_snapshot(&id).unwrap().calls_completed >= 1
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let snapshot = h.manager.get_snapshot(&campaign.id).unwrap();
    assert_eq!(snapshot.calls_completed, 1, "duplicate event double-counted");
    assert_eq!(snapshot.calls_answered, 1);

    let remaining = in_progress_handles(&h.manager, &campaign.id);
    assert_eq!(remaining.len(), 1);
    h.manager
        .apply_outcome(&remaining[0], CallOutcome::NoAnswer, 0, None, None);

    let manager = h.manager.clone();
    let id = campaign.id.clone();
    wait_until("campaign completion", || {
        manager.get_snapshot(&id).unwrap().status == CampaignStatus::Completed
    })
    .await;

    let snapshot = h.manager.get_snapshot(&campaign.id).unwrap();
    assert_eq!(snapshot.calls_completed, 2);
    assert_eq!(snapshot.calls_answered, 1);
    assert_eq!(snapshot.calls_no_answer, 1);
}

#[tokio::test]
async fn transient_failure_retries_then_succeeds() {
    let h = harness();
    h.client.script(&phone(0), Script::Flaky { failures: 1 });

    let campaign = h.manager.create(request(1, 1)).await.unwrap();
    h.manager.start(&campaign.id).await.unwrap();

    let manager = h.manager.clone();
    let id = campaign.id.clone();
    wait_until("campaign completion", || {
        manager.get_snapshot(&id).unwrap().status == CampaignStatus::Completed
    })
    .await;

    let snapshot = h.manager.get_snapshot(&campaign.id).unwrap();
    assert_eq!(snapshot.calls_answered, 1);
    assert_eq!(snapshot.calls_failed, 0);

    let jobs = h.manager.jobs(&campaign.id).unwrap();
    assert_eq!(jobs[0].attempts, 2);
}

#[tokio::test]
async fn exhausted_retries_mark_the_job_failed() {
    // retry_limit 2 allows three attempts; the script fails five times.
    let h = harness_with(DbHandle::new(EngineDb::new_in_memory().unwrap()), 2);
    h.client.script(&phone(0), Script::Flaky { failures: 5 });

    let campaign = h.manager.create(request(1, 1)).await.unwrap();
    h.manager.start(&campaign.id).await.unwrap();

    let manager = h.manager.clone();
    let id = campaign.id.clone();
    wait_until("campaign completion", || {
        manager.get_snapshot(&id).unwrap().status == CampaignStatus::Completed
    })
    .await;

    let snapshot = h.manager.get_snapshot(&campaign.id).unwrap();
    assert_eq!(snapshot.calls_failed, 1);
    assert_eq!(snapshot.calls_answered, 0);

    let jobs = h.manager.jobs(&campaign.id).unwrap();
    assert_eq!(jobs[0].status, CallJobStatus::Failed);
    assert_eq!(jobs[0].attempts, 3);
    assert!(jobs[0].last_error.is_some());
}

#[tokio::test]
async fn restart_restores_running_campaign_as_paused_and_resumes() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("outdial.db");

    // First process lifetime: start a campaign whose calls never finish.
    let first = harness_with(DbHandle::new(EngineDb::new(&db_path).unwrap()), 2);
    for i in 0..2 {
        first.client.script(&phone(i), Script::Hold);
    }
    let campaign = first.manager.create(request(2, 2)).await.unwrap();
    first.manager.start(&campaign.id).await.unwrap();

    let manager = first.manager.clone();
    let id = campaign.id.clone();
    wait_until("both calls in progress", || {
        in_progress_handles(&manager, &id).len() == 2
    })
    .await;

    // Second process lifetime against the same database.
    let second = harness_with(DbHandle::new(EngineDb::new(&db_path).unwrap()), 2);
    let restored = second.manager.restore().await.unwrap();
    assert_eq!(restored, 1);

    let snapshot = second.manager.get_snapshot(&campaign.id).unwrap();
    assert_eq!(snapshot.status, CampaignStatus::Paused);

    // No call records were written, so both contacts are dialable again.
    let stats = second.manager.stats(&campaign.id).unwrap();
    assert_eq!(stats.pending, 2);

    // Resume re-dials them; the second provider answers immediately.
    second.manager.resume(&campaign.id).await.unwrap();
    let manager = second.manager.clone();
    let id = campaign.id.clone();
    wait_until("campaign completion after restart", || {
        manager.get_snapshot(&id).unwrap().status == CampaignStatus::Completed
    })
    .await;

    let snapshot = second.manager.get_snapshot(&campaign.id).unwrap();
    assert_eq!(snapshot.calls_completed, 2);
    assert_eq!(snapshot.calls_answered, 2);
}
