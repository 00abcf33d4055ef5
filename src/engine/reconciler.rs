//! Applies asynchronous call-outcome events to campaign state.
//!
//! One reconciler task runs per campaign, consuming a private mpsc channel.
//! That single consumer is the only writer of outcome-driven counter
//! updates, so arrival order across jobs never matters and duplicate
//! deliveries reduce to a status check on the job.

use std::sync::{Arc, Weak};

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};

use crate::engine::db::DbHandle;
use crate::engine::events::{EngineEvent, broadcast_event};
use crate::engine::manager::{CampaignRuntime, PlacementRouter};
use crate::engine::models::{CallOutcome, CallRecord, Campaign, CampaignStatus};

/// A call outcome routed to a campaign's reconciler, either from the
/// provider webhook (resolved through the placement index) or synthesized
/// by the dispatcher for placements that never got off the ground.
#[derive(Debug, Clone)]
pub(crate) struct OutcomeEvent {
    pub ordinal: u32,
    pub outcome: CallOutcome,
    pub duration_secs: u64,
    pub error: Option<String>,
    pub recording_url: Option<String>,
    pub transcript_id: Option<String>,
}

/// Per-campaign reconciler loop. Holds only a weak reference to the
/// runtime so a deleted campaign lets the loop wind down once the last
/// outcome sender is gone.
pub(crate) async fn run_reconciler(
    db: DbHandle,
    events_tx: broadcast::Sender<String>,
    router: Arc<PlacementRouter>,
    campaign_id: String,
    runtime: Weak<CampaignRuntime>,
    mut rx: mpsc::UnboundedReceiver<OutcomeEvent>,
) {
    while let Some(event) = rx.recv().await {
        let Some(runtime) = runtime.upgrade() else {
            break;
        };
        apply_event(&db, &events_tx, &router, &campaign_id, &runtime, event).await;
    }
    tracing::debug!(campaign_id = %campaign_id, "reconciler stopped");
}

/// What `apply_event` decided under the campaign lock, carried out of the
/// critical section so persistence and broadcasting never hold it.
struct Applied {
    campaign: Campaign,
    record: CallRecord,
    placement_id: Option<String>,
    in_flight: u32,
    completed: bool,
}

pub(crate) async fn apply_event(
    db: &DbHandle,
    events_tx: &broadcast::Sender<String>,
    router: &PlacementRouter,
    campaign_id: &str,
    runtime: &CampaignRuntime,
    event: OutcomeEvent,
) {
    let applied = {
        let mut cell = runtime.cell.lock().expect("campaign lock poisoned");

        let Some(job) = cell.jobs.get_mut(&event.ordinal) else {
            tracing::debug!(
                campaign_id = %campaign_id,
                job = event.ordinal,
                "outcome for unknown job ignored"
            );
            return;
        };
        if job.status.is_terminal() {
            // At-least-once delivery from the provider; duplicates are
            // expected and must not double-count.
            tracing::debug!(
                campaign_id = %campaign_id,
                job = event.ordinal,
                outcome = %event.outcome,
                "duplicate outcome for terminal job ignored"
            );
            return;
        }

        job.status = event.outcome.job_status();
        if let Some(ref error) = event.error {
            job.last_error = Some(error.clone());
        }
        let placement_id = job.placement_id.clone();

        let now = Utc::now();
        cell.in_flight = cell.in_flight.saturating_sub(1);
        cell.campaign.calls_completed += 1;
        match event.outcome {
            CallOutcome::Answered => cell.campaign.calls_answered += 1,
            CallOutcome::NoAnswer => cell.campaign.calls_no_answer += 1,
            CallOutcome::Failed => cell.campaign.calls_failed += 1,
        }
        cell.campaign.updated_at = now;

        // Automatic running → completed, and only from running: a cancelled
        // campaign records late outcomes but never completes.
        let completed = cell.campaign.status == CampaignStatus::Running
            && cell.campaign.calls_completed >= cell.campaign.total_contacts
            && cell.in_flight == 0
            && runtime.queue.is_empty();
        if completed {
            cell.campaign.status = CampaignStatus::Completed;
            cell.campaign.ended_at = Some(now);
        }

        let phone_number = runtime
            .contacts
            .iter()
            .find(|c| c.ordinal == event.ordinal)
            .map(|c| c.phone_number.clone())
            .unwrap_or_default();

        Applied {
            campaign: cell.campaign.clone(),
            record: CallRecord {
                campaign_id: campaign_id.to_string(),
                ordinal: event.ordinal,
                phone_number,
                outcome: event.outcome,
                duration_secs: event.duration_secs,
                recording_url: event.recording_url.clone(),
                transcript_id: event.transcript_id.clone(),
                ended_at: now,
            },
            placement_id,
            in_flight: cell.in_flight,
            completed,
        }
    };

    if let Some(ref placement_id) = applied.placement_id {
        router.retire(placement_id);
    }

    tracing::info!(
        campaign_id = %campaign_id,
        job = applied.record.ordinal,
        outcome = %applied.record.outcome,
        duration_secs = applied.record.duration_secs,
        "call outcome applied"
    );

    // Durable call record first, snapshot second; both are best-effort from
    // the reconciler's perspective and never block counter progress.
    let record = applied.record.clone();
    if let Err(e) = db.call(move |db| db.insert_call_record(&record)).await {
        tracing::error!(campaign_id = %campaign_id, error = %e, "failed to write call record");
    }
    let snapshot = applied.campaign.clone();
    if let Err(e) = db.call(move |db| db.update_campaign(&snapshot)).await {
        tracing::error!(campaign_id = %campaign_id, error = %e, "failed to persist campaign snapshot");
    }

    broadcast_event(
        events_tx,
        &EngineEvent::CallCompleted {
            campaign_id: campaign_id.to_string(),
            job: applied.record.ordinal,
            outcome: applied.record.outcome,
            duration_secs: applied.record.duration_secs,
        },
    );
    broadcast_event(
        events_tx,
        &EngineEvent::CampaignProgress {
            campaign_id: campaign_id.to_string(),
            calls_completed: applied.campaign.calls_completed,
            total_contacts: applied.campaign.total_contacts,
            in_flight: applied.in_flight,
        },
    );
    if applied.completed {
        tracing::info!(campaign_id = %campaign_id, "campaign completed");
        broadcast_event(
            events_tx,
            &EngineEvent::CampaignCompleted {
                campaign: applied.campaign,
            },
        );
    }

    // A slot freed; the dispatcher decides whether it may be refilled.
    runtime.slots.notify_one();
}
