//! Per-campaign dispatch loop.
//!
//! One long-lived task per running campaign pulls contacts and issues
//! placements while `in_flight < max_concurrent_calls`. The loop parks on
//! the campaign's `Notify` whenever the ceiling is reached or the campaign
//! is paused, and a freed slot, `resume`, `cancel`, or a raised ceiling
//! wakes it for a fresh status check. Placement round-trips run in spawned
//! sub-tasks so the loop itself never waits on the provider.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::config::RetryPolicy;
use crate::engine::events::{EngineEvent, broadcast_event};
use crate::engine::manager::{CampaignRuntime, PlacementRouter};
use crate::engine::models::{CallJob, CallJobStatus, CallOutcome, CampaignStatus, Contact};
use crate::engine::placement::{PlacementClient, PlacementRequest};
use crate::engine::reconciler::OutcomeEvent;
use crate::errors::PlacementError;

pub(crate) struct Dispatcher {
    pub runtime: Arc<CampaignRuntime>,
    pub placement: Arc<dyn PlacementClient>,
    pub retry: RetryPolicy,
    pub events_tx: broadcast::Sender<String>,
    pub router: Arc<PlacementRouter>,
}

enum Step {
    Dispatch(Contact),
    Park,
    Exit,
}

impl Dispatcher {
    pub(crate) async fn run(self) {
        let campaign_id = self.runtime.campaign_id.clone();
        tracing::debug!(campaign_id = %campaign_id, "dispatcher started");

        loop {
            let step = {
                let mut cell = self.runtime.cell.lock().expect("campaign lock poisoned");
                match cell.campaign.status {
                    CampaignStatus::Running => {
                        // The ceiling is re-read on every pass, so a
                        // concurrency update takes effect at the next
                        // slot-availability check.
                        if cell.in_flight < cell.campaign.max_concurrent_calls {
                            match self.runtime.queue.take_next() {
                                Some(contact) => {
                                    cell.jobs
                                        .insert(contact.ordinal, CallJob::pending(contact.ordinal));
                                    cell.in_flight += 1;
                                    Step::Dispatch(contact)
                                }
                                // Queue drained; remaining progress is
                                // outcome-driven and owned by the reconciler.
                                None => Step::Exit,
                            }
                        } else {
                            Step::Park
                        }
                    }
                    // Paused: in-flight calls finish, freed slots are not
                    // refilled until resume.
                    CampaignStatus::Paused => Step::Park,
                    _ => Step::Exit,
                }
            };

            match step {
                Step::Dispatch(contact) => {
                    let task = PlacementTask {
                        runtime: Arc::clone(&self.runtime),
                        placement: Arc::clone(&self.placement),
                        retry: self.retry,
                        events_tx: self.events_tx.clone(),
                        router: Arc::clone(&self.router),
                    };
                    tokio::spawn(async move { task.place(contact).await });
                }
                Step::Park => self.runtime.slots.notified().await,
                Step::Exit => break,
            }
        }

        tracing::debug!(campaign_id = %campaign_id, "dispatcher stopped");
    }
}

/// One contact's placement, including bounded retries for transient
/// provider failures. Retries reuse the job's slot; they never pull
/// another contact from the queue.
struct PlacementTask {
    runtime: Arc<CampaignRuntime>,
    placement: Arc<dyn PlacementClient>,
    retry: RetryPolicy,
    events_tx: broadcast::Sender<String>,
    router: Arc<PlacementRouter>,
}

impl PlacementTask {
    async fn place(self, contact: Contact) {
        let campaign_id = self.runtime.campaign_id.clone();
        let request = PlacementRequest {
            phone_number: contact.phone_number.clone(),
            assistant_id: self.runtime.assistant_id.clone(),
            variables: contact.variables.clone(),
        };

        {
            let mut cell = self.runtime.cell.lock().expect("campaign lock poisoned");
            if let Some(job) = cell.jobs.get_mut(&contact.ordinal) {
                job.status = CallJobStatus::Dispatched;
            }
        }
        broadcast_event(
            &self.events_tx,
            &EngineEvent::CallDispatched {
                campaign_id: campaign_id.clone(),
                job: contact.ordinal,
                phone_number: contact.phone_number.clone(),
            },
        );

        let mut attempt: u32 = 0;
        let failure = loop {
            attempt += 1;
            {
                let mut cell = self.runtime.cell.lock().expect("campaign lock poisoned");
                if let Some(job) = cell.jobs.get_mut(&contact.ordinal) {
                    job.attempts = attempt;
                }
            }

            match self.placement.place_call(&request).await {
                Ok(placement_id) => {
                    let early = self
                        .router
                        .register(&placement_id, &campaign_id, contact.ordinal);
                    {
                        let mut cell =
                            self.runtime.cell.lock().expect("campaign lock poisoned");
                        if let Some(job) = cell.jobs.get_mut(&contact.ordinal) {
                            job.status = CallJobStatus::InProgress;
                            job.placement_id = Some(placement_id.clone());
                        }
                    }
                    tracing::info!(
                        campaign_id = %campaign_id,
                        job = contact.ordinal,
                        placement_id = %placement_id,
                        attempt,
                        "call placed"
                    );
                    // An outcome that raced the acknowledgement is replayed
                    // now that the job can receive it.
                    if let Some(buffered) = early {
                        let _ = self.runtime.outcome_tx.send(OutcomeEvent {
                            ordinal: contact.ordinal,
                            outcome: buffered.outcome,
                            duration_secs: buffered.duration_secs,
                            error: None,
                            recording_url: buffered.recording_url,
                            transcript_id: buffered.transcript_id,
                        });
                    }
                    return;
                }
                Err(PlacementError::Transient(reason)) if attempt <= self.retry.limit => {
                    tracing::warn!(
                        campaign_id = %campaign_id,
                        job = contact.ordinal,
                        attempt,
                        reason = %reason,
                        "transient placement failure, retrying"
                    );
                    {
                        let mut cell =
                            self.runtime.cell.lock().expect("campaign lock poisoned");
                        if let Some(job) = cell.jobs.get_mut(&contact.ordinal) {
                            job.last_error = Some(reason);
                        }
                        // A cancel between attempts means the call never
                        // reached the provider; don't keep trying.
                        if cell.campaign.status == CampaignStatus::Cancelled {
                            break "campaign cancelled before placement".to_string();
                        }
                    }
                    tokio::time::sleep(backoff_delay(attempt, self.retry)).await;
                }
                Err(err) => break err.to_string(),
            }
        };

        tracing::warn!(
            campaign_id = %campaign_id,
            job = contact.ordinal,
            attempt,
            error = %failure,
            "placement failed"
        );
        // Terminal placement failure becomes an ordinary failed outcome so
        // the reconciler stays the single writer of counters.
        let _ = self.runtime.outcome_tx.send(OutcomeEvent {
            ordinal: contact.ordinal,
            outcome: CallOutcome::Failed,
            duration_secs: 0,
            error: Some(failure),
            recording_url: None,
            transcript_id: None,
        });
    }
}

/// Linear backoff: attempt n sleeps n times the configured base.
fn backoff_delay(attempt: u32, retry: RetryPolicy) -> Duration {
    Duration::from_millis(retry.backoff_ms.saturating_mul(attempt as u64))
}
