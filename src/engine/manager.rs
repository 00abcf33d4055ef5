//! Campaign manager façade.
//!
//! Owns the registry of per-campaign runtimes and exposes the public
//! lifecycle operations. All mutation of a campaign's status and counters
//! happens under that campaign's own lock; campaigns share nothing but the
//! registry map itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::{Notify, broadcast, mpsc};

use crate::config::RetryPolicy;
use crate::engine::db::DbHandle;
use crate::engine::dispatcher::Dispatcher;
use crate::engine::events::{EngineEvent, broadcast_event};
use crate::engine::models::{
    CallJob, CallJobStatus, CallOutcome, CallRecord, Campaign, CampaignStats, CampaignStatus,
    Contact, CreateCampaignRequest, UpdateCampaignRequest, new_campaign_id, validate_phone_number,
};
use crate::engine::placement::PlacementClient;
use crate::engine::queue::ContactQueue;
use crate::engine::reconciler::{OutcomeEvent, run_reconciler};
use crate::engine::state::{CampaignAction, authorize, deletable};
use crate::errors::EngineError;

/// An outcome that arrived before its placement acknowledgement was
/// processed, parked until the dispatcher registers the handle.
pub(crate) struct BufferedOutcome {
    pub outcome: CallOutcome,
    pub duration_secs: u64,
    pub recording_url: Option<String>,
    pub transcript_id: Option<String>,
    buffered_at: std::time::Instant,
}

const EARLY_OUTCOME_CAP: usize = 1024;
const EARLY_OUTCOME_TTL: std::time::Duration = std::time::Duration::from_secs(60);

/// Routes provider placement handles back to (campaign, job).
///
/// Entries are registered when a placement is acknowledged and retired when
/// the job reaches a terminal state, so late duplicate webhooks miss and
/// are dropped. Outcome delivery can also race the acknowledgement (a call
/// that ends near-instantly); such early outcomes are buffered briefly and
/// replayed at registration.
pub(crate) struct PlacementRouter {
    by_handle: Mutex<HashMap<String, (String, u32)>>,
    early: Mutex<HashMap<String, BufferedOutcome>>,
}

impl PlacementRouter {
    fn new() -> Self {
        Self {
            by_handle: Mutex::new(HashMap::new()),
            early: Mutex::new(HashMap::new()),
        }
    }

    /// Bind a handle to its job; returns an outcome that beat us here.
    pub(crate) fn register(
        &self,
        handle: &str,
        campaign_id: &str,
        ordinal: u32,
    ) -> Option<BufferedOutcome> {
        self.by_handle
            .lock()
            .expect("placement index poisoned")
            .insert(handle.to_string(), (campaign_id.to_string(), ordinal));
        self.early
            .lock()
            .expect("early outcome buffer poisoned")
            .remove(handle)
    }

    pub(crate) fn resolve(&self, handle: &str) -> Option<(String, u32)> {
        self.by_handle
            .lock()
            .expect("placement index poisoned")
            .get(handle)
            .cloned()
    }

    pub(crate) fn buffer_early(
        &self,
        handle: &str,
        outcome: CallOutcome,
        duration_secs: u64,
        recording_url: Option<String>,
        transcript_id: Option<String>,
    ) {
        let mut early = self.early.lock().expect("early outcome buffer poisoned");
        early.retain(|_, buffered| buffered.buffered_at.elapsed() < EARLY_OUTCOME_TTL);
        if early.len() >= EARLY_OUTCOME_CAP {
            tracing::warn!(placement_id = %handle, "early outcome buffer full, dropping");
            return;
        }
        early.insert(
            handle.to_string(),
            BufferedOutcome {
                outcome,
                duration_secs,
                recording_url,
                transcript_id,
                buffered_at: std::time::Instant::now(),
            },
        );
    }

    /// Forget a handle once its job is terminal. Whatever arrives for it
    /// afterwards is a duplicate.
    pub(crate) fn retire(&self, handle: &str) {
        self.by_handle
            .lock()
            .expect("placement index poisoned")
            .remove(handle);
        self.early
            .lock()
            .expect("early outcome buffer poisoned")
            .remove(handle);
    }
}

/// Everything behind a single campaign's lock: the aggregate the API
/// snapshots, the lazily created jobs, and the occupied-slot count
/// (jobs in pending/dispatched/in_progress).
pub(crate) struct RunState {
    pub campaign: Campaign,
    pub jobs: HashMap<u32, CallJob>,
    pub in_flight: u32,
}

pub(crate) struct CampaignRuntime {
    pub campaign_id: String,
    pub assistant_id: String,
    /// Full immutable contact list, ordinal-addressable for the lifetime of
    /// the campaign. The queue below only holds the not-yet-dispatched tail.
    pub contacts: Vec<Contact>,
    pub cell: Mutex<RunState>,
    pub queue: ContactQueue,
    /// Wakes the dispatcher: slot freed, resumed, cancelled, or ceiling
    /// raised.
    pub slots: Notify,
    pub outcome_tx: mpsc::UnboundedSender<OutcomeEvent>,
    dispatcher_live: AtomicBool,
}

struct ManagerInner {
    db: DbHandle,
    events_tx: broadcast::Sender<String>,
    placement: Arc<dyn PlacementClient>,
    retry: RetryPolicy,
    campaigns: Mutex<HashMap<String, Arc<CampaignRuntime>>>,
    router: Arc<PlacementRouter>,
}

#[derive(Clone)]
pub struct CampaignManager {
    inner: Arc<ManagerInner>,
}

impl CampaignManager {
    pub fn new(
        db: DbHandle,
        events_tx: broadcast::Sender<String>,
        placement: Arc<dyn PlacementClient>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                db,
                events_tx,
                placement,
                retry,
                campaigns: Mutex::new(HashMap::new()),
                router: Arc::new(PlacementRouter::new()),
            }),
        }
    }

    /// Rebuild the in-memory registry from the database after a restart.
    ///
    /// Recovery contract: a campaign found `running` is downgraded to
    /// `paused` (whatever was in flight at the crash is unknowable), and a
    /// later `resume` re-dials every contact without a durable call record.
    pub async fn restore(&self) -> anyhow::Result<usize> {
        let stored = self.inner.db.call(|db| db.load_campaigns()).await?;
        let mut restored = 0usize;

        for (mut campaign, contacts) in stored {
            let id = campaign.id.clone();
            let terminal = self
                .inner
                .db
                .call({
                    let id = id.clone();
                    move |db| db.terminal_ordinals(&id)
                })
                .await?;
            let records = self
                .inner
                .db
                .call({
                    let id = id.clone();
                    move |db| db.list_call_records(&id)
                })
                .await?;

            if campaign.status == CampaignStatus::Running {
                tracing::warn!(
                    campaign_id = %id,
                    "campaign was running at shutdown, restoring as paused"
                );
                campaign.status = CampaignStatus::Paused;
                campaign.updated_at = Utc::now();
                let snapshot = campaign.clone();
                self.inner
                    .db
                    .call(move |db| db.update_campaign(&snapshot))
                    .await?;
            }

            let queue = ContactQueue::resume_after(contacts.clone(), &terminal);
            let mut jobs: HashMap<u32, CallJob> = records
                .iter()
                .map(|record| {
                    let mut job = CallJob::pending(record.ordinal);
                    job.status = record.outcome.job_status();
                    job.attempts = 1;
                    (record.ordinal, job)
                })
                .collect();
            if campaign.status == CampaignStatus::Cancelled {
                for contact in queue.drain_remaining() {
                    jobs.insert(contact.ordinal, CallJob::skipped(contact.ordinal));
                }
            }

            self.install_runtime(campaign, contacts, queue, jobs);
            restored += 1;
        }

        if restored > 0 {
            tracing::info!(count = restored, "campaigns restored from database");
        }
        Ok(restored)
    }

    // ── Lifecycle operations ──────────────────────────────────────────

    pub async fn create(&self, request: CreateCampaignRequest) -> Result<Campaign, EngineError> {
        if request.name.trim().is_empty() {
            return Err(EngineError::Validation("campaign name is required".into()));
        }
        if request.assistant_id.trim().is_empty() {
            return Err(EngineError::Validation("assistant_id is required".into()));
        }
        if request.contacts.is_empty() {
            return Err(EngineError::Validation(
                "at least one contact is required".into(),
            ));
        }
        if request.max_concurrent_calls < 1 {
            return Err(EngineError::Validation(
                "max_concurrent_calls must be at least 1".into(),
            ));
        }
        for spec in &request.contacts {
            validate_phone_number(&spec.phone_number)?;
        }

        let contacts: Vec<Contact> = request
            .contacts
            .into_iter()
            .enumerate()
            .map(|(i, spec)| Contact {
                ordinal: i as u32,
                phone_number: spec.phone_number,
                name: spec.name,
                variables: spec.variables,
            })
            .collect();

        let now = Utc::now();
        let status = if request.scheduled_at.is_some() {
            CampaignStatus::Scheduled
        } else {
            CampaignStatus::Draft
        };
        let campaign = Campaign {
            id: new_campaign_id(),
            name: request.name,
            description: request.description,
            assistant_id: request.assistant_id,
            max_concurrent_calls: request.max_concurrent_calls,
            status,
            total_contacts: contacts.len() as u32,
            calls_completed: 0,
            calls_answered: 0,
            calls_failed: 0,
            calls_no_answer: 0,
            calls_skipped: 0,
            created_at: now,
            updated_at: now,
            scheduled_at: request.scheduled_at,
            started_at: None,
            ended_at: None,
        };

        {
            let snapshot = campaign.clone();
            let stored_contacts = contacts.clone();
            self.inner
                .db
                .call(move |db| db.insert_campaign(&snapshot, &stored_contacts))
                .await?;
        }

        let queue = ContactQueue::new(contacts.clone());
        self.install_runtime(campaign.clone(), contacts, queue, HashMap::new());

        tracing::info!(
            campaign_id = %campaign.id,
            total_contacts = campaign.total_contacts,
            max_concurrent = campaign.max_concurrent_calls,
            status = %campaign.status,
            "campaign created"
        );
        broadcast_event(
            &self.inner.events_tx,
            &EngineEvent::CampaignCreated {
                campaign: campaign.clone(),
            },
        );
        Ok(campaign)
    }

    pub async fn start(&self, id: &str) -> Result<Campaign, EngineError> {
        let runtime = self.runtime(id)?;
        let campaign = {
            let mut cell = runtime.cell.lock().expect("campaign lock poisoned");
            let next = authorize(cell.campaign.status, CampaignAction::Start)?;
            if cell.campaign.total_contacts == 0 {
                return Err(EngineError::Validation(
                    "campaign has no contacts to dial".into(),
                ));
            }
            if cell.campaign.assistant_id.is_empty() {
                return Err(EngineError::Validation(
                    "campaign has no assigned assistant".into(),
                ));
            }
            let now = Utc::now();
            cell.campaign.status = next;
            cell.campaign.started_at.get_or_insert(now);
            cell.campaign.updated_at = now;
            cell.campaign.clone()
        };

        self.persist(&campaign).await?;
        self.spawn_dispatcher(&runtime);
        tracing::info!(campaign_id = %id, "campaign started");
        broadcast_event(
            &self.inner.events_tx,
            &EngineEvent::CampaignStarted {
                campaign_id: id.to_string(),
            },
        );
        Ok(campaign)
    }

    pub async fn pause(&self, id: &str) -> Result<Campaign, EngineError> {
        let runtime = self.runtime(id)?;
        let campaign = {
            let mut cell = runtime.cell.lock().expect("campaign lock poisoned");
            let next = authorize(cell.campaign.status, CampaignAction::Pause)?;
            cell.campaign.status = next;
            cell.campaign.updated_at = Utc::now();
            cell.campaign.clone()
        };

        self.persist(&campaign).await?;
        tracing::info!(campaign_id = %id, "campaign paused");
        broadcast_event(
            &self.inner.events_tx,
            &EngineEvent::CampaignPaused {
                campaign_id: id.to_string(),
            },
        );
        Ok(campaign)
    }

    pub async fn resume(&self, id: &str) -> Result<Campaign, EngineError> {
        let runtime = self.runtime(id)?;
        let campaign = {
            let mut cell = runtime.cell.lock().expect("campaign lock poisoned");
            let next = authorize(cell.campaign.status, CampaignAction::Resume)?;
            cell.campaign.status = next;
            cell.campaign.updated_at = Utc::now();
            cell.campaign.clone()
        };

        self.persist(&campaign).await?;
        // The dispatcher may have survived the pause (parked) or may be gone
        // entirely after a restart; cover both.
        self.spawn_dispatcher(&runtime);
        runtime.slots.notify_one();
        tracing::info!(campaign_id = %id, "campaign resumed");
        broadcast_event(
            &self.inner.events_tx,
            &EngineEvent::CampaignResumed {
                campaign_id: id.to_string(),
            },
        );
        Ok(campaign)
    }

    pub async fn cancel(&self, id: &str) -> Result<Campaign, EngineError> {
        let runtime = self.runtime(id)?;
        let (campaign, newly_skipped, already_cancelled) = {
            let mut cell = runtime.cell.lock().expect("campaign lock poisoned");
            let already_cancelled = cell.campaign.status == CampaignStatus::Cancelled;
            authorize(cell.campaign.status, CampaignAction::Cancel)?;
            if already_cancelled {
                (cell.campaign.clone(), 0, true)
            } else {
                // Everything never pulled from the queue is skipped, counted
                // apart from completed/failed so totals remain explicable.
                let drained = runtime.queue.drain_remaining();
                let skipped = drained.len() as u32;
                for contact in drained {
                    cell.jobs
                        .insert(contact.ordinal, CallJob::skipped(contact.ordinal));
                }
                let now = Utc::now();
                cell.campaign.calls_skipped += skipped;
                cell.campaign.status = CampaignStatus::Cancelled;
                cell.campaign.ended_at = Some(now);
                cell.campaign.updated_at = now;
                (cell.campaign.clone(), skipped, false)
            }
        };

        if already_cancelled {
            return Ok(campaign);
        }

        self.persist(&campaign).await?;
        // Wake a parked dispatcher so it observes the terminal status.
        runtime.slots.notify_one();
        tracing::info!(campaign_id = %id, skipped = newly_skipped, "campaign cancelled");
        broadcast_event(
            &self.inner.events_tx,
            &EngineEvent::CampaignCancelled {
                campaign_id: id.to_string(),
                skipped: newly_skipped,
            },
        );
        Ok(campaign)
    }

    pub async fn delete(&self, id: &str) -> Result<(), EngineError> {
        {
            let mut campaigns = self.inner.campaigns.lock().expect("registry lock poisoned");
            let runtime = campaigns
                .get(id)
                .ok_or_else(|| EngineError::NotFound { id: id.to_string() })?;
            let status = {
                let cell = runtime.cell.lock().expect("campaign lock poisoned");
                cell.campaign.status
            };
            if !deletable(status) {
                return Err(EngineError::Conflict(format!(
                    "cannot delete campaign in status {}",
                    status
                )));
            }
            campaigns.remove(id);
        }

        let id_owned = id.to_string();
        self.inner
            .db
            .call(move |db| db.delete_campaign(&id_owned))
            .await?;
        tracing::info!(campaign_id = %id, "campaign deleted");
        broadcast_event(
            &self.inner.events_tx,
            &EngineEvent::CampaignDeleted {
                campaign_id: id.to_string(),
            },
        );
        Ok(())
    }

    // ── Reads ─────────────────────────────────────────────────────────

    /// Read-only snapshot; status and counters are taken under the campaign
    /// lock and therefore always mutually consistent.
    pub fn get_snapshot(&self, id: &str) -> Result<Campaign, EngineError> {
        let runtime = self.runtime(id)?;
        let cell = runtime.cell.lock().expect("campaign lock poisoned");
        Ok(cell.campaign.clone())
    }

    pub fn list(
        &self,
        status: Option<CampaignStatus>,
        limit: usize,
        offset: usize,
    ) -> Vec<Campaign> {
        let campaigns = self.inner.campaigns.lock().expect("registry lock poisoned");
        let mut snapshots: Vec<Campaign> = campaigns
            .values()
            .map(|runtime| {
                runtime
                    .cell
                    .lock()
                    .expect("campaign lock poisoned")
                    .campaign
                    .clone()
            })
            .filter(|c| status.is_none_or(|s| c.status == s))
            .collect();
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        snapshots.into_iter().skip(offset).take(limit).collect()
    }

    /// Per-status job tally. Contacts still in the queue have no job yet
    /// and count as pending.
    pub fn stats(&self, id: &str) -> Result<CampaignStats, EngineError> {
        let runtime = self.runtime(id)?;
        let cell = runtime.cell.lock().expect("campaign lock poisoned");
        let mut stats = CampaignStats {
            total: cell.campaign.total_contacts,
            pending: runtime.queue.remaining() as u32,
            ..Default::default()
        };
        for job in cell.jobs.values() {
            match job.status {
                CallJobStatus::Pending => stats.pending += 1,
                CallJobStatus::Dispatched => stats.dispatched += 1,
                CallJobStatus::InProgress => stats.in_progress += 1,
                CallJobStatus::Completed => stats.completed += 1,
                CallJobStatus::Failed => stats.failed += 1,
                CallJobStatus::NoAnswer => stats.no_answer += 1,
                CallJobStatus::Skipped => stats.skipped += 1,
            }
        }
        Ok(stats)
    }

    /// Jobs created so far, in contact order.
    pub fn jobs(&self, id: &str) -> Result<Vec<CallJob>, EngineError> {
        let runtime = self.runtime(id)?;
        let cell = runtime.cell.lock().expect("campaign lock poisoned");
        let mut jobs: Vec<CallJob> = cell.jobs.values().cloned().collect();
        jobs.sort_by_key(|job| job.ordinal);
        Ok(jobs)
    }

    pub async fn call_records(&self, id: &str) -> Result<Vec<CallRecord>, EngineError> {
        // Validate existence through the registry first for a clean 404.
        self.runtime(id)?;
        let id_owned = id.to_string();
        let records = self
            .inner
            .db
            .call(move |db| db.list_call_records(&id_owned))
            .await?;
        Ok(records)
    }

    // ── Updates ───────────────────────────────────────────────────────

    /// Draft-only edits, except the concurrency ceiling which may change on
    /// an active campaign and is picked up at the dispatcher's next
    /// slot-availability check.
    pub async fn update(
        &self,
        id: &str,
        request: UpdateCampaignRequest,
    ) -> Result<Campaign, EngineError> {
        if let Some(max) = request.max_concurrent_calls
            && max < 1
        {
            return Err(EngineError::Validation(
                "max_concurrent_calls must be at least 1".into(),
            ));
        }

        let runtime = self.runtime(id)?;
        let (campaign, ceiling_changed) = {
            let mut cell = runtime.cell.lock().expect("campaign lock poisoned");
            let editing_metadata = request.name.is_some() || request.description.is_some();
            if editing_metadata && cell.campaign.status != CampaignStatus::Draft {
                return Err(EngineError::Conflict(
                    "only draft campaigns can be edited".into(),
                ));
            }
            if cell.campaign.status.is_terminal() && request.max_concurrent_calls.is_some() {
                return Err(EngineError::Conflict(format!(
                    "cannot update concurrency of campaign in status {}",
                    cell.campaign.status
                )));
            }
            if let Some(name) = request.name {
                cell.campaign.name = name;
            }
            if let Some(description) = request.description {
                cell.campaign.description = Some(description);
            }
            let mut ceiling_changed = false;
            if let Some(max) = request.max_concurrent_calls
                && max != cell.campaign.max_concurrent_calls
            {
                cell.campaign.max_concurrent_calls = max;
                ceiling_changed = true;
            }
            cell.campaign.updated_at = Utc::now();
            (cell.campaign.clone(), ceiling_changed)
        };

        self.persist(&campaign).await?;
        if ceiling_changed {
            tracing::info!(
                campaign_id = %id,
                max_concurrent = campaign.max_concurrent_calls,
                "concurrency ceiling updated"
            );
            runtime.slots.notify_one();
        }
        Ok(campaign)
    }

    /// Change the concurrency ceiling of a live campaign.
    pub async fn update_concurrency(&self, id: &str, new_max: u32) -> Result<Campaign, EngineError> {
        self.update(
            id,
            UpdateCampaignRequest {
                max_concurrent_calls: Some(new_max),
                ..Default::default()
            },
        )
        .await
    }

    // ── Outcome ingestion ─────────────────────────────────────────────

    /// Route a provider outcome to the owning campaign's reconciler.
    /// Delivery is at-least-once: handles not yet acknowledged are buffered
    /// briefly, and late duplicates for retired handles are absorbed.
    pub fn apply_outcome(
        &self,
        placement_id: &str,
        outcome: CallOutcome,
        duration_secs: u64,
        recording_url: Option<String>,
        transcript_id: Option<String>,
    ) {
        let Some((campaign_id, ordinal)) = self.inner.router.resolve(placement_id) else {
            tracing::debug!(
                placement_id = %placement_id,
                "outcome for unregistered placement, buffering"
            );
            self.inner.router.buffer_early(
                placement_id,
                outcome,
                duration_secs,
                recording_url,
                transcript_id,
            );
            return;
        };

        let Ok(runtime) = self.runtime(&campaign_id) else {
            tracing::debug!(
                campaign_id = %campaign_id,
                "outcome for removed campaign ignored"
            );
            return;
        };
        let _ = runtime.outcome_tx.send(OutcomeEvent {
            ordinal,
            outcome,
            duration_secs,
            error: None,
            recording_url,
            transcript_id,
        });
    }

    /// Start every scheduled campaign whose start time has passed. Called
    /// from the server's scheduler tick; returns how many were started.
    pub async fn start_due_scheduled(&self) -> usize {
        let now = Utc::now();
        let due: Vec<String> = {
            let campaigns = self.inner.campaigns.lock().expect("registry lock poisoned");
            campaigns
                .values()
                .filter_map(|runtime| {
                    let cell = runtime.cell.lock().expect("campaign lock poisoned");
                    (cell.campaign.status == CampaignStatus::Scheduled
                        && cell.campaign.scheduled_at.is_some_and(|at| at <= now))
                    .then(|| cell.campaign.id.clone())
                })
                .collect()
        };

        let mut started = 0usize;
        for id in due {
            match self.start(&id).await {
                Ok(_) => started += 1,
                Err(e) => {
                    tracing::warn!(campaign_id = %id, error = %e, "scheduled start failed")
                }
            }
        }
        started
    }

    // ── Internals ─────────────────────────────────────────────────────

    fn runtime(&self, id: &str) -> Result<Arc<CampaignRuntime>, EngineError> {
        let campaigns = self.inner.campaigns.lock().expect("registry lock poisoned");
        campaigns
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound { id: id.to_string() })
    }

    /// Create the runtime for a campaign, spawn its reconciler, and insert
    /// it into the registry.
    fn install_runtime(
        &self,
        campaign: Campaign,
        contacts: Vec<Contact>,
        queue: ContactQueue,
        jobs: HashMap<u32, CallJob>,
    ) -> Arc<CampaignRuntime> {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let campaign_id = campaign.id.clone();
        let runtime = Arc::new(CampaignRuntime {
            campaign_id: campaign_id.clone(),
            assistant_id: campaign.assistant_id.clone(),
            contacts,
            cell: Mutex::new(RunState {
                campaign,
                jobs,
                in_flight: 0,
            }),
            queue,
            slots: Notify::new(),
            outcome_tx,
            dispatcher_live: AtomicBool::new(false),
        });

        tokio::spawn(run_reconciler(
            self.inner.db.clone(),
            self.inner.events_tx.clone(),
            Arc::clone(&self.inner.router),
            campaign_id.clone(),
            Arc::downgrade(&runtime),
            outcome_rx,
        ));

        self.inner
            .campaigns
            .lock()
            .expect("registry lock poisoned")
            .insert(campaign_id, Arc::clone(&runtime));
        runtime
    }

    /// Spawn the dispatch loop unless one is already alive for this
    /// campaign (it survives pauses parked on the notify).
    fn spawn_dispatcher(&self, runtime: &Arc<CampaignRuntime>) {
        if runtime.dispatcher_live.swap(true, Ordering::SeqCst) {
            return;
        }
        let dispatcher = Dispatcher {
            runtime: Arc::clone(runtime),
            placement: Arc::clone(&self.inner.placement),
            retry: self.inner.retry,
            events_tx: self.inner.events_tx.clone(),
            router: Arc::clone(&self.inner.router),
        };
        let runtime = Arc::clone(runtime);
        tokio::spawn(async move {
            dispatcher.run().await;
            runtime.dispatcher_live.store(false, Ordering::SeqCst);
        });
    }

    async fn persist(&self, campaign: &Campaign) -> Result<(), EngineError> {
        let snapshot = campaign.clone();
        self.inner
            .db
            .call(move |db| db.update_campaign(&snapshot))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::db::EngineDb;
    use crate::engine::models::ContactSpec;
    use crate::engine::placement::SimulatedPlacementClient;

    fn manager() -> CampaignManager {
        let db = DbHandle::new(EngineDb::new_in_memory().unwrap());
        let (events_tx, _) = broadcast::channel(64);
        let (client, _outcome_rx) = SimulatedPlacementClient::new();
        CampaignManager::new(
            db,
            events_tx,
            Arc::new(client),
            RetryPolicy {
                limit: 2,
                backoff_ms: 1,
            },
        )
    }

    fn request(contacts: u32) -> CreateCampaignRequest {
        CreateCampaignRequest {
            name: "Test campaign".to_string(),
            description: None,
            assistant_id: "asst_1".to_string(),
            contacts: (0..contacts)
                .map(|i| ContactSpec {
                    phone_number: format!("+1555000{:04}", i),
                    name: None,
                    variables: Default::default(),
                })
                .collect(),
            max_concurrent_calls: 1,
            scheduled_at: None,
        }
    }

    #[tokio::test]
    async fn test_create_rejects_empty_contacts() {
        let manager = manager();
        let err = manager.create(request(0)).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn test_create_rejects_bad_concurrency() {
        let manager = manager();
        let mut req = request(1);
        req.max_concurrent_calls = 0;
        let err = manager.create(req).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_phone() {
        let manager = manager();
        let mut req = request(1);
        req.contacts[0].phone_number = "555-1234".to_string();
        let err = manager.create(req).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn test_create_draft_by_default_scheduled_with_time() {
        let manager = manager();
        let campaign = manager.create(request(2)).await.unwrap();
        assert_eq!(campaign.status, CampaignStatus::Draft);
        assert_eq!(campaign.total_contacts, 2);

        let mut req = request(1);
        req.scheduled_at = Some(Utc::now() + chrono::Duration::hours(1));
        let campaign = manager.create(req).await.unwrap();
        assert_eq!(campaign.status, CampaignStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_unknown_campaign_is_not_found() {
        let manager = manager();
        assert!(matches!(
            manager.start("camp_missing").await.unwrap_err(),
            EngineError::NotFound { .. }
        ));
        assert!(matches!(
            manager.get_snapshot("camp_missing").unwrap_err(),
            EngineError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_pause_requires_running() {
        let manager = manager();
        let campaign = manager.create(request(1)).await.unwrap();
        let err = manager.pause(&campaign.id).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_cancel_draft_skips_all_contacts() {
        let manager = manager();
        let campaign = manager.create(request(3)).await.unwrap();
        let cancelled = manager.cancel(&campaign.id).await.unwrap();
        assert_eq!(cancelled.status, CampaignStatus::Cancelled);
        assert_eq!(cancelled.calls_skipped, 3);
        assert_eq!(cancelled.calls_completed, 0);

        let stats = manager.stats(&campaign.id).unwrap();
        assert_eq!(stats.skipped, 3);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let manager = manager();
        let campaign = manager.create(request(2)).await.unwrap();
        manager.cancel(&campaign.id).await.unwrap();
        let again = manager.cancel(&campaign.id).await.unwrap();
        assert_eq!(again.status, CampaignStatus::Cancelled);
        assert_eq!(again.calls_skipped, 2);
    }

    #[tokio::test]
    async fn test_cancelled_never_restartable() {
        let manager = manager();
        let campaign = manager.create(request(1)).await.unwrap();
        manager.cancel(&campaign.id).await.unwrap();
        assert!(matches!(
            manager.start(&campaign.id).await.unwrap_err(),
            EngineError::InvalidState { .. }
        ));
    }

    #[tokio::test]
    async fn test_delete_draft_ok_active_conflicts() {
        let manager = manager();
        let draft = manager.create(request(1)).await.unwrap();
        manager.delete(&draft.id).await.unwrap();
        assert!(matches!(
            manager.get_snapshot(&draft.id).unwrap_err(),
            EngineError::NotFound { .. }
        ));

        let running = manager.create(request(1)).await.unwrap();
        manager.start(&running.id).await.unwrap();
        assert!(matches!(
            manager.delete(&running.id).await.unwrap_err(),
            EngineError::Conflict(_)
        ));
    }

    #[tokio::test]
    async fn test_update_metadata_draft_only() {
        let manager = manager();
        let campaign = manager.create(request(1)).await.unwrap();
        let updated = manager
            .update(
                &campaign.id,
                UpdateCampaignRequest {
                    name: Some("Renamed".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "Renamed");

        manager.start(&campaign.id).await.unwrap();
        let err = manager
            .update(
                &campaign.id,
                UpdateCampaignRequest {
                    name: Some("Again".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_update_concurrency_validates_and_applies() {
        let manager = manager();
        let campaign = manager.create(request(2)).await.unwrap();
        assert!(matches!(
            manager.update_concurrency(&campaign.id, 0).await.unwrap_err(),
            EngineError::Validation(_)
        ));
        let updated = manager.update_concurrency(&campaign.id, 5).await.unwrap();
        assert_eq!(updated.max_concurrent_calls, 5);
    }

    #[tokio::test]
    async fn test_list_filters_and_pages() {
        let manager = manager();
        for _ in 0..3 {
            manager.create(request(1)).await.unwrap();
        }
        let draft = manager.list(Some(CampaignStatus::Draft), 50, 0);
        assert_eq!(draft.len(), 3);
        assert!(manager.list(Some(CampaignStatus::Running), 50, 0).is_empty());
        assert_eq!(manager.list(None, 2, 0).len(), 2);
        assert_eq!(manager.list(None, 50, 2).len(), 1);
    }

    #[tokio::test]
    async fn test_outcome_for_unknown_placement_is_absorbed() {
        let manager = manager();
        let campaign = manager.create(request(1)).await.unwrap();
        manager.apply_outcome("nonexistent", CallOutcome::Answered, 10, None, None);
        let snapshot = manager.get_snapshot(&campaign.id).unwrap();
        assert_eq!(snapshot.calls_completed, 0);
    }

    #[tokio::test]
    async fn test_start_due_scheduled_starts_past_due_only() {
        let manager = manager();
        let mut due = request(1);
        due.scheduled_at = Some(Utc::now() - chrono::Duration::minutes(1));
        let due = manager.create(due).await.unwrap();

        let mut future = request(1);
        future.scheduled_at = Some(Utc::now() + chrono::Duration::hours(1));
        let future = manager.create(future).await.unwrap();

        let started = manager.start_due_scheduled().await;
        assert_eq!(started, 1);
        assert_eq!(
            manager.get_snapshot(&due.id).unwrap().status,
            CampaignStatus::Running
        );
        assert_eq!(
            manager.get_snapshot(&future.id).unwrap().status,
            CampaignStatus::Scheduled
        );
    }
}
