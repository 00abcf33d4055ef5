//! The outbound boundary to the telephony provider.
//!
//! The engine only ever asks the provider one thing: place this call and
//! give me a handle. Everything after the handle arrives back through the
//! outcome path (webhook in production, scripted pump in dev and tests).

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::engine::models::CallOutcome;
use crate::errors::PlacementError;

#[derive(Debug, Clone, Serialize)]
pub struct PlacementRequest {
    pub phone_number: String,
    pub assistant_id: String,
    pub variables: HashMap<String, String>,
}

#[async_trait]
pub trait PlacementClient: Send + Sync {
    /// Request an outbound call. Returns the provider's opaque handle for
    /// the placed call; the call's outcome arrives later as an independent
    /// event keyed by that handle.
    async fn place_call(&self, request: &PlacementRequest) -> Result<String, PlacementError>;
}

// ── HTTP client ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct PlaceCallResponse {
    call_id: String,
}

/// Production client: POSTs placement requests to the provider gateway.
/// 4xx responses are permanent rejections; transport errors and 5xx are
/// transient and eligible for retry.
pub struct HttpPlacementClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpPlacementClient {
    pub fn new(
        base_url: String,
        api_key: Option<String>,
        timeout_secs: u64,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url,
            api_key,
        })
    }
}

#[async_trait]
impl PlacementClient for HttpPlacementClient {
    async fn place_call(&self, request: &PlacementRequest) -> Result<String, PlacementError> {
        let url = format!("{}/calls", self.base_url.trim_end_matches('/'));
        let mut builder = self.http.post(&url).json(request);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| PlacementError::Transient(format!("request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            let body: PlaceCallResponse = response
                .json()
                .await
                .map_err(|e| PlacementError::Transient(format!("invalid response body: {}", e)))?;
            return Ok(body.call_id);
        }

        let detail = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            Err(PlacementError::Rejected(format!("{}: {}", status, detail)))
        } else {
            Err(PlacementError::Transient(format!("{}: {}", status, detail)))
        }
    }
}

// ── Simulated client ─────────────────────────────────────────────────

/// Scripted behavior for one phone number in the simulated client.
#[derive(Debug, Clone)]
pub enum Script {
    /// Place successfully, then report `outcome` after `delay_ms`.
    Resolve {
        outcome: CallOutcome,
        duration_secs: u64,
        delay_ms: u64,
    },
    /// Place successfully but never report an outcome; the test releases
    /// the call itself via `CampaignManager::apply_outcome`.
    Hold,
    /// Refuse the placement outright.
    Reject,
    /// Fail transiently `failures` times, then behave like `Resolve` with
    /// an answered outcome.
    Flaky { failures: u32 },
}

/// An outcome the simulated provider wants delivered back to the engine.
#[derive(Debug, Clone)]
pub struct SimulatedOutcome {
    pub placement_id: String,
    pub outcome: CallOutcome,
    pub duration_secs: u64,
    pub delay_ms: u64,
}

/// Stand-in provider for dev mode and tests. Placements succeed according
/// to the per-phone script (default: answered after a short delay) and
/// outcomes are pushed onto a channel the server pumps back into the
/// manager, mimicking the provider's webhook.
pub struct SimulatedPlacementClient {
    scripts: Mutex<HashMap<String, Script>>,
    default_script: Script,
    attempts: Mutex<HashMap<String, u32>>,
    counter: AtomicU64,
    outcome_tx: mpsc::UnboundedSender<SimulatedOutcome>,
}

impl SimulatedPlacementClient {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SimulatedOutcome>) {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let client = Self {
            scripts: Mutex::new(HashMap::new()),
            default_script: Script::Resolve {
                outcome: CallOutcome::Answered,
                duration_secs: 30,
                delay_ms: 250,
            },
            attempts: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(0),
            outcome_tx,
        };
        (client, outcome_rx)
    }

    /// Override the behavior for a specific phone number.
    pub fn script(&self, phone_number: &str, script: Script) {
        self.scripts
            .lock()
            .expect("script lock poisoned")
            .insert(phone_number.to_string(), script);
    }

    fn next_placement_id(&self) -> String {
        format!("sim_{}", self.counter.fetch_add(1, Ordering::Relaxed))
    }
}

#[async_trait]
impl PlacementClient for SimulatedPlacementClient {
    async fn place_call(&self, request: &PlacementRequest) -> Result<String, PlacementError> {
        let script = self
            .scripts
            .lock()
            .expect("script lock poisoned")
            .get(&request.phone_number)
            .cloned()
            .unwrap_or_else(|| self.default_script.clone());

        match script {
            Script::Reject => Err(PlacementError::Rejected(format!(
                "provider refused {}",
                request.phone_number
            ))),
            Script::Hold => Ok(self.next_placement_id()),
            Script::Flaky { failures } => {
                let attempt = {
                    let mut attempts = self.attempts.lock().expect("attempts lock poisoned");
                    let entry = attempts.entry(request.phone_number.clone()).or_insert(0);
                    *entry += 1;
                    *entry
                };
                if attempt <= failures {
                    return Err(PlacementError::Transient(format!(
                        "simulated outage (attempt {})",
                        attempt
                    )));
                }
                let placement_id = self.next_placement_id();
                let _ = self.outcome_tx.send(SimulatedOutcome {
                    placement_id: placement_id.clone(),
                    outcome: CallOutcome::Answered,
                    duration_secs: 30,
                    delay_ms: 0,
                });
                Ok(placement_id)
            }
            Script::Resolve {
                outcome,
                duration_secs,
                delay_ms,
            } => {
                let placement_id = self.next_placement_id();
                let _ = self.outcome_tx.send(SimulatedOutcome {
                    placement_id: placement_id.clone(),
                    outcome,
                    duration_secs,
                    delay_ms,
                });
                Ok(placement_id)
            }
        }
    }
}
