use std::collections::HashMap;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

/// E.164: leading `+`, country code 1-9, up to 15 digits total.
static E164_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+[1-9]\d{1,14}$").expect("valid E.164 regex"));

pub fn validate_phone_number(phone: &str) -> Result<(), EngineError> {
    if E164_RE.is_match(phone) {
        Ok(())
    } else {
        Err(EngineError::Validation(format!(
            "invalid E.164 phone number: {}",
            phone
        )))
    }
}

/// Generate a campaign id in the `camp_<12 hex>` form used across the API.
pub fn new_campaign_id() -> String {
    format!("camp_{}", &uuid::Uuid::new_v4().simple().to_string()[..12])
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Running,
    Paused,
    Completed,
    Cancelled,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CampaignStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "scheduled" => Ok(Self::Scheduled),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid campaign status: {}", s)),
        }
    }
}

/// Status of one tracked call job.
///
/// `pending → dispatched → in_progress → {completed | failed | no_answer}`,
/// or `skipped` for contacts never pulled before a cancel. Terminal states
/// are never revisited.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallJobStatus {
    Pending,
    Dispatched,
    InProgress,
    Completed,
    Failed,
    NoAnswer,
    Skipped,
}

impl CallJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Dispatched => "dispatched",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::NoAnswer => "no_answer",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::NoAnswer | Self::Skipped
        )
    }

    /// Counts against the campaign's concurrency ceiling.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Dispatched | Self::InProgress)
    }
}

impl std::fmt::Display for CallJobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallJobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "dispatched" => Ok(Self::Dispatched),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "no_answer" => Ok(Self::NoAnswer),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("Invalid call job status: {}", s)),
        }
    }
}

/// Outcome reported by the telephony layer for a finished call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Answered,
    NoAnswer,
    Failed,
}

impl CallOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Answered => "answered",
            Self::NoAnswer => "no_answer",
            Self::Failed => "failed",
        }
    }

    /// The terminal job status this outcome resolves to.
    pub fn job_status(&self) -> CallJobStatus {
        match self {
            Self::Answered => CallJobStatus::Completed,
            Self::NoAnswer => CallJobStatus::NoAnswer,
            Self::Failed => CallJobStatus::Failed,
        }
    }
}

impl std::fmt::Display for CallOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "answered" => Ok(Self::Answered),
            "no_answer" => Ok(Self::NoAnswer),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid call outcome: {}", s)),
        }
    }
}

/// One phone number targeted by a campaign. Immutable once the campaign is
/// created; the ordinal is the contact's stable position in the submitted
/// list and doubles as the job id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub ordinal: u32,
    pub phone_number: String,
    pub name: Option<String>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub assistant_id: String,
    pub max_concurrent_calls: u32,
    pub status: CampaignStatus,
    pub total_contacts: u32,
    pub calls_completed: u32,
    pub calls_answered: u32,
    pub calls_failed: u32,
    pub calls_no_answer: u32,
    pub calls_skipped: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// The mutable unit of work for one contact. Created lazily when the
/// dispatcher pulls the contact (or when a cancel skips it), discarded with
/// the campaign runtime once terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallJob {
    pub ordinal: u32,
    pub status: CallJobStatus,
    pub placement_id: Option<String>,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl CallJob {
    pub fn pending(ordinal: u32) -> Self {
        Self {
            ordinal,
            status: CallJobStatus::Pending,
            placement_id: None,
            attempts: 0,
            last_error: None,
        }
    }

    pub fn skipped(ordinal: u32) -> Self {
        Self {
            ordinal,
            status: CallJobStatus::Skipped,
            placement_id: None,
            attempts: 0,
            last_error: None,
        }
    }
}

/// Durable record of one finished call, written by the reconciler. This is
/// the row analytics reads later; it is never re-derived from runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub campaign_id: String,
    pub ordinal: u32,
    pub phone_number: String,
    pub outcome: CallOutcome,
    pub duration_secs: u64,
    pub recording_url: Option<String>,
    pub transcript_id: Option<String>,
    pub ended_at: DateTime<Utc>,
}

// ── Request payloads ─────────────────────────────────────────────────

/// Contact as submitted at campaign creation, before ordinals are assigned.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContactSpec {
    pub phone_number: String,
    pub name: Option<String>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

fn default_max_concurrent() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CreateCampaignRequest {
    pub name: String,
    pub description: Option<String>,
    pub assistant_id: String,
    pub contacts: Vec<ContactSpec>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_calls: u32,
    pub scheduled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct UpdateCampaignRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub max_concurrent_calls: Option<u32>,
}

/// Per-status job tally for one campaign.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CampaignStats {
    pub total: u32,
    pub pending: u32,
    pub dispatched: u32,
    pub in_progress: u32,
    pub completed: u32,
    pub failed: u32,
    pub no_answer: u32,
    pub skipped: u32,
}
