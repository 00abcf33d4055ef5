//! Typed error hierarchy for the Outdial engine.
//!
//! Two top-level enums cover the two failure domains:
//! - `EngineError` — campaign lifecycle and API operations
//! - `PlacementError` — the outbound telephony boundary

use thiserror::Error;

use crate::engine::models::CampaignStatus;

/// Errors surfaced synchronously by campaign lifecycle operations.
///
/// These never affect other campaigns: a failed `start` on one campaign
/// leaves every other campaign untouched.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed creation or update input, rejected before any state exists.
    #[error("{0}")]
    Validation(String),

    #[error("campaign {id} not found")]
    NotFound { id: String },

    /// The requested operation is not legal from the campaign's current status.
    #[error("cannot {action} campaign in status {status}")]
    InvalidState {
        action: &'static str,
        status: CampaignStatus,
    },

    /// The operation conflicts with the campaign's current use (e.g. delete
    /// while running).
    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Errors from a single call placement attempt.
///
/// The variant carries the transient/permanent classification the dispatcher
/// uses to decide between retrying and marking the job failed.
#[derive(Debug, Error)]
pub enum PlacementError {
    /// The provider refused the request outright (e.g. malformed number).
    /// Never retried.
    #[error("placement rejected: {0}")]
    Rejected(String),

    /// The provider or transport failed in a way that may succeed on retry.
    #[error("transient placement failure: {0}")]
    Transient(String),
}

impl PlacementError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}
