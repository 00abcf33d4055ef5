//! Campaign status transition table.
//!
//! All lifecycle mutations go through [`authorize`] so a campaign can never
//! reach a status its current status does not permit. Guards that depend on
//! campaign data (non-empty contact list, assigned assistant) live in the
//! manager; this module is the pure table.

use crate::engine::models::CampaignStatus;
use crate::errors::EngineError;

/// Operator-driven lifecycle actions. The automatic `running → completed`
/// transition is fired by the reconciler and does not pass through here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CampaignAction {
    Start,
    Pause,
    Resume,
    Cancel,
}

impl CampaignAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Cancel => "cancel",
        }
    }
}

/// Return the status the campaign moves to if `action` is legal from
/// `status`, or `InvalidState` otherwise.
///
/// `cancel` on an already-cancelled campaign is idempotent and reports the
/// unchanged status as success.
pub fn authorize(
    status: CampaignStatus,
    action: CampaignAction,
) -> Result<CampaignStatus, EngineError> {
    use CampaignAction::*;
    use CampaignStatus::*;

    match (status, action) {
        (Draft | Scheduled, Start) => Ok(Running),
        (Running, Pause) => Ok(Paused),
        (Paused, Resume) => Ok(Running),
        (Draft | Scheduled | Running | Paused, Cancel) => Ok(Cancelled),
        (Cancelled, Cancel) => Ok(Cancelled),
        _ => Err(EngineError::InvalidState {
            action: action.as_str(),
            status,
        }),
    }
}

/// Deletion is a registry operation rather than a status transition, but it
/// is still gated on status: active campaigns cannot be deleted.
pub fn deletable(status: CampaignStatus) -> bool {
    matches!(
        status,
        CampaignStatus::Draft | CampaignStatus::Completed | CampaignStatus::Cancelled
    )
}
