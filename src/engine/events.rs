use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::engine::models::{Campaign, CallOutcome};

// ── Engine event types ───────────────────────────────────────────────

/// Progress events fanned out to WebSocket clients. One broadcast channel
/// serves the whole process; every event carries its campaign id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EngineEvent {
    CampaignCreated {
        campaign: Campaign,
    },
    CampaignStarted {
        campaign_id: String,
    },
    CampaignPaused {
        campaign_id: String,
    },
    CampaignResumed {
        campaign_id: String,
    },
    CampaignCancelled {
        campaign_id: String,
        skipped: u32,
    },
    CampaignCompleted {
        campaign: Campaign,
    },
    CampaignDeleted {
        campaign_id: String,
    },
    CallDispatched {
        campaign_id: String,
        job: u32,
        phone_number: String,
    },
    CallCompleted {
        campaign_id: String,
        job: u32,
        outcome: CallOutcome,
        duration_secs: u64,
    },
    CampaignProgress {
        campaign_id: String,
        calls_completed: u32,
        total_contacts: u32,
        in_flight: u32,
    },
}

// ── Broadcast helper ─────────────────────────────────────────────────

/// Serialize and broadcast an EngineEvent to all connected WebSocket
/// clients. Returns silently even if no clients are connected.
pub fn broadcast_event(tx: &broadcast::Sender<String>, event: &EngineEvent) {
    match serde_json::to_string(event) {
        Ok(json) => {
            let _ = tx.send(json); // Ignore error if no receivers
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize engine event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_completed_serialization() {
        let event = EngineEvent::CallCompleted {
            campaign_id: "camp_abc123def456".to_string(),
            job: 3,
            outcome: CallOutcome::Answered,
            duration_secs: 42,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"CallCompleted\""));
        assert!(json.contains("\"outcome\":\"answered\""));
        assert!(json.contains("\"job\":3"));
    }

    #[test]
    fn test_campaign_progress_roundtrip() {
        let event = EngineEvent::CampaignProgress {
            campaign_id: "camp_abc123def456".to_string(),
            calls_completed: 2,
            total_contacts: 5,
            in_flight: 2,
        };
        let json = serde_json::to_string(&event).unwrap();
        let deserialized: EngineEvent = serde_json::from_str(&json).unwrap();
        match deserialized {
            EngineEvent::CampaignProgress {
                calls_completed,
                total_contacts,
                in_flight,
                ..
            } => {
                assert_eq!(calls_completed, 2);
                assert_eq!(total_contacts, 5);
                assert_eq!(in_flight, 2);
            }
            _ => panic!("Expected CampaignProgress variant"),
        }
    }

    #[tokio::test]
    async fn test_broadcast_delivers_to_subscribers() {
        let (tx, _) = broadcast::channel::<String>(16);
        let mut rx1 = tx.subscribe();
        let mut rx2 = tx.subscribe();

        let event = EngineEvent::CampaignDeleted {
            campaign_id: "camp_abc123def456".to_string(),
        };
        broadcast_event(&tx, &event);

        let received1 = rx1.recv().await.unwrap();
        let received2 = rx2.recv().await.unwrap();
        assert!(received1.contains("CampaignDeleted"));
        assert_eq!(received1, received2);
    }

    #[tokio::test]
    async fn test_broadcast_no_receivers_does_not_panic() {
        let (tx, _) = broadcast::channel::<String>(16);
        let event = EngineEvent::CampaignStarted {
            campaign_id: "camp_abc123def456".to_string(),
        };
        broadcast_event(&tx, &event);
    }
}
