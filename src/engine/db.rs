use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};

use crate::engine::models::{
    CallOutcome, CallRecord, Campaign, CampaignStatus, Contact,
};

/// Async-safe handle to the engine database.
///
/// Wraps `EngineDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<EngineDb>>,
}

impl DbHandle {
    pub fn new(db: EngineDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&EngineDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct EngineDb {
    conn: Connection,
}

impl EngineDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS campaigns (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    description TEXT,
                    assistant_id TEXT NOT NULL,
                    max_concurrent_calls INTEGER NOT NULL,
                    status TEXT NOT NULL DEFAULT 'draft',
                    total_contacts INTEGER NOT NULL,
                    calls_completed INTEGER NOT NULL DEFAULT 0,
                    calls_answered INTEGER NOT NULL DEFAULT 0,
                    calls_failed INTEGER NOT NULL DEFAULT 0,
                    calls_no_answer INTEGER NOT NULL DEFAULT 0,
                    calls_skipped INTEGER NOT NULL DEFAULT 0,
                    contacts TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    scheduled_at TEXT,
                    started_at TEXT,
                    ended_at TEXT
                );

                CREATE TABLE IF NOT EXISTS call_records (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    campaign_id TEXT NOT NULL REFERENCES campaigns(id) ON DELETE CASCADE,
                    ordinal INTEGER NOT NULL,
                    phone_number TEXT NOT NULL,
                    outcome TEXT NOT NULL,
                    duration_secs INTEGER NOT NULL,
                    recording_url TEXT,
                    transcript_id TEXT,
                    ended_at TEXT NOT NULL,
                    UNIQUE(campaign_id, ordinal)
                );

                CREATE INDEX IF NOT EXISTS idx_call_records_campaign
                    ON call_records(campaign_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Campaigns ─────────────────────────────────────────────────────

    /// Insert a freshly created campaign together with its immutable
    /// contact list.
    pub fn insert_campaign(&self, campaign: &Campaign, contacts: &[Contact]) -> Result<()> {
        let contacts_json =
            serde_json::to_string(contacts).context("Failed to serialize contacts")?;
        self.conn
            .execute(
                "INSERT INTO campaigns (
                    id, name, description, assistant_id, max_concurrent_calls,
                    status, total_contacts, calls_completed, calls_answered,
                    calls_failed, calls_no_answer, calls_skipped, contacts,
                    created_at, updated_at, scheduled_at, started_at, ended_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
                params![
                    campaign.id,
                    campaign.name,
                    campaign.description,
                    campaign.assistant_id,
                    campaign.max_concurrent_calls,
                    campaign.status.as_str(),
                    campaign.total_contacts,
                    campaign.calls_completed,
                    campaign.calls_answered,
                    campaign.calls_failed,
                    campaign.calls_no_answer,
                    campaign.calls_skipped,
                    contacts_json,
                    campaign.created_at.to_rfc3339(),
                    campaign.updated_at.to_rfc3339(),
                    campaign.scheduled_at.map(|t| t.to_rfc3339()),
                    campaign.started_at.map(|t| t.to_rfc3339()),
                    campaign.ended_at.map(|t| t.to_rfc3339()),
                ],
            )
            .context("Failed to insert campaign")?;
        Ok(())
    }

    /// Persist the current snapshot of a campaign. Contacts are immutable
    /// and not touched here.
    pub fn update_campaign(&self, campaign: &Campaign) -> Result<()> {
        let updated = self
            .conn
            .execute(
                "UPDATE campaigns SET
                    name = ?2, description = ?3, max_concurrent_calls = ?4,
                    status = ?5, calls_completed = ?6, calls_answered = ?7,
                    calls_failed = ?8, calls_no_answer = ?9, calls_skipped = ?10,
                    updated_at = ?11, scheduled_at = ?12, started_at = ?13,
                    ended_at = ?14
                 WHERE id = ?1",
                params![
                    campaign.id,
                    campaign.name,
                    campaign.description,
                    campaign.max_concurrent_calls,
                    campaign.status.as_str(),
                    campaign.calls_completed,
                    campaign.calls_answered,
                    campaign.calls_failed,
                    campaign.calls_no_answer,
                    campaign.calls_skipped,
                    campaign.updated_at.to_rfc3339(),
                    campaign.scheduled_at.map(|t| t.to_rfc3339()),
                    campaign.started_at.map(|t| t.to_rfc3339()),
                    campaign.ended_at.map(|t| t.to_rfc3339()),
                ],
            )
            .context("Failed to update campaign")?;
        anyhow::ensure!(updated == 1, "Campaign {} not found in DB", campaign.id);
        Ok(())
    }

    pub fn delete_campaign(&self, id: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM campaigns WHERE id = ?1", params![id])
            .context("Failed to delete campaign")?;
        Ok(())
    }

    /// Load every stored campaign with its contact list, newest first.
    /// Used once at startup to rebuild the in-memory registry.
    pub fn load_campaigns(&self) -> Result<Vec<(Campaign, Vec<Contact>)>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, description, assistant_id, max_concurrent_calls,
                        status, total_contacts, calls_completed, calls_answered,
                        calls_failed, calls_no_answer, calls_skipped, contacts,
                        created_at, updated_at, scheduled_at, started_at, ended_at
                 FROM campaigns ORDER BY created_at DESC",
            )
            .context("Failed to prepare campaign query")?;

        let rows = stmt
            .query_map([], |row| {
                let contacts_json: String = row.get(12)?;
                Ok((row_to_campaign(row)?, contacts_json))
            })
            .context("Failed to query campaigns")?;

        let mut campaigns = Vec::new();
        for row in rows {
            let (campaign, contacts_json) = row.context("Failed to read campaign row")?;
            let contacts: Vec<Contact> = serde_json::from_str(&contacts_json)
                .context("Failed to deserialize contacts")?;
            campaigns.push((campaign, contacts));
        }
        Ok(campaigns)
    }

    // ── Call records ──────────────────────────────────────────────────

    /// Write the durable record for one finished call. A record already
    /// present for the same (campaign, contact) is left untouched so
    /// duplicate outcome deliveries cannot double-log.
    pub fn insert_call_record(&self, record: &CallRecord) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO call_records (
                    campaign_id, ordinal, phone_number, outcome, duration_secs,
                    recording_url, transcript_id, ended_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.campaign_id,
                    record.ordinal,
                    record.phone_number,
                    record.outcome.as_str(),
                    record.duration_secs,
                    record.recording_url,
                    record.transcript_id,
                    record.ended_at.to_rfc3339(),
                ],
            )
            .context("Failed to insert call record")?;
        Ok(())
    }

    pub fn list_call_records(&self, campaign_id: &str) -> Result<Vec<CallRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT campaign_id, ordinal, phone_number, outcome, duration_secs,
                        recording_url, transcript_id, ended_at
                 FROM call_records WHERE campaign_id = ?1 ORDER BY ordinal",
            )
            .context("Failed to prepare call record query")?;

        let rows = stmt
            .query_map(params![campaign_id], |row| {
                Ok(CallRecord {
                    campaign_id: row.get(0)?,
                    ordinal: row.get(1)?,
                    phone_number: row.get(2)?,
                    outcome: parse_column(row, 3)?,
                    duration_secs: row.get(4)?,
                    recording_url: row.get(5)?,
                    transcript_id: row.get(6)?,
                    ended_at: parse_timestamp(row, 7)?,
                })
            })
            .context("Failed to query call records")?;

        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read call record rows")
    }

    /// Ordinals that already have a durable record, i.e. contacts that must
    /// not be re-dialed when a restored campaign resumes.
    pub fn terminal_ordinals(&self, campaign_id: &str) -> Result<Vec<u32>> {
        let mut stmt = self
            .conn
            .prepare("SELECT ordinal FROM call_records WHERE campaign_id = ?1")
            .context("Failed to prepare ordinal query")?;
        let rows = stmt
            .query_map(params![campaign_id], |row| row.get(0))
            .context("Failed to query terminal ordinals")?;
        rows.collect::<rusqlite::Result<Vec<u32>>>()
            .context("Failed to read ordinal rows")
    }

}

/// Parse an enum column stored as its `as_str` form.
fn parse_column<T: FromStr>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let value: String = row.get(idx)?;
    value.parse().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("invalid enum value: {}", value).into(),
        )
    })
}

fn parse_timestamp(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let value: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Text,
                format!("invalid timestamp: {}", e).into(),
            )
        })
}

fn parse_opt_timestamp(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let value: Option<String> = row.get(idx)?;
    match value {
        None => Ok(None),
        Some(v) => DateTime::parse_from_rfc3339(&v)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    idx,
                    rusqlite::types::Type::Text,
                    format!("invalid timestamp: {}", e).into(),
                )
            }),
    }
}

fn row_to_campaign(row: &rusqlite::Row<'_>) -> rusqlite::Result<Campaign> {
    Ok(Campaign {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        assistant_id: row.get(3)?,
        max_concurrent_calls: row.get(4)?,
        status: parse_column::<CampaignStatus>(row, 5)?,
        total_contacts: row.get(6)?,
        calls_completed: row.get(7)?,
        calls_answered: row.get(8)?,
        calls_failed: row.get(9)?,
        calls_no_answer: row.get(10)?,
        calls_skipped: row.get(11)?,
        created_at: parse_timestamp(row, 13)?,
        updated_at: parse_timestamp(row, 14)?,
        scheduled_at: parse_opt_timestamp(row, 15)?,
        started_at: parse_opt_timestamp(row, 16)?,
        ended_at: parse_opt_timestamp(row, 17)?,
    })
}
