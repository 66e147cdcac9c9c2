//! Durable work store
//!
//! SQLite-backed record of every company's lifecycle, retry counters,
//! document reference and extracted record. It is the single source of truth
//! for resuming an interrupted run: leases are claimed with compare-and-set
//! updates, and a lease that outlives its process is reclaimed by
//! [`WorkStore::release_stale`].

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::company::{CompanyKey, CompanyRecord, LifecycleState, NewCompany, Phase, ResetKind};
use crate::config::RetryConfig;
use crate::documents::{DocumentFormat, DocumentHandle};
use crate::ownership::OwnershipRecord;
use crate::rate_limit::{chrono_duration, RateState, RateStateStore};

/// Current schema version - bump when making breaking changes
pub const SCHEMA_VERSION: u32 = 1;

/// Row key of the governor state shared by all runs on this store
const RATE_SCOPE: &str = "register";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS companies (
    key TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    location TEXT NOT NULL DEFAULT '',
    court TEXT,
    register TEXT NOT NULL,
    state TEXT NOT NULL,
    fetch_attempts INTEGER NOT NULL DEFAULT 0,
    parse_attempts INTEGER NOT NULL DEFAULT 0,
    retry_after INTEGER,
    leased_at INTEGER,
    lease_prev_state TEXT,
    doc_location TEXT,
    doc_format TEXT,
    doc_size INTEGER,
    fetched_at INTEGER,
    doc_purged_at INTEGER,
    record_json TEXT,
    confidence REAL,
    natural_persons INTEGER,
    legal_entities INTEGER,
    last_error TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_companies_state ON companies(state);

CREATE TABLE IF NOT EXISTS pipeline_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT NOT NULL,
    phase TEXT NOT NULL,
    status TEXT NOT NULL,
    message TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_pipeline_log_key ON pipeline_log(key);

CREATE TABLE IF NOT EXISTS rate_state (
    scope TEXT PRIMARY KEY,
    state_json TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);
";

const COMPANY_COLUMNS: &str = "key, name, location, court, register, state, fetch_attempts, parse_attempts, \
     retry_after, doc_location, doc_format, doc_size, fetched_at, record_json, confidence, last_error, \
     doc_purged_at, created_at, updated_at";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("stored JSON is invalid: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("lease on {key} was lost (reclaimed or already committed)")]
    LeaseLost { key: CompanyKey },

    #[error("unknown company {0}")]
    UnknownCompany(CompanyKey),

    #[error("{key}: transition {from} -> {to} is not allowed")]
    InvalidTransition {
        key: CompanyKey,
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("{outcome} outcome cannot complete a {phase} lease")]
    PhaseMismatch { phase: Phase, outcome: &'static str },

    #[error("database schema version {found} is not supported (expected {expected})")]
    SchemaVersion { found: String, expected: u32 },

    #[error("work store lock poisoned")]
    Poisoned,

    #[error("could not create database directory {path}: {source}")]
    Directory {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Exclusive claim on one company for one phase
#[derive(Debug, Clone)]
pub struct Lease {
    pub key: CompanyKey,
    pub phase: Phase,
    /// Snapshot of the company at lease time
    pub company: CompanyRecord,
    token: i64,
}

impl Lease {
    pub fn leased_at(&self) -> DateTime<Utc> {
        from_micros(self.token).unwrap_or_else(Utc::now)
    }
}

/// Result of one leased unit of work
#[derive(Debug, Clone)]
pub enum Outcome {
    Fetched(DocumentHandle),
    /// The register has no document for this key
    NotFound(String),
    /// Retrieved but not machine-readable; the document is kept for review when present
    Unsupported {
        document: Option<DocumentHandle>,
        reason: String,
    },
    FetchFailed(String),
    Parsed {
        record: OwnershipRecord,
        confidence: f64,
    },
    ParseFailed(String),
}

impl Outcome {
    fn phase(&self) -> Phase {
        match self {
            Outcome::Fetched(_) | Outcome::NotFound(_) | Outcome::Unsupported { .. } | Outcome::FetchFailed(_) => {
                Phase::Fetch
            }
            Outcome::Parsed { .. } | Outcome::ParseFailed(_) => Phase::Parse,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Outcome::Fetched(_) => "fetched",
            Outcome::NotFound(_) => "not_found",
            Outcome::Unsupported { .. } => "unsupported",
            Outcome::FetchFailed(_) => "fetch_failed",
            Outcome::Parsed { .. } => "parsed",
            Outcome::ParseFailed(_) => "parse_failed",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertSummary {
    pub inserted: usize,
    pub updated: usize,
}

/// Number of companies per lifecycle state
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineStats {
    counts: HashMap<LifecycleState, usize>,
}

impl PipelineStats {
    pub fn count(&self, state: LifecycleState) -> usize {
        self.counts.get(&state).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    /// Companies whose screening has finished, successfully or not
    pub fn terminal(&self) -> usize {
        LifecycleState::ALL
            .iter()
            .filter(|s| s.is_terminal())
            .map(|s| self.count(*s))
            .sum()
    }
}

impl fmt::Display for PipelineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Companies: {} ({} finished)", self.total(), self.terminal())?;
        for state in LifecycleState::ALL {
            let count = self.count(state);
            if count > 0 {
                writeln!(f, "  {:<18} {}", state.as_str(), count)?;
            }
        }
        Ok(())
    }
}

/// One entry of the append-only pipeline log
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineEvent {
    pub key: CompanyKey,
    pub phase: String,
    pub status: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Cloneable handle to the SQLite work store
#[derive(Debug, Clone)]
pub struct WorkStore {
    conn: Arc<Mutex<Connection>>,
    retry: RetryConfig,
}

impl WorkStore {
    /// Open (creating if needed) the store at `path`
    pub fn open(path: &Path, retry: RetryConfig) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Directory {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn, retry)
    }

    /// Private store for tests and dry runs
    pub fn open_in_memory(retry: RetryConfig) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?, retry)
    }

    fn from_connection(conn: Connection, retry: RetryConfig) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        debug!("SQLite journal mode: {}", mode);
        conn.execute_batch("PRAGMA synchronous = FULL;")?;
        conn.execute_batch(SCHEMA)?;

        conn.execute(
            "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('version', ?1)",
            params![SCHEMA_VERSION.to_string()],
        )?;
        let found: String = conn.query_row("SELECT value FROM schema_meta WHERE key = 'version'", [], |row| {
            row.get(0)
        })?;
        if found != SCHEMA_VERSION.to_string() {
            return Err(StoreError::SchemaVersion {
                found,
                expected: SCHEMA_VERSION,
            });
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            retry,
        })
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Insert new companies as `pending`; known keys only get their display fields refreshed
    pub fn upsert_companies(&self, companies: &[NewCompany]) -> Result<UpsertSummary, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = micros(Utc::now());
        let mut summary = UpsertSummary::default();

        for company in companies {
            let exists = tx
                .query_row(
                    "SELECT 1 FROM companies WHERE key = ?1",
                    params![company.key.as_str()],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();

            if exists {
                tx.execute(
                    "UPDATE companies SET name = ?2, location = ?3, court = ?4, register = ?5,
                         updated_at = MAX(?6, updated_at + 1)
                     WHERE key = ?1",
                    params![
                        company.key.as_str(),
                        company.name,
                        company.location,
                        company.court,
                        company.register.to_string(),
                        now
                    ],
                )?;
                summary.updated += 1;
            } else {
                tx.execute(
                    "INSERT INTO companies (key, name, location, court, register, state, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                    params![
                        company.key.as_str(),
                        company.name,
                        company.location,
                        company.court,
                        company.register.to_string(),
                        LifecycleState::Pending.as_str(),
                        now
                    ],
                )?;
                insert_event(&tx, company.key.as_str(), "import", "pending", "", now)?;
                summary.inserted += 1;
            }
        }

        tx.commit()?;
        info!(
            "Imported {} new companies ({} already known)",
            summary.inserted, summary.updated
        );
        Ok(summary)
    }

    /// Claim up to `batch_size` items eligible for `phase`
    pub fn lease_next(&self, phase: Phase, batch_size: usize) -> Result<Vec<Lease>, StoreError> {
        let eligible = phase.eligible_state();
        let in_progress = phase.in_progress_state();

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let candidates: Vec<(String, i64)> = {
            let mut stmt = tx.prepare(
                "SELECT key, updated_at FROM companies WHERE state = ?1 ORDER BY created_at, key LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![eligible.as_str(), batch_size as i64], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
            rows.collect::<Result<_, _>>()?
        };

        let now = micros(Utc::now());
        let mut leases = Vec::with_capacity(candidates.len());

        for (key, updated_at) in candidates {
            let token: Option<i64> = tx
                .query_row(
                    "UPDATE companies
                     SET state = ?1, lease_prev_state = ?2,
                         leased_at = MAX(?3, COALESCE(leased_at, 0) + 1),
                         updated_at = MAX(?3, updated_at + 1)
                     WHERE key = ?4 AND state = ?2 AND updated_at = ?5
                     RETURNING leased_at",
                    params![in_progress.as_str(), eligible.as_str(), now, key, updated_at],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(token) = token else {
                debug!("Lease race lost for {}", key);
                continue;
            };

            let company = load_company(&tx, &key)?.ok_or_else(|| StoreError::UnknownCompany(key.clone().into()))?;
            leases.push(Lease {
                key: company.key.clone(),
                phase,
                company,
                token,
            });
        }

        tx.commit()?;
        if !leases.is_empty() {
            debug!("Leased {} item(s) for {}", leases.len(), phase);
        }
        Ok(leases)
    }

    /// Persist the outcome of a leased unit of work; returns the new state
    pub fn commit(&self, lease: &Lease, outcome: Outcome) -> Result<LifecycleState, StoreError> {
        if outcome.phase() != lease.phase {
            return Err(StoreError::PhaseMismatch {
                phase: lease.phase,
                outcome: outcome.label(),
            });
        }

        let key = lease.key.as_str();
        let in_progress = lease.phase.in_progress_state();

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current: Option<(String, u32, u32)> = tx
            .query_row(
                "SELECT state, fetch_attempts, parse_attempts FROM companies WHERE key = ?1 AND leased_at = ?2",
                params![key, lease.token],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((state, fetch_attempts, parse_attempts)) = current else {
            return Err(StoreError::LeaseLost { key: lease.key.clone() });
        };
        if state != in_progress.as_str() {
            return Err(StoreError::LeaseLost { key: lease.key.clone() });
        }

        let now = Utc::now();
        let now_us = micros(now);

        let (next, message) = match &outcome {
            Outcome::Fetched(handle) => {
                let next = LifecycleState::Fetched;
                ensure_edge(&lease.key, in_progress, next)?;
                let updated = tx.execute(
                    "UPDATE companies
                     SET state = ?4, doc_location = ?5, doc_format = ?6, doc_size = ?7, fetched_at = ?8,
                         doc_purged_at = NULL, record_json = NULL, confidence = NULL,
                         natural_persons = NULL, legal_entities = NULL,
                         parse_attempts = 0, retry_after = NULL, last_error = NULL,
                         lease_prev_state = NULL, updated_at = MAX(?9, updated_at + 1)
                     WHERE key = ?1 AND state = ?2 AND leased_at = ?3",
                    params![
                        key, in_progress.as_str(), lease.token,
                        next.as_str(),
                        handle.location,
                        handle.format.as_str(),
                        handle.size as i64,
                        micros(handle.fetched_at),
                        now_us
                    ],
                )?;
                ensure_updated(updated, &lease.key)?;
                (next, format!("{} bytes ({})", handle.size, handle.format))
            }
            Outcome::NotFound(reason) => {
                let next = LifecycleState::NotFound;
                ensure_edge(&lease.key, in_progress, next)?;
                let updated = tx.execute(
                    "UPDATE companies
                     SET state = ?4, last_error = ?5, retry_after = NULL, lease_prev_state = NULL,
                         updated_at = MAX(?6, updated_at + 1)
                     WHERE key = ?1 AND state = ?2 AND leased_at = ?3",
                    params![key, in_progress.as_str(), lease.token, next.as_str(), reason, now_us],
                )?;
                ensure_updated(updated, &lease.key)?;
                (next, reason.clone())
            }
            Outcome::Unsupported { document, reason } => {
                let next = LifecycleState::NeedsReview;
                ensure_edge(&lease.key, in_progress, next)?;
                let updated = tx.execute(
                    "UPDATE companies
                     SET state = ?4, last_error = ?5, doc_location = ?6, doc_format = ?7, doc_size = ?8,
                         fetched_at = ?9, retry_after = NULL, lease_prev_state = NULL,
                         updated_at = MAX(?10, updated_at + 1)
                     WHERE key = ?1 AND state = ?2 AND leased_at = ?3",
                    params![
                        key, in_progress.as_str(), lease.token,
                        next.as_str(),
                        reason,
                        document.as_ref().map(|d| d.location.clone()),
                        document.as_ref().map(|d| d.format.as_str()),
                        document.as_ref().map(|d| d.size as i64),
                        document.as_ref().map(|d| micros(d.fetched_at)),
                        now_us
                    ],
                )?;
                ensure_updated(updated, &lease.key)?;
                (next, reason.clone())
            }
            Outcome::FetchFailed(error) => {
                let attempts = fetch_attempts + 1;
                let (next, retry_after) = self.failure_target(Phase::Fetch, attempts, now);
                ensure_edge(&lease.key, in_progress, next)?;
                let updated = tx.execute(
                    "UPDATE companies
                     SET state = ?4, fetch_attempts = ?5, retry_after = ?6, last_error = ?7,
                         lease_prev_state = NULL, updated_at = MAX(?8, updated_at + 1)
                     WHERE key = ?1 AND state = ?2 AND leased_at = ?3",
                    params![key, in_progress.as_str(), lease.token, next.as_str(), attempts, retry_after, error, now_us],
                )?;
                ensure_updated(updated, &lease.key)?;
                (next, format!("attempt {}: {}", attempts, error))
            }
            Outcome::Parsed { record, confidence } => {
                let next = LifecycleState::Parsed;
                ensure_edge(&lease.key, in_progress, next)?;
                let record_json = serde_json::to_string(record)?;
                let updated = tx.execute(
                    "UPDATE companies
                     SET state = ?4, record_json = ?5, confidence = ?6, natural_persons = ?7,
                         legal_entities = ?8, retry_after = NULL, last_error = NULL,
                         lease_prev_state = NULL, updated_at = MAX(?9, updated_at + 1)
                     WHERE key = ?1 AND state = ?2 AND leased_at = ?3",
                    params![
                        key, in_progress.as_str(), lease.token,
                        next.as_str(),
                        record_json,
                        confidence,
                        record.natural_person_count() as i64,
                        record.legal_entity_count() as i64,
                        now_us
                    ],
                )?;
                ensure_updated(updated, &lease.key)?;
                (
                    next,
                    format!(
                        "{} shareholder(s), {} natural, confidence {:.2}",
                        record.entries.len(),
                        record.natural_person_count(),
                        confidence
                    ),
                )
            }
            Outcome::ParseFailed(error) => {
                let attempts = parse_attempts + 1;
                let (next, retry_after) = self.failure_target(Phase::Parse, attempts, now);
                ensure_edge(&lease.key, in_progress, next)?;
                let updated = tx.execute(
                    "UPDATE companies
                     SET state = ?4, parse_attempts = ?5, retry_after = ?6, last_error = ?7,
                         lease_prev_state = NULL, updated_at = MAX(?8, updated_at + 1)
                     WHERE key = ?1 AND state = ?2 AND leased_at = ?3",
                    params![key, in_progress.as_str(), lease.token, next.as_str(), attempts, retry_after, error, now_us],
                )?;
                ensure_updated(updated, &lease.key)?;
                (next, format!("attempt {}: {}", attempts, error))
            }
        };

        insert_event(&tx, key, lease.phase.as_str(), next.as_str(), &message, now_us)?;
        tx.commit()?;

        debug!("{}: {} -> {}", lease.key, in_progress, next);
        Ok(next)
    }

    /// Failed or exhausted, and when a retry may start
    fn failure_target(&self, phase: Phase, attempts: u32, now: DateTime<Utc>) -> (LifecycleState, Option<i64>) {
        let max = match phase {
            Phase::Fetch => self.retry.max_fetch_retries,
            Phase::Parse => self.retry.max_parse_retries,
        };
        if attempts > max {
            (phase.exhausted_state(), None)
        } else {
            let delay = self.retry.calculate_backoff_delay(attempts);
            (phase.failed_state(), Some(micros(now + chrono_duration(delay))))
        }
    }

    /// Give a lease back untouched (interrupted before any outcome)
    pub fn release(&self, lease: &Lease) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE companies
             SET state = COALESCE(lease_prev_state, ?4), lease_prev_state = NULL,
                 updated_at = MAX(?5, updated_at + 1)
             WHERE key = ?1 AND state = ?2 AND leased_at = ?3",
            params![
                lease.key.as_str(),
                lease.phase.in_progress_state().as_str(),
                lease.token,
                lease.phase.eligible_state().as_str(),
                micros(Utc::now())
            ],
        )?;
        ensure_updated(updated, &lease.key)
    }

    /// Return items stuck in progress for longer than `timeout` to their pre-lease state
    pub fn release_stale(&self, phase: Phase, timeout: Duration) -> Result<usize, StoreError> {
        let in_progress = phase.in_progress_state();
        let fallback = phase.eligible_state();
        let now = Utc::now();
        let cutoff = micros(now - chrono_duration(timeout));

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let reclaimed: Vec<String> = {
            let mut stmt = tx.prepare(
                "UPDATE companies
                 SET state = COALESCE(lease_prev_state, ?3), lease_prev_state = NULL,
                     updated_at = MAX(?4, updated_at + 1)
                 WHERE state = ?1 AND leased_at <= ?2
                 RETURNING key",
            )?;
            let rows = stmt.query_map(
                params![in_progress.as_str(), cutoff, fallback.as_str(), micros(now)],
                |row| row.get(0),
            )?;
            rows.collect::<Result<_, _>>()?
        };

        for key in &reclaimed {
            insert_event(&tx, key, phase.as_str(), "reclaimed", "stale lease released", micros(now))?;
        }
        tx.commit()?;

        if !reclaimed.is_empty() {
            warn!("Reclaimed {} stale {} lease(s)", reclaimed.len(), phase);
        }
        Ok(reclaimed.len())
    }

    /// Apply the retry edge to failed items whose backoff has elapsed
    pub fn requeue_failed(&self, phase: Phase, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let failed = phase.failed_state();
        let target = phase.eligible_state();

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let requeued: Vec<String> = {
            let mut stmt = tx.prepare(
                "UPDATE companies
                 SET state = ?2, retry_after = NULL, updated_at = MAX(?4, updated_at + 1)
                 WHERE state = ?1 AND (retry_after IS NULL OR retry_after <= ?3)
                 RETURNING key",
            )?;
            let rows = stmt.query_map(
                params![failed.as_str(), target.as_str(), micros(now), micros(Utc::now())],
                |row| row.get(0),
            )?;
            rows.collect::<Result<_, _>>()?
        };

        for key in &requeued {
            insert_event(&tx, key, phase.as_str(), "retry", "", micros(Utc::now()))?;
        }
        tx.commit()?;

        if !requeued.is_empty() {
            info!("Requeued {} {}-failed item(s) for retry", requeued.len(), phase);
        }
        Ok(requeued.len())
    }

    /// Earliest pending retry for a phase, if any item is waiting on backoff
    pub fn next_retry_at(&self, phase: Phase) -> Result<Option<DateTime<Utc>>, StoreError> {
        let conn = self.lock()?;
        let next: Option<i64> = conn.query_row(
            "SELECT MIN(retry_after) FROM companies WHERE state = ?1",
            params![phase.failed_state().as_str()],
            |row| row.get(0),
        )?;
        Ok(next.and_then(from_micros))
    }

    /// Final decision for a parsed item
    pub fn classify(&self, key: &CompanyKey, verdict: LifecycleState, reason: &str) -> Result<(), StoreError> {
        let from = LifecycleState::Parsed;
        ensure_edge(key, from, verdict)?;

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = micros(Utc::now());

        let updated = tx.execute(
            "UPDATE companies SET state = ?3, updated_at = MAX(?4, updated_at + 1)
             WHERE key = ?1 AND state = ?2",
            params![key.as_str(), from.as_str(), verdict.as_str(), now],
        )?;

        if updated == 0 {
            let current = current_state(&tx, key)?;
            return Err(StoreError::InvalidTransition {
                key: key.clone(),
                from: current,
                to: verdict,
            });
        }

        insert_event(&tx, key.as_str(), "classify", verdict.as_str(), reason, now)?;
        tx.commit()?;
        Ok(())
    }

    /// Operator reset. Returns the replaced document on refetch so the caller can delete it.
    pub fn reset(&self, key: &CompanyKey, kind: ResetKind) -> Result<Option<DocumentHandle>, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let company = load_company(&tx, key.as_str())?.ok_or_else(|| StoreError::UnknownCompany(key.clone()))?;
        let target = kind.target();
        if !kind.allows(company.state, company.document.is_some()) {
            return Err(StoreError::InvalidTransition {
                key: key.clone(),
                from: company.state,
                to: target,
            });
        }

        let now = micros(Utc::now());
        let sql = match kind {
            ResetKind::Refetch => {
                "UPDATE companies
                 SET state = ?3, fetch_attempts = 0, parse_attempts = 0, retry_after = NULL,
                     doc_location = NULL, doc_format = NULL, doc_size = NULL, fetched_at = NULL,
                     record_json = NULL, confidence = NULL, natural_persons = NULL, legal_entities = NULL,
                     last_error = NULL, lease_prev_state = NULL, updated_at = MAX(?4, updated_at + 1)
                 WHERE key = ?1 AND state = ?2"
            }
            ResetKind::Reparse => {
                "UPDATE companies
                 SET state = ?3, parse_attempts = 0, retry_after = NULL,
                     record_json = NULL, confidence = NULL, natural_persons = NULL, legal_entities = NULL,
                     last_error = NULL, lease_prev_state = NULL, updated_at = MAX(?4, updated_at + 1)
                 WHERE key = ?1 AND state = ?2"
            }
        };
        let updated = tx.execute(sql, params![key.as_str(), company.state.as_str(), target.as_str(), now])?;
        ensure_updated(updated, key)?;

        let phase = match kind {
            ResetKind::Refetch => "fetch",
            ResetKind::Reparse => "parse",
        };
        insert_event(
            &tx,
            key.as_str(),
            phase,
            "reset",
            &format!("{} -> {}", company.state, target),
            now,
        )?;
        tx.commit()?;

        info!("{}: reset {} -> {}", key, company.state, target);
        Ok(match kind {
            ResetKind::Refetch => company.document,
            ResetKind::Reparse => None,
        })
    }

    pub fn get(&self, key: &CompanyKey) -> Result<Option<CompanyRecord>, StoreError> {
        let conn = self.lock()?;
        load_company(&conn, key.as_str())
    }

    pub fn list_by_state(&self, state: LifecycleState) -> Result<Vec<CompanyRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM companies WHERE state = ?1 ORDER BY key",
            COMPANY_COLUMNS
        ))?;
        let rows = stmt.query_map(params![state.as_str()], company_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn stats(&self) -> Result<PipelineStats, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM companies GROUP BY state")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

        let mut stats = PipelineStats::default();
        for row in rows {
            let (state, count) = row?;
            match state.parse::<LifecycleState>() {
                Ok(state) => {
                    stats.counts.insert(state, count as usize);
                }
                Err(e) => warn!("Ignoring rows with {}", e),
            }
        }
        Ok(stats)
    }

    /// Append to the pipeline log outside of a state transition
    pub fn log_event(&self, key: &CompanyKey, phase: &str, status: &str, message: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        insert_event(&conn, key.as_str(), phase, status, message, micros(Utc::now()))
    }

    /// Log entries for one company, oldest first
    pub fn events(&self, key: &CompanyKey) -> Result<Vec<PipelineEvent>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT key, phase, status, message, created_at FROM pipeline_log WHERE key = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![key.as_str()], event_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Most recent log entries across all companies, newest first
    pub fn recent_events(&self, limit: usize) -> Result<Vec<PipelineEvent>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT key, phase, status, message, created_at FROM pipeline_log ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], event_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Finished companies still holding a document fetched before `cutoff`
    pub fn documents_fetched_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<CompanyRecord>, StoreError> {
        let conn = self.lock()?;
        let terminal: Vec<String> = LifecycleState::ALL
            .iter()
            .filter(|s| s.is_terminal())
            .map(|s| format!("'{}'", s.as_str()))
            .collect();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM companies
             WHERE doc_location IS NOT NULL AND fetched_at < ?1 AND state IN ({})
             ORDER BY fetched_at",
            COMPANY_COLUMNS,
            terminal.join(", ")
        ))?;
        let rows = stmt.query_map(params![micros(cutoff)], company_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Drop the document reference after the file was deleted
    pub fn mark_document_purged(&self, key: &CompanyKey, handle: &DocumentHandle) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = micros(Utc::now());
        let updated = tx.execute(
            "UPDATE companies
             SET doc_location = NULL, doc_purged_at = ?3, updated_at = MAX(?3, updated_at + 1)
             WHERE key = ?1 AND doc_location = ?2",
            params![key.as_str(), handle.location, now],
        )?;
        if updated == 1 {
            insert_event(&tx, key.as_str(), "retention", "purged", &handle.location, now)?;
        }
        tx.commit()?;
        Ok(())
    }
}

impl RateStateStore for WorkStore {
    fn with_rate_state<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut RateState) -> T,
    {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let stored: Option<String> = tx
            .query_row(
                "SELECT state_json FROM rate_state WHERE scope = ?1",
                params![RATE_SCOPE],
                |row| row.get(0),
            )
            .optional()?;

        let was_missing = stored.is_none();
        let mut state: RateState = match stored {
            Some(json) => serde_json::from_str(&json)?,
            None => RateState::default(),
        };
        let before = state.clone();

        let result = f(&mut state);

        if was_missing || state != before {
            tx.execute(
                "INSERT INTO rate_state (scope, state_json, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(scope) DO UPDATE SET state_json = excluded.state_json, updated_at = excluded.updated_at",
                params![RATE_SCOPE, serde_json::to_string(&state)?, micros(Utc::now())],
            )?;
        }
        tx.commit()?;
        Ok(result)
    }
}

fn micros(t: DateTime<Utc>) -> i64 {
    t.timestamp_micros()
}

fn from_micros(value: i64) -> Option<DateTime<Utc>> {
    let secs = value.div_euclid(1_000_000);
    let nanos = (value.rem_euclid(1_000_000) * 1_000) as u32;
    Utc.timestamp_opt(secs, nanos).single()
}

fn ensure_edge(key: &CompanyKey, from: LifecycleState, to: LifecycleState) -> Result<(), StoreError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(StoreError::InvalidTransition {
            key: key.clone(),
            from,
            to,
        })
    }
}

fn ensure_updated(rows: usize, key: &CompanyKey) -> Result<(), StoreError> {
    if rows == 1 {
        Ok(())
    } else {
        Err(StoreError::LeaseLost { key: key.clone() })
    }
}

fn current_state(conn: &Connection, key: &CompanyKey) -> Result<LifecycleState, StoreError> {
    let state: Option<String> = conn
        .query_row(
            "SELECT state FROM companies WHERE key = ?1",
            params![key.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    let state = state.ok_or_else(|| StoreError::UnknownCompany(key.clone()))?;
    state
        .parse()
        .map_err(|e: String| StoreError::Sqlite(conversion_error(5, e)))
}

fn insert_event(
    conn: &Connection,
    key: &str,
    phase: &str,
    status: &str,
    message: &str,
    at: i64,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO pipeline_log (key, phase, status, message, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![key, phase, status, message, at],
    )?;
    Ok(())
}

fn load_company(conn: &Connection, key: &str) -> Result<Option<CompanyRecord>, StoreError> {
    let record = conn
        .query_row(
            &format!("SELECT {} FROM companies WHERE key = ?1", COMPANY_COLUMNS),
            params![key],
            company_from_row,
        )
        .optional()?;
    Ok(record)
}

fn conversion_error(column: usize, message: impl Into<String>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::<dyn std::error::Error + Send + Sync>::from(message.into()),
    )
}

fn timestamp(row: &Row, column: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let value: Option<i64> = row.get(column)?;
    match value {
        None => Ok(None),
        Some(v) => from_micros(v)
            .map(Some)
            .ok_or_else(|| conversion_error(column, format!("timestamp {} out of range", v))),
    }
}

fn required_timestamp(row: &Row, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    timestamp(row, column)?.ok_or_else(|| conversion_error(column, "missing timestamp"))
}

fn company_from_row(row: &Row) -> rusqlite::Result<CompanyRecord> {
    let key: String = row.get(0)?;
    let state: String = row.get(5)?;
    let state = state.parse::<LifecycleState>().map_err(|e| conversion_error(5, e))?;

    let document = match row.get::<_, Option<String>>(9)? {
        Some(location) => {
            let format: Option<String> = row.get(10)?;
            let format = match format {
                Some(f) => f.parse::<DocumentFormat>().map_err(|e| conversion_error(10, e))?,
                None => DocumentFormat::Unknown,
            };
            let size: Option<i64> = row.get(11)?;
            Some(DocumentHandle {
                location,
                format,
                size: size.unwrap_or(0).max(0) as u64,
                fetched_at: required_timestamp(row, 12)?,
            })
        }
        None => None,
    };

    let ownership = match row.get::<_, Option<String>>(13)? {
        Some(json) => Some(
            serde_json::from_str::<OwnershipRecord>(&json).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(13, rusqlite::types::Type::Text, Box::new(e))
            })?,
        ),
        None => None,
    };

    Ok(CompanyRecord {
        key: CompanyKey::from(key),
        name: row.get(1)?,
        location: row.get(2)?,
        court: row.get(3)?,
        register: row.get(4)?,
        state,
        fetch_attempts: row.get(6)?,
        parse_attempts: row.get(7)?,
        retry_after: timestamp(row, 8)?,
        document,
        ownership,
        confidence: row.get(14)?,
        last_error: row.get(15)?,
        doc_purged_at: timestamp(row, 16)?,
        created_at: required_timestamp(row, 17)?,
        updated_at: required_timestamp(row, 18)?,
    })
}

fn event_from_row(row: &Row) -> rusqlite::Result<PipelineEvent> {
    Ok(PipelineEvent {
        key: CompanyKey::from(row.get::<_, String>(0)?),
        phase: row.get(1)?,
        status: row.get(2)?,
        message: row.get(3)?,
        created_at: required_timestamp(row, 4)?,
    })
}
