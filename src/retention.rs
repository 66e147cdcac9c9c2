//! Deletion of stored documents past their retention period
//!
//! Shareholder lists name private persons, so documents of finished companies
//! are removed once they are older than `retention.max_age_days`. The extracted
//! record stays in the work store; only the file and its reference go.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use std::fmt;
use tracing::{debug, info, warn};

use crate::company::CompanyKey;
use crate::documents::DocumentStore;
use crate::store::WorkStore;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PurgeReport {
    pub cutoff: Option<DateTime<Utc>>,
    pub dry_run: bool,
    /// Documents old enough to be purged
    pub candidates: usize,
    pub purged: usize,
    pub bytes_freed: u64,
    pub failed: Vec<(CompanyKey, String)>,
}

impl fmt::Display for PurgeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cutoff = self
            .cutoff
            .map(|c| c.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        if self.dry_run {
            write!(f, "{} document(s) fetched before {} would be purged", self.candidates, cutoff)
        } else {
            write!(
                f,
                "purged {} of {} document(s) fetched before {} ({} bytes freed)",
                self.purged, self.candidates, cutoff, self.bytes_freed
            )?;
            if !self.failed.is_empty() {
                write!(f, ", {} failed", self.failed.len())?;
            }
            Ok(())
        }
    }
}

/// Purge documents older than `max_age_days`
pub fn purge(store: &WorkStore, documents: &dyn DocumentStore, max_age_days: u32, dry_run: bool) -> Result<PurgeReport> {
    let cutoff = Utc::now() - Duration::days(i64::from(max_age_days));
    purge_before(store, documents, cutoff, dry_run)
}

pub fn purge_before(
    store: &WorkStore,
    documents: &dyn DocumentStore,
    cutoff: DateTime<Utc>,
    dry_run: bool,
) -> Result<PurgeReport> {
    let expired = store
        .documents_fetched_before(cutoff)
        .context("Failed to list expired documents")?;

    let mut report = PurgeReport {
        cutoff: Some(cutoff),
        dry_run,
        candidates: expired.len(),
        ..PurgeReport::default()
    };

    for company in expired {
        let Some(handle) = company.document else {
            continue;
        };

        if dry_run {
            debug!("Would purge {} ({})", handle.location, company.key);
            continue;
        }

        if let Err(e) = documents.remove(&handle) {
            warn!("Failed to delete document {} of {}: {}", handle.location, company.key, e);
            report.failed.push((company.key, e.to_string()));
            continue;
        }
        store
            .mark_document_purged(&company.key, &handle)
            .context(format!("Failed to record purge of {}", company.key))?;

        report.purged += 1;
        report.bytes_freed += handle.size;
    }

    info!("Retention: {}", report);
    Ok(report)
}
