//! Orchestration of the fetch and parse phases
//!
//! The fetch phase is a single governed flow: one lease, one retrieval, one
//! commit at a time. The parse phase leases batches and runs extraction on a
//! bounded pool of blocking workers, then applies the qualification rule.
//! Both phases start by reclaiming stale leases, so a run interrupted at any
//! point resumes where it stopped.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::company::{CompanyRecord, LifecycleState, Phase};
use crate::config::AppConfig;
use crate::documents::{DocumentError, DocumentStore};
use crate::extractor::{Extraction, Extractor, ParseFailure};
use crate::fetcher::{DocumentSource, FetchFailure, Fetcher};
use crate::interrupt::InterruptFlag;
use crate::qualification::QualificationRule;
use crate::rate_limit::RateStateStore;
use crate::store::{Lease, Outcome, StoreError, WorkStore};

/// Longest single sleep while waiting for a retry to become due
const WAIT_SLICE: Duration = Duration::from_secs(1);

/// Slack added to retry waits so the item is due when we wake
const RETRY_WAKE_MARGIN: Duration = Duration::from_millis(50);

/// Next fetch item, leased only once the governor granted a lookup
enum FetchSlot {
    Ready(Lease),
    Empty,
    Interrupted,
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Documents(#[from] DocumentError),

    #[error("parse worker failed: {0}")]
    Worker(String),
}

/// Tunables taken from the configuration
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub stale_lease_timeout: Duration,
    pub parse_workers: usize,
    pub parse_batch_size: usize,
}

impl PipelineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            stale_lease_timeout: config.store.stale_lease_timeout(),
            parse_workers: config.extraction.worker_count().max(1),
            parse_batch_size: config.extraction.parse_batch_size.max(1),
        }
    }
}

/// What one phase run did
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseReport {
    pub phase: Phase,
    /// Items whose leased work was committed
    pub processed: usize,
    /// Stale leases returned to their queue at start
    pub reclaimed: usize,
    pub interrupted: bool,
    outcomes: BTreeMap<&'static str, usize>,
}

impl PhaseReport {
    fn new(phase: Phase) -> Self {
        Self {
            phase,
            processed: 0,
            reclaimed: 0,
            interrupted: false,
            outcomes: BTreeMap::new(),
        }
    }

    fn record(&mut self, state: LifecycleState) {
        *self.outcomes.entry(state.as_str()).or_insert(0) += 1;
    }

    /// Items that ended this run in `state`
    pub fn count(&self, state: LifecycleState) -> usize {
        self.outcomes.get(state.as_str()).copied().unwrap_or(0)
    }
}

impl fmt::Display for PhaseReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} processed", self.phase, self.processed)?;
        if !self.outcomes.is_empty() {
            let parts: Vec<String> = self
                .outcomes
                .iter()
                .map(|(state, count)| format!("{} {}", state, count))
                .collect();
            write!(f, " ({})", parts.join(", "))?;
        }
        if self.reclaimed > 0 {
            write!(f, ", {} stale lease(s) reclaimed", self.reclaimed)?;
        }
        if self.interrupted {
            write!(f, ", interrupted")?;
        }
        Ok(())
    }
}

/// Fetch then parse, stopping early on interrupt
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub fetch: PhaseReport,
    pub parse: Option<PhaseReport>,
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.fetch)?;
        if let Some(parse) = &self.parse {
            write!(f, "\n{}", parse)?;
        }
        Ok(())
    }
}

pub struct Pipeline<S, R> {
    store: WorkStore,
    fetcher: Fetcher<S, R>,
    documents: Arc<dyn DocumentStore>,
    extractor: Extractor,
    rule: QualificationRule,
    settings: PipelineSettings,
    interrupt: InterruptFlag,
}

impl<S: DocumentSource, R: RateStateStore> Pipeline<S, R> {
    pub fn new(
        store: WorkStore,
        fetcher: Fetcher<S, R>,
        rule: QualificationRule,
        settings: PipelineSettings,
        interrupt: InterruptFlag,
    ) -> Self {
        let documents = fetcher.documents().clone();
        Self {
            store,
            fetcher,
            documents,
            extractor: Extractor::new(),
            rule,
            settings,
            interrupt,
        }
    }

    pub fn store(&self) -> &WorkStore {
        &self.store
    }

    pub async fn run(&self, limit: Option<usize>) -> Result<RunReport, PipelineError> {
        let fetch = self.run_fetch(limit).await?;
        if fetch.interrupted {
            return Ok(RunReport { fetch, parse: None });
        }
        let parse = self.run_parse(limit).await?;
        Ok(RunReport {
            fetch,
            parse: Some(parse),
        })
    }

    /// Retrieve documents for pending companies, one governed request at a time
    pub async fn run_fetch(&self, limit: Option<usize>) -> Result<PhaseReport, PipelineError> {
        let mut report = PhaseReport::new(Phase::Fetch);
        report.reclaimed = self.store.release_stale(Phase::Fetch, self.settings.stale_lease_timeout)?;
        self.fetcher.governor().log_config();

        loop {
            if self.interrupt.is_interrupted() {
                report.interrupted = true;
                break;
            }
            if limit.is_some_and(|limit| report.processed >= limit) {
                break;
            }

            self.store.requeue_failed(Phase::Fetch, Utc::now())?;
            let lease = match self.lease_with_grant().await? {
                FetchSlot::Ready(lease) => lease,
                FetchSlot::Interrupted => {
                    report.interrupted = true;
                    break;
                }
                FetchSlot::Empty => match self.store.next_retry_at(Phase::Fetch)? {
                    Some(due) => {
                        if !self.wait_until(due).await {
                            report.interrupted = true;
                            break;
                        }
                        continue;
                    }
                    None => break,
                },
            };

            let outcome = match self.fetcher.fetch_granted(&lease.company).await {
                Ok(handle) => {
                    info!("{}: fetched {} bytes ({})", lease.key, handle.size, handle.format);
                    Outcome::Fetched(handle)
                }
                Err(FetchFailure::Cancelled) => {
                    self.store.release(&lease)?;
                    report.interrupted = true;
                    break;
                }
                Err(FetchFailure::Storage(e)) => {
                    error!("{}: could not store document: {}", lease.key, e);
                    self.store.release(&lease)?;
                    return Err(e.into());
                }
                Err(failure) => {
                    warn!("{}: {}", lease.key, failure);
                    match failure.into_outcome() {
                        Some(outcome) => outcome,
                        None => {
                            self.store.release(&lease)?;
                            continue;
                        }
                    }
                }
            };

            if let Some(state) = self.commit(&lease, outcome)? {
                report.record(state);
            }
            report.processed += 1;
        }

        info!("{}", report);
        Ok(report)
    }

    /// Extract and classify fetched documents on the worker pool
    pub async fn run_parse(&self, limit: Option<usize>) -> Result<PhaseReport, PipelineError> {
        let mut report = PhaseReport::new(Phase::Parse);
        report.reclaimed = self.store.release_stale(Phase::Parse, self.settings.stale_lease_timeout)?;
        self.classify_leftovers(&mut report)?;

        loop {
            if self.interrupt.is_interrupted() {
                report.interrupted = true;
                break;
            }
            let batch_size = match limit {
                Some(limit) if report.processed >= limit => break,
                Some(limit) => self.settings.parse_batch_size.min(limit - report.processed),
                None => self.settings.parse_batch_size,
            };

            self.store.requeue_failed(Phase::Parse, Utc::now())?;
            let leases = self.store.lease_next(Phase::Parse, batch_size)?;
            if leases.is_empty() {
                match self.store.next_retry_at(Phase::Parse)? {
                    Some(due) => {
                        if !self.wait_until(due).await {
                            report.interrupted = true;
                            break;
                        }
                        continue;
                    }
                    None => break,
                }
            }

            debug!("Parsing batch of {} on {} worker(s)", leases.len(), self.settings.parse_workers);
            let results: Vec<Result<(Lease, Result<Extraction, ParseFailure>), String>> = stream::iter(leases)
                .map(|lease| {
                    let documents = Arc::clone(&self.documents);
                    let extractor = self.extractor;
                    async move {
                        tokio::task::spawn_blocking(move || {
                            let result = extract_company(documents.as_ref(), &lease.company, &extractor);
                            (lease, result)
                        })
                        .await
                        .map_err(|e| e.to_string())
                    }
                })
                .buffer_unordered(self.settings.parse_workers)
                .collect()
                .await;

            for result in results {
                let (lease, extraction) = result.map_err(PipelineError::Worker)?;
                if let Some(state) = self.settle_parse(&lease, extraction)? {
                    report.record(state);
                }
                report.processed += 1;
            }
        }

        info!("{}", report);
        Ok(report)
    }

    /// Commit one extraction and, on success, the qualification verdict
    fn settle_parse(
        &self,
        lease: &Lease,
        extraction: Result<Extraction, ParseFailure>,
    ) -> Result<Option<LifecycleState>, StoreError> {
        let extraction = match extraction {
            Ok(extraction) => extraction,
            Err(failure) => {
                warn!("{}: {}", lease.key, failure);
                return self.commit(lease, Outcome::ParseFailed(failure.to_string()));
            }
        };

        let verdict = self.rule.verdict(&extraction.record, extraction.confidence);
        let committed = self.commit(
            lease,
            Outcome::Parsed {
                record: extraction.record,
                confidence: extraction.confidence,
            },
        )?;
        if committed.is_none() {
            return Ok(None);
        }

        self.store.classify(&lease.key, verdict.state, &verdict.reason)?;
        info!("{}: {} ({})", lease.key, verdict.state, verdict.reason);
        Ok(Some(verdict.state))
    }

    /// Lease the next fetch item together with a governor grant.
    ///
    /// No lease is held while the governor waits.
    async fn lease_with_grant(&self) -> Result<FetchSlot, StoreError> {
        let Some(lease) = self.store.lease_next(Phase::Fetch, 1)?.pop() else {
            return Ok(FetchSlot::Empty);
        };
        let governor = self.fetcher.governor();
        match governor.try_acquire() {
            Ok(None) => return Ok(FetchSlot::Ready(lease)),
            Ok(Some(wait)) => debug!("{}: lease returned while the governor waits {}s", lease.key, wait.as_secs()),
            Err(e) => warn!("{}: rate state unavailable, waiting without a lease: {}", lease.key, e),
        }
        self.store.release(&lease)?;

        if governor.acquire().await.is_none() {
            return Ok(FetchSlot::Interrupted);
        }
        match self.store.lease_next(Phase::Fetch, 1)?.pop() {
            Some(lease) => Ok(FetchSlot::Ready(lease)),
            None => {
                debug!("Fetch queue emptied while waiting for the governor");
                Ok(FetchSlot::Empty)
            }
        }
    }

    /// Items committed as parsed but never classified (crash between the two writes)
    fn classify_leftovers(&self, report: &mut PhaseReport) -> Result<(), StoreError> {
        for company in self.store.list_by_state(LifecycleState::Parsed)? {
            let (Some(record), Some(confidence)) = (&company.ownership, company.confidence) else {
                warn!("{}: parsed without a stored record, leaving for review", company.key);
                continue;
            };

            let verdict = self.rule.verdict(record, confidence);
            match self.store.classify(&company.key, verdict.state, &verdict.reason) {
                Ok(()) => {
                    info!("{}: {} on resume ({})", company.key, verdict.state, verdict.reason);
                    report.record(verdict.state);
                }
                Err(StoreError::InvalidTransition { .. }) => {
                    debug!("{}: classified concurrently", company.key);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Commit, treating a lost lease as someone else's work
    fn commit(&self, lease: &Lease, outcome: Outcome) -> Result<Option<LifecycleState>, StoreError> {
        match self.store.commit(lease, outcome) {
            Ok(state) => Ok(Some(state)),
            Err(StoreError::LeaseLost { key }) => {
                warn!("{}: lease lost before commit, result discarded", key);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Sleep until `due`; false if interrupted first
    async fn wait_until(&self, due: DateTime<Utc>) -> bool {
        let delay = (due - Utc::now()).to_std().unwrap_or(Duration::ZERO) + RETRY_WAKE_MARGIN;
        info!("Waiting {}s for the next retry to become due", delay.as_secs());

        let deadline = Instant::now() + delay;
        loop {
            if self.interrupt.is_interrupted() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            sleep((deadline - now).min(WAIT_SLICE)).await;
        }
    }
}

fn extract_company(
    documents: &dyn DocumentStore,
    company: &CompanyRecord,
    extractor: &Extractor,
) -> Result<Extraction, ParseFailure> {
    let handle = company
        .document
        .as_ref()
        .ok_or_else(|| ParseFailure::Unreadable("no stored document".to_string()))?;
    let bytes = documents
        .get(handle)
        .map_err(|e| ParseFailure::Unreadable(e.to_string()))?;
    extractor.extract(&bytes, handle.format)
}
