//! Shared helpers for the integration tests

#![allow(dead_code)]

pub mod fixtures;
pub mod wiremock_helpers;

use gfscreen::company::{NewCompany, RegisterNumber};
use gfscreen::config::{RateLimitConfig, RetryConfig};
use gfscreen::documents::{DocumentStore, FsDocumentStore};
use gfscreen::fetcher::{DocumentSource, Fetcher};
use gfscreen::interrupt::InterruptFlag;
use gfscreen::pipeline::{Pipeline, PipelineSettings};
use gfscreen::qualification::QualificationRule;
use gfscreen::rate_limit::RateGovernor;
use gfscreen::store::WorkStore;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// No spacing, no jitter, no throttle pause: lookups are granted immediately
pub fn unthrottled() -> RateLimitConfig {
    RateLimitConfig {
        max_per_window: 10_000,
        window_secs: 3600,
        min_spacing_secs: 0,
        jitter_max_ms: 0,
        rate_blocked_pause_secs: 0,
    }
}

/// Two fetch retries and one parse retry, each due immediately
pub fn immediate_retry() -> RetryConfig {
    RetryConfig {
        max_fetch_retries: 2,
        max_parse_retries: 1,
        backoff_base_delay_ms: 0,
        backoff_max_delay_ms: 0,
        ..RetryConfig::default()
    }
}

pub fn settings() -> PipelineSettings {
    PipelineSettings {
        stale_lease_timeout: Duration::from_secs(900),
        parse_workers: 2,
        parse_batch_size: 2,
    }
}

pub fn company(name: &str, court: &str, register: &str) -> NewCompany {
    NewCompany::new(name, "", Some(court), RegisterNumber::parse(register).unwrap())
}

/// Work store and document directory inside one temp dir
pub struct TestEnv {
    pub dir: TempDir,
    pub store: WorkStore,
    pub documents: Arc<FsDocumentStore>,
    retry: RetryConfig,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_retry(immediate_retry())
    }

    pub fn with_retry(retry: RetryConfig) -> Self {
        let dir = TempDir::new().expect("create temp dir");
        let store = WorkStore::open(&dir.path().join("data").join("work.db"), retry.clone()).unwrap();
        let documents = Arc::new(FsDocumentStore::open(dir.path().join("documents")).unwrap());
        Self {
            dir,
            store,
            documents,
            retry,
        }
    }

    pub fn reopen_store(&self) -> WorkStore {
        WorkStore::open(&self.dir.path().join("data").join("work.db"), self.retry.clone()).unwrap()
    }

    pub fn pipeline<S: DocumentSource>(
        &self,
        source: S,
        settings: PipelineSettings,
        interrupt: InterruptFlag,
    ) -> Pipeline<S, WorkStore> {
        self.pipeline_with_limits(source, &unthrottled(), settings, interrupt)
    }

    /// Pipeline whose governor persists its state in the work store under `limits`
    pub fn pipeline_with_limits<S: DocumentSource>(
        &self,
        source: S,
        limits: &RateLimitConfig,
        settings: PipelineSettings,
        interrupt: InterruptFlag,
    ) -> Pipeline<S, WorkStore> {
        let governor = RateGovernor::new(self.store.clone(), limits).with_interrupt(interrupt.clone());
        let documents: Arc<dyn DocumentStore> = self.documents.clone();
        let fetcher = Fetcher::new(source, governor, documents);
        Pipeline::new(
            self.store.clone(),
            fetcher,
            QualificationRule::default(),
            settings,
            interrupt,
        )
    }
}
