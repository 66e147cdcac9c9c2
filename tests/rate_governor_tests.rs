//! Governor timing against the persisted rate state, on tokio's paused clock.

mod common;

use chrono::{DateTime, TimeZone, Utc};
use gfscreen::config::RateLimitConfig;
use gfscreen::interrupt::InterruptFlag;
use gfscreen::rate_limit::{Clock, RateGovernor};
use gfscreen::store::WorkStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Wall clock that advances with tokio's (paused) timer
struct TokioClock {
    base: DateTime<Utc>,
    start: Instant,
}

impl TokioClock {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            base: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            start: Instant::now(),
        })
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        self.base + chrono::Duration::from_std(self.start.elapsed()).unwrap()
    }
}

fn register_policy() -> RateLimitConfig {
    RateLimitConfig {
        max_per_window: 55,
        window_secs: 3600,
        min_spacing_secs: 65,
        jitter_max_ms: 0,
        rate_blocked_pause_secs: 3600,
    }
}

fn open_store(dir: &tempfile::TempDir) -> WorkStore {
    WorkStore::open(&dir.path().join("work.db"), common::immediate_retry()).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_consecutive_grants_are_spaced() {
    let dir = tempfile::tempdir().unwrap();
    let clock = TokioClock::new();
    let governor = RateGovernor::new(open_store(&dir), &register_policy()).with_clock(clock.clone());

    let first = governor.acquire().await.unwrap();
    let second = governor.acquire().await.unwrap();
    let third = governor.acquire().await.unwrap();

    assert!(second - first >= chrono::Duration::seconds(65));
    assert!(third - second >= chrono::Duration::seconds(65));
    assert!(third - first < chrono::Duration::seconds(135));
}

#[tokio::test(start_paused = true)]
async fn test_ceiling_holds_within_any_window() {
    let dir = tempfile::tempdir().unwrap();
    let clock = TokioClock::new();
    let config = RateLimitConfig {
        max_per_window: 3,
        window_secs: 600,
        min_spacing_secs: 10,
        ..register_policy()
    };
    let governor = RateGovernor::new(open_store(&dir), &config).with_clock(clock.clone());

    let mut grants = Vec::new();
    for _ in 0..7 {
        grants.push(governor.acquire().await.unwrap());
    }

    for (i, grant) in grants.iter().enumerate() {
        let in_window = grants
            .iter()
            .skip(i)
            .filter(|g| **g - *grant < chrono::Duration::seconds(600))
            .count();
        assert!(in_window <= 3, "{} grants inside one window", in_window);
    }
    // The fourth grant waits for the first to leave the window
    assert!(grants[3] - grants[0] >= chrono::Duration::seconds(600));
}

#[tokio::test(start_paused = true)]
async fn test_spacing_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let clock = TokioClock::new();

    let first = {
        let governor = RateGovernor::new(open_store(&dir), &register_policy()).with_clock(clock.clone());
        governor.acquire().await.unwrap()
    };

    // New process, same database
    let governor = RateGovernor::new(open_store(&dir), &register_policy()).with_clock(clock.clone());
    assert!(governor.try_acquire().unwrap().is_some(), "restart must not reset the spacing");

    let second = governor.acquire().await.unwrap();
    assert!(second - first >= chrono::Duration::seconds(65));
    assert_eq!(governor.snapshot().unwrap().grants.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_two_governors_sharing_a_store_never_double_grant() {
    let dir = tempfile::tempdir().unwrap();
    let clock = TokioClock::new();
    let a = RateGovernor::new(open_store(&dir), &register_policy()).with_clock(clock.clone());
    let b = RateGovernor::new(open_store(&dir), &register_policy()).with_clock(clock.clone());

    let (ga, gb) = tokio::join!(a.acquire(), b.acquire());
    let (ga, gb) = (ga.unwrap(), gb.unwrap());

    let gap = if ga > gb { ga - gb } else { gb - ga };
    assert!(gap >= chrono::Duration::seconds(65));
}

#[tokio::test(start_paused = true)]
async fn test_persisted_block_delays_next_grant() {
    let dir = tempfile::tempdir().unwrap();
    let clock = TokioClock::new();
    let start = clock.now();

    {
        let governor = RateGovernor::new(open_store(&dir), &register_policy()).with_clock(clock.clone());
        governor.pause_for(Duration::from_secs(1800)).unwrap();
    }

    let governor = RateGovernor::new(open_store(&dir), &register_policy()).with_clock(clock.clone());
    let granted = governor.acquire().await.unwrap();
    assert!(granted - start >= chrono::Duration::seconds(1800));
}

#[tokio::test(start_paused = true)]
async fn test_interrupt_ends_a_long_wait() {
    let dir = tempfile::tempdir().unwrap();
    let clock = TokioClock::new();
    let interrupt = InterruptFlag::new();
    let governor = RateGovernor::new(open_store(&dir), &register_policy())
        .with_clock(clock.clone())
        .with_interrupt(interrupt.clone());

    governor.acquire().await.unwrap();

    let flag = interrupt.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        flag.interrupt();
    });

    let waited_from = Instant::now();
    assert!(governor.acquire().await.is_none());
    assert!(waited_from.elapsed() < Duration::from_secs(65));
    assert_eq!(governor.snapshot().unwrap().grants.len(), 1);
}
