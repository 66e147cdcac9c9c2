//! Rate governor for register lookups
//!
//! Enforces a ceiling of grants over any rolling window plus a minimum
//! spacing between consecutive grants. The grant log lives in persisted
//! state behind [`RateStateStore`], so the quota holds across process
//! restarts and across several processes sharing one work store.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::config::RateLimitConfig;
use crate::interrupt::InterruptFlag;
use crate::store::StoreError;

/// Longest single sleep between interrupt checks
const WAIT_SLICE: Duration = Duration::from_secs(1);

/// Pause before retrying after the rate state could not be read or written
const PERSISTENCE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Convert a std duration for timestamp arithmetic, saturating at a century
pub fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// Source of wall-clock time for the governor
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Persisted governor state: grants inside the trailing window and an optional block
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateState {
    /// Grant instants, oldest first
    pub grants: VecDeque<DateTime<Utc>>,
    /// No grant before this instant (set after the upstream signalled throttling)
    #[serde(default)]
    pub blocked_until: Option<DateTime<Utc>>,
}

impl RateState {
    /// Drop grants that left the window ending at `now`
    pub fn prune(&mut self, now: DateTime<Utc>, window: Duration) {
        let horizon = now - chrono_duration(window);
        while self.grants.front().is_some_and(|&g| g <= horizon) {
            self.grants.pop_front();
        }
        if self.blocked_until.is_some_and(|b| b <= now) {
            self.blocked_until = None;
        }
    }

    /// Earliest instant at which one more grant keeps both limits
    pub fn next_allowed(&self, now: DateTime<Utc>, config: &RateLimitConfig) -> DateTime<Utc> {
        let mut earliest = now;

        if let Some(&last) = self.grants.back() {
            earliest = earliest.max(last + chrono_duration(config.min_spacing()));
        }

        let ceiling = config.max_per_window.max(1) as usize;
        if self.grants.len() >= ceiling {
            // This grant has to leave the window before one more fits
            let must_expire = self.grants[self.grants.len() - ceiling];
            earliest = earliest.max(must_expire + chrono_duration(config.window()));
        }

        if let Some(blocked) = self.blocked_until {
            earliest = earliest.max(blocked);
        }

        earliest
    }

    pub fn last_grant(&self) -> Option<DateTime<Utc>> {
        self.grants.back().copied()
    }
}

/// Durable home of the [`RateState`]
pub trait RateStateStore: Send + Sync {
    /// Run `f` on the state inside one exclusive transaction and persist the result
    fn with_rate_state<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut RateState) -> T;
}

/// Process-local state, for tests and dry runs
#[derive(Debug, Clone, Default)]
pub struct MemoryRateState {
    inner: Arc<Mutex<RateState>>,
}

impl RateStateStore for MemoryRateState {
    fn with_rate_state<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut RateState) -> T,
    {
        let mut state = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(f(&mut state))
    }
}

enum Decision {
    Granted(DateTime<Utc>),
    Wait(Duration),
}

/// Gate in front of every external retrieval
pub struct RateGovernor<S> {
    store: S,
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    interrupt: InterruptFlag,
}

impl<S: RateStateStore> RateGovernor<S> {
    pub fn new(store: S, config: &RateLimitConfig) -> Self {
        Self {
            store,
            config: config.clone(),
            clock: Arc::new(SystemClock),
            interrupt: InterruptFlag::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_interrupt(mut self, interrupt: InterruptFlag) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn decide(&self) -> Result<Decision, StoreError> {
        let now = self.clock.now();
        let config = &self.config;

        self.store.with_rate_state(|state| {
            state.prune(now, config.window());
            let next = state.next_allowed(now, config);
            if next <= now {
                state.grants.push_back(now);
                Decision::Granted(now)
            } else {
                Decision::Wait((next - now).to_std().unwrap_or(Duration::ZERO))
            }
        })
    }

    /// Try to take a grant without waiting, returning time to wait if not available
    pub fn try_acquire(&self) -> Result<Option<Duration>, StoreError> {
        match self.decide()? {
            Decision::Granted(_) => Ok(None),
            Decision::Wait(wait) => Ok(Some(wait)),
        }
    }

    /// Wait until a grant is available and record it.
    ///
    /// Returns the grant instant, or `None` if the run was interrupted while waiting.
    pub async fn acquire(&self) -> Option<DateTime<Utc>> {
        loop {
            if self.interrupt.is_interrupted() {
                return None;
            }

            match self.decide() {
                Ok(Decision::Granted(at)) => {
                    debug!("Rate governor granted lookup at {}", at);
                    return Some(at);
                }
                Ok(Decision::Wait(wait)) => {
                    let wait = wait + self.jitter();
                    debug!("Rate governor waiting {:?} for next slot", wait);
                    if !self.sleep_interruptibly(wait).await {
                        return None;
                    }
                    // Re-check after sleep: another process may have taken the slot
                }
                Err(e) => {
                    error!("Rate state unavailable, retrying: {}", e);
                    if !self.sleep_interruptibly(PERSISTENCE_RETRY_DELAY).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Close the gate for `pause`, e.g. after the register signalled throttling
    pub fn pause_for(&self, pause: Duration) -> Result<DateTime<Utc>, StoreError> {
        let until = self.clock.now() + chrono_duration(pause);
        self.pause_until(until)?;
        Ok(until)
    }

    /// Persist a block; an existing later block is kept
    pub fn pause_until(&self, until: DateTime<Utc>) -> Result<(), StoreError> {
        self.store.with_rate_state(|state| {
            let effective = state.blocked_until.map_or(until, |b| b.max(until));
            state.blocked_until = Some(effective);
        })?;
        warn!("Rate governor paused until {}", until);
        Ok(())
    }

    /// Current persisted state, pruned to the window
    pub fn snapshot(&self) -> Result<RateState, StoreError> {
        let now = self.clock.now();
        let window = self.config.window();
        self.store.with_rate_state(|state| {
            state.prune(now, window);
            state.clone()
        })
    }

    /// Log rate limit configuration
    pub fn log_config(&self) {
        info!(
            "Rate governor: max {} per {}s, spacing {}s, jitter up to {}ms",
            self.config.max_per_window,
            self.config.window_secs,
            self.config.min_spacing_secs,
            self.config.jitter_max_ms
        );
    }

    fn jitter(&self) -> Duration {
        if self.config.jitter_max_ms == 0 {
            return Duration::ZERO;
        }
        let ms = rand::thread_rng().gen_range(0..=self.config.jitter_max_ms);
        Duration::from_millis(ms)
    }

    /// Sleep in short slices so an interrupt is noticed; false if interrupted
    async fn sleep_interruptibly(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
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

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn config() -> RateLimitConfig {
        RateLimitConfig {
            max_per_window: 3,
            window_secs: 600,
            min_spacing_secs: 60,
            jitter_max_ms: 0,
            rate_blocked_pause_secs: 3600,
        }
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    #[test]
    fn test_empty_state_allows_now() {
        let state = RateState::default();
        assert_eq!(state.next_allowed(t(0), &config()), t(0));
    }

    #[test]
    fn test_spacing_from_last_grant() {
        let state = RateState {
            grants: VecDeque::from(vec![t(0)]),
            blocked_until: None,
        };
        assert_eq!(state.next_allowed(t(10), &config()), t(60));
        assert_eq!(state.next_allowed(t(90), &config()), t(90));
    }

    #[test]
    fn test_ceiling_waits_for_oldest_to_expire() {
        let state = RateState {
            grants: VecDeque::from(vec![t(0), t(60), t(120)]),
            blocked_until: None,
        };
        // Spacing alone would allow t(180); the window is full until t(600)
        assert_eq!(state.next_allowed(t(180), &config()), t(600));
    }

    #[test]
    fn test_lowered_ceiling_uses_right_grant() {
        let state = RateState {
            grants: VecDeque::from(vec![t(0), t(60), t(120), t(180)]),
            blocked_until: None,
        };
        // Four grants against a ceiling of three: t(60) must leave the window
        assert_eq!(state.next_allowed(t(240), &config()), t(660));
    }

    #[test]
    fn test_block_dominates() {
        let state = RateState {
            grants: VecDeque::new(),
            blocked_until: Some(t(3600)),
        };
        assert_eq!(state.next_allowed(t(0), &config()), t(3600));
    }

    #[test]
    fn test_prune_drops_expired_grants_and_blocks() {
        let mut state = RateState {
            grants: VecDeque::from(vec![t(0), t(300), t(599)]),
            blocked_until: Some(t(100)),
        };
        state.prune(t(600), Duration::from_secs(600));
        assert_eq!(state.grants, VecDeque::from(vec![t(300), t(599)]));
        assert_eq!(state.blocked_until, None);
    }

    #[test]
    fn test_try_acquire_records_grant() {
        let store = MemoryRateState::default();
        let governor = RateGovernor::new(store.clone(), &config()).with_clock(Arc::new(FixedClock(t(0))));

        assert_eq!(governor.try_acquire().unwrap(), None);
        assert_eq!(governor.try_acquire().unwrap(), Some(Duration::from_secs(60)));

        let snapshot = governor.snapshot().unwrap();
        assert_eq!(snapshot.grants.len(), 1, "a refused attempt must not be recorded");
    }

    #[test]
    fn test_pause_keeps_later_block() {
        let governor =
            RateGovernor::new(MemoryRateState::default(), &config()).with_clock(Arc::new(FixedClock(t(0))));

        governor.pause_until(t(7200)).unwrap();
        governor.pause_until(t(3600)).unwrap();
        assert_eq!(governor.snapshot().unwrap().blocked_until, Some(t(7200)));
        assert_eq!(governor.try_acquire().unwrap(), Some(Duration::from_secs(7200)));
    }

    #[test]
    fn test_rate_state_json_roundtrip() {
        let state = RateState {
            grants: VecDeque::from(vec![t(0), t(65)]),
            blocked_until: Some(t(4000)),
        };
        let json = serde_json::to_string(&state).unwrap();
        let back: RateState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_returns_none_when_interrupted() {
        let interrupt = InterruptFlag::new();
        let governor = RateGovernor::new(MemoryRateState::default(), &config())
            .with_clock(Arc::new(FixedClock(t(0))))
            .with_interrupt(interrupt.clone());

        assert!(governor.acquire().await.is_some());

        interrupt.interrupt();
        assert!(governor.acquire().await.is_none());
    }
}
