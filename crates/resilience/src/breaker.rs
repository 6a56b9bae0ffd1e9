//! Per-key circuit breaker.
//!
//! State transitions:
//! - Closed → Open: after N consecutive qualifying failures
//! - Open → Half-Open: once the cool-down elapses
//! - Half-Open → Closed: the single trial call succeeds
//! - Half-Open → Open: the trial call fails; cool-down is extended
//!   exponentially on repeated trips

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tracing::{info, warn};

/// The circuit is open; the call was rejected without touching the network.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("circuit open for {key}, retry in {retry_in_ms}ms")]
pub struct CircuitOpenError {
    pub key: String,
    pub retry_in_ms: u64,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive qualifying failures that trip the circuit.
    pub failure_threshold: u32,
    /// Base cool-down after the first trip.
    pub cooldown: Duration,
    /// Cap for the exponentially extended cool-down.
    pub max_cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(600),
        }
    }
}

impl BreakerConfig {
    fn cooldown_for_trip(&self, trips: u32) -> Duration {
        let exp = trips.saturating_sub(1).min(16);
        let extended = self.cooldown.saturating_mul(1u32 << exp);
        extended.min(self.max_cooldown)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerPhase {
    Closed,
    Open,
    HalfOpen,
}

/// Point-in-time view for diagnostics and the admin API.
#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub key: String,
    pub phase: BreakerPhase,
    pub consecutive_failures: u32,
    pub trips: u32,
    /// Remaining cool-down while Open.
    pub retry_in: Option<Duration>,
}

#[derive(Debug)]
struct BreakerState {
    phase: BreakerPhase,
    consecutive_failures: u32,
    /// Consecutive trips without a full close; drives cool-down extension.
    trips: u32,
    open_until: Option<Instant>,
    probe_in_flight: bool,
    last_failure_at: Option<Instant>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            phase: BreakerPhase::Closed,
            consecutive_failures: 0,
            trips: 0,
            open_until: None,
            probe_in_flight: false,
            last_failure_at: None,
        }
    }
}

/// Failure tracker for one provider key (e.g. `"kie:video"`).
#[derive(Debug)]
pub struct CircuitBreaker {
    key: String,
    config: BreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(key: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            key: key.into(),
            config,
            state: Mutex::new(BreakerState::new()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Ask permission to place a call.
    ///
    /// While Open, rejects immediately. Once the cool-down elapses the
    /// breaker moves to Half-Open and admits exactly one trial call; other
    /// callers keep getting rejected until that trial reports its outcome.
    pub fn check(&self) -> Result<(), CircuitOpenError> {
        let mut state = self.state.lock().unwrap();
        match state.phase {
            BreakerPhase::Closed => Ok(()),
            BreakerPhase::Open => {
                let now = Instant::now();
                match state.open_until {
                    Some(until) if now < until => Err(CircuitOpenError {
                        key: self.key.clone(),
                        retry_in_ms: (until - now).as_millis() as u64,
                    }),
                    _ => {
                        info!(key = %self.key, "circuit half-open, admitting trial call");
                        state.phase = BreakerPhase::HalfOpen;
                        state.probe_in_flight = true;
                        Ok(())
                    }
                }
            }
            BreakerPhase::HalfOpen => {
                if state.probe_in_flight {
                    Err(CircuitOpenError {
                        key: self.key.clone(),
                        retry_in_ms: 0,
                    })
                } else {
                    state.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap();
        if state.phase == BreakerPhase::HalfOpen {
            info!(key = %self.key, "circuit closed after successful trial");
        }
        *state = BreakerState::new();
    }

    /// Record a qualifying failure.
    ///
    /// Callers are expected to filter: validation and business rejections are
    /// not evidence the provider is down and must not be recorded.
    pub fn record_failure(&self) {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        state.last_failure_at = Some(now);
        state.consecutive_failures += 1;

        match state.phase {
            BreakerPhase::Closed => {
                if state.consecutive_failures >= self.config.failure_threshold {
                    state.trips += 1;
                    let cooldown = self.config.cooldown_for_trip(state.trips);
                    warn!(
                        key = %self.key,
                        failures = state.consecutive_failures,
                        cooldown_ms = cooldown.as_millis() as u64,
                        "circuit opened"
                    );
                    state.phase = BreakerPhase::Open;
                    state.open_until = Some(now + cooldown);
                }
            }
            BreakerPhase::HalfOpen => {
                state.trips += 1;
                let cooldown = self.config.cooldown_for_trip(state.trips);
                warn!(
                    key = %self.key,
                    trips = state.trips,
                    cooldown_ms = cooldown.as_millis() as u64,
                    "trial call failed, circuit re-opened"
                );
                state.phase = BreakerPhase::Open;
                state.open_until = Some(now + cooldown);
                state.probe_in_flight = false;
            }
            BreakerPhase::Open => {}
        }
    }

    /// Run `f` under breaker protection.
    ///
    /// `counts` decides whether an error is evidence of provider failure;
    /// errors for which it returns `false` pass through without moving the
    /// breaker.
    pub async fn call<F, Fut, T, E>(
        &self,
        counts: impl Fn(&E) -> bool,
        f: F,
    ) -> Result<Result<T, E>, CircuitOpenError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.check()?;
        let outcome = f().await;
        match &outcome {
            Ok(_) => self.record_success(),
            Err(e) if counts(e) => self.record_failure(),
            // Non-qualifying error: the call reached the provider and was
            // answered, so a pending half-open probe resolves as recovery.
            Err(_) => self.record_success(),
        }
        Ok(outcome)
    }

    /// Force Closed. Administrative escape hatch for confirmed recoveries.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        *state = BreakerState::new();
        info!(key = %self.key, "circuit manually reset");
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.state.lock().unwrap();
        let retry_in = match (state.phase, state.open_until) {
            (BreakerPhase::Open, Some(until)) => until.checked_duration_since(Instant::now()),
            _ => None,
        };
        BreakerSnapshot {
            key: self.key.clone(),
            phase: state.phase,
            consecutive_failures: state.consecutive_failures,
            trips: state.trips,
            retry_in,
        }
    }
}

/// Keyed breaker instances, one per provider key, created on first use.
///
/// A failing video provider never blocks image-provider calls: each key has
/// its own independent state.
#[derive(Debug)]
pub struct BreakerRegistry {
    default_config: BreakerConfig,
    overrides: HashMap<String, BreakerConfig>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(default_config: BreakerConfig) -> Self {
        Self {
            default_config,
            overrides: HashMap::new(),
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Per-key threshold/cool-down override, applied at first use of the key.
    pub fn with_override(mut self, key: impl Into<String>, config: BreakerConfig) -> Self {
        self.overrides.insert(key.into(), config);
        self
    }

    pub fn breaker(&self, key: &str) -> Arc<CircuitBreaker> {
        if let Some(b) = self.breakers.read().unwrap().get(key) {
            return b.clone();
        }
        let mut breakers = self.breakers.write().unwrap();
        breakers
            .entry(key.to_string())
            .or_insert_with(|| {
                let config = self
                    .overrides
                    .get(key)
                    .cloned()
                    .unwrap_or_else(|| self.default_config.clone());
                Arc::new(CircuitBreaker::new(key, config))
            })
            .clone()
    }

    /// Force one key Closed. Returns false if the key was never used.
    pub fn reset(&self, key: &str) -> bool {
        match self.breakers.read().unwrap().get(key) {
            Some(b) => {
                b.reset();
                true
            }
            None => false,
        }
    }

    pub fn reset_all(&self) {
        for b in self.breakers.read().unwrap().values() {
            b.reset();
        }
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut snaps: Vec<_> = self
            .breakers
            .read()
            .unwrap()
            .values()
            .map(|b| b.snapshot())
            .collect();
        snaps.sort_by(|a, b| a.key.cmp(&b.key));
        snaps
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
