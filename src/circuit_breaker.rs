//! Per-supplier circuit breakers.
//!
//! ```text
//! Closed   -> Open      failure_threshold failures inside the sliding window
//! Open     -> HalfOpen  now >= next_attempt (checked lazily on acquire)
//! HalfOpen -> Closed    the single probe succeeds
//! HalfOpen -> Open      the probe fails; back-off grows, capped
//! ```
//!
//! Every transition bumps an epoch. Permits remember the epoch they were
//! issued in and outcomes from an older epoch are ignored, so late results
//! cannot double-transition a breaker or count twice.

use std::{collections::VecDeque, sync::Arc, time::Duration as StdDuration};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::{
    clock::Clock,
    config::CircuitBreakerConfig,
    error::OrchestratorError,
    model::{CircuitSnapshot, CircuitState, ProviderId},
};

#[derive(Debug)]
enum State {
    Closed { failures: VecDeque<DateTime<Utc>> },
    Open { next_attempt: DateTime<Utc> },
    /// `probe_deadline` is set while a probe is in flight.
    HalfOpen { probe_deadline: Option<DateTime<Utc>> },
}

#[derive(Debug)]
struct CircuitBreaker {
    state: State,
    epoch: u64,
    failure_count: u32,
    last_failure: Option<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
    reopen_count: u32,
}

impl CircuitBreaker {
    fn new() -> Self {
        Self {
            state: State::Closed {
                failures: VecDeque::new(),
            },
            epoch: 0,
            failure_count: 0,
            last_failure: None,
            opened_at: None,
            reopen_count: 0,
        }
    }

    fn circuit_state(&self) -> CircuitState {
        match self.state {
            State::Closed { .. } => CircuitState::Closed,
            State::Open { .. } => CircuitState::Open,
            State::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    fn close(&mut self) {
        self.state = State::Closed {
            failures: VecDeque::new(),
        };
        self.epoch += 1;
        self.failure_count = 0;
        self.opened_at = None;
        self.reopen_count = 0;
    }

    fn open(&mut self, now: DateTime<Utc>, backoff: StdDuration) {
        let next_attempt = now + Duration::from_std(backoff).unwrap_or_else(|_| Duration::zero());
        self.state = State::Open { next_attempt };
        self.epoch += 1;
        self.opened_at = Some(now);
    }

    fn half_open(&mut self) {
        self.state = State::HalfOpen { probe_deadline: None };
        self.epoch += 1;
    }
}

/// Permission to call a supplier, issued by [`CircuitBreakerRegistry::try_acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "a call permit must be settled with an outcome or abandoned"]
pub struct CallPermit {
    pub provider_id: ProviderId,
    /// The holder owns the half-open probe slot.
    pub probe: bool,
    epoch: u64,
}

pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    breakers: DashMap<ProviderId, Arc<Mutex<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            breakers: DashMap::new(),
        }
    }

    fn breaker(&self, provider_id: &ProviderId) -> Arc<Mutex<CircuitBreaker>> {
        if let Some(breaker) = self.breakers.get(provider_id) {
            return breaker.clone();
        }
        self.breakers
            .entry(provider_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(CircuitBreaker::new())))
            .clone()
    }

    pub fn ensure(&self, provider_id: &ProviderId) {
        self.breaker(provider_id);
    }

    // A probe owns the slot for its whole call timeout plus the settlement grace
    fn probe_deadline(&self, now: DateTime<Utc>, call_timeout: StdDuration) -> DateTime<Utc> {
        let hold = call_timeout + StdDuration::from_millis(self.config.probe_grace_ms);
        now + Duration::from_std(hold).unwrap_or_else(|_| Duration::days(1))
    }

    /// Admits a call or rejects it with `CircuitOpen`.
    ///
    /// In half-open exactly one caller wins the probe slot; everyone else is
    /// rejected as if the breaker were still open. `call_timeout` is the
    /// upper bound of the call the permit is for.
    pub fn try_acquire(&self, provider_id: &ProviderId, call_timeout: StdDuration) -> Result<CallPermit, OrchestratorError> {
        let breaker = self.breaker(provider_id);
        let mut guard = breaker.lock();
        let breaker = &mut *guard;
        let now = self.clock.now();

        if let State::Open { next_attempt } = breaker.state {
            if now < next_attempt {
                return Err(OrchestratorError::CircuitOpen {
                    provider_id: provider_id.clone(),
                    retry_after: Some(next_attempt),
                });
            }
            breaker.half_open();
            info!(provider_id = %provider_id, "circuit half-open, probe allowed");
        }

        let epoch = breaker.epoch;
        match &mut breaker.state {
            State::Closed { .. } => Ok(CallPermit {
                provider_id: provider_id.clone(),
                probe: false,
                epoch,
            }),
            State::HalfOpen { probe_deadline } => {
                let busy = probe_deadline.map_or(false, |deadline| now < deadline);
                if busy {
                    Err(OrchestratorError::CircuitOpen {
                        provider_id: provider_id.clone(),
                        retry_after: None,
                    })
                } else {
                    *probe_deadline = Some(self.probe_deadline(now, call_timeout));
                    Ok(CallPermit {
                        provider_id: provider_id.clone(),
                        probe: true,
                        epoch,
                    })
                }
            }
            State::Open { next_attempt } => Err(OrchestratorError::CircuitOpen {
                provider_id: provider_id.clone(),
                retry_after: Some(*next_attempt),
            }),
        }
    }

    /// Whether `try_acquire` would currently admit a call. Does not take the probe slot.
    pub fn is_call_permitted(&self, provider_id: &ProviderId) -> bool {
        let Some(breaker) = self.breakers.get(provider_id).map(|b| b.clone()) else {
            return true;
        };
        let breaker = breaker.lock();
        let now = self.clock.now();
        match &breaker.state {
            State::Closed { .. } => true,
            State::Open { next_attempt } => now >= *next_attempt,
            State::HalfOpen { probe_deadline } => probe_deadline.map_or(true, |deadline| now >= deadline),
        }
    }

    pub fn record_success(&self, permit: CallPermit) {
        let breaker = self.breaker(&permit.provider_id);
        let mut guard = breaker.lock();
        let breaker = &mut *guard;
        if breaker.epoch != permit.epoch {
            return;
        }
        match &mut breaker.state {
            State::Closed { failures } => {
                // failures only leave the window by ageing out
                let now = self.clock.now();
                let window = Duration::seconds(self.config.failure_window_secs);
                while failures.front().map_or(false, |first| now - *first > window) {
                    failures.pop_front();
                }
                breaker.failure_count = failures.len() as u32;
            }
            State::HalfOpen { .. } if permit.probe => {
                breaker.close();
                info!(provider_id = %permit.provider_id, "circuit closed after successful probe");
            }
            _ => {}
        }
    }

    pub fn record_failure(&self, permit: CallPermit) {
        let breaker = self.breaker(&permit.provider_id);
        let mut guard = breaker.lock();
        let breaker = &mut *guard;
        if breaker.epoch != permit.epoch {
            return;
        }
        let now = self.clock.now();
        let window = Duration::seconds(self.config.failure_window_secs);

        match &mut breaker.state {
            State::Closed { failures } => {
                failures.push_back(now);
                while failures.front().map_or(false, |first| now - *first > window) {
                    failures.pop_front();
                }
                let count = failures.len() as u32;
                breaker.failure_count = count;
                breaker.last_failure = Some(now);

                if count >= self.config.failure_threshold {
                    let backoff = self.calculate_backoff(0);
                    breaker.open(now, backoff);
                    warn!(
                        provider_id = %permit.provider_id,
                        failures = count,
                        backoff_ms = backoff.as_millis() as u64,
                        "circuit opened"
                    );
                }
            }
            State::HalfOpen { .. } if permit.probe => {
                breaker.last_failure = Some(now);
                breaker.failure_count += 1;
                breaker.reopen_count += 1;
                let backoff = self.calculate_backoff(breaker.reopen_count);
                breaker.open(now, backoff);
                warn!(
                    provider_id = %permit.provider_id,
                    reopen_count = breaker.reopen_count,
                    backoff_ms = backoff.as_millis() as u64,
                    "probe failed, circuit re-opened"
                );
            }
            _ => {}
        }
    }

    /// Gives back a permit whose call never reached the supplier.
    pub fn abandon(&self, permit: CallPermit) {
        if !permit.probe {
            return;
        }
        let breaker = self.breaker(&permit.provider_id);
        let mut guard = breaker.lock();
        let breaker = &mut *guard;
        if breaker.epoch != permit.epoch {
            return;
        }
        if let State::HalfOpen { probe_deadline } = &mut breaker.state {
            *probe_deadline = None;
        }
    }

    /// Manual override for incident response.
    pub fn force_state(&self, provider_id: &ProviderId, state: CircuitState) {
        let breaker = self.breaker(provider_id);
        let mut guard = breaker.lock();
        let breaker = &mut *guard;
        let now = self.clock.now();
        match state {
            CircuitState::Closed => breaker.close(),
            CircuitState::Open => {
                let backoff = self.calculate_backoff(breaker.reopen_count);
                breaker.open(now, backoff);
            }
            CircuitState::HalfOpen => breaker.half_open(),
        }
        warn!(provider_id = %provider_id, %state, "circuit state forced");
    }

    /// Closes a breaker that has been open longer than `max_age`.
    pub fn reset_if_stuck(&self, provider_id: &ProviderId, max_age: Duration) -> bool {
        let Some(breaker) = self.breakers.get(provider_id).map(|b| b.clone()) else {
            return false;
        };
        let mut guard = breaker.lock();
        let breaker = &mut *guard;
        let now = self.clock.now();
        let stuck = matches!(breaker.state, State::Open { .. })
            && breaker.opened_at.map_or(true, |opened| now - opened >= max_age);
        if stuck {
            breaker.close();
            warn!(provider_id = %provider_id, "stuck circuit reset to closed");
        }
        stuck
    }

    pub fn snapshot(&self, provider_id: &ProviderId) -> CircuitSnapshot {
        let Some(breaker) = self.breakers.get(provider_id).map(|b| b.clone()) else {
            return CircuitSnapshot {
                provider_id: provider_id.clone(),
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                next_attempt: None,
                opened_at: None,
                reopen_count: 0,
            };
        };
        let breaker = breaker.lock();
        CircuitSnapshot {
            provider_id: provider_id.clone(),
            state: breaker.circuit_state(),
            failure_count: breaker.failure_count,
            last_failure: breaker.last_failure,
            next_attempt: match breaker.state {
                State::Open { next_attempt } => Some(next_attempt),
                _ => None,
            },
            opened_at: breaker.opened_at,
            reopen_count: breaker.reopen_count,
        }
    }

    /// Loads a persisted breaker. A restored half-open breaker starts with a free probe slot.
    pub fn restore(&self, snapshot: &CircuitSnapshot) {
        let now = self.clock.now();
        let mut breaker = CircuitBreaker::new();
        breaker.failure_count = snapshot.failure_count;
        breaker.last_failure = snapshot.last_failure;
        breaker.opened_at = snapshot.opened_at;
        breaker.reopen_count = snapshot.reopen_count;
        breaker.state = match snapshot.state {
            CircuitState::Closed => State::Closed {
                failures: VecDeque::new(),
            },
            CircuitState::Open => State::Open {
                next_attempt: snapshot.next_attempt.unwrap_or(now),
            },
            CircuitState::HalfOpen => State::HalfOpen { probe_deadline: None },
        };
        self.breakers
            .insert(snapshot.provider_id.clone(), Arc::new(Mutex::new(breaker)));
    }

    pub fn remove(&self, provider_id: &ProviderId) -> bool {
        self.breakers.remove(provider_id).is_some()
    }

    pub fn provider_ids(&self) -> Vec<ProviderId> {
        self.breakers.iter().map(|entry| entry.key().clone()).collect()
    }

    // Exponential back-off with jitter, capped at max_backoff_ms
    pub fn calculate_backoff(&self, reopen_count: u32) -> StdDuration {
        let config = &self.config;
        let base_backoff_ms = (config.initial_backoff_ms as f64
            * config.backoff_multiplier.powf(reopen_count as f64))
        .min(config.max_backoff_ms as f64);

        // spread re-probes of many callers across a small band
        let jitter = rand::random::<f64>() * config.jitter_factor * base_backoff_ms;
        let backoff_ms = base_backoff_ms * (1.0 - config.jitter_factor / 2.0) + jitter;

        StdDuration::from_millis(backoff_ms as u64)
    }
}
