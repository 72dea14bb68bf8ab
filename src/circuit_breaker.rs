//! Per-resource circuit breaking.
//!
//! Each named resource walks its own CLOSED → OPEN → HALF_OPEN → CLOSED
//! cycle. Admission decisions are made while holding the resource's
//! `DashMap` shard lock, so concurrent callers never both win the single
//! half-open trial slot.

use crate::pool::{ErrorMatcher, TaskError};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Errors the breaker can classify by kind
pub trait ClassifiedError {
    fn kind(&self) -> &str;
}

impl ClassifiedError for TaskError {
    fn kind(&self) -> &str {
        &self.kind
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    trial_in_flight: bool,
}

/// Per-resource overrides; unset fields fall back to the breaker defaults
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct ResourceBreakerConfig {
    pub failure_threshold: Option<u32>,
    pub recovery_timeout_ms: Option<u64>,
    pub expected_errors: Option<ErrorMatcher>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    /// Error kinds that count as resource failures
    pub expected_errors: ErrorMatcher,
    pub overrides: HashMap<String, ResourceBreakerConfig>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 30_000,
            expected_errors: ErrorMatcher::Any,
            overrides: HashMap::new(),
        }
    }
}

/// Settings in effect for one resource
#[derive(Clone, Debug, PartialEq)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub expected_errors: ErrorMatcher,
}

impl CircuitBreakerConfig {
    pub fn for_resource(&self, resource: &str) -> BreakerSettings {
        let overrides = self.overrides.get(resource);
        BreakerSettings {
            failure_threshold: overrides
                .and_then(|o| o.failure_threshold)
                .unwrap_or(self.failure_threshold),
            recovery_timeout: Duration::from_millis(
                overrides
                    .and_then(|o| o.recovery_timeout_ms)
                    .unwrap_or(self.recovery_timeout_ms),
            ),
            expected_errors: overrides
                .and_then(|o| o.expected_errors.clone())
                .unwrap_or_else(|| self.expected_errors.clone()),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be at least 1".to_string());
        }
        for (resource, overrides) in &self.overrides {
            if overrides.failure_threshold == Some(0) {
                return Err(format!(
                    "failure_threshold for resource '{}' must be at least 1",
                    resource
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CircuitError<E> {
    #[error("circuit open for resource '{resource}', retry after {retry_after:?}")]
    Open {
        resource: String,
        retry_after: Duration,
    },
    #[error(transparent)]
    Inner(E),
}

impl From<CircuitError<TaskError>> for TaskError {
    fn from(err: CircuitError<TaskError>) -> Self {
        match err {
            CircuitError::Open { resource, .. } => TaskError::circuit_open(&resource),
            CircuitError::Inner(inner) => inner,
        }
    }
}

#[derive(Debug, Default)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    states: DashMap<String, CircuitBreakerState>,
}

/// Releases a half-open trial slot if the guarded call never reports back
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    resource: &'a str,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!(
                "Trial call for '{}' dropped before completion",
                self.resource
            );
            self.breaker.release_trial(self.resource);
        }
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            states: DashMap::new(),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Invoke `f` through the breaker for `resource`.
    ///
    /// Errors whose kind is in the resource's expected set count as failures;
    /// any other error passes through without touching the breaker state.
    pub async fn call<F, Fut, T, E>(&self, resource: &str, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ClassifiedError,
    {
        let settings = self.config.for_resource(resource);
        let trial = self
            .admit(resource, &settings)
            .map_err(|retry_after| CircuitError::Open {
                resource: resource.to_string(),
                retry_after,
            })?;

        let mut guard = TrialGuard {
            breaker: self,
            resource,
            armed: trial,
        };
        let result = f().await;

        match &result {
            Ok(_) => self.on_success(resource, trial),
            Err(e) if settings.expected_errors.matches(e.kind()) => {
                self.on_failure(resource, &settings, trial)
            }
            Err(_) if trial => self.release_trial(resource),
            Err(_) => {}
        }
        guard.armed = false;

        result.map_err(CircuitError::Inner)
    }

    /// Current state, reporting HALF_OPEN once an open circuit's recovery
    /// timeout has elapsed even if no call has arrived to move it yet
    pub fn state(&self, resource: &str) -> CircuitState {
        let Some(entry) = self.states.get(resource) else {
            return CircuitState::Closed;
        };
        if entry.state == CircuitState::Open
            && open_elapsed(&entry, Utc::now()) >= self.config.for_resource(resource).recovery_timeout
        {
            return CircuitState::HalfOpen;
        }
        entry.state
    }

    pub fn resource_state(&self, resource: &str) -> Option<CircuitBreakerState> {
        self.states.get(resource).map(|entry| entry.clone())
    }

    /// All known resources and their state
    pub fn snapshot(&self) -> HashMap<String, CircuitBreakerState> {
        self.states
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn force_open(&self, resource: &str) {
        let mut entry = self.states.entry(resource.to_string()).or_default();
        entry.state = CircuitState::Open;
        entry.opened_at = Some(Utc::now());
        entry.trial_in_flight = false;
        warn!("Circuit for '{}' forced open", resource);
    }

    pub fn force_close(&self, resource: &str) {
        self.states
            .insert(resource.to_string(), CircuitBreakerState::default());
        info!("Circuit for '{}' forced closed", resource);
    }

    /// Forget every resource
    pub fn reset(&self) {
        self.states.clear();
    }

    /// Report a success observed outside `call`
    pub fn record_success(&self, resource: &str) {
        self.on_success(resource, true);
    }

    /// Report a failure observed outside `call`
    pub fn record_failure(&self, resource: &str) {
        let settings = self.config.for_resource(resource);
        self.on_failure(resource, &settings, true);
    }

    /// Ok(true) when admitted as the half-open trial; Err carries the wait
    fn admit(&self, resource: &str, settings: &BreakerSettings) -> Result<bool, Duration> {
        let mut entry = self.states.entry(resource.to_string()).or_default();
        match entry.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let elapsed = open_elapsed(&entry, Utc::now());
                if elapsed >= settings.recovery_timeout {
                    entry.state = CircuitState::HalfOpen;
                    entry.trial_in_flight = true;
                    info!("Circuit for '{}' half-open, admitting trial call", resource);
                    Ok(true)
                } else {
                    Err(settings.recovery_timeout - elapsed)
                }
            }
            CircuitState::HalfOpen => {
                if entry.trial_in_flight {
                    Err(Duration::ZERO)
                } else {
                    entry.trial_in_flight = true;
                    Ok(true)
                }
            }
        }
    }

    fn on_success(&self, resource: &str, trial: bool) {
        let mut entry = self.states.entry(resource.to_string()).or_default();
        match entry.state {
            CircuitState::HalfOpen if trial => {
                *entry = CircuitBreakerState::default();
                info!("Circuit for '{}' closed after successful trial", resource);
            }
            CircuitState::Closed => entry.failure_count = 0,
            _ => {}
        }
    }

    fn on_failure(&self, resource: &str, settings: &BreakerSettings, trial: bool) {
        let now = Utc::now();
        let mut entry = self.states.entry(resource.to_string()).or_default();
        entry.failure_count = entry.failure_count.saturating_add(1);
        entry.last_failure_at = Some(now);

        match entry.state {
            CircuitState::HalfOpen if trial => {
                entry.state = CircuitState::Open;
                entry.opened_at = Some(now);
                entry.trial_in_flight = false;
                warn!("Circuit for '{}' re-opened after failed trial", resource);
            }
            CircuitState::Closed if entry.failure_count >= settings.failure_threshold => {
                entry.state = CircuitState::Open;
                entry.opened_at = Some(now);
                warn!(
                    "Circuit for '{}' opened after {} consecutive failures",
                    resource, entry.failure_count
                );
            }
            _ => {}
        }
    }

    fn release_trial(&self, resource: &str) {
        if let Some(mut entry) = self.states.get_mut(resource) {
            entry.trial_in_flight = false;
        }
    }
}

fn open_elapsed(state: &CircuitBreakerState, now: DateTime<Utc>) -> Duration {
    state
        .opened_at
        .map(|opened| (now - opened).to_std().unwrap_or_default())
        .unwrap_or(Duration::MAX)
}
