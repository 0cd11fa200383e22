//! Adapter registry
//!
//! Holds every registered adapter under a stable name with an enabled flag,
//! tracks in-flight load, and resolves the adapter for a task when the
//! caller does not name one. Resolution order: declared preferences of the
//! task type, then adapter health, then breaker state, then least-loaded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use mahavishnu_core::{Error, Result, WorkflowId};

use crate::reliability::{BreakerRegistry, CircuitState};

use super::{Adapter, AdapterHealth, AdapterVariant, StepOutcome, StepRequest};

/// A registered adapter with its runtime bookkeeping
pub struct RegisteredAdapter {
    adapter: Arc<dyn Adapter>,
    enabled: AtomicBool,
    initialized: AtomicBool,
    in_flight: AtomicUsize,
}

impl RegisteredAdapter {
    fn new(adapter: Arc<dyn Adapter>) -> Self {
        Self {
            adapter,
            enabled: AtomicBool::new(true),
            initialized: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Stable adapter name
    pub fn name(&self) -> &str {
        self.adapter.name()
    }

    /// Engine family
    pub fn variant(&self) -> AdapterVariant {
        self.adapter.variant()
    }

    /// Whether the adapter accepts new work
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Whether initialize has succeeded
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Relaxed)
    }

    /// Calls currently executing through this adapter
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Adapter-reported health
    pub async fn health(&self) -> AdapterHealth {
        self.adapter.health().await
    }

    /// Execute a step, tracking in-flight load
    pub async fn execute(
        &self,
        request: StepRequest,
        cancel: CancellationToken,
    ) -> Result<StepOutcome> {
        if !self.is_enabled() {
            return Err(Error::dependency_down("adapter is disabled")
                .with_context("adapter", self.name()));
        }
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        let result = self.adapter.execute(request, cancel).await;
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        result
    }

    /// Request cancellation of an in-flight step
    pub async fn cancel(&self, workflow_id: WorkflowId, step: &str) -> Result<()> {
        self.adapter.cancel(workflow_id, step).await
    }
}

/// Queryable adapter summary for the admin surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterSummary {
    pub name: String,
    pub variant: AdapterVariant,
    pub enabled: bool,
    pub initialized: bool,
    pub in_flight: usize,
    pub health: AdapterHealth,
    pub breaker_state: CircuitState,
}

/// Registry of execution adapters
pub struct AdapterRegistry {
    adapters: DashMap<String, Arc<RegisteredAdapter>>,
    /// task_type -> ordered adapter preferences
    preferences: RwLock<HashMap<String, Vec<String>>>,
    breakers: Arc<BreakerRegistry>,
}

impl AdapterRegistry {
    /// Create an empty registry sharing the given breaker registry
    pub fn new(breakers: Arc<BreakerRegistry>) -> Self {
        Self {
            adapters: DashMap::new(),
            preferences: RwLock::new(HashMap::new()),
            breakers,
        }
    }

    /// Register an adapter under its stable name
    pub fn register(&self, adapter: Arc<dyn Adapter>) -> Arc<RegisteredAdapter> {
        let name = adapter.name().to_string();
        let registered = Arc::new(RegisteredAdapter::new(adapter));
        self.adapters.insert(name.clone(), registered.clone());
        info!(adapter = %name, "registered adapter");
        registered
    }

    /// Declare the adapter preference order for a task type
    pub fn set_preferences(&self, task_type: &str, adapters: Vec<String>) {
        self.preferences
            .write()
            .insert(task_type.to_string(), adapters);
    }

    /// Look up an adapter by name
    pub fn get(&self, name: &str) -> Result<Arc<RegisteredAdapter>> {
        self.adapters
            .get(name)
            .map(|entry| entry.clone())
            .ok_or_else(|| Error::not_found("unknown adapter").with_context("adapter", name))
    }

    /// Enable or disable an adapter
    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let adapter = self.get(name)?;
        adapter.enabled.store(enabled, Ordering::Relaxed);
        info!(adapter = %name, enabled, "adapter availability changed");
        Ok(())
    }

    /// Initialize one adapter
    ///
    /// A startup failure trips the adapter's breaker immediately; the health
    /// supervisor retries uninitialized adapters on its cadence.
    pub async fn initialize(&self, name: &str) -> Result<()> {
        let registered = self.get(name)?;
        match registered.adapter.initialize().await {
            Ok(()) => {
                registered.initialized.store(true, Ordering::Relaxed);
                info!(adapter = %name, "adapter initialized");
                Ok(())
            }
            Err(err) => {
                warn!(adapter = %name, error = %err, "adapter startup failed, tripping breaker");
                self.breakers.breaker(name).trip();
                Err(err)
            }
        }
    }

    /// Initialize every registered adapter, collecting per-adapter outcomes
    pub async fn initialize_all(&self) -> Vec<(String, Result<()>)> {
        let names: Vec<String> = self.adapters.iter().map(|e| e.key().clone()).collect();
        let mut results = Vec::with_capacity(names.len());
        for name in names {
            let result = self.initialize(&name).await;
            results.push((name, result));
        }
        results
    }

    /// Retry initialization for adapters whose startup previously failed
    pub async fn retry_uninitialized(&self) {
        let pending: Vec<String> = self
            .adapters
            .iter()
            .filter(|e| !e.value().is_initialized())
            .map(|e| e.key().clone())
            .collect();
        for name in pending {
            let _ = self.initialize(&name).await;
        }
    }

    /// Number of initialized adapters
    pub fn initialized_count(&self) -> usize {
        self.adapters
            .iter()
            .filter(|e| e.value().is_initialized())
            .count()
    }

    /// Resolve the adapter for a task
    ///
    /// An explicit `requested` name bypasses preferences but still honours
    /// the enabled flag. Otherwise candidates come from the task type's
    /// declared preferences (all adapters when none are declared), filtered
    /// by health and breaker state, with ties broken by least-loaded.
    pub async fn resolve(
        &self,
        task_type: &str,
        requested: Option<&str>,
    ) -> Result<Arc<RegisteredAdapter>> {
        if let Some(name) = requested {
            let adapter = self.get(name)?;
            if !adapter.is_enabled() {
                return Err(Error::exhausted("requested adapter is disabled")
                    .with_context("adapter", name));
            }
            return Ok(adapter);
        }

        let preferred = self.preferences.read().get(task_type).cloned();
        let candidates: Vec<Arc<RegisteredAdapter>> = match preferred {
            Some(names) => names
                .iter()
                .filter_map(|name| self.adapters.get(name).map(|e| e.clone()))
                .collect(),
            None => self.adapters.iter().map(|e| e.value().clone()).collect(),
        };

        let mut eligible = Vec::new();
        for adapter in candidates {
            if !adapter.is_enabled() || !adapter.is_initialized() {
                continue;
            }
            if !adapter.health().await.is_available() {
                continue;
            }
            if self.breakers.breaker(adapter.name()).state() == CircuitState::Open {
                continue;
            }
            eligible.push(adapter);
        }

        eligible
            .into_iter()
            .min_by_key(|adapter| adapter.in_flight())
            .ok_or_else(|| {
                Error::exhausted("no eligible adapter for task type")
                    .with_context("task_type", task_type)
            })
    }

    /// Summaries for the admin surface
    pub async fn list(&self) -> Vec<AdapterSummary> {
        let mut out = Vec::new();
        for entry in self.adapters.iter() {
            let adapter = entry.value();
            out.push(AdapterSummary {
                name: adapter.name().to_string(),
                variant: adapter.variant(),
                enabled: adapter.is_enabled(),
                initialized: adapter.is_initialized(),
                in_flight: adapter.in_flight(),
                health: adapter.health().await,
                breaker_state: self.breakers.breaker(adapter.name()).state(),
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Shut every adapter down; failures are logged, never retried
    pub async fn shutdown_all(&self) {
        for entry in self.adapters.iter() {
            if let Err(err) = entry.value().adapter.shutdown().await {
                warn!(adapter = %entry.key(), error = %err, "adapter shutdown failed");
            }
        }
    }
}
