//! Registered processors and the pool the scheduling service keeps them in.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info, warn};

use super::status::ProcessorStatus;
use crate::errors::SchedulingError;
use crate::observability::{sanitize_for_log, telemetry::record_status_transition};

/// An execution agent as known to the scheduling core.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Processor {
    /// Assigned by the core when empty on first registration
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub subsets: Vec<String>,
    #[serde(default)]
    pub status: ProcessorStatus,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Processor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn answers_to(&self, name: &str) -> bool {
        self.name == name || self.subsets.iter().any(|subset| subset == name)
    }

    /// Apply the mutable fields of a re-registration.
    pub fn patch(&mut self, update: &Processor) {
        if update.label.is_some() {
            self.label = update.label.clone();
        }
        self.status = update.status;
        self.metadata.extend(update.metadata.clone());
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorRegistration {
    pub processor: Processor,
    /// Address the processor listens on
    pub host: String,
}

/// Selects registered processors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorQuery {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ProcessorQuery {
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, processor: &Processor) -> bool {
        if let Some(id) = &self.id {
            if &processor.id != id {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if !processor.answers_to(name) {
                return false;
            }
        }
        self.metadata
            .iter()
            .all(|(key, value)| processor.metadata.get(key) == Some(value))
    }
}

impl std::fmt::Display for ProcessorQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{id: {:?}, name: {:?}, metadata: {:?}}}",
            self.id, self.name, self.metadata
        )
    }
}

#[derive(Debug, Clone)]
pub struct RegisteredProcessor {
    pub processor: Processor,
    pub host: String,
    pub last_seen: Instant,
    /// Command ids currently assigned
    pub running: HashSet<String>,
}

#[derive(Default)]
struct PoolState {
    processors: HashMap<String, RegisteredProcessor>,
    waiting: HashMap<String, Vec<oneshot::Sender<Processor>>>,
}

/// Registered processors keyed by id.
#[derive(Clone, Default)]
pub struct ProcessorPool {
    state: Arc<RwLock<PoolState>>,
}

impl ProcessorPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or patch a processor and return the canonical record.
    pub async fn register(
        &self,
        registration: ProcessorRegistration,
    ) -> Result<Processor, SchedulingError> {
        let ProcessorRegistration {
            mut processor,
            host,
        } = registration;
        if processor.id.is_empty() {
            processor.id = uuid::Uuid::new_v4().to_string();
        }

        let mut state = self.state.write().await;
        let canonical = match state.processors.get_mut(&processor.id) {
            Some(existing) => {
                let from = existing.processor.status;
                if !from.can_transition_to(processor.status) {
                    return Err(SchedulingError::InvalidTransition {
                        from: from.to_string(),
                        to: processor.status.to_string(),
                    });
                }
                existing.processor.patch(&processor);
                existing.host = host;
                existing.last_seen = Instant::now();
                if from != existing.processor.status {
                    record_status_transition(
                        &existing.processor.id,
                        &from.to_string(),
                        &existing.processor.status.to_string(),
                    );
                }
                existing.processor.clone()
            }
            None => {
                info!(
                    id = processor.id.as_str(),
                    name = %sanitize_for_log(&processor.name),
                    host = %sanitize_for_log(&host),
                    status = %processor.status,
                    "Processor registered"
                );
                state.processors.insert(
                    processor.id.clone(),
                    RegisteredProcessor {
                        processor: processor.clone(),
                        host,
                        last_seen: Instant::now(),
                        running: HashSet::new(),
                    },
                );
                processor
            }
        };

        if canonical.status.is_available() {
            if let Some(waiters) = state.waiting.remove(&canonical.id) {
                for waiter in waiters {
                    let _ = waiter.send(canonical.clone());
                }
            }
        }
        Ok(canonical)
    }

    /// Resolves once the processor with `id` registers as available.
    pub async fn expect_registration(&self, id: &str) -> oneshot::Receiver<Processor> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.write().await;
        match state.processors.get(id) {
            Some(existing) if existing.processor.status.is_available() => {
                let _ = tx.send(existing.processor.clone());
            }
            _ => {
                let waiters = state.waiting.entry(id.to_string()).or_default();
                waiters.retain(|waiter| !waiter.is_closed());
                waiters.push(tx);
            }
        }
        rx
    }

    /// Forget waiters for `id` whose receiver is gone.
    pub async fn prune_waiters(&self, id: &str) {
        let mut state = self.state.write().await;
        if let Some(waiters) = state.waiting.get_mut(id) {
            waiters.retain(|waiter| !waiter.is_closed());
            if waiters.is_empty() {
                state.waiting.remove(id);
            }
        }
    }

    /// Number of processor ids someone is waiting on.
    pub async fn waiting_count(&self) -> usize {
        self.state.read().await.waiting.len()
    }

    pub async fn get(&self, id: &str) -> Option<RegisteredProcessor> {
        self.state.read().await.processors.get(id).cloned()
    }

    /// Available processor matching `query`, least loaded first.
    pub async fn find(&self, query: &ProcessorQuery) -> Option<Processor> {
        let state = self.state.read().await;
        state
            .processors
            .values()
            .filter(|p| p.processor.status.is_available() && query.matches(&p.processor))
            .min_by(|a, b| {
                a.running
                    .len()
                    .cmp(&b.running.len())
                    .then_with(|| a.processor.id.cmp(&b.processor.id))
            })
            .map(|p| p.processor.clone())
    }

    pub async fn list(&self) -> Vec<Processor> {
        let state = self.state.read().await;
        let mut processors: Vec<Processor> = state
            .processors
            .values()
            .map(|p| p.processor.clone())
            .collect();
        processors.sort_by(|a, b| a.id.cmp(&b.id));
        processors
    }

    /// Record contact from a processor. A not-responding processor recovers
    /// to `Processing` while it still has commands assigned, `Idle` otherwise.
    pub async fn touch(&self, id: &str) {
        let mut state = self.state.write().await;
        if let Some(entry) = state.processors.get_mut(id) {
            entry.last_seen = Instant::now();
            if entry.processor.status == ProcessorStatus::NotResponding {
                let recovered = if entry.running.is_empty() {
                    ProcessorStatus::Idle
                } else {
                    ProcessorStatus::Processing
                };
                info!(id = id, status = %recovered, "Processor responding again");
                record_status_transition(
                    id,
                    &ProcessorStatus::NotResponding.to_string(),
                    &recovered.to_string(),
                );
                entry.processor.status = recovered;
            }
        }
    }

    pub async fn set_status(
        &self,
        id: &str,
        status: ProcessorStatus,
    ) -> Result<(), SchedulingError> {
        let mut state = self.state.write().await;
        let entry = state
            .processors
            .get_mut(id)
            .ok_or_else(|| SchedulingError::UnknownProcessor { id: id.to_string() })?;
        let from = entry.processor.status;
        if !from.can_transition_to(status) {
            return Err(SchedulingError::InvalidTransition {
                from: from.to_string(),
                to: status.to_string(),
            });
        }
        if from != status {
            record_status_transition(id, &from.to_string(), &status.to_string());
            entry.processor.status = status;
        }
        Ok(())
    }

    /// Track a command as running on the processor; returns the number running.
    pub async fn assign(&self, id: &str, command_id: &str) -> usize {
        let mut state = self.state.write().await;
        match state.processors.get_mut(id) {
            Some(entry) => {
                entry.running.insert(command_id.to_string());
                entry.running.len()
            }
            None => 0,
        }
    }

    /// Drop a finished command; returns the number still running.
    pub async fn release(&self, id: &str, command_id: &str) -> usize {
        let mut state = self.state.write().await;
        match state.processors.get_mut(id) {
            Some(entry) => {
                entry.running.remove(command_id);
                entry.running.len()
            }
            None => 0,
        }
    }

    /// Mark processors not seen within `deadline` as not responding.
    pub async fn sweep_unresponsive(&self, deadline: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut swept = Vec::new();
        let mut state = self.state.write().await;
        for (id, entry) in state.processors.iter_mut() {
            let status = entry.processor.status;
            if status.is_terminal() || status == ProcessorStatus::NotResponding {
                continue;
            }
            if now.duration_since(entry.last_seen) > deadline {
                warn!(
                    id = id.as_str(),
                    silent_secs = now.duration_since(entry.last_seen).as_secs(),
                    "Processor missed its liveness deadline"
                );
                record_status_transition(
                    id,
                    &status.to_string(),
                    &ProcessorStatus::NotResponding.to_string(),
                );
                entry.processor.status = ProcessorStatus::NotResponding;
                swept.push(id.clone());
            }
        }
        swept.sort();
        swept
    }

    /// Drop processors that have shut down; returns their ids.
    pub async fn evict_shut_down(&self) -> Vec<String> {
        let mut state = self.state.write().await;
        let mut evicted: Vec<String> = state
            .processors
            .iter()
            .filter(|(_, entry)| entry.processor.status.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &evicted {
            state.processors.remove(id);
            state.waiting.remove(id);
        }
        if !evicted.is_empty() {
            debug!(evicted = evicted.len(), "Evicted shut down processors");
        }
        evicted.sort();
        evicted
    }
}
