#![forbid(unsafe_code)]

use crate::domain::{EndpointKind, HealthStatus};
use crate::events::{EngineEvent, EventBus};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Registration-time description of an addressable external service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub name: String,
    pub kind: EndpointKind,
    pub address: String,
    pub auth_mode: Option<String>,
}

/// Rolling delivery counters per endpoint, shared with the gateway.
#[derive(Debug, Default)]
pub struct EndpointCounters {
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl EndpointCounters {
    pub fn record_delivery(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EndpointCountersSnapshot {
        EndpointCountersSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EndpointCountersSnapshot {
    pub delivered: u64,
    pub failed: u64,
}

/// Point-in-time view of one registered endpoint.
#[derive(Clone, Debug)]
pub struct Endpoint {
    pub descriptor: EndpointDescriptor,
    pub health: HealthStatus,
    pub counters: EndpointCountersSnapshot,
}

struct EndpointEntry {
    descriptor: EndpointDescriptor,
    health: HealthStatus,
    counters: Arc<EndpointCounters>,
    references: usize,
}

/// Registry of service descriptors with health-aware lookups.
///
/// Health transitions are applied under the registry lock (compare-and-swap
/// semantics) and emit `HealthChanged`; readers always get snapshots.
pub struct EndpointRegistry {
    entries: Mutex<HashMap<String, EndpointEntry>>,
    events: EventBus,
}

impl EndpointRegistry {
    pub fn new(events: EventBus) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn register(&self, descriptor: EndpointDescriptor) -> Result<(), EndpointRegistryError> {
        let mut entries = self.entries.lock().expect("endpoint registry");
        if entries.contains_key(&descriptor.name) {
            return Err(EndpointRegistryError::Duplicate {
                endpoint: descriptor.name,
            });
        }

        tracing::info!(
            target: "switchyard::endpoint",
            event = "endpoint_registered",
            endpoint = %descriptor.name,
            kind = descriptor.kind.as_str(),
            address = %descriptor.address,
        );

        entries.insert(
            descriptor.name.clone(),
            EndpointEntry {
                descriptor,
                health: HealthStatus::Unknown,
                counters: Arc::default(),
                references: 0,
            },
        );
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Result<Endpoint, EndpointRegistryError> {
        let entries = self.entries.lock().expect("endpoint registry");
        entries
            .get(name)
            .map(snapshot_entry)
            .ok_or_else(|| EndpointRegistryError::NotFound {
                endpoint: name.to_string(),
            })
    }

    /// Shared counters handle for delivery bookkeeping.
    pub fn counters(&self, name: &str) -> Result<Arc<EndpointCounters>, EndpointRegistryError> {
        let entries = self.entries.lock().expect("endpoint registry");
        entries
            .get(name)
            .map(|entry| Arc::clone(&entry.counters))
            .ok_or_else(|| EndpointRegistryError::NotFound {
                endpoint: name.to_string(),
            })
    }

    /// Applies a probe result. Emits `HealthChanged` only on transition.
    pub fn report_health(
        &self,
        name: &str,
        status: HealthStatus,
    ) -> Result<(), EndpointRegistryError> {
        let previous = {
            let mut entries = self.entries.lock().expect("endpoint registry");
            let entry = entries
                .get_mut(name)
                .ok_or_else(|| EndpointRegistryError::NotFound {
                    endpoint: name.to_string(),
                })?;
            let previous = entry.health;
            entry.health = status;
            previous
        };

        if previous != status {
            tracing::info!(
                target: "switchyard::endpoint",
                event = "health_changed",
                endpoint = %name,
                previous = previous.as_str(),
                current = status.as_str(),
            );
            self.events.publish(EngineEvent::HealthChanged {
                endpoint: name.to_string(),
                previous,
                current: status,
            });
        }
        Ok(())
    }

    /// Healthy endpoints filtered by kind, as of the health snapshot at call
    /// time. Later health updates do not retroactively alter the result.
    pub fn list_healthy(&self, kind: Option<EndpointKind>) -> Vec<Endpoint> {
        let entries = self.entries.lock().expect("endpoint registry");
        let mut healthy: Vec<Endpoint> = entries
            .values()
            .filter(|entry| entry.health == HealthStatus::Healthy)
            .filter(|entry| kind.map_or(true, |kind| entry.descriptor.kind == kind))
            .map(snapshot_entry)
            .collect();
        healthy.sort_by(|lhs, rhs| lhs.descriptor.name.cmp(&rhs.descriptor.name));
        healthy
    }

    pub fn list_all(&self) -> Vec<Endpoint> {
        let entries = self.entries.lock().expect("endpoint registry");
        let mut all: Vec<Endpoint> = entries.values().map(snapshot_entry).collect();
        all.sort_by(|lhs, rhs| lhs.descriptor.name.cmp(&rhs.descriptor.name));
        all
    }

    /// Marks the endpoint as referenced by a route or flow. Deregistration is
    /// refused while references remain.
    pub fn retain(&self, name: &str) -> Result<(), EndpointRegistryError> {
        let mut entries = self.entries.lock().expect("endpoint registry");
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| EndpointRegistryError::NotFound {
                endpoint: name.to_string(),
            })?;
        entry.references += 1;
        Ok(())
    }

    pub fn release(&self, name: &str) {
        let mut entries = self.entries.lock().expect("endpoint registry");
        if let Some(entry) = entries.get_mut(name) {
            entry.references = entry.references.saturating_sub(1);
        }
    }

    pub fn deregister(&self, name: &str) -> Result<(), EndpointRegistryError> {
        let mut entries = self.entries.lock().expect("endpoint registry");
        match entries.get(name) {
            None => Err(EndpointRegistryError::NotFound {
                endpoint: name.to_string(),
            }),
            Some(entry) if entry.references > 0 => Err(EndpointRegistryError::StillReferenced {
                endpoint: name.to_string(),
                references: entry.references,
            }),
            Some(_) => {
                entries.remove(name);
                Ok(())
            }
        }
    }
}

fn snapshot_entry(entry: &EndpointEntry) -> Endpoint {
    Endpoint {
        descriptor: entry.descriptor.clone(),
        health: entry.health,
        counters: entry.counters.snapshot(),
    }
}

#[derive(Debug, Error)]
pub enum EndpointRegistryError {
    #[error("endpoint `{endpoint}` is already registered")]
    Duplicate { endpoint: String },
    #[error("endpoint `{endpoint}` is not registered")]
    NotFound { endpoint: String },
    #[error("endpoint `{endpoint}` is referenced by {references} route(s)/flow(s)")]
    StillReferenced { endpoint: String, references: usize },
}
