// SPDX-License-Identifier: Apache-2.0

//! Processor registry (spec.md §4.4): external workers register under
//! {family name, version, namespaces}; selection is round-robin within a
//! bucket; missed heartbeats unregister the worker. Read-mostly; mutations
//! take a short write lock (spec.md §5).

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub type ProcessorId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FamilyKey {
    pub family: String,
    pub version: String,
}

struct Registration {
    namespaces: Vec<String>,
    last_heartbeat: Instant,
}

struct Bucket {
    workers: Vec<ProcessorId>,
    next: usize,
}

impl Default for Bucket {
    fn default() -> Self {
        Bucket {
            workers: Vec::new(),
            next: 0,
        }
    }
}

struct State {
    registrations: HashMap<ProcessorId, (FamilyKey, Registration)>,
    buckets: HashMap<FamilyKey, Bucket>,
}

/// Tracks connected transaction processors and performs round-robin
/// selection within a {family, version} bucket.
pub struct ProcessorRegistry {
    state: RwLock<State>,
    next_id: AtomicU64,
    heartbeat_timeout: Duration,
}

impl ProcessorRegistry {
    pub fn new(heartbeat_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(State {
                registrations: HashMap::new(),
                buckets: HashMap::new(),
            }),
            next_id: AtomicU64::new(1),
            heartbeat_timeout,
        })
    }

    pub fn register(&self, family: impl Into<String>, version: impl Into<String>, namespaces: Vec<String>) -> ProcessorId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let key = FamilyKey {
            family: family.into(),
            version: version.into(),
        };
        let mut state = self.state.write();
        state.registrations.insert(
            id,
            (
                key.clone(),
                Registration {
                    namespaces,
                    last_heartbeat: Instant::now(),
                },
            ),
        );
        state.buckets.entry(key.clone()).or_default().workers.push(id);
        ledger_metrics::PROCESSOR_REGISTRY_SIZE
            .with_label_values(&[&key.family, &key.version])
            .inc();
        info!(processor_id = id, family = %key.family, version = %key.version, "processor registered");
        id
    }

    pub fn unregister(&self, id: ProcessorId) {
        let mut state = self.state.write();
        if let Some((key, _)) = state.registrations.remove(&id) {
            if let Some(bucket) = state.buckets.get_mut(&key) {
                bucket.workers.retain(|&w| w != id);
            }
            ledger_metrics::PROCESSOR_REGISTRY_SIZE
                .with_label_values(&[&key.family, &key.version])
                .dec();
            info!(processor_id = id, "processor unregistered");
        }
    }

    pub fn heartbeat(&self, id: ProcessorId) {
        let mut state = self.state.write();
        if let Some((_, registration)) = state.registrations.get_mut(&id) {
            registration.last_heartbeat = Instant::now();
        }
    }

    /// Selects the next healthy worker for `key`, round-robin. `None` if
    /// no worker is currently registered for that family/version.
    pub fn select(&self, key: &FamilyKey) -> Option<ProcessorId> {
        let mut state = self.state.write();
        let bucket = state.buckets.get_mut(key)?;
        if bucket.workers.is_empty() {
            return None;
        }
        bucket.next %= bucket.workers.len();
        let chosen = bucket.workers[bucket.next];
        bucket.next = (bucket.next + 1) % bucket.workers.len();
        Some(chosen)
    }

    /// Removes every registration whose last heartbeat is older than the
    /// configured timeout. Intended to be driven by a periodic
    /// `tokio::time::interval` sweep at startup.
    pub fn sweep_expired(&self) -> Vec<ProcessorId> {
        let now = Instant::now();
        let expired: Vec<ProcessorId> = {
            let state = self.state.read();
            state
                .registrations
                .iter()
                .filter(|(_, (_, r))| now.duration_since(r.last_heartbeat) > self.heartbeat_timeout)
                .map(|(id, _)| *id)
                .collect()
        };
        for id in &expired {
            warn!(processor_id = id, "processor missed heartbeat deadline, unregistering");
            self.unregister(*id);
        }
        expired
    }

    pub fn is_registered(&self, id: ProcessorId) -> bool {
        self.state.read().registrations.contains_key(&id)
    }
}

/// Spawns the background heartbeat sweep task. The returned handle aborts
/// the task on drop.
pub fn spawn_heartbeat_sweep(registry: Arc<ProcessorRegistry>, period: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            registry.sweep_expired();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> FamilyKey {
        FamilyKey {
            family: "intkey".into(),
            version: "1.0".into(),
        }
    }

    #[test]
    fn select_round_robins_across_registered_workers() {
        let registry = ProcessorRegistry::new(Duration::from_secs(30));
        let a = registry.register("intkey", "1.0", vec!["aabbcc".into()]);
        let b = registry.register("intkey", "1.0", vec!["aabbcc".into()]);
        assert_eq!(registry.select(&key()), Some(a));
        assert_eq!(registry.select(&key()), Some(b));
        assert_eq!(registry.select(&key()), Some(a));
    }

    #[test]
    fn select_returns_none_for_unknown_family() {
        let registry = ProcessorRegistry::new(Duration::from_secs(30));
        assert_eq!(registry.select(&key()), None);
    }

    #[test]
    fn unregister_removes_worker_from_its_bucket() {
        let registry = ProcessorRegistry::new(Duration::from_secs(30));
        let a = registry.register("intkey", "1.0", vec![]);
        registry.unregister(a);
        assert_eq!(registry.select(&key()), None);
        assert!(!registry.is_registered(a));
    }

    #[test]
    fn sweep_expired_drops_stale_registrations() {
        let registry = ProcessorRegistry::new(Duration::from_millis(0));
        let a = registry.register("intkey", "1.0", vec![]);
        std::thread::sleep(Duration::from_millis(5));
        let expired = registry.sweep_expired();
        assert_eq!(expired, vec![a]);
        assert!(!registry.is_registered(a));
    }
}
