//! Authoritative map from [`TunnelKey`] to tunnel state.
//!
//! The registry does no I/O. Each entry carries a generation number; a
//! transition only applies when the caller presents the generation it was
//! handed, which keeps a retried or removed tunnel from being overwritten by
//! a stale attempt or a late health check.

use super::key::TunnelKey;
use super::supervisor::ProcessId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, watch};

const EVENT_CAPACITY: usize = 256;

/// Tunnel state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Snapshot of one tunnel
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelEntry {
    pub key: TunnelKey,
    pub project: String,
    pub zone: String,
    pub status: TunnelStatus,
    pub local_port: Option<u16>,
    pub remote_port: u16,
    pub created_at: Option<i64>,
    pub last_health_check: Option<i64>,
    pub error: Option<String>,
    #[serde(skip)]
    pub process: Option<ProcessId>,
    #[serde(skip)]
    pub generation: u64,
}

impl TunnelEntry {
    fn connecting(key: TunnelKey, project: &str, zone: &str, generation: u64) -> Self {
        Self {
            remote_port: key.remote_port(),
            key,
            project: project.to_string(),
            zone: zone.to_string(),
            status: TunnelStatus::Connecting,
            local_port: None,
            created_at: Some(chrono::Utc::now().timestamp()),
            last_health_check: None,
            error: None,
            process: None,
            generation,
        }
    }
}

/// Published on every transition. `entry` is `None` once the tunnel is removed.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelEvent {
    pub key: TunnelKey,
    pub status: TunnelStatus,
    pub entry: Option<TunnelEntry>,
}

/// Outcome of [`TunnelRegistry::begin_connect`]
#[derive(Debug)]
pub enum ConnectTicket {
    /// The caller owns this attempt and must spawn, then report back with `generation`.
    Fresh {
        generation: u64,
        previous_process: Option<ProcessId>,
    },
    /// Another attempt is in flight; watch it for the outcome.
    InFlight(watch::Receiver<TunnelEntry>),
    /// Already connected.
    Ready(TunnelEntry),
}

struct Slot {
    entry: TunnelEntry,
    watch: watch::Sender<TunnelEntry>,
}

/// Tunnel registry owned by the composition root
pub struct TunnelRegistry {
    entries: DashMap<TunnelKey, Slot>,
    events: broadcast::Sender<TunnelEvent>,
    next_generation: AtomicU64,
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            entries: DashMap::new(),
            events,
            next_generation: AtomicU64::new(0),
        }
    }

    /// Subscribe to transition events
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events.subscribe()
    }

    fn publish(&self, key: &TunnelKey, entry: Option<TunnelEntry>) {
        let status = entry
            .as_ref()
            .map(|e| e.status)
            .unwrap_or(TunnelStatus::Disconnected);
        // No subscribers is fine
        let _ = self.events.send(TunnelEvent {
            key: key.clone(),
            status,
            entry,
        });
    }

    /// Claim the right to connect `key`.
    ///
    /// At most one attempt per key is in flight: a Connecting entry hands back a
    /// watcher, a Connected entry is returned as is, and only an absent or
    /// Error entry yields a [`ConnectTicket::Fresh`].
    pub fn begin_connect(&self, key: &TunnelKey, project: &str, zone: &str) -> ConnectTicket {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;

        let (ticket, snapshot) = match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                match slot.entry.status {
                    TunnelStatus::Connecting => return ConnectTicket::InFlight(slot.watch.subscribe()),
                    TunnelStatus::Connected => return ConnectTicket::Ready(slot.entry.clone()),
                    TunnelStatus::Error | TunnelStatus::Disconnected => {
                        let previous_process = slot.entry.process.take();
                        let mut entry = TunnelEntry::connecting(key.clone(), project, zone, generation);
                        entry.created_at = slot.entry.created_at.or(entry.created_at);
                        slot.entry = entry;
                        slot.watch.send_replace(slot.entry.clone());
                        (
                            ConnectTicket::Fresh {
                                generation,
                                previous_process,
                            },
                            slot.entry.clone(),
                        )
                    }
                }
            }
            Entry::Vacant(vacant) => {
                let entry = TunnelEntry::connecting(key.clone(), project, zone, generation);
                let (watch, _) = watch::channel(entry.clone());
                vacant.insert(Slot {
                    entry: entry.clone(),
                    watch,
                });
                (
                    ConnectTicket::Fresh {
                        generation,
                        previous_process: None,
                    },
                    entry,
                )
            }
        };

        tracing::debug!(key = %key, generation, "Tunnel entering Connecting");
        self.publish(key, Some(snapshot));
        ticket
    }

    /// Apply `change` if the entry still belongs to `generation` and is in `expected`.
    fn transition<F>(&self, key: &TunnelKey, generation: u64, expected: TunnelStatus, change: F) -> Option<TunnelEntry>
    where
        F: FnOnce(&mut TunnelEntry),
    {
        let snapshot = {
            let mut slot = self.entries.get_mut(key)?;
            if slot.entry.generation != generation {
                tracing::debug!(key = %key, generation, current = slot.entry.generation, "Discarding stale transition");
                return None;
            }
            if expected == TunnelStatus::Connected && slot.entry.status == TunnelStatus::Error {
                // Another health check already failed this generation.
                tracing::debug!(key = %key, generation, "Tunnel already marked unhealthy");
                return None;
            }
            if slot.entry.status != expected {
                tracing::error!(
                    key = %key,
                    generation,
                    expected = ?expected,
                    actual = ?slot.entry.status,
                    "Registry invariant violated: transition from unexpected state"
                );
                return None;
            }
            change(&mut slot.entry);
            slot.watch.send_replace(slot.entry.clone());
            slot.entry.clone()
        };
        self.publish(key, Some(snapshot.clone()));
        Some(snapshot)
    }

    /// Connecting → Connected. Returns false if the attempt is stale (entry removed or retried).
    pub fn mark_connected(&self, key: &TunnelKey, generation: u64, local_port: u16, process: ProcessId) -> bool {
        self.transition(key, generation, TunnelStatus::Connecting, |entry| {
            entry.status = TunnelStatus::Connected;
            entry.local_port = Some(local_port);
            entry.process = Some(process);
            entry.error = None;
            entry.last_health_check = Some(chrono::Utc::now().timestamp());
        })
        .is_some()
    }

    /// Connecting → Error
    pub fn mark_failed(&self, key: &TunnelKey, generation: u64, error: impl Into<String>) -> bool {
        let error = error.into();
        self.transition(key, generation, TunnelStatus::Connecting, |entry| {
            entry.status = TunnelStatus::Error;
            entry.error = Some(error);
        })
        .is_some()
    }

    /// Connected → Error after a failed health check. The process reference is
    /// kept so a retry or disconnect can still reap it.
    pub fn mark_unhealthy(&self, key: &TunnelKey, generation: u64, cause: impl Into<String>) -> Option<TunnelEntry> {
        let cause = cause.into();
        self.transition(key, generation, TunnelStatus::Connected, |entry| {
            entry.status = TunnelStatus::Error;
            entry.error = Some(cause);
            entry.last_health_check = Some(chrono::Utc::now().timestamp());
        })
    }

    /// Stamp a passing health check. Silent, no event is published.
    pub fn record_health_check(&self, key: &TunnelKey, generation: u64) {
        if let Some(mut slot) = self.entries.get_mut(key) {
            if slot.entry.generation == generation && slot.entry.status == TunnelStatus::Connected {
                slot.entry.last_health_check = Some(chrono::Utc::now().timestamp());
            }
        }
    }

    /// Remove an entry. Any watcher of an in-flight attempt sees its channel close.
    pub fn remove(&self, key: &TunnelKey) -> Option<TunnelEntry> {
        let removed = self.entries.remove(key).map(|(_, slot)| slot.entry);
        if removed.is_some() {
            self.publish(key, None);
        }
        removed
    }

    /// Remove every entry (shutdown)
    pub fn drain(&self) -> Vec<TunnelEntry> {
        let keys: Vec<TunnelKey> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.iter().filter_map(|k| self.remove(k)).collect()
    }

    pub fn get(&self, key: &TunnelKey) -> Option<TunnelEntry> {
        self.entries.get(key).map(|slot| slot.entry.clone())
    }

    /// Status of `key`; absence means Disconnected
    pub fn status(&self, key: &TunnelKey) -> TunnelStatus {
        self.get(key)
            .map(|e| e.status)
            .unwrap_or(TunnelStatus::Disconnected)
    }

    /// Snapshot of entries whose target starts with `target_prefix`
    pub fn list(&self, target_prefix: Option<&str>) -> Vec<TunnelEntry> {
        let mut entries: Vec<TunnelEntry> = self
            .entries
            .iter()
            .filter(|slot| {
                target_prefix
                    .map(|prefix| slot.key().target().starts_with(prefix))
                    .unwrap_or(true)
            })
            .map(|slot| slot.entry.clone())
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    /// Snapshot of Connected entries
    pub fn connected(&self) -> Vec<TunnelEntry> {
        self.entries
            .iter()
            .filter(|slot| slot.entry.status == TunnelStatus::Connected)
            .map(|slot| slot.entry.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(target: &str, port: u16) -> TunnelKey {
        TunnelKey::new(target, port)
    }

    fn fresh_generation(ticket: ConnectTicket) -> u64 {
        match ticket {
            ConnectTicket::Fresh { generation, .. } => generation,
            other => panic!("expected fresh ticket, got {:?}", other),
        }
    }

    #[test]
    fn test_second_connect_is_in_flight() {
        let registry = TunnelRegistry::new();
        let k = key("vm-a", 22);
        fresh_generation(registry.begin_connect(&k, "my-project", "us-central1-a"));
        assert!(matches!(
            registry.begin_connect(&k, "my-project", "us-central1-a"),
            ConnectTicket::InFlight(_)
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_connected_entry_is_returned() {
        let registry = TunnelRegistry::new();
        let k = key("vm-a", 22);
        let gen = fresh_generation(registry.begin_connect(&k, "my-project", "us-central1-a"));
        assert!(registry.mark_connected(&k, gen, 40001, ProcessId::new()));

        match registry.begin_connect(&k, "my-project", "us-central1-a") {
            ConnectTicket::Ready(entry) => assert_eq!(entry.local_port, Some(40001)),
            other => panic!("expected ready, got {:?}", other),
        }
    }

    #[test]
    fn test_failure_lands_in_error_with_message() {
        let registry = TunnelRegistry::new();
        let k = key("vm-a", 3389);
        let gen = fresh_generation(registry.begin_connect(&k, "my-project", "us-central1-a"));
        assert!(registry.mark_failed(&k, gen, "spawn failed"));

        let entry = registry.get(&k).unwrap();
        assert_eq!(entry.status, TunnelStatus::Error);
        assert_eq!(entry.error.as_deref(), Some("spawn failed"));
        assert_eq!(entry.local_port, None);
    }

    #[test]
    fn test_retry_from_error_hands_back_previous_process() {
        let registry = TunnelRegistry::new();
        let k = key("vm-a", 22);
        let process = ProcessId::new();
        let gen = fresh_generation(registry.begin_connect(&k, "my-project", "us-central1-a"));
        registry.mark_connected(&k, gen, 40002, process);
        registry.mark_unhealthy(&k, gen, "port closed").unwrap();

        match registry.begin_connect(&k, "my-project", "us-central1-a") {
            ConnectTicket::Fresh {
                generation,
                previous_process,
            } => {
                assert!(generation > gen);
                assert_eq!(previous_process, Some(process));
            }
            other => panic!("expected fresh, got {:?}", other),
        }
        assert_eq!(registry.status(&k), TunnelStatus::Connecting);
    }

    #[test]
    fn test_stale_generation_is_discarded() {
        let registry = TunnelRegistry::new();
        let k = key("vm-a", 22);
        let gen = fresh_generation(registry.begin_connect(&k, "my-project", "us-central1-a"));
        registry.remove(&k);
        assert!(!registry.mark_connected(&k, gen, 40003, ProcessId::new()));
        assert!(registry.get(&k).is_none());
    }

    #[test]
    fn test_unhealthy_after_removal_does_not_resurrect() {
        let registry = TunnelRegistry::new();
        let k = key("vm-a", 22);
        let gen = fresh_generation(registry.begin_connect(&k, "my-project", "us-central1-a"));
        registry.mark_connected(&k, gen, 40004, ProcessId::new());
        registry.remove(&k);
        assert!(registry.mark_unhealthy(&k, gen, "process exited").is_none());
        assert!(registry.get(&k).is_none());
        assert_eq!(registry.status(&k), TunnelStatus::Disconnected);
    }

    #[test]
    fn test_concurrent_unhealthy_reports_fail_once() {
        let registry = TunnelRegistry::new();
        let mut events = registry.subscribe();
        let k = key("vm-a", 22);
        let gen = fresh_generation(registry.begin_connect(&k, "my-project", "us-central1-a"));
        registry.mark_connected(&k, gen, 40005, ProcessId::new());

        assert!(registry.mark_unhealthy(&k, gen, "port closed").is_some());
        assert!(registry.mark_unhealthy(&k, gen, "process exited").is_none());

        let entry = registry.get(&k).unwrap();
        assert_eq!(entry.status, TunnelStatus::Error);
        assert_eq!(entry.error.as_deref(), Some("port closed"));

        let mut errors = 0;
        while let Ok(event) = events.try_recv() {
            if event.status == TunnelStatus::Error {
                errors += 1;
            }
        }
        assert_eq!(errors, 1);
    }

    #[test]
    fn test_independent_ports_per_target() {
        let registry = TunnelRegistry::new();
        let rdp = key("vm-a", 3389);
        let ssh = key("vm-a", 22);
        fresh_generation(registry.begin_connect(&rdp, "my-project", "us-central1-a"));
        fresh_generation(registry.begin_connect(&ssh, "my-project", "us-central1-a"));
        assert_eq!(registry.len(), 2);

        registry.remove(&rdp);
        assert!(registry.get(&ssh).is_some());
    }

    #[test]
    fn test_list_is_prefix_filtered_snapshot() {
        let registry = TunnelRegistry::new();
        registry.begin_connect(&key("vm-a", 22), "my-project", "us-central1-a");
        registry.begin_connect(&key("vm-b", 22), "my-project", "us-central1-a");
        registry.begin_connect(&key("db-1", 5432), "my-project", "us-central1-a");

        let vms = registry.list(Some("vm-"));
        assert_eq!(vms.len(), 2);
        assert_eq!(vms[0].key.to_string(), "vm-a:22");

        registry.remove(&key("vm-a", 22));
        assert_eq!(vms.len(), 2);
        assert_eq!(registry.list(None).len(), 2);
    }

    #[tokio::test]
    async fn test_events_published_on_transitions() {
        let registry = TunnelRegistry::new();
        let mut events = registry.subscribe();
        let k = key("vm-a", 22);
        let gen = fresh_generation(registry.begin_connect(&k, "my-project", "us-central1-a"));
        registry.mark_connected(&k, gen, 40005, ProcessId::new());
        registry.remove(&k);

        assert_eq!(events.recv().await.unwrap().status, TunnelStatus::Connecting);
        assert_eq!(events.recv().await.unwrap().status, TunnelStatus::Connected);
        let removed = events.recv().await.unwrap();
        assert_eq!(removed.status, TunnelStatus::Disconnected);
        assert!(removed.entry.is_none());
    }

    #[tokio::test]
    async fn test_in_flight_watcher_sees_outcome() {
        let registry = TunnelRegistry::new();
        let k = key("vm-a", 22);
        let gen = fresh_generation(registry.begin_connect(&k, "my-project", "us-central1-a"));
        let mut rx = match registry.begin_connect(&k, "my-project", "us-central1-a") {
            ConnectTicket::InFlight(rx) => rx,
            other => panic!("expected in-flight, got {:?}", other),
        };
        registry.mark_connected(&k, gen, 40006, ProcessId::new());
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().local_port, Some(40006));
    }
}
