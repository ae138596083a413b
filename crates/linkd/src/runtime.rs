//! Desired-state store and host runtime seam.
//!
//! The reconciler reads declared items, holds a finalizer on every item it
//! manages, bumps refresh counters for subsystems that cannot watch the
//! kernel themselves, and reports healthy cycles. [`MemoryRuntime`] is the
//! in-process implementation used by the daemon and the tests.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::spec::LinkSpec;

/// Lifecycle phase of a declared item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Phase {
    #[default]
    Running,
    /// Deletion requested; the item goes away once its finalizers are gone.
    TearingDown,
}

/// A declared link as held by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkItem {
    pub phase: Phase,
    pub spec: LinkSpec,
}

impl LinkItem {
    pub fn running(spec: LinkSpec) -> Self {
        Self {
            phase: Phase::Running,
            spec,
        }
    }

    /// Store key; the link name.
    pub fn id(&self) -> &str {
        &self.spec.name
    }
}

/// Generation counter telling downstream consumers to re-read state the
/// kernel does not announce (wireguard configuration).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkRefresh {
    pub generation: u64,
}

impl LinkRefresh {
    pub fn bump(&mut self) {
        self.generation = self.generation.wrapping_add(1);
    }
}

/// Desired-state store and host runtime used by the reconciler.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Declared items in a stable order.
    async fn list(&self) -> Result<Vec<LinkItem>>;

    /// Attach `owner`'s finalizer to item `id`. Idempotent.
    async fn add_finalizer(&self, id: &str, owner: &str) -> Result<()>;

    /// Release `owner`'s finalizer. Idempotent, also for unknown items.
    async fn remove_finalizer(&self, id: &str, owner: &str) -> Result<()>;

    /// Create or update the refresh counter under `key`.
    async fn modify_refresh(
        &self,
        key: &str,
        mutate: &(dyn for<'a> Fn(&'a mut LinkRefresh) + Send + Sync),
    ) -> Result<()>;

    /// Report a fully successful cycle.
    fn reset_restart_backoff(&self);
}

/// Exponential restart backoff.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            current: initial,
        }
    }

    /// Delay before the next restart; doubles up to the maximum.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}

#[derive(Debug)]
struct Entry {
    item: LinkItem,
    finalizers: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct State {
    entries: Vec<Entry>,
    refresh: HashMap<String, LinkRefresh>,
}

impl State {
    fn entry_mut(&mut self, id: &str) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|e| e.item.id() == id)
    }
}

/// In-memory store.
///
/// Items keep insertion order. A TearingDown item is dropped once its last
/// finalizer is released. Declaration changes are published on a watch
/// channel (see [`MemoryRuntime::subscribe`]); finalizer and refresh updates
/// are not, so the reconciler does not wake itself.
#[derive(Debug)]
pub struct MemoryRuntime {
    state: Mutex<State>,
    revision: watch::Sender<u64>,
    backoff: Mutex<Backoff>,
    healthy_cycles: Mutex<u64>,
}

impl Default for MemoryRuntime {
    fn default() -> Self {
        Self::new(Backoff::default())
    }
}

impl MemoryRuntime {
    pub fn new(backoff: Backoff) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            state: Mutex::new(State::default()),
            revision,
            backoff: Mutex::new(backoff),
            healthy_cycles: Mutex::new(0),
        }
    }

    pub fn with_specs(specs: impl IntoIterator<Item = LinkSpec>) -> Self {
        let runtime = Self::default();
        for spec in specs {
            runtime.upsert(spec);
        }
        runtime
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }

    /// Declaration revisions; changes whenever an item is added, changed or
    /// marked for teardown.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    /// Insert or update a Running item. Finalizers are kept; an item being
    /// torn down is revived.
    pub fn upsert(&self, spec: LinkSpec) {
        let mut state = self.state();
        match state.entry_mut(&spec.name) {
            Some(entry) => {
                if entry.item.phase == Phase::Running && entry.item.spec == spec {
                    return;
                }
                entry.item = LinkItem::running(spec);
            }
            None => state.entries.push(Entry {
                item: LinkItem::running(spec),
                finalizers: BTreeSet::new(),
            }),
        }
        drop(state);
        self.publish();
    }

    /// Request deletion of an item. Returns false if it is unknown.
    ///
    /// An item nobody holds a finalizer on is removed right away.
    pub fn teardown(&self, id: &str) -> bool {
        let mut state = self.state();
        let Some(pos) = state.entries.iter().position(|e| e.item.id() == id) else {
            return false;
        };
        if state.entries[pos].finalizers.is_empty() {
            state.entries.remove(pos);
        } else if state.entries[pos].item.phase == Phase::TearingDown {
            return true;
        } else {
            state.entries[pos].item.phase = Phase::TearingDown;
        }
        drop(state);
        self.publish();
        true
    }

    /// Make the declared set equal to `specs`: upsert each, tear down the
    /// rest. Returns the names being torn down.
    pub fn replace_all(&self, specs: Vec<LinkSpec>) -> Vec<String> {
        let keep: BTreeSet<String> = specs.iter().map(|s| s.name.clone()).collect();
        let stale: Vec<String> = self
            .state()
            .entries
            .iter()
            .filter(|e| !keep.contains(e.item.id()) && e.item.phase == Phase::Running)
            .map(|e| e.item.id().to_string())
            .collect();

        for spec in specs {
            self.upsert(spec);
        }
        for id in &stale {
            self.teardown(id);
        }
        stale
    }

    pub fn get(&self, id: &str) -> Option<LinkItem> {
        self.state()
            .entries
            .iter()
            .find(|e| e.item.id() == id)
            .map(|e| e.item.clone())
    }

    pub fn finalizers(&self, id: &str) -> Vec<String> {
        self.state()
            .entries
            .iter()
            .find(|e| e.item.id() == id)
            .map(|e| e.finalizers.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn refresh(&self, key: &str) -> Option<LinkRefresh> {
        self.state().refresh.get(key).copied()
    }

    pub fn healthy_cycles(&self) -> u64 {
        *self
            .healthy_cycles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Delay before restarting after a failed cycle.
    pub fn next_backoff(&self) -> Duration {
        self.backoff
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .next_delay()
    }
}

#[async_trait]
impl Runtime for MemoryRuntime {
    async fn list(&self) -> Result<Vec<LinkItem>> {
        Ok(self.state().entries.iter().map(|e| e.item.clone()).collect())
    }

    async fn add_finalizer(&self, id: &str, owner: &str) -> Result<()> {
        let mut state = self.state();
        let entry = state
            .entry_mut(id)
            .ok_or_else(|| Error::Store(format!("no such item: {id}")))?;
        entry.finalizers.insert(owner.to_string());
        Ok(())
    }

    async fn remove_finalizer(&self, id: &str, owner: &str) -> Result<()> {
        let mut state = self.state();
        let Some(pos) = state.entries.iter().position(|e| e.item.id() == id) else {
            return Ok(());
        };
        let entry = &mut state.entries[pos];
        entry.finalizers.remove(owner);
        if entry.item.phase == Phase::TearingDown && entry.finalizers.is_empty() {
            state.entries.remove(pos);
        }
        Ok(())
    }

    async fn modify_refresh(
        &self,
        key: &str,
        mutate: &(dyn for<'a> Fn(&'a mut LinkRefresh) + Send + Sync),
    ) -> Result<()> {
        let mut state = self.state();
        mutate(state.refresh.entry(key.to_string()).or_default());
        Ok(())
    }

    fn reset_restart_backoff(&self) {
        self.backoff
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .reset();
        *self
            .healthy_cycles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) += 1;
    }
}
