//! Per-owner window cache.
//!
//! Every owning process gets its own lock, so discovery for one application
//! never waits on another. Records are stored by [`WindowSlot`], which makes
//! "at most one record per window id" a structural property rather than a
//! convention callers have to uphold.

use crate::types::{OwnerId, WindowKey, WindowRecord, WindowSlot};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::trace;

/// Result of merging a record into the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Updated,
}

/// The windows of a single owner, as seen inside [`OwnerWindowCache::mutate`]
#[derive(Debug, Default, Clone)]
pub struct OwnerWindows {
    records: BTreeMap<WindowSlot, WindowRecord>,
}

impl OwnerWindows {
    pub fn get(&self, slot: &WindowSlot) -> Option<&WindowRecord> {
        self.records.get(slot)
    }

    pub fn get_mut(&mut self, slot: &WindowSlot) -> Option<&mut WindowRecord> {
        self.records.get_mut(slot)
    }

    /// Insert or replace by slot
    pub fn insert(&mut self, record: WindowRecord) -> Option<WindowRecord> {
        self.records.insert(record.slot, record)
    }

    pub fn remove(&mut self, slot: &WindowSlot) -> Option<WindowRecord> {
        self.records.remove(slot)
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&WindowRecord) -> bool) {
        self.records.retain(|_, record| keep(record));
    }

    pub fn iter(&self) -> impl Iterator<Item = &WindowRecord> {
        self.records.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut WindowRecord> {
        self.records.values_mut()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records for real windows, i.e. everything but the windowless placeholder
    pub fn real_count(&self) -> usize {
        self.records.keys().filter(|slot| **slot != WindowSlot::Windowless).count()
    }

    /// Merge a freshly discovered record into the existing one with the same
    /// identity, or insert it.
    ///
    /// Identity is the live accessibility element when both sides carry one,
    /// otherwise the slot. When the same element shows up under a new slot
    /// the old entry is folded into the new one.
    pub fn upsert(&mut self, fresh: WindowRecord) -> Upsert {
        let moved_from = fresh.ax.as_ref().and_then(|fresh_ax| {
            self.records
                .iter()
                .find(|(slot, existing)| {
                    **slot != fresh.slot
                        && existing
                            .ax
                            .as_ref()
                            .is_some_and(|ax| ax.same_live_element(fresh_ax))
                })
                .map(|(slot, _)| *slot)
        });

        if let Some(old_slot) = moved_from {
            if let Some(mut existing) = self.records.remove(&old_slot) {
                trace!(
                    "Window element moved from slot {} to {}",
                    old_slot,
                    fresh.slot
                );
                existing.slot = fresh.slot;
                existing.absorb(fresh);
                self.records.insert(existing.slot, existing);
                return Upsert::Updated;
            }
        }

        match self.records.get_mut(&fresh.slot) {
            Some(existing) => {
                existing.absorb(fresh);
                Upsert::Updated
            }
            None => {
                self.records.insert(fresh.slot, fresh);
                Upsert::Inserted
            }
        }
    }
}

/// Thread-safe cache of window records, grouped by owning process
#[derive(Debug, Default)]
pub struct OwnerWindowCache {
    owners: RwLock<HashMap<OwnerId, Arc<Mutex<OwnerWindows>>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl OwnerWindowCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, owner: OwnerId) -> Option<Arc<Mutex<OwnerWindows>>> {
        self.owners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&owner)
            .cloned()
    }

    fn entry_or_create(&self, owner: OwnerId) -> Arc<Mutex<OwnerWindows>> {
        if let Some(entry) = self.entry(owner) {
            return entry;
        }
        self.owners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(owner)
            .or_default()
            .clone()
    }

    /// All records of an owner, ordered by slot
    pub fn read(&self, owner: OwnerId) -> Vec<WindowRecord> {
        match self.entry(owner) {
            Some(entry) => {
                let windows = lock(&entry);
                windows.iter().cloned().collect()
            }
            None => Vec::new(),
        }
    }

    pub fn get(&self, key: &WindowKey) -> Option<WindowRecord> {
        let entry = self.entry(key.owner)?;
        let windows = lock(&entry);
        windows.get(&key.slot).cloned()
    }

    /// Replace an owner's records wholesale. Later records win over earlier
    /// ones with the same slot.
    pub fn write(&self, owner: OwnerId, records: Vec<WindowRecord>) {
        let mut windows = OwnerWindows::default();
        for mut record in records {
            record.owner = owner;
            windows.insert(record);
        }
        let entry = self.entry_or_create(owner);
        *lock(&entry) = windows;
    }

    /// Atomic read-modify-write of one owner's records
    pub fn mutate<R>(&self, owner: OwnerId, f: impl FnOnce(&mut OwnerWindows) -> R) -> R {
        let entry = self.entry_or_create(owner);
        let mut windows = lock(&entry);
        f(&mut windows)
    }

    pub fn upsert(&self, record: WindowRecord) -> Upsert {
        self.mutate(record.owner, |windows| windows.upsert(record))
    }

    pub fn remove_entry(&self, owner: OwnerId, slot: WindowSlot) -> Option<WindowRecord> {
        let entry = self.entry(owner)?;
        let removed = lock(&entry).remove(&slot);
        removed
    }

    /// Forget an owner entirely
    pub fn remove_owner(&self, owner: OwnerId) -> usize {
        let removed = self
            .owners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&owner);
        match removed {
            Some(entry) => {
                let windows = lock(&entry);
                windows.len()
            }
            None => 0,
        }
    }

    /// Owners that currently have an entry, in ascending order
    pub fn owners(&self) -> Vec<OwnerId> {
        let mut owners: Vec<_> = self
            .owners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        owners.sort_unstable();
        owners
    }

    /// Record that the UI looked at a window
    pub fn touch(&self, key: &WindowKey) -> bool {
        let Some(entry) = self.entry(key.owner) else {
            return false;
        };
        let mut windows = lock(&entry);
        match windows.get_mut(&key.slot) {
            Some(record) => {
                record.last_accessed_at = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Read-only snapshot for the UI, ordered by owner, then creation time,
    /// then window id
    pub fn snapshot(&self, owner: Option<OwnerId>) -> Vec<WindowRecord> {
        let owners = match owner {
            Some(owner) => vec![owner],
            None => self.owners(),
        };

        let mut records: Vec<WindowRecord> = owners
            .into_iter()
            .flat_map(|owner| self.read(owner))
            .collect();
        records.sort_by(|a, b| {
            a.owner
                .cmp(&b.owner)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.slot.cmp(&b.slot))
        });
        records
    }

    /// Total number of records across all owners
    pub fn len(&self) -> usize {
        let entries: Vec<_> = self
            .owners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        entries
            .iter()
            .map(|entry| {
                let windows = lock(entry);
                windows.len()
            })
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
