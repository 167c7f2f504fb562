//! In-memory index of the record log, built once at open.

use alloc::collections::{BTreeMap, btree_map};
use alloc::string::String;
use alloc::vec::Vec;

use crate::guid::Guid;
use crate::marker::RecordState;
use crate::variable::attributes::Attributes;

/// Unique key of a variable.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VariableKey {
    /// Namespace id.
    pub namespace: Guid,
    /// Name.
    pub name: String,
}

impl VariableKey {
    /// Build a key.
    pub fn new(namespace: Guid, name: &str) -> Self {
        Self {
            namespace,
            name: String::from(name),
        }
    }
}

/// Where a key's current record lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Offset of the record from the start of the store region.
    pub offset: u32,
    /// State as last read or programmed.
    pub state: RecordState,
    /// Stored attributes.
    pub attributes: Attributes,
    /// Offset of the value from the start of the record.
    pub value_offset: u32,
    /// Value length.
    pub value_len: u32,
    /// Record size including padding.
    pub size: u32,
}

#[derive(Debug, Clone)]
struct Slot {
    live: IndexEntry,
    // Older in-deleted-transition records of the same key.
    shadows: Vec<u32>,
}

/// Maps keys to their live record, and keeps store order for enumeration.
#[derive(Debug, Default)]
pub struct VariableIndex {
    slots: BTreeMap<VariableKey, Slot>,
    order: BTreeMap<u32, VariableKey>,
    live_bytes: u32,
}

impl VariableIndex {
    /// Empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no key is live.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Bytes taken by live records.
    pub fn live_bytes(&self) -> u32 {
        self.live_bytes
    }

    /// The live record of `key`.
    pub fn get(&self, key: &VariableKey) -> Option<&IndexEntry> {
        self.slots.get(key).map(|slot| &slot.live)
    }

    /// Offsets of superseded records of `key` still in `in-deleted-transition`.
    pub fn shadows(&self, key: &VariableKey) -> &[u32] {
        self.slots
            .get(key)
            .map(|slot| slot.shadows.as_slice())
            .unwrap_or(&[])
    }

    /// Feed a record found while scanning the log, oldest first.
    ///
    /// An `added` record always wins. Among `in-deleted-transition` records
    /// without an `added` one, the newest is served: it is what an
    /// interrupted update left behind.
    pub fn observe(&mut self, key: VariableKey, entry: IndexEntry) {
        match entry.state {
            RecordState::Added | RecordState::InDeletedTransition => {}
            _ => return,
        }
        let Some(slot) = self.slots.get_mut(&key) else {
            self.insert_new(key, entry);
            return;
        };
        let keep_current =
            slot.live.state == RecordState::Added && entry.state == RecordState::InDeletedTransition;
        if keep_current {
            slot.shadows.push(entry.offset);
            return;
        }
        let previous = core::mem::replace(&mut slot.live, entry);
        slot.shadows.push(previous.offset);
        self.order.remove(&previous.offset);
        self.order.insert(entry.offset, key);
        self.live_bytes = self.live_bytes - previous.size + entry.size;
    }

    /// Record that `key` now lives at `entry`, its former live record having
    /// been downgraded to `in-deleted-transition` and older shadows deleted.
    pub fn replace(&mut self, key: VariableKey, entry: IndexEntry) {
        let Some(slot) = self.slots.get_mut(&key) else {
            self.insert_new(key, entry);
            return;
        };
        let previous = core::mem::replace(&mut slot.live, entry);
        slot.shadows.clear();
        slot.shadows.push(previous.offset);
        self.order.remove(&previous.offset);
        self.order.insert(entry.offset, key);
        self.live_bytes = self.live_bytes - previous.size + entry.size;
    }

    /// Update the state of the live record of `key`.
    pub fn set_state(&mut self, key: &VariableKey, state: RecordState) {
        if let Some(slot) = self.slots.get_mut(key) {
            slot.live.state = state;
        }
    }

    /// Drop `key` entirely.
    pub fn remove(&mut self, key: &VariableKey) -> Option<IndexEntry> {
        let slot = self.slots.remove(key)?;
        self.order.remove(&slot.live.offset);
        self.live_bytes -= slot.live.size;
        Some(slot.live)
    }

    /// Live keys and records in store order.
    pub fn iter(&self) -> impl Iterator<Item = (&VariableKey, &IndexEntry)> + '_ {
        self.order.values().filter_map(move |key| {
            self.slots.get(key).map(|slot| (key, &slot.live))
        })
    }

    /// Live keys in store order.
    pub fn keys(&self) -> btree_map::Values<'_, u32, VariableKey> {
        self.order.values()
    }

    /// The live key following `key` in store order, or the first one.
    pub fn next_after(&self, key: Option<&VariableKey>) -> Option<Option<&VariableKey>> {
        let start = match key {
            None => return Some(self.order.values().next()),
            Some(key) => self.slots.get(key)?.live.offset,
        };
        Some(
            self.order
                .range((core::ops::Bound::Excluded(start), core::ops::Bound::Unbounded))
                .map(|(_, key)| key)
                .next(),
        )
    }

    fn insert_new(&mut self, key: VariableKey, entry: IndexEntry) {
        self.order.insert(entry.offset, key.clone());
        self.live_bytes += entry.size;
        self.slots.insert(
            key,
            Slot {
                live: entry,
                shadows: Vec::new(),
            },
        );
    }
}
