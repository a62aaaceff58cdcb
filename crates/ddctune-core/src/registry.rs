//! Mapping from bus path to per-display record.
//!
//! Locking discipline: one shared/exclusive cross-display lock over the map,
//! plus a mutex on each record. Multi-record scans (reports, sweeps, cache
//! saves) take the map lock exclusively; single-record work takes it shared
//! just long enough to clone the record's `Arc`, then locks only that record.
//! Lock order is always map before record, so the two levels cannot deadlock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use ddctune_types::BusPath;

use crate::record::{DisplayRecord, DisplayState, RecordDefaults};

/// Shared handle to one display's record.
pub type RecordHandle = Arc<Mutex<DisplayRecord>>;

#[derive(Default)]
pub struct Registry {
    records: RwLock<HashMap<u64, RecordHandle>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Lookup without creation.
    pub fn get(&self, bus: BusPath) -> Option<RecordHandle> {
        self.records
            .read()
            .expect("registry lock poisoned")
            .get(&bus.key())
            .cloned()
    }

    /// Fetch the record for `bus`, creating it if absent.
    ///
    /// An existing record's EDID checksum byte is validated against
    /// `edid_check`; on mismatch the bus has been re-enumerated to a
    /// different monitor, so the stale record (cached or live) is discarded
    /// and a fresh one installed. A cache-restored record that matches is
    /// promoted to detected-and-verified.
    pub fn get_or_create(
        &self,
        bus: BusPath,
        edid_check: u8,
        defaults: &RecordDefaults,
    ) -> RecordHandle {
        let mut map = self.records.write().expect("registry lock poisoned");
        if let Some(handle) = map.get(&bus.key()) {
            let mut record = handle.lock().expect("record lock poisoned");
            if record.edid_check() == edid_check {
                record.mark_detected_and_verified();
                drop(record);
                return handle.clone();
            }
            tracing::debug!(
                %bus,
                cached = record.edid_check(),
                live = edid_check,
                "EDID checksum mismatch, discarding stale record"
            );
        }
        let handle = Arc::new(Mutex::new(DisplayRecord::new(bus, edid_check, defaults)));
        map.insert(bus.key(), handle.clone());
        handle
    }

    /// Install a cache-restored record. Refused (returning `false`) if the
    /// bus already has a record; a bus appears in the registry at most once.
    pub fn insert_restored(&self, record: DisplayRecord) -> bool {
        let mut map = self.records.write().expect("registry lock poisoned");
        let key = record.bus().key();
        if map.contains_key(&key) {
            return false;
        }
        map.insert(key, Arc::new(Mutex::new(record)));
        true
    }

    /// Apply `f` to every record, in arbitrary order, under the exclusive
    /// cross-display lock.
    pub fn apply_all<F: FnMut(&mut DisplayRecord)>(&self, mut f: F) {
        let map = self.records.write().expect("registry lock poisoned");
        for handle in map.values() {
            f(&mut handle.lock().expect("record lock poisoned"));
        }
    }

    /// Like [`Registry::apply_all`] but in ascending bus order.
    pub fn apply_all_sorted<F: FnMut(&mut DisplayRecord)>(&self, mut f: F) {
        let map = self.records.write().expect("registry lock poisoned");
        let mut handles: Vec<_> = map.iter().collect();
        handles.sort_by_key(|(key, _)| **key);
        for (_, handle) in handles {
            f(&mut handle.lock().expect("record lock poisoned"));
        }
    }

    /// Redetection sweep: drop records restored from the cache that were
    /// never verified against a live monitor. Returns how many were freed.
    pub fn sweep_unverified(&self) -> usize {
        let mut map = self.records.write().expect("registry lock poisoned");
        let before = map.len();
        map.retain(|_, handle| {
            let record = handle.lock().expect("record lock poisoned");
            let stale = record.state().contains(DisplayState::FROM_CACHE)
                && !record.state().contains(DisplayState::EDID_VERIFIED);
            !stale
        });
        before - map.len()
    }

    pub fn len(&self) -> usize {
        self.records.read().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.records
            .write()
            .expect("registry lock poisoned")
            .clear();
    }

    /// Bus paths currently registered, ascending.
    pub fn buses(&self) -> Vec<BusPath> {
        let map = self.records.read().expect("registry lock poisoned");
        let mut buses: Vec<BusPath> = map
            .values()
            .map(|h| h.lock().expect("record lock poisoned").bus())
            .collect();
        buses.sort();
        buses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{CachedDsaState, DisplayState};

    fn defaults() -> RecordDefaults {
        RecordDefaults::default()
    }

    #[test]
    fn get_or_create_reuses_matching_records() {
        let registry = Registry::new();
        let first = registry.get_or_create(BusPath::new(3), 0xA7, &defaults());
        first.lock().unwrap().dsa_on_final(true, 4, 1); // learn something
        let again = registry.get_or_create(BusPath::new(3), 0xA7, &defaults());
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn edid_mismatch_discards_the_record() {
        let registry = Registry::new();
        let old = registry.get_or_create(BusPath::new(3), 0xA7, &defaults());
        old.lock().unwrap().dsa_on_final(true, 4, 1);

        let new = registry.get_or_create(BusPath::new(3), 0x99, &defaults());
        assert!(!Arc::ptr_eq(&old, &new));
        let record = new.lock().unwrap();
        assert_eq!(record.edid_check(), 0x99);
        assert!(record.recent().is_empty());
        assert_eq!(
            record.state(),
            DisplayState::BUS_DETECTED | DisplayState::EDID_VERIFIED
        );
    }

    #[test]
    fn restored_records_verify_on_first_use() {
        let registry = Registry::new();
        let cached = CachedDsaState {
            cur_step: 5,
            lookback: 5,
            remaining_interval: 2,
            min_ok_step: 3,
            found_failure_step: true,
            recent: vec![],
        };
        assert!(registry.insert_restored(DisplayRecord::from_cache(
            BusPath::new(7),
            0xA7,
            cached,
            &defaults(),
        )));

        let handle = registry.get_or_create(BusPath::new(7), 0xA7, &defaults());
        let record = handle.lock().unwrap();
        assert_eq!(record.cur_step(), 5, "learned state survives verification");
        assert!(record.state().contains(DisplayState::FROM_CACHE));
        assert!(record.state().contains(DisplayState::BUS_DETECTED));
        assert!(record.state().contains(DisplayState::EDID_VERIFIED));
    }

    #[test]
    fn insert_restored_refuses_duplicates() {
        let registry = Registry::new();
        registry.get_or_create(BusPath::new(2), 0x10, &defaults());
        let cached = CachedDsaState {
            cur_step: 1,
            lookback: 5,
            remaining_interval: 3,
            min_ok_step: 0,
            found_failure_step: false,
            recent: vec![],
        };
        let dup = DisplayRecord::from_cache(BusPath::new(2), 0x10, cached, &defaults());
        assert!(!registry.insert_restored(dup));
    }

    #[test]
    fn sweep_frees_only_unverified_cache_records() {
        let registry = Registry::new();
        registry.get_or_create(BusPath::new(1), 0x11, &defaults());
        let cached = CachedDsaState {
            cur_step: 2,
            lookback: 5,
            remaining_interval: 3,
            min_ok_step: 0,
            found_failure_step: false,
            recent: vec![],
        };
        registry.insert_restored(DisplayRecord::from_cache(
            BusPath::new(2),
            0x22,
            cached.clone(),
            &defaults(),
        ));
        registry.insert_restored(DisplayRecord::from_cache(
            BusPath::new(3),
            0x33,
            cached,
            &defaults(),
        ));
        // Verify bus 3 but never bus 2.
        registry.get_or_create(BusPath::new(3), 0x33, &defaults());

        assert_eq!(registry.sweep_unverified(), 1);
        assert_eq!(registry.buses(), vec![BusPath::new(1), BusPath::new(3)]);
    }

    #[test]
    fn apply_all_sorted_visits_in_bus_order() {
        let registry = Registry::new();
        for bus in [9u16, 1, 5] {
            registry.get_or_create(BusPath::new(bus), 0, &defaults());
        }
        let mut seen = Vec::new();
        registry.apply_all_sorted(|r| seen.push(r.bus().number()));
        assert_eq!(seen, vec![1, 5, 9]);
    }
}
