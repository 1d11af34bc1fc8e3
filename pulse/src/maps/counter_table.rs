//! Host-side sample-count table

use pulse_common::{CounterStore, InsertError, SampleKey, SAMPLE_COUNTS_MAX_ENTRIES};

use super::bounded_map::BoundedMap;

/// Bounded map of [`SampleKey`] → sample count
///
/// Shared by every sampling thread; drained by the collector with exclusive
/// access.
pub struct SampleCounterTable {
    map: BoundedMap<SampleKey>,
}

impl SampleCounterTable {
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self { map: BoundedMap::new(max_entries) }
    }

    #[must_use]
    pub fn count(&self, key: &SampleKey) -> Option<u64> {
        self.map.get(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.map.capacity()
    }

    /// Sum of all bucket counts
    #[must_use]
    pub fn total(&self) -> u64 {
        self.map.entries().iter().map(|(_, count)| count).sum()
    }

    #[must_use]
    pub fn entries(&self) -> Vec<(SampleKey, u64)> {
        self.map.entries()
    }

    /// Remove and return every bucket.
    pub fn drain(&mut self) -> Vec<(SampleKey, u64)> {
        self.map.drain()
    }
}

impl Default for SampleCounterTable {
    fn default() -> Self {
        Self::new(SAMPLE_COUNTS_MAX_ENTRIES as usize)
    }
}

impl CounterStore for SampleCounterTable {
    fn increment(&self, key: &SampleKey) -> bool {
        self.map.fetch_add(key, 1).is_some()
    }

    fn insert_new(&self, key: &SampleKey, count: u64) -> Result<(), InsertError> {
        self.map.insert_new(key, count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_requires_existing_bucket() {
        let table = SampleCounterTable::new(4);
        let key = SampleKey::new(1, 2, 3);

        assert!(!table.increment(&key));
        table.insert_new(&key, 1).unwrap();
        assert!(table.increment(&key));
        assert_eq!(table.count(&key), Some(2));
        assert_eq!(table.total(), 2);
    }

    #[test]
    fn test_default_capacity() {
        assert_eq!(SampleCounterTable::default().capacity(), 10_240);
    }
}
