//! Host-side entry-timestamp table

use pulse_common::{InsertError, ThreadKey, TimestampStore, ENTRY_TIMESTAMPS_MAX_ENTRIES};

use super::bounded_map::BoundedMap;

/// Bounded map of [`ThreadKey`] → entry timestamp (ns)
///
/// One open window per thread. Only the owning thread stores or takes its
/// own key.
pub struct EntryTimestampTable {
    map: BoundedMap<ThreadKey>,
}

impl EntryTimestampTable {
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self { map: BoundedMap::new(max_entries) }
    }

    #[must_use]
    pub fn get(&self, thread: &ThreadKey) -> Option<u64> {
        self.map.get(thread)
    }

    #[must_use]
    pub fn contains(&self, thread: &ThreadKey) -> bool {
        self.map.contains_key(thread)
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
}

impl Default for EntryTimestampTable {
    fn default() -> Self {
        Self::new(ENTRY_TIMESTAMPS_MAX_ENTRIES as usize)
    }
}

impl TimestampStore for EntryTimestampTable {
    fn store(&self, thread: &ThreadKey, timestamp_ns: u64) -> Result<(), InsertError> {
        self.map.upsert(thread, timestamp_ns)
    }

    fn take(&self, thread: &ThreadKey) -> Option<u64> {
        self.map.take(thread)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_overwrites_open_window() {
        let table = EntryTimestampTable::new(2);
        let thread = ThreadKey::new(5, 6);

        table.store(&thread, 100).unwrap();
        table.store(&thread, 250).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.take(&thread), Some(250));
        assert!(!table.contains(&thread));
    }

    #[test]
    fn test_store_fails_when_full() {
        let table = EntryTimestampTable::new(1);
        table.store(&ThreadKey::new(1, 1), 1).unwrap();
        assert_eq!(table.store(&ThreadKey::new(1, 2), 2), Err(InsertError::CapacityExceeded));
    }
}
