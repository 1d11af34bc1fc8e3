//! Fixed-capacity lock-free hash map with `u64` values
//!
//! Open addressing over a power-of-two slot array sized to twice the entry
//! budget. Every slot carries one atomic meta word:
//!
//! ```text
//! 0                  EMPTY  (never used; terminates a probe)
//! (tag << 2) | 1     BUSY   (claimed, key/value being written or removed)
//! (tag << 2) | 2     LIVE   (key and value readable)
//! (tag << 2) | 3     DEAD   (removed; reusable, does not terminate a probe)
//! ```
//!
//! `tag` is the upper 62 bits of the key hash. Readers compare the tag, read
//! the key words, then re-check the meta word (seqlock style) before trusting
//! the match. Writers claim a slot with a single CAS, so two CPUs can never
//! both create the same key through [`BoundedMap::insert_new`].
//!
//! The entry budget is a separate atomic counter reserved before the claim
//! and given back if the claim fails. Every probe loop is bounded by the slot
//! count.
//!
//! A key must not be inserted concurrently with itself while other keys are
//! being removed; otherwise a removal can open a hole that lets both inserts
//! succeed. The counter table never removes while samplers run and the
//! timestamp table is only written by the thread that owns the key.

use std::marker::PhantomData;
use std::sync::atomic::{fence, AtomicU64, AtomicUsize, Ordering};

use pulse_common::{InsertError, SampleKey, ThreadKey};

const EMPTY: u64 = 0;
const BUSY: u64 = 1;
const LIVE: u64 = 2;
const DEAD: u64 = 3;
const STATE_MASK: u64 = 0b11;

/// Times an insert restarts its probe after losing a claim CAS
const MAX_CLAIM_ATTEMPTS: usize = 8;

/// Key that packs into two machine words
pub trait MapKey: Copy + Eq {
    fn to_words(&self) -> [u64; 2];
    fn from_words(words: [u64; 2]) -> Self;
}

#[allow(clippy::cast_sign_loss)]
impl MapKey for SampleKey {
    fn to_words(&self) -> [u64; 2] {
        [
            u64::from(self.pid) | (u64::from(self.user_stack_id as u32) << 32),
            u64::from(self.kernel_stack_id as u32),
        ]
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    fn from_words(words: [u64; 2]) -> Self {
        SampleKey::new(words[0] as u32, (words[0] >> 32) as u32 as i32, words[1] as u32 as i32)
    }
}

impl MapKey for ThreadKey {
    fn to_words(&self) -> [u64; 2] {
        [u64::from(self.pid) | (u64::from(self.tid) << 32), 0]
    }

    #[allow(clippy::cast_possible_truncation)]
    fn from_words(words: [u64; 2]) -> Self {
        ThreadKey::new(words[0] as u32, (words[0] >> 32) as u32)
    }
}

/// splitmix64 finalizer
pub(crate) fn mix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

pub(crate) const fn pack(tag: u64, state: u64) -> u64 {
    (tag << 2) | state
}

pub(crate) const fn state_of(meta: u64) -> u64 {
    meta & STATE_MASK
}

pub(crate) const fn tag_of(meta: u64) -> u64 {
    meta >> 2
}

struct Slot {
    meta: AtomicU64,
    key: [AtomicU64; 2],
    value: AtomicU64,
}

impl Slot {
    fn new() -> Self {
        Self {
            meta: AtomicU64::new(EMPTY),
            key: [AtomicU64::new(0), AtomicU64::new(0)],
            value: AtomicU64::new(0),
        }
    }

    /// True if this slot is LIVE and holds `words`, checked against `meta`.
    fn holds(&self, meta: u64, words: [u64; 2]) -> bool {
        let k0 = self.key[0].load(Ordering::Relaxed);
        let k1 = self.key[1].load(Ordering::Relaxed);
        fence(Ordering::Acquire);
        self.meta.load(Ordering::Relaxed) == meta && [k0, k1] == words
    }
}

enum Claim {
    Full,
    Contended,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum InsertMode {
    Strict,
    Upsert,
}

pub struct BoundedMap<K> {
    slots: Box<[Slot]>,
    mask: usize,
    max_entries: usize,
    len: AtomicUsize,
    _key: PhantomData<fn() -> K>,
}

impl<K: MapKey> BoundedMap<K> {
    /// Map holding at most `max_entries` keys (at least one).
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        let max_entries = max_entries.max(1);
        let slot_count = (max_entries * 2).next_power_of_two();
        let slots = (0..slot_count).map(|_| Slot::new()).collect::<Vec<_>>().into_boxed_slice();
        Self {
            slots,
            mask: slot_count - 1,
            max_entries,
            len: AtomicUsize::new(0),
            _key: PhantomData,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.max_entries
    }

    /// Number of live entries (exact once writers are quiescent)
    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire).min(self.max_entries)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn hash(words: [u64; 2]) -> u64 {
        mix64(words[0] ^ mix64(words[1]))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn start(&self, hash: u64) -> usize {
        hash as usize & self.mask
    }

    /// Index of the LIVE slot holding `key`, with the meta word it was seen under.
    fn find(&self, key: &K) -> Option<(usize, u64)> {
        let words = key.to_words();
        let hash = Self::hash(words);
        let tag = hash >> 2;
        let mut idx = self.start(hash);

        for _ in 0..self.slots.len() {
            let slot = &self.slots[idx];
            let meta = slot.meta.load(Ordering::Acquire);
            if meta == EMPTY {
                return None;
            }
            if state_of(meta) == LIVE && tag_of(meta) == tag && slot.holds(meta, words) {
                return Some((idx, meta));
            }
            idx = (idx + 1) & self.mask;
        }
        None
    }

    #[must_use]
    pub fn get(&self, key: &K) -> Option<u64> {
        self.find(key).map(|(idx, _)| self.slots[idx].value.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        self.find(key).is_some()
    }

    /// Atomically add `delta` to an existing value. Returns the previous value,
    /// or `None` if the key is absent.
    pub fn fetch_add(&self, key: &K, delta: u64) -> Option<u64> {
        self.find(key).map(|(idx, _)| self.slots[idx].value.fetch_add(delta, Ordering::AcqRel))
    }

    /// Create `key` only if it does not exist yet.
    ///
    /// # Errors
    /// [`InsertError::AlreadyPresent`] if the key exists or another thread is
    /// creating it; [`InsertError::CapacityExceeded`] if the budget is spent.
    pub fn insert_new(&self, key: &K, value: u64) -> Result<(), InsertError> {
        self.insert(key, value, InsertMode::Strict)
    }

    /// Insert `key` or overwrite its value.
    ///
    /// # Errors
    /// [`InsertError::CapacityExceeded`] if the key is new and the budget is
    /// spent. [`InsertError::AlreadyPresent`] only under claim contention.
    pub fn upsert(&self, key: &K, value: u64) -> Result<(), InsertError> {
        self.insert(key, value, InsertMode::Upsert)
    }

    fn insert(&self, key: &K, value: u64, mode: InsertMode) -> Result<(), InsertError> {
        let words = key.to_words();
        let hash = Self::hash(words);
        let tag = hash >> 2;

        'attempt: for _ in 0..MAX_CLAIM_ATTEMPTS {
            let mut idx = self.start(hash);
            let mut tombstone: Option<(usize, u64)> = None;

            for _ in 0..self.slots.len() {
                let slot = &self.slots[idx];
                let meta = slot.meta.load(Ordering::Acquire);

                match state_of(meta) {
                    _ if meta == EMPTY => {
                        let (target, expected) = tombstone.unwrap_or((idx, EMPTY));
                        match self.claim(target, expected, tag, words, value) {
                            Ok(()) => return Ok(()),
                            Err(Claim::Full) => return Err(InsertError::CapacityExceeded),
                            Err(Claim::Contended) => continue 'attempt,
                        }
                    }
                    BUSY if tag_of(meta) == tag => return Err(InsertError::AlreadyPresent),
                    LIVE if tag_of(meta) == tag && slot.holds(meta, words) => {
                        return match mode {
                            InsertMode::Strict => Err(InsertError::AlreadyPresent),
                            InsertMode::Upsert => {
                                slot.value.store(value, Ordering::Release);
                                Ok(())
                            }
                        };
                    }
                    DEAD if tombstone.is_none() => tombstone = Some((idx, meta)),
                    _ => {}
                }
                idx = (idx + 1) & self.mask;
            }

            // Every slot is in use or dead; only a tombstone can take the key
            return match tombstone {
                Some((target, expected)) => match self.claim(target, expected, tag, words, value) {
                    Ok(()) => Ok(()),
                    Err(Claim::Full) => Err(InsertError::CapacityExceeded),
                    Err(Claim::Contended) => continue 'attempt,
                },
                None => Err(InsertError::CapacityExceeded),
            };
        }

        Err(InsertError::AlreadyPresent)
    }

    fn claim(
        &self,
        idx: usize,
        expected: u64,
        tag: u64,
        words: [u64; 2],
        value: u64,
    ) -> Result<(), Claim> {
        if self.len.fetch_add(1, Ordering::AcqRel) >= self.max_entries {
            self.len.fetch_sub(1, Ordering::AcqRel);
            return Err(Claim::Full);
        }

        let slot = &self.slots[idx];
        if slot
            .meta
            .compare_exchange(expected, pack(tag, BUSY), Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.len.fetch_sub(1, Ordering::AcqRel);
            return Err(Claim::Contended);
        }

        slot.key[0].store(words[0], Ordering::Relaxed);
        slot.key[1].store(words[1], Ordering::Relaxed);
        slot.value.store(value, Ordering::Relaxed);
        slot.meta.store(pack(tag, LIVE), Ordering::Release);
        Ok(())
    }

    /// Look up and delete `key` in one claim. Returns the removed value.
    pub fn take(&self, key: &K) -> Option<u64> {
        let (idx, meta) = self.find(key)?;
        let slot = &self.slots[idx];
        let tag = tag_of(meta);

        slot.meta
            .compare_exchange(meta, pack(tag, BUSY), Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        let value = slot.value.load(Ordering::Acquire);
        slot.meta.store(pack(tag, DEAD), Ordering::Release);
        self.len.fetch_sub(1, Ordering::AcqRel);
        Some(value)
    }

    /// Snapshot of every live entry.
    #[must_use]
    pub fn entries(&self) -> Vec<(K, u64)> {
        self.slots
            .iter()
            .filter_map(|slot| {
                let meta = slot.meta.load(Ordering::Acquire);
                if state_of(meta) != LIVE {
                    return None;
                }
                let words =
                    [slot.key[0].load(Ordering::Relaxed), slot.key[1].load(Ordering::Relaxed)];
                let value = slot.value.load(Ordering::Acquire);
                slot.holds(meta, words).then(|| (K::from_words(words), value))
            })
            .collect()
    }

    /// Remove and return every entry. Requires exclusive access.
    pub fn drain(&mut self) -> Vec<(K, u64)> {
        let mut out = Vec::with_capacity(*self.len.get_mut());
        for slot in self.slots.iter_mut() {
            let meta = std::mem::replace(slot.meta.get_mut(), EMPTY);
            if state_of(meta) == LIVE {
                let words = [*slot.key[0].get_mut(), *slot.key[1].get_mut()];
                out.push((K::from_words(words), *slot.value.get_mut()));
            }
        }
        *self.len.get_mut() = 0;
        out
    }

    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot.meta.get_mut() = EMPTY;
        }
        *self.len.get_mut() = 0;
    }
}
