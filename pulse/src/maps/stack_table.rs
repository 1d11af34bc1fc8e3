//! Host-side stack trace table
//!
//! Stack ids are slot indices. A capture hashes its frames, probes from the
//! hash, and either matches a LIVE slot holding identical frames or claims
//! the first EMPTY slot with a CAS. Two concurrent captures of the same
//! frames may therefore end up with two ids; each id still refers to exactly
//! one frame sequence until the collector clears it.

use std::sync::atomic::{fence, AtomicU64, AtomicUsize, Ordering};

use pulse_common::{
    CaptureOutcome, RawStack, StackSpace, StackStore, MAX_STACK_DEPTH, STACK_TRACES_MAX_ENTRIES,
};

use super::bounded_map::{mix64, pack, state_of, tag_of};

const EMPTY: u64 = 0;
const BUSY: u64 = 1;
const LIVE: u64 = 2;

struct StackSlot {
    meta: AtomicU64,
    depth: AtomicU64,
    frames: [AtomicU64; MAX_STACK_DEPTH],
}

impl StackSlot {
    fn new() -> Self {
        Self {
            meta: AtomicU64::new(EMPTY),
            depth: AtomicU64::new(0),
            frames: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Copy the slot's frames if it is still LIVE under `meta`.
    #[allow(clippy::cast_possible_truncation)]
    fn read(&self, meta: u64) -> Option<RawStack> {
        let depth = (self.depth.load(Ordering::Relaxed) as usize).min(MAX_STACK_DEPTH);
        let mut frames = [0u64; MAX_STACK_DEPTH];
        for (dst, src) in frames.iter_mut().zip(&self.frames[..depth]) {
            *dst = src.load(Ordering::Relaxed);
        }
        fence(Ordering::Acquire);
        if self.meta.load(Ordering::Relaxed) != meta {
            return None;
        }
        RawStack::from_frames(&frames[..depth])
    }
}

fn hash_frames(frames: &[u64]) -> u64 {
    frames.iter().fold(mix64(frames.len() as u64), |acc, &ip| mix64(acc ^ ip))
}

/// Bounded table of captured stacks keyed by id
pub struct StackTraceTable {
    slots: Box<[StackSlot]>,
    len: AtomicUsize,
}

impl StackTraceTable {
    /// Table holding at most `max_entries` distinct stacks (at least one).
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        let slots = (0..max_entries.max(1)).map(|_| StackSlot::new()).collect::<Vec<_>>();
        Self { slots: slots.into_boxed_slice(), len: AtomicUsize::new(0) }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store `stack` (or find an identical stored one) and return its id.
    #[allow(clippy::cast_possible_truncation)]
    pub fn insert(&self, stack: &RawStack) -> CaptureOutcome {
        if stack.is_empty() {
            return CaptureOutcome::NoFrames;
        }

        let frames = stack.frames();
        let hash = hash_frames(frames);
        let tag = hash >> 2;
        let n = self.slots.len();
        let mut idx = (hash % n as u64) as usize;
        let mut probed = 0;

        while probed < n {
            let slot = &self.slots[idx];
            let meta = slot.meta.load(Ordering::Acquire);

            if meta == EMPTY {
                if slot
                    .meta
                    .compare_exchange(EMPTY, pack(tag, BUSY), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    for (dst, &ip) in slot.frames.iter().zip(frames) {
                        dst.store(ip, Ordering::Relaxed);
                    }
                    slot.depth.store(frames.len() as u64, Ordering::Relaxed);
                    slot.meta.store(pack(tag, LIVE), Ordering::Release);
                    self.len.fetch_add(1, Ordering::AcqRel);
                    return CaptureOutcome::Stored(idx as u32);
                }
                // Lost the claim; look at what the winner put here
                continue;
            }

            if state_of(meta) == LIVE
                && tag_of(meta) == tag
                && slot.read(meta).is_some_and(|stored| stored.frames() == frames)
            {
                return CaptureOutcome::Stored(idx as u32);
            }

            idx = (idx + 1) % n;
            probed += 1;
        }

        CaptureOutcome::StorageFull
    }

    /// Frames stored under `id`, innermost first.
    #[must_use]
    pub fn frames(&self, id: u32) -> Option<RawStack> {
        let slot = self.slots.get(id as usize)?;
        let meta = slot.meta.load(Ordering::Acquire);
        if state_of(meta) != LIVE {
            return None;
        }
        slot.read(meta)
    }

    /// Forget `id`. Requires exclusive access so no capture holds it.
    pub fn remove(&mut self, id: u32) -> bool {
        let Some(slot) = self.slots.get_mut(id as usize) else {
            return false;
        };
        let meta = std::mem::replace(slot.meta.get_mut(), EMPTY);
        if state_of(meta) == LIVE {
            *self.len.get_mut() -= 1;
            true
        } else {
            false
        }
    }

    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot.meta.get_mut() = EMPTY;
        }
        *self.len.get_mut() = 0;
    }
}

impl Default for StackTraceTable {
    fn default() -> Self {
        Self::new(STACK_TRACES_MAX_ENTRIES as usize)
    }
}

/// Recorded user and kernel frames of one thread, captured into a table
///
/// `None` means the thread has no such stack (a kernel thread has no user
/// frames). Frames are innermost first, as the kernel reports them.
pub struct ThreadStacks<'a> {
    table: &'a StackTraceTable,
    user: Option<&'a [u64]>,
    kernel: Option<&'a [u64]>,
}

impl<'a> ThreadStacks<'a> {
    #[must_use]
    pub fn new(
        table: &'a StackTraceTable,
        user: Option<&'a [u64]>,
        kernel: Option<&'a [u64]>,
    ) -> Self {
        Self { table, user, kernel }
    }
}

impl StackStore for ThreadStacks<'_> {
    fn capture(&self, space: StackSpace) -> CaptureOutcome {
        let frames = match space {
            StackSpace::User => self.user,
            StackSpace::Kernel => self.kernel,
        };
        match frames.map(RawStack::from_frames) {
            None => CaptureOutcome::NoFrames,
            Some(None) => CaptureOutcome::TooDeep,
            Some(Some(stack)) => self.table.insert(&stack),
        }
    }
}
