//! Periodic stack sampling
//!
//! [`StackSampler`] runs once per perf-event trigger: it captures the
//! interrupted thread's user and kernel stacks and bumps the count of the
//! resulting [`SampleKey`] bucket.
//!
//! Every step is a single attempt. A failed capture degrades the key to the
//! [`STACK_ID_NONE`] sentinel; a full or contended count table drops the
//! increment. Sampling is statistical, so an occasional undercount is fine.

use crate::{SampleKey, STACK_ID_NONE};

/// Which half of a thread's call chain to capture
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StackSpace {
    User,
    Kernel,
}

/// Result of capturing one stack into the stack trace table
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// Stored (or matched an identical stored stack) under this id
    Stored(u32),
    /// Deeper than `MAX_STACK_DEPTH`
    TooDeep,
    /// The table has no room for a new stack
    StorageFull,
    /// Nothing to capture, e.g. a kernel thread has no user stack
    NoFrames,
}

impl CaptureOutcome {
    /// Id to record in a [`SampleKey`]; [`STACK_ID_NONE`] for any failure.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn stack_id(self) -> i32 {
        match self {
            CaptureOutcome::Stored(id) => id as i32,
            _ => STACK_ID_NONE,
        }
    }

    #[must_use]
    pub const fn is_stored(self) -> bool {
        matches!(self, CaptureOutcome::Stored(_))
    }
}

/// Why a strict insert was refused
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertError {
    /// The key exists, or another CPU is inserting it right now
    AlreadyPresent,
    /// The table holds its maximum number of entries
    CapacityExceeded,
}

/// Result of counting one sample
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CountOutcome {
    /// Bucket existed; its count was atomically incremented
    Incremented,
    /// Bucket created with count 1
    Inserted,
    /// Another CPU created the bucket between our lookup and insert
    LostRace,
    /// New bucket refused; existing buckets are unaffected
    CapacityExceeded,
}

impl CountOutcome {
    #[must_use]
    pub const fn is_counted(self) -> bool {
        matches!(self, CountOutcome::Incremented | CountOutcome::Inserted)
    }
}

/// Everything one sampling invocation did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SampleOutcome {
    pub key: SampleKey,
    pub user: CaptureOutcome,
    pub kernel: CaptureOutcome,
    pub count: CountOutcome,
}

/// Captures the current thread's stacks into the stack trace table.
///
/// Implementations carry whatever context the capture needs (the trigger's
/// register state in the kernel, a recorded frame list on the host).
pub trait StackStore {
    fn capture(&self, space: StackSpace) -> CaptureOutcome;
}

/// Sample-count table operations needed on the trigger path
pub trait CounterStore {
    /// Atomically add 1 to an existing bucket. Returns `false` if absent.
    fn increment(&self, key: &SampleKey) -> bool;

    /// Create a bucket only if it does not exist yet.
    ///
    /// # Errors
    /// [`InsertError::AlreadyPresent`] if the key exists, or
    /// [`InsertError::CapacityExceeded`] if the table is full.
    fn insert_new(&self, key: &SampleKey, count: u64) -> Result<(), InsertError>;
}

/// Orchestrates the stack trace and sample-count tables on each trigger
pub struct StackSampler<'a, S, C> {
    stacks: &'a S,
    counts: &'a C,
}

impl<'a, S: StackStore, C: CounterStore> StackSampler<'a, S, C> {
    pub const fn new(stacks: &'a S, counts: &'a C) -> Self {
        Self { stacks, counts }
    }

    /// Capture user and kernel stacks independently.
    ///
    /// Either capture may fail without affecting the other.
    #[inline(always)]
    pub fn capture_stacks(&self) -> (CaptureOutcome, CaptureOutcome) {
        let user = self.stacks.capture(StackSpace::User);
        let kernel = self.stacks.capture(StackSpace::Kernel);
        (user, kernel)
    }

    /// Increment-if-present, else create with count 1.
    ///
    /// The create path is a strict insert. When two CPUs race to create the
    /// same bucket, the loser's increment is dropped; there is no retry.
    #[inline(always)]
    pub fn record_sample(
        &self,
        pid: u32,
        user_stack_id: i32,
        kernel_stack_id: i32,
    ) -> CountOutcome {
        let key = SampleKey::new(pid, user_stack_id, kernel_stack_id);

        if self.counts.increment(&key) {
            return CountOutcome::Incremented;
        }

        match self.counts.insert_new(&key, 1) {
            Ok(()) => CountOutcome::Inserted,
            Err(InsertError::AlreadyPresent) => CountOutcome::LostRace,
            Err(InsertError::CapacityExceeded) => CountOutcome::CapacityExceeded,
        }
    }

    /// One full sampling invocation for process `pid`.
    #[inline(always)]
    pub fn sample(&self, pid: u32) -> SampleOutcome {
        let (user, kernel) = self.capture_stacks();
        let key = SampleKey::new(pid, user.stack_id(), kernel.stack_id());
        let count = self.record_sample(key.pid, key.user_stack_id, key.kernel_stack_id);
        SampleOutcome { key, user, kernel, count }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::{Cell, RefCell};
    use std::vec::Vec;

    struct FixedStacks {
        user: CaptureOutcome,
        kernel: CaptureOutcome,
    }

    impl StackStore for FixedStacks {
        fn capture(&self, space: StackSpace) -> CaptureOutcome {
            match space {
                StackSpace::User => self.user,
                StackSpace::Kernel => self.kernel,
            }
        }
    }

    /// Single-threaded count table; `racer` simulates another CPU inserting
    /// the key between our lookup and our insert.
    #[derive(Default)]
    struct VecCounts {
        entries: RefCell<Vec<(SampleKey, u64)>>,
        max_entries: usize,
        racer: Cell<bool>,
    }

    impl CounterStore for VecCounts {
        fn increment(&self, key: &SampleKey) -> bool {
            let mut entries = self.entries.borrow_mut();
            match entries.iter_mut().find(|(k, _)| k == key) {
                Some((_, count)) => {
                    *count += 1;
                    true
                }
                None => false,
            }
        }

        fn insert_new(&self, key: &SampleKey, count: u64) -> Result<(), InsertError> {
            let mut entries = self.entries.borrow_mut();
            if self.racer.get() {
                entries.push((*key, 1));
                return Err(InsertError::AlreadyPresent);
            }
            if entries.len() >= self.max_entries {
                return Err(InsertError::CapacityExceeded);
            }
            entries.push((*key, count));
            Ok(())
        }
    }

    #[test]
    fn test_sample_creates_then_increments() {
        let stacks =
            FixedStacks { user: CaptureOutcome::Stored(3), kernel: CaptureOutcome::Stored(9) };
        let counts = VecCounts { max_entries: 4, ..Default::default() };
        let sampler = StackSampler::new(&stacks, &counts);

        assert_eq!(sampler.sample(100).count, CountOutcome::Inserted);
        assert_eq!(sampler.sample(100).count, CountOutcome::Incremented);
        assert_eq!(counts.entries.borrow()[0], (SampleKey::new(100, 3, 9), 2));
    }

    #[test]
    fn test_failed_captures_use_sentinel_bucket() {
        let stacks =
            FixedStacks { user: CaptureOutcome::NoFrames, kernel: CaptureOutcome::TooDeep };
        let counts = VecCounts { max_entries: 4, ..Default::default() };
        let outcome = StackSampler::new(&stacks, &counts).sample(7);

        assert_eq!(outcome.key, SampleKey::new(7, STACK_ID_NONE, STACK_ID_NONE));
        assert_eq!(outcome.count, CountOutcome::Inserted);
    }

    #[test]
    fn test_lost_race_is_not_retried() {
        let stacks =
            FixedStacks { user: CaptureOutcome::Stored(1), kernel: CaptureOutcome::Stored(2) };
        let counts = VecCounts { max_entries: 4, ..Default::default() };
        counts.racer.set(true);

        let outcome = StackSampler::new(&stacks, &counts).sample(7);
        assert_eq!(outcome.count, CountOutcome::LostRace);
        // Only the racer's count=1 exists; ours was dropped
        assert_eq!(counts.entries.borrow().as_slice(), &[(SampleKey::new(7, 1, 2), 1)]);
    }

    #[test]
    fn test_full_table_drops_new_bucket() {
        let stacks =
            FixedStacks { user: CaptureOutcome::Stored(1), kernel: CaptureOutcome::Stored(2) };
        let counts = VecCounts { max_entries: 1, ..Default::default() };
        let sampler = StackSampler::new(&stacks, &counts);

        assert_eq!(sampler.record_sample(1, 1, 2), CountOutcome::Inserted);
        assert_eq!(sampler.record_sample(2, 1, 2), CountOutcome::CapacityExceeded);
        assert_eq!(sampler.record_sample(1, 1, 2), CountOutcome::Incremented);
    }
}
