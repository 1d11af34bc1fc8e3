//! # Shared Data Structures (eBPF ↔ Userspace)
//!
//! Records, constants and trigger logic shared between the kernel-side eBPF
//! programs and userspace. All records use `#[repr(C)]` for a consistent
//! memory layout across the kernel/userspace boundary.
//!
//! ## Profiling Modes
//!
//! 1. **Stack sampling** - a perf event fires at a fixed frequency (99 Hz by
//!    default) and [`sampler::StackSampler`] counts the (pid, user stack,
//!    kernel stack) bucket of the interrupted thread.
//! 2. **Function timing** - a uprobe/uretprobe pair drives
//!    [`tracer::ProbeTracer`], which measures each call of one function and
//!    reports it through the event ring buffer.
//!
//! The trigger logic is written against small store traits so the same code
//! runs inside the kernel (backed by BPF maps) and on the host (backed by the
//! lock-free tables in the `pulse` crate).
//!
//! ## Key Types
//!
//! - [`SampleKey`] - Bucket key of the sample-count table
//! - [`ThreadKey`] - Thread identity keying the entry-timestamp table
//! - [`TimingEvent`] / [`CompletionEvent`] - Ring buffer records
//! - [`RawStack`] - Fixed-depth captured call stack

#![no_std]

#[cfg(test)]
extern crate std;

pub mod sampler;
pub mod tracer;

pub use sampler::{
    CaptureOutcome, CountOutcome, CounterStore, InsertError, SampleOutcome, StackSampler,
    StackSpace, StackStore,
};
pub use tracer::{
    EmissionMode, EmitOutcome, EntryOutcome, EventSink, ExitOutcome, MonotonicClock, ProbeTracer,
    Reserved, TimestampStore, MIN_SPLIT_EXIT_NS,
};

// ============================================================================
// Limits and Defaults
// ============================================================================

/// Maximum number of stack frames to capture
///
/// Kernel eBPF programs are limited to 127 frames due to verifier constraints.
pub const MAX_STACK_DEPTH: usize = 127;

/// Stack id recorded when a capture failed or no stack was available.
///
/// Never a valid index into the stack trace table.
pub const STACK_ID_NONE: i32 = -1;

/// Unique stacks kept by the stack trace table.
pub const STACK_TRACES_MAX_ENTRIES: u32 = 10_240;

/// Distinct (pid, user stack, kernel stack) buckets kept by the count table.
pub const SAMPLE_COUNTS_MAX_ENTRIES: u32 = 10_240;

/// Threads that can be inside an instrumented function at the same time.
pub const ENTRY_TIMESTAMPS_MAX_ENTRIES: u32 = 10_240;

/// Byte size of the event ring buffer (256KB).
pub const EVENT_CHANNEL_BYTES: u32 = 256 * 1024;

pub const DEFAULT_SAMPLE_FREQUENCY_HZ: u64 = 99;
pub const MAX_SAMPLE_FREQUENCY_HZ: u64 = 1000;

// ============================================================================
// Runtime Configuration Keys
// ============================================================================

/// **CONFIG[0]**: Only sample this process (TGID). 0 samples every process.
pub const CONFIG_TARGET_PID: u32 = 0;

/// **CONFIG[1]**: [`EmissionMode`] raw value used by the function probes.
pub const CONFIG_EMISSION_MODE: u32 = 1;

// ============================================================================
// Event Type Constants (combined records)
// ============================================================================

/// `CompletionEvent::event_type` of a function entry.
pub const EVENT_TYPE_ENTRY: u8 = 0;

/// `CompletionEvent::event_type` of a function return.
pub const EVENT_TYPE_RETURN: u8 = 1;

// ============================================================================
// Drop Diagnostics
// ============================================================================

/// Why a trigger invocation dropped (part of) its work.
///
/// Each reason indexes one slot of the `DIAGNOSTICS` counter array.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// New sample bucket refused because the count table is full
    SampleTableFull = 0,
    /// Another CPU created the same bucket first; this increment was lost
    SampleLostRace = 1,
    UserStackMissing = 2,
    KernelStackMissing = 3,
    /// Entry timestamp could not be stored; the matching exit will miss
    EntryTableFull = 4,
    ExitWithoutEntry = 5,
    /// Event ring buffer had no room for the record
    ChannelFull = 6,
}

/// Number of slots in the `DIAGNOSTICS` array.
pub const DROP_REASON_COUNT: u32 = 7;

impl DropReason {
    pub const ALL: [DropReason; DROP_REASON_COUNT as usize] = [
        DropReason::SampleTableFull,
        DropReason::SampleLostRace,
        DropReason::UserStackMissing,
        DropReason::KernelStackMissing,
        DropReason::EntryTableFull,
        DropReason::ExitWithoutEntry,
        DropReason::ChannelFull,
    ];

    #[must_use]
    pub const fn index(self) -> u32 {
        self as u32
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            DropReason::SampleTableFull => "sample table full",
            DropReason::SampleLostRace => "sample lost race",
            DropReason::UserStackMissing => "user stack missing",
            DropReason::KernelStackMissing => "kernel stack missing",
            DropReason::EntryTableFull => "entry table full",
            DropReason::ExitWithoutEntry => "exit without entry",
            DropReason::ChannelFull => "event channel full",
        }
    }
}

// ============================================================================
// Shared Data Structures
// ============================================================================

/// Key of the sample-count table
///
/// Two samples land in the same bucket iff all three fields are equal. A
/// failed capture is recorded with [`STACK_ID_NONE`], so `(pid, -1, -1)` is a
/// valid bucket meaning "no stack captured".
///
/// **Memory Layout**: 12 bytes, no padding
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SampleKey {
    /// Process ID (TGID in Linux terms)
    pub pid: u32,

    /// Stack id of the user-space stack, or [`STACK_ID_NONE`]
    pub user_stack_id: i32,

    /// Stack id of the kernel-space stack, or [`STACK_ID_NONE`]
    pub kernel_stack_id: i32,
}

impl SampleKey {
    #[must_use]
    pub const fn new(pid: u32, user_stack_id: i32, kernel_stack_id: i32) -> Self {
        Self { pid, user_stack_id, kernel_stack_id }
    }
}

/// Thread identity keying the entry-timestamp table
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ThreadKey {
    /// Process ID (TGID)
    pub pid: u32,
    /// Thread ID (kernel PID)
    pub tid: u32,
}

impl ThreadKey {
    #[must_use]
    pub const fn new(pid: u32, tid: u32) -> Self {
        Self { pid, tid }
    }

    /// Split the value returned by `bpf_get_current_pid_tgid()`.
    ///
    /// The TGID lives in the upper 32 bits, the thread id in the lower 32.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from_pid_tgid(pid_tgid: u64) -> Self {
        Self { pid: (pid_tgid >> 32) as u32, tid: pid_tgid as u32 }
    }
}

/// Function timing record (split emission mode)
///
/// Entries carry `duration_ns == 0`; exits carry the measured duration.
///
/// **Size**: 24 bytes
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimingEvent {
    /// Monotonic timestamp (`bpf_ktime_get_ns()`) when the event fired
    pub timestamp_ns: u64,
    pub pid: u32,
    pub tid: u32,
    pub duration_ns: u64,
}

/// Function timing record (combined emission mode)
///
/// Only emitted on return. `timestamp_ns` is the return time, so the call
/// started at `timestamp_ns - duration_ns`.
///
/// **Size**: 32 bytes
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompletionEvent {
    pub timestamp_ns: u64,
    pub pid: u32,
    pub tid: u32,
    /// [`EVENT_TYPE_ENTRY`] or [`EVENT_TYPE_RETURN`]
    pub event_type: u8,

    /// Padding for 8-byte alignment
    #[allow(clippy::pub_underscore_fields)]
    pub _padding: [u8; 7],

    pub duration_ns: u64,
}

/// Captured call stack, innermost frame first
///
/// The frame array has exactly [`MAX_STACK_DEPTH`] slots, so a deeper stack
/// cannot be represented at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawStack {
    depth: usize,
    frames: [u64; MAX_STACK_DEPTH],
}

impl RawStack {
    /// Copy `frames` into a fixed-depth stack.
    ///
    /// Returns `None` when more than [`MAX_STACK_DEPTH`] frames are given.
    #[must_use]
    pub fn from_frames(frames: &[u64]) -> Option<Self> {
        if frames.len() > MAX_STACK_DEPTH {
            return None;
        }
        let mut stack = Self { depth: frames.len(), frames: [0; MAX_STACK_DEPTH] };
        stack.frames[..frames.len()].copy_from_slice(frames);
        Some(stack)
    }

    #[must_use]
    pub fn frames(&self) -> &[u64] {
        &self.frames[..self.depth]
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.depth == 0
    }
}

// ============================================================================
// Wire Records
// ============================================================================

/// Plain-old-data record that can travel through the event channel as bytes.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]`, contain no pointers, and be valid for
/// any bit pattern of their size.
#[allow(unsafe_code)]
pub unsafe trait Record: Copy + 'static {}

#[allow(unsafe_code)]
unsafe impl Record for TimingEvent {}

#[allow(unsafe_code)]
unsafe impl Record for CompletionEvent {}

/// Decode one record from the bytes of a ring buffer entry.
///
/// Returns `None` if the buffer is shorter than `T`.
#[must_use]
pub fn decode<T: Record>(bytes: &[u8]) -> Option<T> {
    if bytes.len() < core::mem::size_of::<T>() {
        return None;
    }
    // SAFETY: length checked above and `Record` guarantees any bit pattern is valid
    #[allow(unsafe_code)]
    let record = unsafe { core::ptr::read_unaligned(bytes.as_ptr().cast::<T>()) };
    Some(record)
}

#[cfg(feature = "user")]
use aya::Pod;

// These unsafe impls are required for eBPF <-> userspace communication
// Pod trait ensures types can be safely transmitted as plain bytes
#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for SampleKey {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for ThreadKey {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for TimingEvent {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for CompletionEvent {}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::size_of;

    #[test]
    fn test_record_layouts() {
        assert_eq!(size_of::<SampleKey>(), 12);
        assert_eq!(size_of::<ThreadKey>(), 8);
        assert_eq!(size_of::<TimingEvent>(), 24);
        assert_eq!(size_of::<CompletionEvent>(), 32);
    }

    #[test]
    fn test_thread_key_from_pid_tgid() {
        let key = ThreadKey::from_pid_tgid((4242u64 << 32) | 4243);
        assert_eq!(key, ThreadKey::new(4242, 4243));
    }

    #[test]
    fn test_raw_stack_rejects_over_deep_capture() {
        let frames = [0xdead_beef_u64; MAX_STACK_DEPTH + 1];
        assert!(RawStack::from_frames(&frames).is_none());

        let stack = RawStack::from_frames(&frames[..MAX_STACK_DEPTH]).unwrap();
        assert_eq!(stack.depth(), MAX_STACK_DEPTH);
    }

    #[test]
    fn test_decode_short_buffer() {
        let bytes = [0u8; 16];
        assert!(decode::<TimingEvent>(&bytes).is_none());
    }

    #[test]
    fn test_decode_completion_event() {
        let mut bytes = [0u8; 32];
        bytes[..8].copy_from_slice(&1_500u64.to_ne_bytes());
        bytes[8..12].copy_from_slice(&7u32.to_ne_bytes());
        bytes[12..16].copy_from_slice(&8u32.to_ne_bytes());
        bytes[16] = EVENT_TYPE_RETURN;
        bytes[24..].copy_from_slice(&500u64.to_ne_bytes());

        let event = decode::<CompletionEvent>(&bytes).unwrap();
        assert_eq!(event.timestamp_ns, 1_500);
        assert_eq!((event.pid, event.tid), (7, 8));
        assert_eq!(event.event_type, EVENT_TYPE_RETURN);
        assert_eq!(event.duration_ns, 500);
    }

    #[test]
    fn test_drop_reason_indices_are_dense() {
        for (i, reason) in DropReason::ALL.iter().enumerate() {
            assert_eq!(reason.index() as usize, i);
        }
    }
}
