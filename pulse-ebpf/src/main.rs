//! # eBPF Kernel-Side Programs
//!
//! Trigger handlers that run inside the Linux kernel. The decision logic
//! lives in `pulse-common` ([`StackSampler`], [`ProbeTracer`]); this crate
//! only binds it to BPF maps and helpers.
//!
//! ## Programs
//!
//! - **Perf Event**: `sample_stacks` - counts (pid, user stack, kernel stack)
//! - **Uprobe**: `probe_entry` - stamps the calling thread
//! - **Uretprobe**: `probe_exit` - computes the call duration, emits an event
//!
//! ## Maps (Shared with Userspace)
//!
//! - `STACK_TRACES` - Captured stacks by id
//! - `SAMPLE_COUNTS` - Sample count per [`SampleKey`]
//! - `ENTRY_TIMESTAMPS` - Open entry/exit window per thread
//! - `EVENTS` - Ring buffer (256KB) for timing events
//! - `CONFIG` - Runtime configuration (target PID, emission mode)
//! - `DIAGNOSTICS` - Drop counters indexed by [`DropReason`]
//!
//! ## Build
//!
//! ```bash
//! cargo xtask build-ebpf
//! ```

#![no_std]
#![no_main]
#![allow(unused_unsafe)]

use core::sync::atomic::{AtomicU64, Ordering};

use aya_ebpf::{
    bindings,
    helpers::{bpf_get_current_pid_tgid, bpf_ktime_get_ns},
    macros::{map, perf_event, uprobe, uretprobe},
    maps::{ring_buf::RingBufEntry, Array, HashMap, RingBuf, StackTrace},
    programs::{PerfEventContext, ProbeContext, RetProbeContext},
    EbpfContext,
};
use aya_log_ebpf::debug;
use pulse_common::{
    CaptureOutcome, CountOutcome, CounterStore, DropReason, EmissionMode, EmitOutcome,
    EventSink, InsertError, MonotonicClock, ProbeTracer, Record, Reserved, SampleKey,
    StackSampler, StackSpace, StackStore, ThreadKey, TimestampStore, CONFIG_EMISSION_MODE,
    CONFIG_TARGET_PID, DROP_REASON_COUNT, ENTRY_TIMESTAMPS_MAX_ENTRIES, EVENT_CHANNEL_BYTES,
    SAMPLE_COUNTS_MAX_ENTRIES, STACK_TRACES_MAX_ENTRIES,
};

// ============================================================================
// Constants
// ============================================================================

/// `bpf_get_stackid` flag: walk the user-space stack instead of the kernel's.
///
/// Never combined with `BPF_F_REUSE_STACKID`: a live id must keep referring
/// to the frames it was assigned.
const USER_STACK_FLAGS: u64 = bindings::BPF_F_USER_STACK as u64;

/// Map update flags
const UPDATE_ANY: u64 = bindings::BPF_ANY as u64;
const UPDATE_NOEXIST: u64 = bindings::BPF_NOEXIST as u64;

// Negated kernel return codes
const E2BIG: i64 = 7;
const EFAULT: i64 = 14;
const EEXIST: i64 = 17;

// ============================================================================
// eBPF Maps - Shared data structures between kernel and userspace
// ============================================================================

/// Stack trace map: stack id → array of instruction pointers
///
/// - **Max Entries**: 10240 unique stacks
/// - **Usage**: Kernel captures with `get_stackid()`, userspace reads frames
///   and deletes ids once drained
///
/// Identical frame sequences share an id. A full map makes new captures fail
/// with -ENOMEM / -EEXIST, which degrades the sample to the -1 sentinel.
#[map]
static STACK_TRACES: StackTrace = StackTrace::with_max_entries(STACK_TRACES_MAX_ENTRIES, 0);

/// Map: [`SampleKey`] → number of samples
///
/// Existing buckets are bumped with an atomic add. New buckets are created
/// with `BPF_NOEXIST` so two CPUs never both create the same key.
#[map]
static SAMPLE_COUNTS: HashMap<SampleKey, u64> =
    HashMap::with_max_entries(SAMPLE_COUNTS_MAX_ENTRIES, 0);

/// Map: [`ThreadKey`] → entry timestamp (ns)
///
/// At most one open window per thread; removed on exit.
#[map]
static ENTRY_TIMESTAMPS: HashMap<ThreadKey, u64> =
    HashMap::with_max_entries(ENTRY_TIMESTAMPS_MAX_ENTRIES, 0);

/// Ring buffer for timing events (split or combined records)
#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(EVENT_CHANNEL_BYTES, 0);

/// Map: Config key → Config value
///
/// - **Key 0**: Target PID (0 = every process)
/// - **Key 1**: Emission mode (0 = split, 1 = combined)
#[map]
static CONFIG: HashMap<u32, u64> = HashMap::with_max_entries(16, 0);

/// Drop counters, one slot per [`DropReason`]
#[map]
static DIAGNOSTICS: Array<u64> = Array::with_max_entries(DROP_REASON_COUNT, 0);

// ============================================================================
// Map bindings for the shared trigger logic
// ============================================================================

/// Stack capture from the current trigger context
struct ContextStacks<'a, C>(&'a C);

impl<C: EbpfContext> StackStore for ContextStacks<'_, C> {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn capture(&self, space: StackSpace) -> CaptureOutcome {
        let flags = match space {
            StackSpace::User => USER_STACK_FLAGS,
            StackSpace::Kernel => 0,
        };
        match unsafe { STACK_TRACES.get_stackid(self.0, flags) } {
            Ok(id) => CaptureOutcome::Stored(id as u32),
            Err(e) if e == -EFAULT => CaptureOutcome::NoFrames,
            Err(e) if e == -E2BIG => CaptureOutcome::TooDeep,
            Err(_) => CaptureOutcome::StorageFull,
        }
    }
}

struct CountMap;

impl CounterStore for CountMap {
    fn increment(&self, key: &SampleKey) -> bool {
        match SAMPLE_COUNTS.get_ptr_mut(key) {
            Some(count) => {
                unsafe { AtomicU64::from_ptr(count) }.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    fn insert_new(&self, key: &SampleKey, count: u64) -> Result<(), InsertError> {
        SAMPLE_COUNTS.insert(key, &count, UPDATE_NOEXIST).map_err(|e| {
            if e == -EEXIST {
                InsertError::AlreadyPresent
            } else {
                InsertError::CapacityExceeded
            }
        })
    }
}

struct TimestampMap;

impl TimestampStore for TimestampMap {
    fn store(&self, thread: &ThreadKey, timestamp_ns: u64) -> Result<(), InsertError> {
        ENTRY_TIMESTAMPS
            .insert(thread, &timestamp_ns, UPDATE_ANY)
            .map_err(|_| InsertError::CapacityExceeded)
    }

    fn take(&self, thread: &ThreadKey) -> Option<u64> {
        // Only the owning thread touches its own key, so lookup+delete is
        // not raced by another writer.
        let start = unsafe { ENTRY_TIMESTAMPS.get(thread).copied() };
        let _ = ENTRY_TIMESTAMPS.remove(thread);
        start
    }
}

struct RingSink;

struct RingSlot<T: 'static>(RingBufEntry<T>);

impl<T: Record> Reserved<T> for RingSlot<T> {
    fn submit(mut self, record: T) {
        self.0.write(record);
        self.0.submit(0);
    }
}

impl EventSink for RingSink {
    fn reserve<T: Record>(&self) -> Option<impl Reserved<T>> {
        EVENTS.reserve::<T>(0).map(RingSlot)
    }
}

struct KernelClock;

impl MonotonicClock for KernelClock {
    fn now_ns(&self) -> u64 {
        unsafe { bpf_ktime_get_ns() }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn count_drop(reason: DropReason) {
    if let Some(slot) = DIAGNOSTICS.get_ptr_mut(reason.index()) {
        unsafe { AtomicU64::from_ptr(slot) }.fetch_add(1, Ordering::Relaxed);
    }
}

#[allow(clippy::cast_possible_truncation)]
fn target_pid() -> u32 {
    unsafe { CONFIG.get(&CONFIG_TARGET_PID).map_or(0, |v| *v as u32) }
}

fn emission_mode() -> EmissionMode {
    unsafe {
        CONFIG
            .get(&CONFIG_EMISSION_MODE)
            .map_or(EmissionMode::Split, |v| EmissionMode::from_raw(*v))
    }
}

fn current_thread() -> ThreadKey {
    ThreadKey::from_pid_tgid(unsafe { bpf_get_current_pid_tgid() })
}

fn is_filtered_out(thread: &ThreadKey) -> bool {
    let target = target_pid();
    target != 0 && thread.pid != target
}

// ============================================================================
// eBPF Program Hooks
// ============================================================================

/// CPU Sampling Profiler - counts one stack sample per perf_event trigger
#[perf_event]
pub fn sample_stacks(ctx: PerfEventContext) -> u32 {
    try_sample_stacks(&ctx);
    0
}

fn try_sample_stacks(ctx: &PerfEventContext) {
    let thread = current_thread();
    if is_filtered_out(&thread) {
        return;
    }

    let stacks = ContextStacks(ctx);
    let outcome = StackSampler::new(&stacks, &CountMap).sample(thread.pid);

    if !outcome.user.is_stored() {
        count_drop(DropReason::UserStackMissing);
    }
    if !outcome.kernel.is_stored() {
        count_drop(DropReason::KernelStackMissing);
    }
    match outcome.count {
        CountOutcome::Incremented | CountOutcome::Inserted => {}
        CountOutcome::LostRace => count_drop(DropReason::SampleLostRace),
        CountOutcome::CapacityExceeded => {
            debug!(ctx, "sample table full, dropping sample for pid {}", thread.pid);
            count_drop(DropReason::SampleTableFull);
        }
    }
}

/// Hook: entry of the instrumented function
#[uprobe]
pub fn probe_entry(ctx: ProbeContext) -> u32 {
    try_probe_entry(&ctx);
    0
}

fn try_probe_entry(ctx: &ProbeContext) {
    let thread = current_thread();
    if is_filtered_out(&thread) {
        return;
    }

    let tracer = ProbeTracer::new(&TimestampMap, &RingSink, &KernelClock, emission_mode());
    let outcome = tracer.on_entry(thread);

    if outcome.store.is_err() {
        count_drop(DropReason::EntryTableFull);
    }
    if outcome.emit == EmitOutcome::ChannelFull {
        debug!(ctx, "event channel full on entry, tid {}", thread.tid);
        count_drop(DropReason::ChannelFull);
    }
}

/// Hook: return of the instrumented function
#[uretprobe]
pub fn probe_exit(ctx: RetProbeContext) -> u32 {
    try_probe_exit(&ctx);
    0
}

fn try_probe_exit(ctx: &RetProbeContext) {
    let thread = current_thread();
    if is_filtered_out(&thread) {
        return;
    }

    let tracer = ProbeTracer::new(&TimestampMap, &RingSink, &KernelClock, emission_mode());
    let outcome = tracer.on_exit(thread);

    if outcome.duration_ns.is_none() {
        count_drop(DropReason::ExitWithoutEntry);
    }
    if outcome.emit == EmitOutcome::ChannelFull {
        debug!(ctx, "event channel full on exit, tid {}", thread.tid);
        count_drop(DropReason::ChannelFull);
    }
}

#[cfg(all(not(test), target_os = "none"))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
