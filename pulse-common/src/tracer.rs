//! Function entry/exit timing
//!
//! [`ProbeTracer`] is bound to one instrumented function. `on_entry` runs on
//! the uprobe, `on_exit` on the matching uretprobe, possibly on many CPUs at
//! once for different threads.
//!
//! Per thread the state machine is `Idle -> on_entry -> InWindow -> on_exit
//! -> Idle`. The entry timestamp table holds a single slot per thread: a
//! second `on_entry` while in the window overwrites the start time, so
//! recursive calls into the same function are not timed correctly (the
//! outer call's start is lost).

use crate::sampler::InsertError;
use crate::{CompletionEvent, Record, ThreadKey, TimingEvent, EVENT_TYPE_RETURN};

/// Smallest duration a split-mode exit record carries
pub const MIN_SPLIT_EXIT_NS: u64 = 1;

/// How timing events are reported through the event channel
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EmissionMode {
    /// Entry and exit each emit a [`TimingEvent`]; exits without a matching
    /// entry are suppressed and exit durations are at least
    /// [`MIN_SPLIT_EXIT_NS`].
    #[default]
    Split,
    /// Only exits emit a [`CompletionEvent`]; exits without a matching entry
    /// report a zero duration.
    Combined,
}

impl EmissionMode {
    /// Decode the `CONFIG_EMISSION_MODE` value. Unknown values mean `Split`.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        match raw {
            1 => EmissionMode::Combined,
            _ => EmissionMode::Split,
        }
    }

    #[must_use]
    pub const fn as_raw(self) -> u64 {
        match self {
            EmissionMode::Split => 0,
            EmissionMode::Combined => 1,
        }
    }
}

/// Shared monotonic clock, nanoseconds
pub trait MonotonicClock {
    fn now_ns(&self) -> u64;
}

/// Entry-timestamp table operations needed on the trigger path
pub trait TimestampStore {
    /// Insert or overwrite the entry time of `thread`.
    ///
    /// # Errors
    /// Fails when the table is full and `thread` has no slot yet.
    fn store(&self, thread: &ThreadKey, timestamp_ns: u64) -> Result<(), InsertError>;

    /// Look up and delete the entry time of `thread` in one step.
    fn take(&self, thread: &ThreadKey) -> Option<u64>;
}

/// Producer side of the event channel.
///
/// `reserve` never waits: it returns `None` when the channel has no room.
pub trait EventSink {
    fn reserve<T: Record>(&self) -> Option<impl Reserved<T>>;
}

/// Space claimed in the event channel for one record
pub trait Reserved<T: Record> {
    /// Write `record` and make it visible to the consumer.
    fn submit(self, record: T);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmitOutcome {
    Submitted,
    /// Reservation failed; the event was dropped
    ChannelFull,
    /// Nothing to emit in the configured mode
    NotEmitted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryOutcome {
    pub timestamp_ns: u64,
    pub store: Result<(), InsertError>,
    pub emit: EmitOutcome,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExitOutcome {
    pub timestamp_ns: u64,
    /// `None` when no entry timestamp was found for the thread
    pub duration_ns: Option<u64>,
    pub emit: EmitOutcome,
}

/// Orchestrates the entry-timestamp table and the event channel
pub struct ProbeTracer<'a, T, E, C> {
    entries: &'a T,
    events: &'a E,
    clock: &'a C,
    mode: EmissionMode,
}

impl<'a, T, E, C> ProbeTracer<'a, T, E, C>
where
    T: TimestampStore,
    E: EventSink,
    C: MonotonicClock,
{
    pub const fn new(entries: &'a T, events: &'a E, clock: &'a C, mode: EmissionMode) -> Self {
        Self { entries, events, clock, mode }
    }

    #[must_use]
    pub const fn mode(&self) -> EmissionMode {
        self.mode
    }

    /// Function entry: stamp the thread, then report the entry (split mode).
    ///
    /// The timestamp write is unconditional and overwrites any open window.
    #[inline(always)]
    pub fn on_entry(&self, thread: ThreadKey) -> EntryOutcome {
        let now = self.clock.now_ns();
        let store = self.entries.store(&thread, now);

        let emit = match self.mode {
            EmissionMode::Split => self.emit(TimingEvent {
                timestamp_ns: now,
                pid: thread.pid,
                tid: thread.tid,
                duration_ns: 0,
            }),
            EmissionMode::Combined => EmitOutcome::NotEmitted,
        };

        EntryOutcome { timestamp_ns: now, store, emit }
    }

    /// Function return: close the thread's window and report the duration.
    ///
    /// The entry record is deleted whether or not it was found.
    #[inline(always)]
    pub fn on_exit(&self, thread: ThreadKey) -> ExitOutcome {
        let now = self.clock.now_ns();
        let duration_ns = self.entries.take(&thread).map(|start| now.saturating_sub(start));

        let emit = match (self.mode, duration_ns) {
            // A zero duration marks an entry in this layout
            (EmissionMode::Split, Some(duration_ns)) => self.emit(TimingEvent {
                timestamp_ns: now,
                pid: thread.pid,
                tid: thread.tid,
                duration_ns: duration_ns.max(MIN_SPLIT_EXIT_NS),
            }),
            (EmissionMode::Split, None) => EmitOutcome::NotEmitted,
            (EmissionMode::Combined, duration_ns) => self.emit(CompletionEvent {
                timestamp_ns: now,
                pid: thread.pid,
                tid: thread.tid,
                event_type: EVENT_TYPE_RETURN,
                _padding: [0u8; 7],
                duration_ns: duration_ns.unwrap_or(0),
            }),
        };

        ExitOutcome { timestamp_ns: now, duration_ns, emit }
    }

    #[inline(always)]
    fn emit<R: Record>(&self, record: R) -> EmitOutcome {
        match self.events.reserve::<R>() {
            Some(slot) => {
                slot.submit(record);
                EmitOutcome::Submitted
            }
            None => EmitOutcome::ChannelFull,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::{Cell, RefCell};
    use std::vec::Vec;

    struct StepClock(Cell<u64>);

    impl MonotonicClock for StepClock {
        fn now_ns(&self) -> u64 {
            self.0.get()
        }
    }

    #[derive(Default)]
    struct OneSlot(Cell<Option<(ThreadKey, u64)>>);

    impl TimestampStore for OneSlot {
        fn store(&self, thread: &ThreadKey, timestamp_ns: u64) -> Result<(), InsertError> {
            match self.0.get() {
                Some((held, _)) if held != *thread => Err(InsertError::CapacityExceeded),
                _ => {
                    self.0.set(Some((*thread, timestamp_ns)));
                    Ok(())
                }
            }
        }

        fn take(&self, thread: &ThreadKey) -> Option<u64> {
            match self.0.get() {
                Some((held, ts)) if held == *thread => {
                    self.0.set(None);
                    Some(ts)
                }
                _ => None,
            }
        }
    }

    /// Records submitted payload sizes; refuses reservations past `room`.
    #[derive(Default)]
    struct Sizes {
        room: Cell<usize>,
        sizes: RefCell<Vec<usize>>,
    }

    struct SizeSlot<'a>(&'a Sizes);

    impl<T: Record> Reserved<T> for SizeSlot<'_> {
        fn submit(self, _record: T) {
            self.0.sizes.borrow_mut().push(core::mem::size_of::<T>());
        }
    }

    impl EventSink for Sizes {
        fn reserve<T: Record>(&self) -> Option<impl Reserved<T>> {
            let room = self.room.get();
            if room == 0 {
                return None;
            }
            self.room.set(room - 1);
            Some(SizeSlot(self))
        }
    }

    const THREAD: ThreadKey = ThreadKey::new(10, 11);

    #[test]
    fn test_split_mode_emits_entry_and_exit() {
        let clock = StepClock(Cell::new(1_000));
        let entries = OneSlot::default();
        let events = Sizes { room: Cell::new(8), ..Default::default() };
        let tracer = ProbeTracer::new(&entries, &events, &clock, EmissionMode::Split);

        let entry = tracer.on_entry(THREAD);
        assert_eq!(entry.store, Ok(()));
        assert_eq!(entry.emit, EmitOutcome::Submitted);

        clock.0.set(1_500);
        let exit = tracer.on_exit(THREAD);
        assert_eq!(exit.duration_ns, Some(500));
        assert_eq!(events.sizes.borrow().as_slice(), &[24, 24]);
    }

    #[test]
    fn test_combined_mode_reports_zero_on_miss() {
        let clock = StepClock(Cell::new(5));
        let entries = OneSlot::default();
        let events = Sizes { room: Cell::new(8), ..Default::default() };
        let tracer = ProbeTracer::new(&entries, &events, &clock, EmissionMode::Combined);

        let exit = tracer.on_exit(THREAD);
        assert_eq!(exit.duration_ns, None);
        assert_eq!(exit.emit, EmitOutcome::Submitted);
        assert_eq!(events.sizes.borrow().as_slice(), &[32]);
    }

    #[test]
    fn test_clock_skew_saturates_to_zero() {
        let clock = StepClock(Cell::new(2_000));
        let entries = OneSlot::default();
        let events = Sizes { room: Cell::new(8), ..Default::default() };
        let tracer = ProbeTracer::new(&entries, &events, &clock, EmissionMode::Split);

        tracer.on_entry(THREAD);
        clock.0.set(1_999);
        assert_eq!(tracer.on_exit(THREAD).duration_ns, Some(0));
    }

    #[test]
    fn test_full_channel_drops_silently() {
        let clock = StepClock(Cell::new(0));
        let entries = OneSlot::default();
        let events = Sizes::default();
        let tracer = ProbeTracer::new(&entries, &events, &clock, EmissionMode::Split);

        let entry = tracer.on_entry(THREAD);
        assert_eq!(entry.emit, EmitOutcome::ChannelFull);
        // The timestamp is still recorded so the exit can be measured
        assert_eq!(entry.store, Ok(()));
    }

    #[test]
    fn test_emission_mode_raw_values() {
        assert_eq!(EmissionMode::from_raw(EmissionMode::Combined.as_raw()), EmissionMode::Combined);
        assert_eq!(EmissionMode::from_raw(0), EmissionMode::Split);
        assert_eq!(EmissionMode::from_raw(42), EmissionMode::Split);
    }
}
