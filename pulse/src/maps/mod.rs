//! # Host-Side Bounded Stores
//!
//! Userspace counterparts of the kernel maps, with the same contracts:
//! fixed capacity, per-key atomic updates, strict inserts and drop-on-full.
//! They implement the `pulse-common` store traits, so [`StackSampler`] and
//! [`ProbeTracer`] run on the host exactly as they run in the kernel. The
//! integration tests drive them from many threads at once.
//!
//! | Kernel map          | Host store                |
//! |---------------------|---------------------------|
//! | `STACK_TRACES`      | [`StackTraceTable`]       |
//! | `SAMPLE_COUNTS`     | [`SampleCounterTable`]    |
//! | `ENTRY_TIMESTAMPS`  | [`EntryTimestampTable`]   |
//! | `EVENTS`            | [`EventChannel`]          |
//!
//! [`StackSampler`]: pulse_common::StackSampler
//! [`ProbeTracer`]: pulse_common::ProbeTracer

pub mod bounded_map;
pub mod clock;
pub mod counter_table;
pub mod event_channel;
pub mod stack_table;
pub mod timestamp_table;

pub use bounded_map::{BoundedMap, MapKey};
pub use clock::{ManualClock, MonotonicNow};
pub use counter_table::SampleCounterTable;
pub use event_channel::{EventChannel, RawRecord, Reservation};
pub use stack_table::{StackTraceTable, ThreadStacks};
pub use timestamp_table::EntryTimestampTable;
