//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers keep process ids, thread ids and stack ids from
//! being mixed up at call sites that juggle all three.

use std::fmt;

use pulse_common::STACK_ID_NONE;

/// Process ID (TGID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID:{}", self.0)
    }
}

impl From<u32> for Pid {
    fn from(pid: u32) -> Self {
        Pid(pid)
    }
}

#[allow(clippy::cast_possible_wrap)]
impl From<Pid> for i32 {
    fn from(pid: Pid) -> Self {
        pid.0 as i32
    }
}

/// Thread ID
///
/// The kernel's per-thread id. The main thread of a process has `Tid == Pid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tid(pub u32);

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TID:{}", self.0)
    }
}

/// Stack trace ID as recorded in a sample key
///
/// Negative values mean no stack was captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StackId(pub i32);

impl StackId {
    pub const NONE: StackId = StackId(STACK_ID_NONE);

    #[must_use]
    pub fn is_valid(self) -> bool {
        self.0 >= 0
    }

    /// Key into the stack trace map, `None` for the sentinel
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn map_key(self) -> Option<u32> {
        self.is_valid().then_some(self.0 as u32)
    }
}

impl fmt::Display for StackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "stack#{}", self.0)
        } else {
            write!(f, "stack#none")
        }
    }
}

/// Duration in nanoseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Duration(pub u64);

impl Duration {
    #[allow(clippy::cast_precision_loss)]
    pub fn as_millis(self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn as_seconds(self) -> f64 {
        self.0 as f64 / 1_000_000_000.0
    }

    pub fn as_micros(self) -> u64 {
        self.0 / 1_000
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms = self.as_millis();
        if ms >= 1000.0 {
            write!(f, "{:.2}s", self.as_seconds())
        } else if self.0 >= 1_000_000 {
            write!(f, "{ms:.2}ms")
        } else {
            write!(f, "{}µs", self.as_micros())
        }
    }
}
