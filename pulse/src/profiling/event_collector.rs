//! # Function Timing Event Collection
//!
//! Consumes records from the `EVENTS` ring buffer (or the host-side
//! [`EventChannel`]) and decodes them according to the active
//! [`EmissionMode`].
//!
//! - **Split**: every record is a 24-byte [`TimingEvent`]. Entries carry a
//!   zero duration, exits the measured one (at least 1 ns).
//! - **Combined**: every record is a 32-byte [`CompletionEvent`] tagged with
//!   an event type.
//!
//! Decoded events update running [`CallStats`] and can be exported as JSON
//! lines.

use aya::maps::{MapData, RingBuf};
use log::warn;
use pulse_common::{
    decode, CompletionEvent, EmissionMode, TimingEvent, EVENT_TYPE_ENTRY, EVENT_TYPE_RETURN,
};
use serde::Serialize;
use std::io::Write;

use crate::domain::{CollectError, Duration};
use crate::maps::EventChannel;

/// One decoded function timing event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbeEvent {
    Entry { timestamp_ns: u64, pid: u32, tid: u32 },
    Exit { timestamp_ns: u64, pid: u32, tid: u32, duration_ns: u64 },
    Completion { timestamp_ns: u64, pid: u32, tid: u32, duration_ns: u64 },
}

impl ProbeEvent {
    /// Measured duration, `None` for entries
    #[must_use]
    pub fn duration_ns(&self) -> Option<u64> {
        match *self {
            ProbeEvent::Entry { .. } => None,
            ProbeEvent::Exit { duration_ns, .. } | ProbeEvent::Completion { duration_ns, .. } => {
                Some(duration_ns)
            }
        }
    }
}

/// Decode one ring buffer record
///
/// # Errors
/// [`CollectError::TruncatedRecord`] if the record is shorter than the mode's
/// record type, [`CollectError::UnknownEventType`] for an unrecognised
/// combined event type.
pub fn decode_event(mode: EmissionMode, bytes: &[u8]) -> Result<ProbeEvent, CollectError> {
    match mode {
        EmissionMode::Split => {
            let event: TimingEvent = decode(bytes)
                .ok_or(CollectError::TruncatedRecord { kind: "timing", len: bytes.len() })?;
            let TimingEvent { timestamp_ns, pid, tid, duration_ns } = event;
            Ok(if duration_ns == 0 {
                ProbeEvent::Entry { timestamp_ns, pid, tid }
            } else {
                ProbeEvent::Exit { timestamp_ns, pid, tid, duration_ns }
            })
        }
        EmissionMode::Combined => {
            let event: CompletionEvent = decode(bytes)
                .ok_or(CollectError::TruncatedRecord { kind: "completion", len: bytes.len() })?;
            let CompletionEvent { timestamp_ns, pid, tid, event_type, duration_ns, .. } = event;
            match event_type {
                EVENT_TYPE_RETURN => {
                    Ok(ProbeEvent::Completion { timestamp_ns, pid, tid, duration_ns })
                }
                EVENT_TYPE_ENTRY => Ok(ProbeEvent::Entry { timestamp_ns, pid, tid }),
                other => Err(CollectError::UnknownEventType(other)),
            }
        }
    }
}

/// Running totals over completed calls
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CallStats {
    pub entries: u64,
    pub calls: u64,
    pub total_ns: u64,
    pub min_ns: Option<u64>,
    pub max_ns: u64,
    /// Completions reported with a zero duration (exit without a matching entry)
    pub unmatched: u64,
}

impl CallStats {
    pub fn record(&mut self, event: &ProbeEvent) {
        let Some(duration) = event.duration_ns() else {
            self.entries += 1;
            return;
        };
        if duration == 0 {
            self.unmatched += 1;
            return;
        }
        self.calls += 1;
        self.total_ns = self.total_ns.saturating_add(duration);
        self.max_ns = self.max_ns.max(duration);
        self.min_ns = Some(self.min_ns.map_or(duration, |min| min.min(duration)));
    }

    #[must_use]
    pub fn mean(&self) -> Option<Duration> {
        (self.calls > 0).then(|| Duration(self.total_ns / self.calls))
    }

    pub fn print_summary(&self, function: &str) {
        println!("\n📊 {function}");
        println!("   calls:   {}", self.calls);
        if let Some(mean) = self.mean() {
            println!("   mean:    {mean}");
            println!("   min:     {}", Duration(self.min_ns.unwrap_or_default()));
            println!("   max:     {}", Duration(self.max_ns));
            println!("   total:   {}", Duration(self.total_ns));
        }
        if self.unmatched > 0 {
            println!("   unmatched returns: {}", self.unmatched);
        }
    }
}

/// Decodes events, keeps statistics and optionally exports them
pub struct EventCollector<W: Write> {
    mode: EmissionMode,
    stats: CallStats,
    export: Option<W>,
    malformed: u64,
}

impl<W: Write> EventCollector<W> {
    #[must_use]
    pub fn new(mode: EmissionMode, export: Option<W>) -> Self {
        Self { mode, stats: CallStats::default(), export, malformed: 0 }
    }

    #[must_use]
    pub fn stats(&self) -> &CallStats {
        &self.stats
    }

    /// Records that failed to decode
    #[must_use]
    pub fn malformed(&self) -> u64 {
        self.malformed
    }

    /// Decode and account one record
    ///
    /// # Errors
    /// Returns decode errors and export write errors
    pub fn process(&mut self, bytes: &[u8]) -> Result<ProbeEvent, CollectError> {
        let event = decode_event(self.mode, bytes)?;
        self.stats.record(&event);

        if let Some(out) = self.export.as_mut() {
            serde_json::to_writer(&mut *out, &event)?;
            out.write_all(b"\n")?;
        }
        Ok(event)
    }

    fn process_logged(&mut self, bytes: &[u8]) {
        if let Err(e) = self.process(bytes) {
            self.malformed += 1;
            warn!("Skipping event: {e}");
        }
    }

    /// Consume everything currently in the kernel ring buffer
    pub fn drain_ring(&mut self, ring: &mut RingBuf<MapData>) -> usize {
        let mut consumed = 0;
        while let Some(item) = ring.next() {
            self.process_logged(&item);
            consumed += 1;
        }
        consumed
    }

    /// Consume everything currently visible in a host-side channel
    pub fn drain_channel(&mut self, channel: &EventChannel) -> usize {
        let mut consumed = 0;
        while let Some(record) = channel.try_recv() {
            self.process_logged(record.bytes());
            consumed += 1;
        }
        consumed
    }

    /// Flush the export and return the final statistics
    ///
    /// # Errors
    /// Returns an error if flushing the export fails
    pub fn finish(mut self) -> Result<CallStats, CollectError> {
        if let Some(out) = self.export.as_mut() {
            out.flush()?;
        }
        Ok(self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    fn timing_bytes(event: TimingEvent) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(size_of::<TimingEvent>());
        bytes.extend_from_slice(&event.timestamp_ns.to_ne_bytes());
        bytes.extend_from_slice(&event.pid.to_ne_bytes());
        bytes.extend_from_slice(&event.tid.to_ne_bytes());
        bytes.extend_from_slice(&event.duration_ns.to_ne_bytes());
        bytes
    }

    fn completion_bytes(event_type: u8, duration_ns: u64) -> Vec<u8> {
        let mut bytes = vec![0u8; 32];
        bytes[..8].copy_from_slice(&9_000u64.to_ne_bytes());
        bytes[8..12].copy_from_slice(&5u32.to_ne_bytes());
        bytes[12..16].copy_from_slice(&6u32.to_ne_bytes());
        bytes[16] = event_type;
        bytes[24..].copy_from_slice(&duration_ns.to_ne_bytes());
        bytes
    }

    #[test]
    fn test_split_zero_duration_is_entry() {
        let entry = timing_bytes(TimingEvent { timestamp_ns: 100, pid: 1, tid: 2, duration_ns: 0 });
        let exit =
            timing_bytes(TimingEvent { timestamp_ns: 600, pid: 1, tid: 2, duration_ns: 500 });

        assert_eq!(
            decode_event(EmissionMode::Split, &entry).unwrap(),
            ProbeEvent::Entry { timestamp_ns: 100, pid: 1, tid: 2 }
        );
        assert_eq!(decode_event(EmissionMode::Split, &exit).unwrap().duration_ns(), Some(500));
    }

    #[test]
    fn test_combined_decoding() {
        let bytes = completion_bytes(EVENT_TYPE_RETURN, 42);
        let event = decode_event(EmissionMode::Combined, &bytes).unwrap();
        assert_eq!(
            event,
            ProbeEvent::Completion { timestamp_ns: 9_000, pid: 5, tid: 6, duration_ns: 42 }
        );

        assert!(matches!(
            decode_event(EmissionMode::Combined, &completion_bytes(7, 0)),
            Err(CollectError::UnknownEventType(7))
        ));
    }

    #[test]
    fn test_truncated_record_rejected() {
        let short = [0u8; 20];
        assert!(matches!(
            decode_event(EmissionMode::Split, &short),
            Err(CollectError::TruncatedRecord { kind: "timing", len: 20 })
        ));
        // A split record is too short for combined mode
        assert!(decode_event(EmissionMode::Combined, &[0u8; 24]).is_err());
    }

    #[test]
    fn test_stats_and_json_export() {
        let mut out = Vec::new();
        let mut collector = EventCollector::new(EmissionMode::Combined, Some(&mut out));

        collector.process(&completion_bytes(EVENT_TYPE_RETURN, 300)).unwrap();
        collector.process(&completion_bytes(EVENT_TYPE_RETURN, 100)).unwrap();
        collector.process(&completion_bytes(EVENT_TYPE_RETURN, 0)).unwrap();
        let stats = collector.finish().unwrap();

        assert_eq!(stats.calls, 2);
        assert_eq!(stats.unmatched, 1);
        assert_eq!(stats.min_ns, Some(100));
        assert_eq!(stats.max_ns, 300);
        assert_eq!(stats.mean(), Some(Duration(200)));

        let text = String::from_utf8(out).unwrap();
        let first: serde_json::Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(first["kind"], "completion");
        assert_eq!(first["duration_ns"], 300);
        assert_eq!(text.lines().count(), 3);
    }
}
