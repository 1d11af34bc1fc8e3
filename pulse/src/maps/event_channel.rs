//! Host-side event channel
//!
//! Bounded multi-producer byte ring laid out like the kernel ring buffer: a
//! record takes an 8-byte header plus its payload rounded up to 8 bytes.
//! Producers claim space by advancing `producer_pos` with a CAS, write the
//! payload, then publish the header. A header of zero means "not committed
//! yet", so the consumer stops at a reservation that has not been submitted
//! and never sees its bytes. Consumed words are zeroed before `consumer_pos`
//! moves past them, which keeps every free word zero.

use std::marker::PhantomData;
use std::mem::size_of;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use pulse_common::{decode, EventSink, Record, Reserved, EVENT_CHANNEL_BYTES};

const WORD_BYTES: usize = size_of::<u64>();

const RECORD_HEADER_BYTES: usize = WORD_BYTES;

/// CAS attempts a producer makes before reporting the channel full
const RESERVE_ATTEMPTS: usize = 16;

const HEADER_LEN_MASK: u64 = 0xffff_ffff;
const HEADER_COMMITTED: u64 = 1 << 32;
const HEADER_DISCARDED: u64 = 1 << 33;

/// Bytes one record of `payload` bytes occupies in the ring
#[must_use]
pub const fn record_footprint(payload: usize) -> usize {
    RECORD_HEADER_BYTES + payload.div_ceil(WORD_BYTES) * WORD_BYTES
}

pub struct EventChannel {
    words: Box<[AtomicU64]>,
    /// Next free word, monotonic
    producer_pos: AtomicUsize,
    /// Oldest unconsumed word, monotonic
    consumer_pos: AtomicUsize,
    consumer: Mutex<()>,
}

impl EventChannel {
    /// Channel over `byte_size` bytes, rounded down to whole 8-byte words.
    #[must_use]
    pub fn with_byte_size(byte_size: usize) -> Self {
        let words = (0..byte_size / WORD_BYTES).map(|_| AtomicU64::new(0)).collect();
        Self {
            words,
            producer_pos: AtomicUsize::new(0),
            consumer_pos: AtomicUsize::new(0),
            consumer: Mutex::new(()),
        }
    }

    /// Usable bytes
    #[must_use]
    pub fn capacity_bytes(&self) -> usize {
        self.words.len() * WORD_BYTES
    }

    /// Records of type `T` the channel holds when no consumer drains it
    #[must_use]
    pub fn capacity_for<T: Record>(&self) -> usize {
        self.capacity_bytes() / record_footprint(size_of::<T>())
    }

    /// Bytes taken by reserved or published records not yet consumed
    #[must_use]
    pub fn used_bytes(&self) -> usize {
        let consumed = self.consumer_pos.load(Ordering::Acquire);
        let produced = self.producer_pos.load(Ordering::Acquire);
        produced.saturating_sub(consumed) * WORD_BYTES
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.used_bytes() == 0
    }

    /// Claim space for one `T`. Never waits; `None` when there is no room.
    #[must_use]
    pub fn try_reserve<T: Record>(&self) -> Option<Reservation<'_, T>> {
        let needed = record_footprint(size_of::<T>()) / WORD_BYTES;
        if needed > self.words.len() {
            return None;
        }

        let mut pos = self.producer_pos.load(Ordering::Relaxed);
        for _ in 0..RESERVE_ATTEMPTS {
            let consumed = self.consumer_pos.load(Ordering::Acquire);
            if (pos + needed).saturating_sub(consumed) > self.words.len() {
                return None;
            }
            match self.producer_pos.compare_exchange_weak(
                pos,
                pos + needed,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    let pos = Some(pos);
                    return Some(Reservation { channel: self, pos, _record: PhantomData });
                }
                Err(current) => pos = current,
            }
        }
        None
    }

    fn word(&self, pos: usize) -> &AtomicU64 {
        &self.words[pos % self.words.len()]
    }

    /// Pop the oldest published record, skipping discarded reservations.
    ///
    /// Returns `None` if the channel is empty or the oldest reservation has
    /// not been submitted yet.
    pub fn try_recv(&self) -> Option<RawRecord> {
        if self.words.is_empty() {
            return None;
        }
        let _consumer = self.consumer.lock().unwrap_or_else(PoisonError::into_inner);

        let mut pos = self.consumer_pos.load(Ordering::Relaxed);
        loop {
            let header = self.word(pos).load(Ordering::Acquire);
            if header == 0 {
                return None;
            }

            #[allow(clippy::cast_possible_truncation)]
            let len = (header & HEADER_LEN_MASK) as usize;
            let payload_words = len.div_ceil(WORD_BYTES);

            let mut bytes = Vec::with_capacity(payload_words * WORD_BYTES);
            for i in 1..=payload_words {
                let word = self.word(pos + i).load(Ordering::Relaxed);
                bytes.extend_from_slice(&word.to_ne_bytes());
            }
            bytes.truncate(len);

            for i in 0..=payload_words {
                self.word(pos + i).store(0, Ordering::Relaxed);
            }
            pos += 1 + payload_words;
            self.consumer_pos.store(pos, Ordering::Release);

            if header & HEADER_DISCARDED == 0 {
                return Some(RawRecord { bytes });
            }
        }
    }

    /// Pop every record currently visible.
    pub fn drain(&self) -> Vec<RawRecord> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::with_byte_size(EVENT_CHANNEL_BYTES as usize)
    }
}

impl EventSink for EventChannel {
    fn reserve<T: Record>(&self) -> Option<impl Reserved<T>> {
        self.try_reserve::<T>()
    }
}

/// Claimed space for one `T`. Dropping it without [`Reserved::submit`]
/// discards it.
pub struct Reservation<'a, T> {
    channel: &'a EventChannel,
    pos: Option<usize>,
    _record: PhantomData<T>,
}

impl<T: Record> Reserved<T> for Reservation<'_, T> {
    fn submit(mut self, record: T) {
        let Some(pos) = self.pos.take() else {
            return;
        };
        for (i, chunk) in record_bytes(&record).chunks(WORD_BYTES).enumerate() {
            let mut word = [0u8; WORD_BYTES];
            word[..chunk.len()].copy_from_slice(chunk);
            self.channel.word(pos + 1 + i).store(u64::from_ne_bytes(word), Ordering::Relaxed);
        }
        let header = size_of::<T>() as u64 | HEADER_COMMITTED;
        self.channel.word(pos).store(header, Ordering::Release);
    }
}

impl<T> Drop for Reservation<'_, T> {
    fn drop(&mut self) {
        if let Some(pos) = self.pos.take() {
            let header = size_of::<T>() as u64 | HEADER_DISCARDED;
            self.channel.word(pos).store(header, Ordering::Release);
        }
    }
}

#[allow(unsafe_code)]
fn record_bytes<T: Record>(record: &T) -> &[u8] {
    // SAFETY: `Record` types are `repr(C)` plain data without pointers
    unsafe {
        std::slice::from_raw_parts(std::ptr::from_ref(record).cast::<u8>(), size_of::<T>())
    }
}

/// One record as the consumer sees it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawRecord {
    bytes: Vec<u8>,
}

impl RawRecord {
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn decode<T: Record>(&self) -> Option<T> {
        decode(self.bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_common::{CompletionEvent, TimingEvent};

    fn event(n: u64) -> TimingEvent {
        TimingEvent { timestamp_ns: n, pid: 1, tid: 2, duration_ns: n * 10 }
    }

    #[test]
    fn test_footprint_is_header_plus_padded_payload() {
        assert_eq!(record_footprint(size_of::<TimingEvent>()), 32);
        assert_eq!(record_footprint(size_of::<CompletionEvent>()), 40);
        assert_eq!(record_footprint(1), 16);
    }

    #[test]
    fn test_capacity_from_byte_size() {
        let channel = EventChannel::default();
        assert_eq!(channel.capacity_bytes(), 256 * 1024);
        assert_eq!(channel.capacity_for::<TimingEvent>(), 8192);
        assert_eq!(channel.capacity_for::<CompletionEvent>(), 256 * 1024 / 40);
        assert_eq!(EventChannel::with_byte_size(100).capacity_bytes(), 96);
    }

    #[test]
    fn test_records_arrive_in_order() {
        let channel = EventChannel::with_byte_size(400);
        for n in 0..3 {
            channel.try_reserve::<TimingEvent>().unwrap().submit(event(n));
        }

        let got: Vec<u64> = channel
            .drain()
            .iter()
            .map(|r| r.decode::<TimingEvent>().unwrap().timestamp_ns)
            .collect();
        assert_eq!(got, vec![0, 1, 2]);
    }

    #[test]
    fn test_full_channel_refuses_reservation() {
        let channel = EventChannel::with_byte_size(64);
        assert_eq!(channel.capacity_for::<TimingEvent>(), 2);

        channel.try_reserve::<TimingEvent>().unwrap().submit(event(1));
        channel.try_reserve::<TimingEvent>().unwrap().submit(event(2));
        assert!(channel.try_reserve::<TimingEvent>().is_none());

        channel.try_recv().unwrap();
        assert!(channel.try_reserve::<TimingEvent>().is_some());
    }

    #[test]
    fn test_single_record_channel_never_overwrites() {
        let channel = EventChannel::with_byte_size(32);
        assert_eq!(channel.capacity_for::<TimingEvent>(), 1);

        let accepted = (0..3)
            .filter(|&n| {
                channel.try_reserve::<TimingEvent>().map(|slot| slot.submit(event(n))).is_some()
            })
            .count();
        assert_eq!(accepted, 1);

        let records = channel.drain();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].decode::<TimingEvent>().unwrap(), event(0));
        assert!(channel.is_empty());

        // The slot is free again once consumed
        channel.try_reserve::<TimingEvent>().unwrap().submit(event(7));
        assert_eq!(channel.drain()[0].decode::<TimingEvent>().unwrap(), event(7));
    }

    #[test]
    fn test_record_larger_than_channel_is_refused() {
        let channel = EventChannel::with_byte_size(32);
        assert!(channel.try_reserve::<CompletionEvent>().is_none());
        assert!(channel.try_recv().is_none());
        assert!(EventChannel::with_byte_size(0).try_reserve::<TimingEvent>().is_none());
    }

    #[test]
    fn test_mixed_sizes_wrap_around() {
        // 9 words per round over 10: records straddle the end of the ring
        let channel = EventChannel::with_byte_size(80);
        for n in 0..10u64 {
            channel.try_reserve::<TimingEvent>().unwrap().submit(event(n));
            let completion = CompletionEvent {
                timestamp_ns: n,
                pid: 3,
                tid: 4,
                event_type: 1,
                _padding: [0; 7],
                duration_ns: n + 1,
            };
            channel.try_reserve::<CompletionEvent>().unwrap().submit(completion);

            let records = channel.drain();
            assert_eq!(records.len(), 2);
            assert_eq!(records[0].decode::<TimingEvent>().unwrap(), event(n));
            let got: CompletionEvent = records[1].decode().unwrap();
            assert_eq!(got.duration_ns, n + 1);
        }
    }

    #[test]
    fn test_unsubmitted_reservation_is_never_visible() {
        let channel = EventChannel::with_byte_size(400);
        let pending = channel.try_reserve::<TimingEvent>().unwrap();
        assert!(channel.try_recv().is_none());

        drop(pending);
        channel.try_reserve::<TimingEvent>().unwrap().submit(event(9));

        let records = channel.drain();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].decode::<TimingEvent>().unwrap(), event(9));
        assert!(channel.is_empty());
    }
}
