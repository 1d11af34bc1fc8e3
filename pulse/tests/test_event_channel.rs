use pulse::maps::EventChannel;
use pulse_common::{EventSink, Reserved, TimingEvent};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;

fn event(pid: u32, seq: u64) -> TimingEvent {
    TimingEvent { timestamp_ns: seq, pid, tid: pid, duration_ns: seq + 1 }
}

#[test]
fn test_visible_records_equal_successful_reservations() {
    // Room for 125 records, 8 producers x 50 attempts: most reservations fail
    let channel = EventChannel::with_byte_size(4_000);
    let submitted = AtomicU64::new(0);

    thread::scope(|s| {
        for pid in 0..8u32 {
            let channel = &channel;
            let submitted = &submitted;
            s.spawn(move || {
                for seq in 0..50 {
                    if let Some(slot) = channel.reserve::<TimingEvent>() {
                        slot.submit(event(pid, seq));
                        submitted.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
        }
    });

    let records = channel.drain();
    assert_eq!(records.len() as u64, submitted.load(Ordering::Relaxed));
    assert!(records.len() <= channel.capacity_for::<TimingEvent>());
    for record in records {
        let e: TimingEvent = record.decode().unwrap();
        assert_eq!(e.duration_ns, e.timestamp_ns + 1);
    }
}

#[test]
fn test_concurrent_consumer_sees_every_submitted_record_in_producer_order() {
    let channel = EventChannel::with_byte_size(2_000);
    let submitted = AtomicU64::new(0);
    let done = AtomicBool::new(false);

    let received = thread::scope(|s| {
        let consumer = s.spawn(|| {
            let mut got: Vec<TimingEvent> = Vec::new();
            loop {
                let finished = done.load(Ordering::Acquire);
                got.extend(channel.drain().iter().map(|r| r.decode::<TimingEvent>().unwrap()));
                if finished {
                    return got;
                }
                thread::yield_now();
            }
        });

        let producers: Vec<_> = (0..4u32)
            .map(|pid| {
                let channel = &channel;
                let submitted = &submitted;
                s.spawn(move || {
                    for seq in 0..2_000 {
                        if let Some(slot) = channel.reserve::<TimingEvent>() {
                            slot.submit(event(pid, seq));
                            submitted.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }
        done.store(true, Ordering::Release);
        consumer.join().unwrap()
    });

    assert_eq!(received.len() as u64, submitted.load(Ordering::Relaxed));
    for pid in 0..4u32 {
        let seqs: Vec<u64> =
            received.iter().filter(|e| e.pid == pid).map(|e| e.timestamp_ns).collect();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]), "producer {pid} out of order");
    }
}

#[test]
fn test_abandoned_reservation_leaves_no_record_and_frees_space() {
    let channel = EventChannel::with_byte_size(64);
    {
        let _abandoned = channel.reserve::<TimingEvent>().unwrap();
    }
    channel.reserve::<TimingEvent>().unwrap().submit(event(1, 1));

    let records = channel.drain();
    assert_eq!(records.len(), 1);

    // Both record slots are free again
    channel.reserve::<TimingEvent>().unwrap().submit(event(2, 2));
    channel.reserve::<TimingEvent>().unwrap().submit(event(3, 3));
    assert!(channel.reserve::<TimingEvent>().is_none());
    assert_eq!(channel.drain().len(), 2);
}

#[test]
fn test_one_record_channel_drops_instead_of_overwriting() {
    let channel = EventChannel::with_byte_size(32);
    let submitted = AtomicU64::new(0);

    thread::scope(|s| {
        for pid in 0..4u32 {
            let channel = &channel;
            let submitted = &submitted;
            s.spawn(move || {
                for seq in 0..20 {
                    if let Some(slot) = channel.reserve::<TimingEvent>() {
                        slot.submit(event(pid, seq));
                        submitted.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
        }
    });

    assert_eq!(submitted.load(Ordering::Relaxed), 1);
    let records = channel.drain();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].decode::<TimingEvent>().unwrap().timestamp_ns, 0);
    assert!(channel.is_empty());
}

#[test]
fn test_two_record_channel_cycles_without_loss() {
    let channel = EventChannel::with_byte_size(64);
    let mut received = Vec::new();

    for round in 0..50u64 {
        channel.reserve::<TimingEvent>().unwrap().submit(event(1, round * 2));
        channel.reserve::<TimingEvent>().unwrap().submit(event(1, round * 2 + 1));
        assert!(channel.reserve::<TimingEvent>().is_none());
        received.extend(channel.drain().iter().map(|r| r.decode::<TimingEvent>().unwrap()));
    }

    let seqs: Vec<u64> = received.iter().map(|e| e.timestamp_ns).collect();
    assert_eq!(seqs, (0..100).collect::<Vec<_>>());
}
