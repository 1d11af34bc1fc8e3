use pulse::maps::StackTraceTable;
use pulse_common::{CaptureOutcome, RawStack, MAX_STACK_DEPTH};
use std::thread;

fn frames_for(seed: u64) -> Vec<u64> {
    (0..(seed % 20 + 1)).map(|i| 0x5555_0000_0000 + seed * 0x1000 + i * 8).collect()
}

#[test]
fn test_identical_concurrent_captures_map_to_that_sequence() {
    let table = StackTraceTable::new(64);
    let frames = frames_for(3);
    let stack = RawStack::from_frames(&frames).unwrap();

    let ids: Vec<u32> = thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                s.spawn(|| match table.insert(&stack) {
                    CaptureOutcome::Stored(id) => id,
                    other => panic!("capture failed: {other:?}"),
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for id in ids {
        assert_eq!(table.frames(id).unwrap().frames(), frames.as_slice());
    }
}

#[test]
fn test_each_id_keeps_its_own_frames_under_contention() {
    let table = StackTraceTable::new(256);

    let assigned: Vec<(u32, u64)> = thread::scope(|s| {
        let handles: Vec<_> = (0..8u64)
            .map(|t| {
                let table = &table;
                s.spawn(move || {
                    let mut out = Vec::new();
                    for round in 0..200u64 {
                        let seed = (t * 7 + round) % 40;
                        let stack = RawStack::from_frames(&frames_for(seed)).unwrap();
                        if let CaptureOutcome::Stored(id) = table.insert(&stack) {
                            out.push((id, seed));
                        }
                    }
                    out
                })
            })
            .collect();
        handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
    });

    assert!(!assigned.is_empty());
    for (id, seed) in assigned {
        assert_eq!(table.frames(id).unwrap().frames(), frames_for(seed).as_slice());
    }
}

#[test]
fn test_storage_full_and_over_deep_captures() {
    let table = StackTraceTable::new(2);
    assert!(table.insert(&RawStack::from_frames(&[1, 2]).unwrap()).is_stored());
    assert!(table.insert(&RawStack::from_frames(&[3, 4]).unwrap()).is_stored());

    let outcome = table.insert(&RawStack::from_frames(&[5, 6]).unwrap());
    assert_eq!(outcome, CaptureOutcome::StorageFull);
    assert_eq!(outcome.stack_id(), -1);
    assert_eq!(table.len(), 2);

    let too_deep = vec![0x1234; MAX_STACK_DEPTH + 1];
    assert!(RawStack::from_frames(&too_deep).is_none());
}
