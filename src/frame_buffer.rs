// src/frame_buffer.rs
//
// Bounded ring of the N most recent decoded frames.
//
// Single writer (the capture loop), any number of readers (analysis loop,
// broadcaster, inference payload building). The writer publishes the newest
// sequence number with a Release store after filling the slot; readers load
// it with Acquire and verify the slot still holds the sequence they asked
// for. A reader that falls behind observes a gap in sequence numbers; it
// never blocks the writer and the writer never waits for readers.

use crate::types::Frame;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

pub struct FrameBuffer {
    slots: Vec<RwLock<Option<Arc<Frame>>>>,
    capacity: usize,
    /// Highest published sequence number; 0 = nothing published yet
    head: AtomicU64,
}

impl FrameBuffer {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || RwLock::new(None));
        Self {
            slots,
            capacity,
            head: AtomicU64::new(0),
        }
    }

    /// Publish a frame, overwriting the oldest slot. Sequence numbers must be
    /// assigned by the single writer and be strictly increasing from 1.
    pub fn push(&self, frame: Frame) {
        let seq = frame.sequence;
        let idx = (seq as usize) % self.capacity;
        {
            let mut slot = self.slots[idx].write().unwrap();
            *slot = Some(Arc::new(frame));
        }
        self.head.store(seq, Ordering::Release);
    }

    /// Highest sequence number published so far (0 = empty)
    pub fn latest_sequence(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }

    /// Most recent frame, if any
    pub fn latest(&self) -> Option<Arc<Frame>> {
        let seq = self.head.load(Ordering::Acquire);
        if seq == 0 {
            return None;
        }
        self.get(seq)
    }

    /// A specific frame by sequence number. Returns None when the frame was
    /// never published or has already been overwritten.
    pub fn get(&self, seq: u64) -> Option<Arc<Frame>> {
        if seq == 0 {
            return None;
        }
        let idx = (seq as usize) % self.capacity;
        let slot = self.slots[idx].read().unwrap();
        match slot.as_ref() {
            Some(frame) if frame.sequence == seq => Some(Arc::clone(frame)),
            _ => None,
        }
    }

    /// True when `seq` has scrolled out of the ring
    pub fn is_evicted(&self, seq: u64) -> bool {
        let head = self.head.load(Ordering::Acquire);
        head > seq && (head - seq) as usize >= self.capacity
    }

    /// Next frame after `last_seen`, skipping ahead to the newest frame when
    /// the reader has fallen behind. Returns the observed gap (frames the
    /// reader missed) alongside the frame.
    pub fn next_after(&self, last_seen: u64) -> Option<(Arc<Frame>, u64)> {
        let head = self.head.load(Ordering::Acquire);
        if head <= last_seen {
            return None;
        }
        // Prefer the oldest unread frame still in the ring; fall back to
        // newest if even that was overwritten mid-read.
        let oldest_available = head.saturating_sub(self.capacity as u64 - 1).max(1);
        let want = (last_seen + 1).max(oldest_available);
        for seq in want..=head {
            if let Some(frame) = self.get(seq) {
                let gap = seq - last_seen - 1;
                return Some((frame, gap));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SourceBackend;

    fn frame(seq: u64) -> Frame {
        Frame {
            data: vec![0u8; 12],
            width: 2,
            height: 2,
            sequence: seq,
            captured_at_ms: seq as f64 * 33.3,
            backend: SourceBackend::Primary,
        }
    }

    #[test]
    fn test_empty_buffer() {
        let buf = FrameBuffer::new(4);
        assert_eq!(buf.latest_sequence(), 0);
        assert!(buf.latest().is_none());
        assert!(buf.next_after(0).is_none());
    }

    #[test]
    fn test_push_and_latest() {
        let buf = FrameBuffer::new(4);
        buf.push(frame(1));
        buf.push(frame(2));
        assert_eq!(buf.latest_sequence(), 2);
        assert_eq!(buf.latest().unwrap().sequence, 2);
        assert_eq!(buf.get(1).unwrap().sequence, 1);
    }

    #[test]
    fn test_oldest_frame_silently_dropped() {
        let buf = FrameBuffer::new(4);
        for seq in 1..=6 {
            buf.push(frame(seq));
        }
        // 1 and 2 overwritten by 5 and 6
        assert!(buf.get(1).is_none());
        assert!(buf.get(2).is_none());
        assert_eq!(buf.get(3).unwrap().sequence, 3);
        assert_eq!(buf.get(6).unwrap().sequence, 6);
        assert!(buf.is_evicted(1));
        assert!(!buf.is_evicted(5));
    }

    #[test]
    fn test_slow_reader_observes_gap() {
        let buf = FrameBuffer::new(4);
        for seq in 1..=10 {
            buf.push(frame(seq));
        }
        // Reader last saw frame 2; frames 3..=6 are gone
        let (next, gap) = buf.next_after(2).unwrap();
        assert_eq!(next.sequence, 7);
        assert_eq!(gap, 4);

        // A caught-up reader sees consecutive frames with no gap
        let (next, gap) = buf.next_after(9).unwrap();
        assert_eq!(next.sequence, 10);
        assert_eq!(gap, 0);
    }

    #[test]
    fn test_reader_never_sees_stale_sequence() {
        let buf = FrameBuffer::new(2);
        buf.push(frame(1));
        buf.push(frame(2));
        buf.push(frame(3)); // overwrites slot of 1
        assert!(buf.get(1).is_none());
        assert_eq!(buf.get(3).unwrap().sequence, 3);
    }
}
