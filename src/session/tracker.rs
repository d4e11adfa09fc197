//! Pictures lent to the consumer.
//!
//! Every published picture is parked here until the consumer returns its
//! frame id; whatever is still parked at close is released by force.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use serde::Serialize;

use super::drive::DriveEvent;
use crate::accel::DecodedPicture;

/// Handle the consumer uses to return a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FrameId(pub u64);

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame#{}", self.0)
    }
}

#[derive(Debug)]
struct PendingConsume {
    id: FrameId,
    picture: DecodedPicture,
}

#[derive(Debug)]
pub struct PictureConsumeTracker {
    entries: Mutex<Vec<Option<PendingConsume>>>,
}

impl PictureConsumeTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new((0..capacity.max(1)).map(|_| None).collect()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn outstanding(&self) -> usize {
        self.entries.lock().iter().flatten().count()
    }

    /// Parks a picture under `id`. Hands the picture back when the table is
    /// full.
    pub fn track(&self, id: FrameId, picture: DecodedPicture) -> Result<(), DecodedPicture> {
        let mut entries = self.entries.lock();
        match entries.iter_mut().find(|entry| entry.is_none()) {
            Some(entry) => {
                *entry = Some(PendingConsume { id, picture });
                Ok(())
            }
            None => Err(picture),
        }
    }

    pub fn take(&self, id: FrameId) -> Option<DecodedPicture> {
        let mut entries = self.entries.lock();
        entries
            .iter_mut()
            .find(|entry| entry.as_ref().is_some_and(|pending| pending.id == id))
            .and_then(Option::take)
            .map(|pending| pending.picture)
    }

    /// Empties the table, oldest frame id first.
    pub fn drain_all(&self) -> Vec<(FrameId, DecodedPicture)> {
        let mut drained: Vec<(FrameId, DecodedPicture)> = self
            .entries
            .lock()
            .iter_mut()
            .filter_map(Option::take)
            .map(|pending| (pending.id, pending.picture))
            .collect();
        drained.sort_by_key(|(id, _)| *id);
        drained
    }
}

/// Wakes the drive loop when it is parked on a full picture pool.
#[derive(Debug)]
pub struct DpbSignal {
    waiting: AtomicBool,
    events: Sender<DriveEvent>,
}

impl DpbSignal {
    pub fn new(events: Sender<DriveEvent>) -> Self {
        Self {
            waiting: AtomicBool::new(false),
            events,
        }
    }

    /// Must be called while the core lock that observed the stall is held.
    pub fn arm(&self) {
        self.waiting.store(true, Ordering::SeqCst);
    }

    /// Sends one wake-up if the drive loop is waiting. Returns whether it did.
    pub fn notify_released(&self) -> bool {
        if self.waiting.swap(false, Ordering::SeqCst) {
            return self.events.send(DriveEvent::PictureReleased).is_ok();
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::MAX_PP_OUTPUTS;

    fn picture(pic_id: u32) -> DecodedPicture {
        DecodedPicture {
            pic_id,
            decode_order_id: pic_id as u64,
            keyframe: false,
            outputs: [None; MAX_PP_OUTPUTS],
        }
    }

    #[test]
    fn track_take_once() {
        let tracker = PictureConsumeTracker::new(2);
        tracker.track(FrameId(1), picture(10)).unwrap();
        tracker.track(FrameId(2), picture(11)).unwrap();
        let rejected = tracker.track(FrameId(3), picture(12)).unwrap_err();
        assert_eq!(rejected.pic_id, 12);

        assert_eq!(tracker.take(FrameId(1)).map(|p| p.pic_id), Some(10));
        assert!(tracker.take(FrameId(1)).is_none());
        assert_eq!(tracker.outstanding(), 1);
        tracker.track(FrameId(3), picture(12)).unwrap();
    }

    #[test]
    fn drain_returns_everything_in_id_order() {
        let tracker = PictureConsumeTracker::new(4);
        for id in [7u64, 3, 5] {
            tracker.track(FrameId(id), picture(id as u32)).unwrap();
        }
        let ids: Vec<u64> = tracker.drain_all().iter().map(|(id, _)| id.0).collect();
        assert_eq!(ids, vec![3, 5, 7]);
        assert_eq!(tracker.outstanding(), 0);
        assert!(tracker.drain_all().is_empty());
    }

    #[test]
    fn signal_wakes_exactly_once_per_arm() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let signal = DpbSignal::new(tx);
        assert!(!signal.notify_released());

        signal.arm();
        assert!(signal.notify_released());
        assert!(!signal.notify_released());
        assert_eq!(rx.try_recv(), Ok(DriveEvent::PictureReleased));
        assert!(rx.try_recv().is_err());
    }
}
