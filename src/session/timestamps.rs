use serde::Serialize;

/// Timestamps supplied with a packet. `None` fields were not given or could
/// not be matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PacketTimestamp {
    pub pts: Option<i64>,
    pub dts: Option<i64>,
}

impl PacketTimestamp {
    pub const UNKNOWN: Self = Self {
        pts: None,
        dts: None,
    };

    pub fn is_unknown(&self) -> bool {
        *self == Self::UNKNOWN
    }
}

#[derive(Debug, Clone, Copy)]
struct TimestampEntry {
    decode_order_id: u64,
    timestamp: PacketTimestamp,
}

/// Bounded ring from decode-order id to packet timestamps. Once full, the
/// oldest entry is overwritten.
#[derive(Debug)]
pub struct TimestampTable {
    entries: Vec<Option<TimestampEntry>>,
    next: usize,
}

impl TimestampTable {
    pub fn new(depth: usize) -> Self {
        Self {
            entries: vec![None; depth.max(1)],
            next: 0,
        }
    }

    /// Records a packet's timestamps, returning the id of an evicted entry.
    pub fn insert(&mut self, decode_order_id: u64, timestamp: PacketTimestamp) -> Option<u64> {
        let evicted = self.entries[self.next].map(|entry| entry.decode_order_id);
        self.entries[self.next] = Some(TimestampEntry {
            decode_order_id,
            timestamp,
        });
        self.next = (self.next + 1) % self.entries.len();
        evicted
    }

    /// Removes and returns the oldest entry for `decode_order_id`, or
    /// [`PacketTimestamp::UNKNOWN`].
    pub fn take(&mut self, decode_order_id: u64) -> PacketTimestamp {
        let depth = self.entries.len();
        for offset in 0..depth {
            let index = (self.next + offset) % depth;
            if let Some(entry) = self.entries[index]
                && entry.decode_order_id == decode_order_id
            {
                self.entries[index] = None;
                return entry.timestamp;
            }
        }
        PacketTimestamp::UNKNOWN
    }

    pub fn len(&self) -> usize {
        self.entries.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
