//! In-order delivery of sequenced frames.

use std::collections::BTreeMap;

use bytes::Bytes;

/// Maximum number of early frames held while waiting for a gap to fill.
pub const DEFAULT_REORDER_LIMIT: usize = 64;

/// Outcome of offering one regular frame to the [`Sequencer`].
#[derive(Debug, PartialEq, Eq)]
pub enum Sequenced {
    /// Payloads now deliverable, in order. May contain buffered successors.
    Deliver(Vec<Bytes>),
    /// The id was already delivered; the frame is rejected.
    Duplicate {
        /// Rejected id.
        id: u32,
        /// Next id the sequencer is waiting for.
        expected: u32,
    },
    /// The frame arrived early and is held until the gap fills.
    Buffered {
        /// Held id.
        id: u32,
        /// Next id the sequencer is waiting for.
        expected: u32,
    },
    /// Too many early frames are held; ordering can no longer be restored.
    Overflow {
        /// Next id the sequencer is waiting for.
        expected: u32,
    },
}

/// Restores send order for regular frames and rejects duplicates.
#[derive(Debug)]
pub struct Sequencer {
    expected: u32,
    early: BTreeMap<u32, Bytes>,
    limit: usize,
}

impl Sequencer {
    /// A sequencer expecting id `1` first.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            expected: 1,
            early: BTreeMap::new(),
            limit,
        }
    }

    /// Highest id delivered in order so far (`0` before the first delivery).
    #[must_use]
    pub fn last_delivered(&self) -> u32 {
        self.expected.wrapping_sub(1)
    }

    /// Offer a frame.
    pub fn accept(&mut self, id: u32, payload: Bytes) -> Sequenced {
        if id < self.expected || self.early.contains_key(&id) {
            return Sequenced::Duplicate {
                id,
                expected: self.expected,
            };
        }

        if id > self.expected {
            if self.early.len() >= self.limit {
                return Sequenced::Overflow {
                    expected: self.expected,
                };
            }
            self.early.insert(id, payload);
            return Sequenced::Buffered {
                id,
                expected: self.expected,
            };
        }

        let mut ready = vec![payload];
        self.expected = self.expected.wrapping_add(1);
        while let Some(next) = self.early.remove(&self.expected) {
            ready.push(next);
            self.expected = self.expected.wrapping_add(1);
        }
        Sequenced::Deliver(ready)
    }
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new(DEFAULT_REORDER_LIMIT)
    }
}
