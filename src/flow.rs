//! Per-sink flow control.
//!
//! A [`FlowController`] counts what a sink has been handed but not yet
//! consumed. Once the count reaches the high-water mark the delivery that got
//! it there is answered with [`Delivery::Deferred`], and the producer has to
//! wait for capacity (and acknowledge it) before delivering again.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chunk::Weight;

pub const DEFAULT_HIGH_WATER_BYTES: usize = 16 * 1024;
pub const DEFAULT_HIGH_WATER_RECORDS: usize = 16;

/// Buffer capacity for one sink. Crossing either dimension defers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HighWaterMark {
    pub bytes: usize,
    pub records: usize,
}

impl Default for HighWaterMark {
    fn default() -> Self {
        Self {
            bytes: DEFAULT_HIGH_WATER_BYTES,
            records: DEFAULT_HIGH_WATER_RECORDS,
        }
    }
}

impl HighWaterMark {
    pub fn new(bytes: usize, records: usize) -> Self {
        Self { bytes, records }
    }

    pub fn with_bytes(mut self, bytes: usize) -> Self {
        self.bytes = bytes;
        self
    }

    pub fn with_records(mut self, records: usize) -> Self {
        self.records = records;
        self
    }
}

/// Answer to a single delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Keep going.
    Accepted,
    /// The chunk was taken, but the producer must wait for capacity.
    Deferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("delivery after Deferred without awaiting capacity")]
pub struct FlowViolation;

#[derive(Debug)]
pub struct FlowController {
    mark: HighWaterMark,
    outstanding: Weight,
    peak: Weight,
    deferred: bool,
}

impl FlowController {
    pub fn new(mark: HighWaterMark) -> Self {
        Self {
            mark,
            outstanding: Weight::default(),
            peak: Weight::default(),
            deferred: false,
        }
    }

    /// Account for a delivery. Fails if the previous delivery was deferred and
    /// the producer never acknowledged capacity.
    pub fn admit(&mut self, weight: Weight) -> Result<Delivery, FlowViolation> {
        if self.deferred {
            return Err(FlowViolation);
        }
        self.outstanding += weight;
        self.peak.bytes = self.peak.bytes.max(self.outstanding.bytes);
        self.peak.records = self.peak.records.max(self.outstanding.records);
        if self.saturated() {
            self.deferred = true;
            Ok(Delivery::Deferred)
        } else {
            Ok(Delivery::Accepted)
        }
    }

    /// A chunk left the buffer. Returns true when a waiting producer can now resume.
    pub fn release(&mut self, weight: Weight) -> bool {
        self.outstanding -= weight;
        self.deferred && self.has_capacity()
    }

    /// Consume the capacity signal. A producer that was deferred calls this
    /// (through `ready()`) before it may deliver again.
    pub fn acknowledge(&mut self) -> bool {
        if !self.deferred {
            return true;
        }
        if self.has_capacity() {
            self.deferred = false;
            true
        } else {
            false
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.outstanding == Weight::default() || !self.saturated()
    }

    pub fn is_deferred(&self) -> bool {
        self.deferred
    }

    pub fn outstanding(&self) -> Weight {
        self.outstanding
    }

    /// Highest outstanding level seen so far.
    pub fn peak(&self) -> Weight {
        self.peak
    }

    pub fn mark(&self) -> HighWaterMark {
        self.mark
    }

    fn saturated(&self) -> bool {
        self.outstanding.bytes >= self.mark.bytes || self.outstanding.records >= self.mark.records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec() -> Weight {
        Weight { bytes: 0, records: 1 }
    }

    #[test]
    fn defers_on_the_delivery_that_reaches_the_mark() {
        let mut fc = FlowController::new(HighWaterMark::default().with_records(2));
        assert_eq!(fc.admit(rec()), Ok(Delivery::Accepted));
        assert_eq!(fc.admit(rec()), Ok(Delivery::Deferred));
        assert!(fc.is_deferred());
        assert_eq!(fc.outstanding().records, 2);
    }

    #[test]
    fn delivering_again_before_capacity_is_a_violation() {
        let mut fc = FlowController::new(HighWaterMark::default().with_records(1));
        assert_eq!(fc.admit(rec()), Ok(Delivery::Deferred));
        assert_eq!(fc.admit(rec()), Err(FlowViolation));
    }

    #[test]
    fn capacity_must_be_acknowledged() {
        let mut fc = FlowController::new(HighWaterMark::default().with_records(2));
        fc.admit(rec()).unwrap();
        fc.admit(rec()).unwrap();
        assert!(!fc.acknowledge());
        assert!(fc.release(rec()));
        // released, but not yet acknowledged: still a violation
        assert_eq!(fc.admit(rec()), Err(FlowViolation));
        assert!(fc.acknowledge());
        assert_eq!(fc.admit(rec()), Ok(Delivery::Deferred));
    }

    #[test]
    fn byte_mark_counts_payload_length() {
        let mut fc = FlowController::new(HighWaterMark::new(10, 100));
        assert_eq!(fc.admit(Weight { bytes: 6, records: 0 }), Ok(Delivery::Accepted));
        // a single oversized delivery may overshoot, and is the one that defers
        assert_eq!(fc.admit(Weight { bytes: 9, records: 0 }), Ok(Delivery::Deferred));
        assert_eq!(fc.peak().bytes, 15);
    }

    #[test]
    fn zero_mark_defers_everything_but_drains_when_empty() {
        let mut fc = FlowController::new(HighWaterMark::new(0, 0));
        assert_eq!(fc.admit(rec()), Ok(Delivery::Deferred));
        assert!(!fc.acknowledge());
        fc.release(rec());
        assert!(fc.acknowledge());
    }
}
