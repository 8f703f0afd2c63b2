// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

/// Counts the progress of "packet-timed" round trips, which start at the
/// transmission of some packet and end at the acknowledgement of that packet
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Counter {
    /// The `delivered` count at which the next round begins
    next_round_delivered: u64,
    /// The number of rounds counted since initialization
    round_count: u32,
    /// True if the current ack being processed started a new round
    round_start: bool,
}

impl Counter {
    /// Called for each acknowledgement carrying a valid rate sample
    ///
    /// `prior_delivered` is the delivered count at the time the newest acked
    /// packet was sent; `delivered` is the current delivered count.
    pub fn on_ack(&mut self, prior_delivered: u64, delivered: u64) {
        if prior_delivered >= self.next_round_delivered {
            self.start(delivered);
            self.round_count = self.round_count.wrapping_add(1);
            self.round_start = true;
        } else {
            self.round_start = false;
        }
    }

    /// Starts a round that ends when the packet sent at `delivered` is acked
    pub fn start(&mut self, delivered: u64) {
        self.next_round_delivered = delivered;
    }

    /// Called when the acknowledgement carried no usable rate sample
    pub fn clear_round_start(&mut self) {
        self.round_start = false;
    }

    /// Treats a retransmission timeout like the end of a round
    pub fn force_round_start(&mut self) {
        self.round_start = true;
    }

    /// True if the latest acknowledgement started a new round
    pub fn round_start(&self) -> bool {
        self.round_start
    }

    /// The number of rounds counted since initialization
    pub fn round_count(&self) -> u32 {
        self.round_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_round_start_per_round() {
        let mut counter = Counter::default();

        // The first ack starts the first round
        counter.on_ack(0, 10);
        assert!(counter.round_start());
        assert_eq!(1, counter.round_count());

        // Acks for packets sent before the round boundary do not start a round
        counter.on_ack(4, 14);
        assert!(!counter.round_start());
        counter.on_ack(9, 19);
        assert!(!counter.round_start());
        assert_eq!(1, counter.round_count());

        // An ack for a packet sent at or past the boundary starts the next one
        counter.on_ack(10, 25);
        assert!(counter.round_start());
        assert_eq!(2, counter.round_count());
    }

    #[test]
    fn forced_and_cleared_round_start() {
        let mut counter = Counter::default();

        counter.force_round_start();
        assert!(counter.round_start());
        assert_eq!(0, counter.round_count());

        counter.clear_round_start();
        assert!(!counter.round_start());
    }
}
