// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::recovery::bbrplus::windowed_filter::WindowedMinFilter;

/// Window length of the min RTT filter, in microseconds
const MIN_RTT_FILTER_LEN: u64 = 10 * 1_000_000;

/// Tracks the minimum round-trip time seen over the last 10 seconds
///
/// The windowed minimum serves as a proxy for the unloaded two-way
/// propagation delay of the path. A sample at or below the current minimum
/// restarts the window; once the window expires the filter refreshes from its
/// runner-up candidates, or from the next sample, whichever comes first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Estimator {
    filter: WindowedMinFilter<u32>,
}

impl Estimator {
    /// Constructs a new `Estimator` seeded with the host's lifetime minimum
    ///
    /// `seed_rtt_us` is `u32::MAX` when the host has no RTT sample yet.
    pub fn new(seed_rtt_us: u32, now: u64) -> Self {
        Self {
            filter: WindowedMinFilter::new(MIN_RTT_FILTER_LEN, seed_rtt_us, now),
        }
    }

    /// The windowed minimum RTT in microseconds, `u32::MAX` if no sample yet
    #[inline]
    pub fn min_rtt_us(&self) -> u32 {
        self.filter.value()
    }

    /// True if at least one RTT sample has been observed
    #[inline]
    pub fn has_sample(&self) -> bool {
        self.min_rtt_us() != u32::MAX
    }

    /// True if the current minimum has not been matched or lowered for a full
    /// filter window
    #[inline]
    pub fn is_expired(&self, now: u64) -> bool {
        now > self.filter.last_updated().saturating_add(MIN_RTT_FILTER_LEN)
    }

    /// Incorporates the RTT measurement from one rate sample, if any
    #[inline]
    pub fn update(&mut self, rtt_us: i64, now: u64) {
        if rtt_us >= 0 {
            self.filter.update(rtt_us.min(u32::MAX as i64) as u32, now);
        }
    }

    /// Keeps the current minimum but restarts its window, deferring the next
    /// expiry by a full filter length
    #[inline]
    pub fn schedule_next_probe(&mut self, now: u64) {
        self.filter.reset(self.min_rtt_us(), now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_without_seed() {
        let estimator = Estimator::new(u32::MAX, 0);
        assert!(!estimator.has_sample());
        assert_eq!(u32::MAX, estimator.min_rtt_us());
    }

    #[test]
    fn monotone_within_window() {
        let mut estimator = Estimator::new(u32::MAX, 0);
        let mut now = 0;
        let mut prev = u32::MAX;

        // Non-increasing samples inside the window keep the minimum
        // non-increasing
        for rtt in [40_000i64, 30_000, 30_000, 25_000, 20_000] {
            now += 1_000_000;
            estimator.update(rtt, now);
            assert!(estimator.min_rtt_us() <= prev);
            prev = estimator.min_rtt_us();
        }
        assert_eq!(20_000, estimator.min_rtt_us());

        // A larger sample inside the window does not raise the minimum
        estimator.update(50_000, now + 1_000_000);
        assert_eq!(20_000, estimator.min_rtt_us());
    }

    #[test]
    fn negative_samples_are_ignored() {
        let mut estimator = Estimator::new(u32::MAX, 0);
        estimator.update(-1, 1_000_000);
        assert!(!estimator.has_sample());
    }

    #[test]
    fn expiry_and_refresh() {
        let mut estimator = Estimator::new(u32::MAX, 0);
        estimator.update(10_000, 1_000_000);
        assert!(!estimator.is_expired(1_000_000 + MIN_RTT_FILTER_LEN));
        assert!(estimator.is_expired(1_000_001 + MIN_RTT_FILTER_LEN));

        // After the window has gone stale, even a larger sample refreshes the
        // minimum
        estimator.update(15_000, 2_000_000 + MIN_RTT_FILTER_LEN);
        assert_eq!(15_000, estimator.min_rtt_us());
        assert!(!estimator.is_expired(2_000_000 + MIN_RTT_FILTER_LEN));
    }

    #[test]
    fn schedule_next_probe_keeps_the_minimum() {
        let mut estimator = Estimator::new(u32::MAX, 0);
        estimator.update(10_000, 1_000_000);

        let now = 1_000_001 + MIN_RTT_FILTER_LEN;
        assert!(estimator.is_expired(now));

        estimator.schedule_next_probe(now);
        assert_eq!(10_000, estimator.min_rtt_us());
        assert!(!estimator.is_expired(now));
        assert!(estimator.is_expired(now + MIN_RTT_FILTER_LEN + 1));
    }
}
