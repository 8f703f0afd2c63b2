// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    random,
    recovery::{
        bbrplus::{probe_bw, windowed_filter::WindowedMaxFilter, BbrPlusCongestionController, BW_UNIT},
        congestion_controller::HostConnection,
        RateSample,
    },
};

/// Window length of the bandwidth filter, in packet-timed rounds
pub(super) const BW_FILTER_LEN: u32 = probe_bw::CYCLE_LEN as u32 + 2;

/// Estimates the bottleneck bandwidth of the path from delivery rate samples
///
/// Bandwidth is tracked in packets per microsecond, scaled by 2^24 to avoid
/// truncation: one unit is roughly 715 bit/s for 1500 byte packets, and a
/// `u32` covers rates up to a few Tbit/s.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Estimator {
    max_bw_filter: WindowedMaxFilter<u32>,
}

impl Estimator {
    pub fn new() -> Self {
        Self {
            max_bw_filter: WindowedMaxFilter::new(BW_FILTER_LEN as u64, 0, 0),
        }
    }

    /// Returns the windowed max recent bandwidth sample, in pkts/uS << 24
    #[inline]
    pub fn max_bw(&self) -> u32 {
        self.max_bw_filter.value()
    }

    /// Restarts the filter from zero at the given round
    pub fn reset(&mut self, round_count: u32) {
        self.max_bw_filter.reset(0, round_count as u64);
    }

    /// Incorporates one valid rate sample, keyed by the current round
    #[inline]
    pub fn on_ack(&mut self, rate_sample: &RateSample, round_count: u32) {
        debug_assert!(rate_sample.is_valid());

        // Delivered is scaled first: the packets/microsecond ratio is far
        // below one for most connections.
        let bw = (rate_sample.delivered as u64 * BW_UNIT) / rate_sample.interval_us as u64;
        let bw = bw.min(u32::MAX as u64) as u32;

        // An application-limited sample reflects application behavior rather
        // than the available network rate and could drag the estimate down,
        // so it is admitted only when it describes the path at least as well
        // as the current model.
        if !rate_sample.is_app_limited || bw >= self.max_bw() {
            self.max_bw_filter.update(bw, round_count as u64);
        }
    }
}

/// Model update methods driven by the per-ack rate sample
impl BbrPlusCongestionController {
    /// Estimates the bandwidth based on how fast packets are delivered
    #[inline]
    pub(super) fn update_bw<C: HostConnection>(
        &mut self,
        conn: &C,
        rate_sample: &RateSample,
        random_generator: &mut dyn random::Generator,
    ) {
        if !rate_sample.is_valid() {
            self.round_counter.clear_round_start();
            return;
        }

        self.round_counter
            .on_ack(rate_sample.prior_delivered, conn.delivered());
        if self.round_counter.round_start() {
            self.recovery_state.end_packet_conservation();
        }

        self.lt_bw_sampling(conn, rate_sample, random_generator);

        self.bw_estimator
            .on_ack(rate_sample, self.round_counter.round_count());
    }
}
