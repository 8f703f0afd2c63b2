// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    counter::{Counter, Saturating},
    random,
    recovery::{
        bbrplus::{pacing, BbrPlusCongestionController, Mode, BW_UNIT, GAIN_SCALE, GAIN_UNIT},
        congestion_controller::HostConnection,
        RateSample,
    },
};

/// The minimum number of rounds in a sampling interval
const LT_INTERVAL_MIN_RTTS: u8 = 4;
/// If lost/delivered ratio exceeds 50/256 (~20%), the interval is "lossy"
const LT_LOSS_THRESH: u32 = 50;
/// Two intervals with a bw ratio within 1/8 are "consistent"
const LT_BW_RATIO: u32 = GAIN_UNIT as u32 / 8;
/// Two intervals with a bw difference within 4 Kbit/sec are "consistent"
const LT_BW_DIFF_BYTES_PER_SEC: u64 = 4000 / 8;
/// Once policing is detected, use the long-term rate for this many rounds
const LT_BW_MAX_RTTS: u8 = 48;

/// Long-term ("LT") bandwidth sampling state
///
/// Token-bucket traffic policers are common (see "An Internet-Wide Analysis
/// of Traffic Policing", SIGCOMM 2016). We estimate that we're policed when
/// two consecutive sampling intervals show consistent throughput and high
/// packet loss, and then pace at the long-term average delivery rate from
/// those intervals to keep the drop rate reasonable.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Estimator {
    /// Estimated delivery rate allowed by the policer, in pkts/uS << 24
    pub(super) bw: u32,
    /// Interval start: the connection's delivered count
    last_delivered: u64,
    /// Interval start: the connection's lost count
    last_lost: u64,
    /// Interval start: the delivered clock, in milliseconds
    last_stamp_ms: u64,
    /// Round trips elapsed in the current interval, or spent using `bw`
    rtt_count: Counter<u8, Saturating>,
    /// True while loss-bounded sampling intervals are being collected
    is_sampling: bool,
    /// True while `bw` overrides the windowed max filter
    pub(super) use_bw: bool,
}

impl BbrPlusCongestionController {
    /// Collects long-term samples and latches the policed rate when two
    /// consecutive intervals agree
    pub(super) fn lt_bw_sampling<C: HostConnection>(
        &mut self,
        conn: &C,
        rate_sample: &RateSample,
        random_generator: &mut dyn random::Generator,
    ) {
        if self.long_term.use_bw {
            // Expire the long-term estimate after enough gain-cycling rounds
            if self.mode == Mode::ProbeBw && self.round_counter.round_start() {
                self.long_term.rtt_count += 1;
                if *self.long_term.rtt_count >= LT_BW_MAX_RTTS {
                    self.reset_lt_bw_sampling(conn);
                    self.enter_probe_bw(conn, random_generator);
                }
            }
            return;
        }

        // Wait for the first loss before sampling, to let the policer exhaust
        // its tokens; earlier samples include bursts that over-estimate the
        // steady-state rate it allows.
        if !self.long_term.is_sampling {
            if rate_sample.losses == 0 {
                return;
            }
            self.reset_lt_bw_sampling_interval(conn);
            self.long_term.is_sampling = true;
        }

        // To avoid underestimates, reset sampling if we run out of data.
        if rate_sample.is_app_limited {
            self.reset_lt_bw_sampling(conn);
            return;
        }

        if self.round_counter.round_start() {
            self.long_term.rtt_count += 1;
        }
        if *self.long_term.rtt_count < LT_INTERVAL_MIN_RTTS {
            // The sampling interval needs to be longer
            return;
        }
        if *self.long_term.rtt_count > 4 * LT_INTERVAL_MIN_RTTS {
            self.reset_lt_bw_sampling(conn); // interval is too long
            return;
        }

        // End the sampling interval only when a packet is lost, so the
        // estimate covers a full policer token drain.
        if rate_sample.losses == 0 {
            return;
        }

        let lost = conn.lost().saturating_sub(self.long_term.last_lost);
        let delivered = conn.delivered().saturating_sub(self.long_term.last_delivered);
        // Require a loss rate of at least LT_LOSS_THRESH
        if delivered == 0 || (lost << GAIN_SCALE) < LT_LOSS_THRESH as u64 * delivered {
            return;
        }

        // Average delivery rate over the sampling interval
        let t_ms = (conn.delivered_mstamp() / pacing::USEC_PER_MSEC)
            .saturating_sub(self.long_term.last_stamp_ms);
        if t_ms < 1 {
            return; // interval is less than one ms, so wait
        }
        if t_ms >= u32::MAX as u64 / pacing::USEC_PER_MSEC {
            self.reset_lt_bw_sampling(conn); // interval too long, reset
            return;
        }
        let bw = delivered.saturating_mul(BW_UNIT) / (t_ms * pacing::USEC_PER_MSEC);
        self.lt_bw_interval_done(conn, bw.min(u32::MAX as u64) as u32);
    }

    /// A sampling interval is done; estimate whether we're policed
    fn lt_bw_interval_done<C: HostConnection>(&mut self, conn: &C, bw: u32) {
        if self.long_term.bw != 0 {
            // Is the new bw close to the one from the previous interval?
            let diff = bw.abs_diff(self.long_term.bw);
            if diff as u64 * GAIN_UNIT as u64 <= LT_BW_RATIO as u64 * self.long_term.bw as u64
                || pacing::rate_bytes_per_sec(conn, diff as u64, GAIN_UNIT)
                    <= LT_BW_DIFF_BYTES_PER_SEC
            {
                // All criteria are met; estimate we're policed
                self.long_term.bw = (bw + self.long_term.bw) >> 1; // avg 2 intvls
                self.long_term.use_bw = true;
                self.pacing_gain = GAIN_UNIT; // try to avoid drops
                self.long_term.rtt_count = Counter::default();

                #[cfg(feature = "event-tracing")]
                tracing::debug!(lt_bw = self.long_term.bw, "policed rate detected");

                return;
            }
        }
        self.long_term.bw = bw;
        self.reset_lt_bw_sampling_interval(conn);
    }

    /// Starts a new sampling interval at the connection's current counters
    pub(super) fn reset_lt_bw_sampling_interval<C: HostConnection>(&mut self, conn: &C) {
        self.long_term.last_stamp_ms = conn.delivered_mstamp() / pacing::USEC_PER_MSEC;
        self.long_term.last_delivered = conn.delivered();
        self.long_term.last_lost = conn.lost();
        self.long_term.rtt_count = Counter::default();
    }

    /// Completely resets long-term bandwidth sampling
    pub(super) fn reset_lt_bw_sampling<C: HostConnection>(&mut self, conn: &C) {
        self.long_term.bw = 0;
        self.long_term.use_bw = false;
        self.long_term.is_sampling = false;
        self.reset_lt_bw_sampling_interval(conn);
    }
}
