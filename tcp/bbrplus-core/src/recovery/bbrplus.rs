// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! BBR+ congestion control
//!
//! The sending rate is computed from the delivery rate (throughput) estimated
//! from ACKs. On each ACK the model of the network path is updated:
//!
//! ```text
//!   bottleneck_bandwidth = windowed_max(delivered / elapsed, 10 round trips)
//!   min_rtt = windowed_min(rtt, 10 seconds)
//!   pacing_rate = pacing_gain * bottleneck_bandwidth
//!   cwnd = max(cwnd_gain * bottleneck_bandwidth * min_rtt, 4)
//! ```
//!
//! The core algorithm does not react directly to losses or delays, although
//! it adjusts the next send per ACK when loss is observed and pins the
//! sending rate when it estimates the path is traffic-policed. On top of
//! plain BBR, this variant provisions the congestion window for ACK
//! aggregation, and its bandwidth-probing cycle holds a sub-unity gain until
//! the queue it built has drained back to the estimated BDP.
//!
//! A flow starts in Startup and ramps its sending rate quickly; when it
//! estimates the pipe is full it enters Drain to empty the queue, then spends
//! nearly all of its time in ProbeBw. If no RTT sample matches or lowers the
//! min_rtt estimate for 10 seconds, it briefly enters ProbeRtt to cut
//! inflight to a minimum and re-measure the propagation delay.
//!
//! BBR is described in detail in "BBR: Congestion-Based Congestion Control",
//! Cardwell et al., ACM Queue, Vol. 14 No. 5, 2016.

use crate::{
    random,
    recovery::{
        congestion_controller::{
            self, CaState, CongestionControl, CongestionEvent, CongestionInfo, HostConnection,
            PacingStatus, INET_DIAG_BBRINFO, INET_DIAG_VEGASINFO, TCP_INFINITE_SSTHRESH,
            TCP_INIT_CWND,
        },
        RateSample,
    },
};

mod ack_aggregation;
mod bandwidth;
mod drain;
mod full_pipe;
mod long_term;
mod min_rtt;
mod pacing;
mod probe_bw;
mod probe_rtt;
mod recovery;
mod round;
mod startup;
mod windowed_filter;

/// Scale factor for rates in pkts/uSec units, to avoid truncation in the
/// bandwidth estimation. One unit is ~715 bit/s for 1500 byte packets, so a
/// u32 covers 715 bit/s up to ~3 Tbit/s; with a minimum window of 4 packets
/// neither bound is a concern.
pub(crate) const BW_SCALE: u8 = 24;
pub(crate) const BW_UNIT: u64 = 1 << BW_SCALE;

/// Scale factor for fractions such as gains
pub(crate) const GAIN_SCALE: u8 = 8;
pub(crate) const GAIN_UNIT: u16 = 1 << GAIN_SCALE;

/// Try to keep at least this many packets in flight, if things go smoothly.
/// A sliding window protocol ACKing every other packet needs at least 4
/// packets in flight for smooth functioning.
pub(crate) const CWND_MIN_TARGET: u32 = 4;

/// Each probing cycle, hold a sub-unity gain until inflight falls to the BDP
const DRAIN_TO_TARGET: bool = true;

/// The modes for deciding how fast to send
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Mode {
    /// Ramp up the sending rate rapidly to fill the pipe
    Startup,
    /// Drain any queue created during startup
    Drain,
    /// Discover and share bandwidth: pace around the estimated bandwidth
    ProbeBw,
    /// Cut inflight to the minimum to probe min_rtt
    ProbeRtt,
}

/// A congestion controller implementing BBR+, a "Bottleneck Bandwidth and
/// Round-trip propagation time" variant with ACK-aggregation compensation
/// and drain-to-target gain cycling
///
/// The host embeds one instance per connection in its control block and
/// drives it through the [`CongestionControl`] operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BbrPlusCongestionController {
    mode: Mode,
    round_counter: round::Counter,
    bw_estimator: bandwidth::Estimator,
    full_pipe_estimator: full_pipe::Estimator,
    long_term: long_term::Estimator,
    min_rtt_estimator: min_rtt::Estimator,
    ack_aggregation: ack_aggregation::Estimator,
    cycle: probe_bw::Cycle,
    recovery_state: recovery::State,
    probe_rtt_state: probe_rtt::State,
    /// Current gain for setting the pacing rate, scaled by 2^8
    pacing_gain: u16,
    /// Current gain for setting the cwnd, scaled by 2^8
    cwnd_gain: u16,
    /// Segments to aim for in each transmitted aggregate; 0 until the first ack
    tso_segs_goal: u8,
    /// True once an RTT sample has seeded the pacing rate
    has_seen_rtt: bool,
    /// True if the connection is restarting after being idle
    idle_restart: bool,
}

// The host embeds the controller state in the fixed-size slot its control
// block reserves for congestion control.
const _: () = assert!(
    core::mem::size_of::<BbrPlusCongestionController>() <= congestion_controller::CA_PRIV_SIZE
);

impl Default for BbrPlusCongestionController {
    fn default() -> Self {
        Self::new()
    }
}

impl BbrPlusCongestionController {
    /// Constructs a new `BbrPlusCongestionController`
    ///
    /// The object carries no model yet; the host must call
    /// [`CongestionControl::init`] before any other operation.
    pub fn new() -> Self {
        Self {
            mode: Mode::Startup,
            round_counter: Default::default(),
            bw_estimator: bandwidth::Estimator::new(),
            full_pipe_estimator: Default::default(),
            long_term: Default::default(),
            min_rtt_estimator: min_rtt::Estimator::new(u32::MAX, 0),
            ack_aggregation: Default::default(),
            cycle: Default::default(),
            recovery_state: Default::default(),
            probe_rtt_state: Default::default(),
            pacing_gain: startup::PACING_GAIN,
            cwnd_gain: startup::CWND_GAIN,
            tso_segs_goal: 0,
            has_seen_rtt: false,
            idle_restart: false,
        }
    }

    /// The windowed max recent bandwidth sample, in pkts/uS << 24
    #[inline]
    fn max_bw(&self) -> u32 {
        self.bw_estimator.max_bw()
    }

    /// The estimated bandwidth of the path, in pkts/uS << 24
    ///
    /// A latched long-term (policed) estimate overrides the max filter.
    #[inline]
    fn bw(&self) -> u32 {
        if self.long_term.use_bw {
            self.long_term.bw
        } else {
            self.max_bw()
        }
    }

    /// Do we estimate that Startup filled the pipe?
    #[inline]
    fn full_bw_reached(&self) -> bool {
        self.full_pipe_estimator.full_bw_reached()
    }

    /// The bandwidth-delay product for the given bandwidth estimate and gain,
    /// in packets
    ///
    /// The gain controls the amount of queue: a small gain builds a smaller
    /// queue but is more vulnerable to noise in RTT measurements such as
    /// delayed ACKs.
    #[inline]
    fn bdp(&self, bw: u32, gain: u16) -> u32 {
        // Without a valid RTT sample the connection is still retransmitting
        // its opening exchange; an RTO may have cut the cwnd to 1 and we need
        // to slow-start up toward something safe.
        if !self.min_rtt_estimator.has_sample() {
            return TCP_INIT_CWND;
        }

        let w = bw as u64 * self.min_rtt_estimator.min_rtt_us() as u64;

        // Apply the gain, then remove the bw scaling
        let bdp = (w.saturating_mul(gain as u64) >> GAIN_SCALE).div_ceil(BW_UNIT);
        bdp.min(u32::MAX as u64) as u32
    }

    /// Budgets enough extra window for full-sized aggregates at both end
    /// systems: one in the sending host's queueing discipline, one in the
    /// sending host's offload engine, and one in the receiver's coalescing
    /// engine
    #[inline]
    fn quantization_budget(&self, cwnd: u32) -> u32 {
        cwnd.saturating_add(3 * self.tso_segs_goal as u32)
    }

    /// The inflight volume needed to fill the path at the given bandwidth
    /// estimate and gain, in packets
    #[inline]
    fn inflight(&self, bw: u32, gain: u16) -> u32 {
        self.quantization_budget(self.bdp(bw, gain))
    }

    /// The cwnd increment provisioned for ACK aggregation, in packets
    #[inline]
    fn ack_aggregation_cwnd(&self) -> u32 {
        if ack_aggregation::EXTRA_ACKED_GAIN == 0 || !self.full_bw_reached() {
            return 0;
        }

        let max_aggr_cwnd = self.bw() as u64 * ack_aggregation::EXTRA_ACKED_MAX_US / BW_UNIT;
        let aggr_cwnd = (ack_aggregation::EXTRA_ACKED_GAIN as u64
            * self.ack_aggregation.extra_acked() as u64)
            >> GAIN_SCALE;
        aggr_cwnd.min(max_aggr_cwnd).min(u32::MAX as u64) as u32
    }

    /// Slow-starts the cwnd up toward the target (if the bw estimate is
    /// growing or losses drew the window down below it), or snaps down to the
    /// target when above it
    #[inline]
    fn set_cwnd<C: HostConnection>(
        &mut self,
        conn: &mut C,
        rate_sample: &RateSample,
        acked: u32,
        bw: u32,
        gain: u16,
    ) {
        if acked == 0 {
            return;
        }

        let (mut cwnd, packet_conservation) =
            self.modulate_cwnd_for_recovery(conn, rate_sample, acked);

        if !packet_conservation {
            // Increment the target to absorb excess ACKed data that appears
            // due to aggregation (of data and/or ACKs) in the ACK stream
            let target_cwnd = self
                .bdp(bw, gain)
                .saturating_add(self.ack_aggregation_cwnd());
            let target_cwnd = self.quantization_budget(target_cwnd);

            if self.full_bw_reached() {
                // Only cut the cwnd if we filled the pipe
                cwnd = cwnd.saturating_add(acked).min(target_cwnd);
            } else if cwnd < target_cwnd || conn.delivered() < TCP_INIT_CWND as u64 {
                cwnd = cwnd.saturating_add(acked);
            }
            cwnd = cwnd.max(CWND_MIN_TARGET);
        }

        // Apply the global cap
        let mut cwnd = cwnd.min(conn.snd_cwnd_clamp());
        if self.mode == Mode::ProbeRtt {
            // Drain the queue, refresh min_rtt
            cwnd = cwnd.min(CWND_MIN_TARGET);
        }
        conn.set_snd_cwnd(cwnd);
    }

    /// Updates the path model from one ACK's rate sample
    #[inline]
    fn update_model<C: HostConnection>(
        &mut self,
        conn: &mut C,
        rate_sample: &RateSample,
        random_generator: &mut dyn random::Generator,
    ) {
        self.update_bw(conn, rate_sample, random_generator);
        self.update_ack_aggregation(conn, rate_sample);
        self.update_cycle_phase(conn, rate_sample, random_generator);
        self.check_full_bw_reached(rate_sample);
        self.check_drain(conn, random_generator);
        self.update_min_rtt(conn, rate_sample, random_generator);
    }

    /// Feeds the ACK-aggregation estimator with the effective bandwidth
    #[inline]
    fn update_ack_aggregation<C: HostConnection>(&mut self, conn: &C, rate_sample: &RateSample) {
        self.ack_aggregation.on_ack(
            self.bw(),
            rate_sample,
            self.round_counter.round_start(),
            conn.delivered_mstamp(),
            conn.snd_cwnd(),
        );
    }

    /// Moves the mode machine to `new_mode`
    #[inline]
    fn transition_to(&mut self, new_mode: Mode) {
        if cfg!(debug_assertions) {
            match new_mode {
                // Startup is re-entered when ProbeRtt finds the pipe unfilled
                Mode::Startup => assert!(matches!(self.mode, Mode::Startup | Mode::ProbeRtt)),
                Mode::Drain => assert!(matches!(self.mode, Mode::Startup)),
                // ProbeBw is re-entered to restart gain cycling when the
                // long-term estimate expires
                Mode::ProbeBw => assert!(matches!(
                    self.mode,
                    Mode::Drain | Mode::ProbeBw | Mode::ProbeRtt
                )),
                Mode::ProbeRtt => assert!(self.mode != Mode::ProbeRtt),
            }
        }

        #[cfg(feature = "event-tracing")]
        tracing::debug!(from = ?self.mode, to = ?new_mode, "congestion mode changed");

        self.mode = new_mode;
    }
}

impl CongestionControl for BbrPlusCongestionController {
    const NAME: &'static str = "bbrplus";

    fn init<C: HostConnection>(&mut self, conn: &mut C) {
        let now = conn.tcp_mstamp();

        *self = Self::new();
        self.min_rtt_estimator = min_rtt::Estimator::new(conn.min_rtt_us(), now);
        self.bw_estimator.reset(self.round_counter.round_count());
        self.ack_aggregation.reset_epoch(now);
        self.reset_lt_bw_sampling(conn);
        self.init_pacing_rate(conn);

        if conn.pacing_status() == PacingStatus::None {
            conn.set_pacing_status(PacingStatus::Needed);
        }
    }

    fn cong_control<C: HostConnection>(
        &mut self,
        conn: &mut C,
        rate_sample: &RateSample,
        random_generator: &mut dyn random::Generator,
    ) {
        self.update_model(conn, rate_sample, random_generator);

        let bw = self.bw();
        self.set_pacing_rate(conn, bw, self.pacing_gain);
        self.set_tso_segs_goal(conn);
        self.set_cwnd(conn, rate_sample, rate_sample.acked_sacked, bw, self.cwnd_gain);
    }

    fn cwnd_event<C: HostConnection>(&mut self, conn: &mut C, event: CongestionEvent) {
        if event == CongestionEvent::TxStart && conn.app_limited() != 0 {
            self.idle_restart = true;
            self.ack_aggregation.reset_epoch(conn.tcp_mstamp());

            // Avoid pointless buffer overflows: pace at the estimated bw when
            // restarting from idle and app-limited, since no more speed is
            // needed
            if self.mode == Mode::ProbeBw {
                self.set_pacing_rate(conn, self.bw(), GAIN_UNIT);
            }
        }
    }

    fn set_state<C: HostConnection>(
        &mut self,
        conn: &mut C,
        new_state: CaState,
        random_generator: &mut dyn random::Generator,
    ) {
        if new_state == CaState::Loss {
            self.recovery_state.prev_ca_state = CaState::Loss;
            self.full_pipe_estimator.discard_baseline();
            // Treat an RTO like the end of a round
            self.round_counter.force_round_start();

            let rate_sample = RateSample {
                losses: 1,
                ..Default::default()
            };
            self.lt_bw_sampling(conn, &rate_sample, random_generator);
        }
    }

    /// Entering loss recovery, so save the cwnd for when recovery exits or is
    /// undone; ssthresh itself is not used
    fn ssthresh<C: HostConnection>(&mut self, conn: &C) -> u32 {
        self.save_cwnd(conn);
        TCP_INFINITE_SSTHRESH
    }

    /// Losses do not always reduce the cwnd, so there is nothing to undo
    fn undo_cwnd<C: HostConnection>(&mut self, conn: &C) -> u32 {
        conn.snd_cwnd()
    }

    /// Provision 3 * cwnd: the flow may slow-start even during recovery
    fn sndbuf_expand<C: HostConnection>(&self, _conn: &C) -> u32 {
        3
    }

    fn tso_segs_goal<C: HostConnection>(&self, _conn: &C) -> u32 {
        self.tso_segs_goal as u32
    }

    fn get_info<C: HostConnection>(&self, conn: &C, ext: u32) -> Option<(u16, CongestionInfo)> {
        if ext & (1 << (INET_DIAG_BBRINFO - 1)) != 0 || ext & (1 << (INET_DIAG_VEGASINFO - 1)) != 0
        {
            let bw =
                (self.bw() as u64 * conn.mss_cache() as u64 * pacing::USEC_PER_SEC) >> BW_SCALE;
            return Some((
                INET_DIAG_BBRINFO as u16,
                CongestionInfo {
                    bw_lo: bw as u32,
                    bw_hi: (bw >> 32) as u32,
                    min_rtt: self.min_rtt_estimator.min_rtt_us(),
                    pacing_gain: self.pacing_gain as u32,
                    cwnd_gain: self.cwnd_gain as u32,
                },
            ));
        }
        None
    }
}

#[cfg(test)]
mod tests;
