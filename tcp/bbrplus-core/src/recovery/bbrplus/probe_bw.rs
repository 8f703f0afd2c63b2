// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    random,
    recovery::{
        bbrplus::{BbrPlusCongestionController, Mode, DRAIN_TO_TARGET, GAIN_UNIT},
        congestion_controller::HostConnection,
        RateSample,
    },
};

/// Number of phases in a pacing gain cycle
pub(crate) const CYCLE_LEN: usize = 8;

/// The starting gain cycling phase is randomized over this many phases
const CYCLE_RAND: u64 = 7;

/// The pacing gain values for the gain cycle, to discover and share bw:
/// probe for more available bw, drain queue and/or yield bw to other flows,
/// then cruise at 1.0*bw to utilize the pipe without creating excess queue
pub(crate) const PACING_GAIN_CYCLE: [u16; CYCLE_LEN] = [
    GAIN_UNIT * 5 / 4,
    GAIN_UNIT * 3 / 4,
    GAIN_UNIT,
    GAIN_UNIT,
    GAIN_UNIT,
    GAIN_UNIT,
    GAIN_UNIT,
    GAIN_UNIT,
];

/// The gain for deriving steady-state cwnd tolerates delayed/stretched ACKs
pub(crate) const CWND_GAIN: u16 = GAIN_UNIT * 2;

/// The phases of a drain-to-target probing cycle, named by their position in
/// the gain table
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CyclePhase {
    /// Probe for more available bandwidth at a gain above 1.0
    Up,
    /// Drain the queue the probe built at a gain below 1.0
    Down,
    /// Cruise at the estimated bandwidth
    Cruise,
}

impl CyclePhase {
    /// The position of this phase in the pacing gain table
    #[inline]
    pub const fn cycle_index(self) -> u8 {
        match self {
            CyclePhase::Up => 0,
            CyclePhase::Down => 1,
            CyclePhase::Cruise => 2,
        }
    }
}

/// Gain cycling state while probing for bandwidth
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Cycle {
    /// Time the current cycle phase started
    pub(super) mstamp: u64,
    /// Current index in the pacing gain table
    pub(super) index: u8,
    /// Phases in the current probing cycle, randomized per cycle
    pub(super) length: u8,
}

/// Methods related to the ProbeBw mode
impl BbrPlusCongestionController {
    /// Enters `ProbeBw` with a randomized starting phase
    #[inline]
    pub(super) fn enter_probe_bw<C: HostConnection>(
        &mut self,
        conn: &C,
        random_generator: &mut dyn random::Generator,
    ) {
        self.transition_to(Mode::ProbeBw);
        self.pacing_gain = GAIN_UNIT;
        self.cwnd_gain = CWND_GAIN;
        self.cycle.index =
            (CYCLE_LEN as u64 - 1 - random::gen_range_biased(random_generator, 0..=CYCLE_RAND - 1))
                as u8;
        // Flip to the next phase of the gain cycle
        self.advance_cycle_phase(conn);
    }

    /// Gain cycling: cycle the pacing gain to converge to a fair share of the
    /// available bandwidth
    #[inline]
    pub(super) fn update_cycle_phase<C: HostConnection>(
        &mut self,
        conn: &C,
        rate_sample: &RateSample,
        random_generator: &mut dyn random::Generator,
    ) {
        if DRAIN_TO_TARGET {
            self.drain_to_target_cycling(conn, rate_sample, random_generator);
            return;
        }

        if self.mode == Mode::ProbeBw
            && !self.long_term.use_bw
            && self.is_next_cycle_phase(conn, rate_sample)
        {
            self.advance_cycle_phase(conn);
        }
    }

    /// Each probing cycle, probe up once and then hold a sub-unity gain until
    /// inflight falls to the estimated BDP
    #[inline]
    fn drain_to_target_cycling<C: HostConnection>(
        &mut self,
        conn: &C,
        rate_sample: &RateSample,
        random_generator: &mut dyn random::Generator,
    ) {
        if self.mode != Mode::ProbeBw {
            return;
        }

        let elapsed_us = conn.delivered_mstamp().saturating_sub(self.cycle.mstamp);
        let min_rtt_us = self.min_rtt_estimator.min_rtt_us() as u64;

        // Always probe for bw before the good bw estimate is forgotten
        if elapsed_us > self.cycle.length as u64 * min_rtt_us {
            // Start a new probing cycle of [2 to 8] x min_rtt
            self.cycle.mstamp = conn.delivered_mstamp();
            self.cycle.length = (CYCLE_LEN as u64
                - random::gen_range_biased(random_generator, 0..=CYCLE_RAND - 1))
                as u8;
            self.set_cycle_phase(CyclePhase::Up);
            return;
        }

        // A gain of 1.0 paces at the estimated bw to fully use the pipe
        // without increasing the queue
        if self.pacing_gain == GAIN_UNIT {
            return;
        }

        let inflight = rate_sample.prior_in_flight;
        let bw = self.max_bw();

        // A gain below 1.0 tries to drain the extra queue the probe added if
        // it didn't find more bw. Once inflight matches the BDP the queue is
        // drained; persisting would underutilize the pipe.
        if self.pacing_gain < GAIN_UNIT {
            if inflight <= self.inflight(bw, GAIN_UNIT) {
                self.set_cycle_phase(CyclePhase::Cruise);
            }
            return;
        }

        // A gain above 1.0 probes for bw by trying to raise inflight to at
        // least gain*BDP; this may take more than min_rtt if min_rtt is small.
        // Do not persist if packets are lost, since a path with small buffers
        // may not hold that much, and exit if the app or receive window
        // prevented reaching the target.
        if elapsed_us > min_rtt_us
            && (inflight >= self.inflight(bw, self.pacing_gain)
                || rate_sample.losses > 0
                || rate_sample.is_app_limited
                || !conn.has_send_head()
                || !conn.send_window_allows_head())
        {
            self.set_cycle_phase(CyclePhase::Down);
        }
    }

    /// End the current phase if it's time and/or the phase's inflight target
    /// was hit, cycling through the fixed gain table
    #[inline]
    fn is_next_cycle_phase<C: HostConnection>(
        &self,
        conn: &C,
        rate_sample: &RateSample,
    ) -> bool {
        let is_full_length =
            conn.delivered_mstamp().saturating_sub(self.cycle.mstamp)
                > self.min_rtt_estimator.min_rtt_us() as u64;

        if self.pacing_gain == GAIN_UNIT {
            return is_full_length;
        }

        let inflight = rate_sample.prior_in_flight;
        let bw = self.max_bw();

        if self.pacing_gain > GAIN_UNIT {
            return is_full_length
                && (rate_sample.losses > 0
                    || inflight >= self.inflight(bw, self.pacing_gain));
        }

        is_full_length || inflight <= self.inflight(bw, GAIN_UNIT)
    }

    /// Advances to the next index of the fixed gain table
    #[inline]
    fn advance_cycle_phase<C: HostConnection>(&mut self, conn: &C) {
        self.cycle.index = (self.cycle.index + 1) & (CYCLE_LEN as u8 - 1);
        self.cycle.mstamp = conn.delivered_mstamp();
        self.apply_cycle_gain();
    }

    /// Jumps to the given drain-to-target phase
    #[inline]
    fn set_cycle_phase(&mut self, phase: CyclePhase) {
        #[cfg(feature = "event-tracing")]
        tracing::trace!(?phase, "probe bw phase");

        self.cycle.index = phase.cycle_index();
        self.apply_cycle_gain();
    }

    /// Applies the gain for the current cycle index; a latched long-term
    /// (policed) estimate pins the gain to 1.0
    #[inline]
    fn apply_cycle_gain(&mut self) {
        self.pacing_gain = if self.long_term.use_bw {
            GAIN_UNIT
        } else {
            PACING_GAIN_CYCLE[self.cycle.index as usize]
        };
    }
}
