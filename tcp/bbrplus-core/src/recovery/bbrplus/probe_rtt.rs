// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    random,
    recovery::{
        bbrplus::{BbrPlusCongestionController, Mode, CWND_MIN_TARGET, GAIN_UNIT},
        congestion_controller::HostConnection,
        RateSample,
    },
};

/// Minimum time spent at the minimum cwnd in ProbeRtt
///
/// 200ms against a 10 second filter window bounds the throughput penalty of
/// ProbeRtt's cwnd capping to roughly 2%.
const PROBE_RTT_DURATION_US: u64 = 200 * 1000;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct State {
    /// End time for the ProbeRtt dwell, armed once inflight reaches the
    /// minimum target
    done_timestamp: Option<u64>,
    /// True once a full packet-timed round elapsed at the minimum target
    round_done: bool,
}

/// Methods related to the ProbeRtt mode
///
/// ProbeRtt periodically drains the bottleneck queue so that flows sharing it
/// converge on the true propagation delay, keeping queues small and BBR flows
/// fair to each other. Flows with natural silences re-measure min_rtt
/// opportunistically and rarely pay the dip.
impl BbrPlusCongestionController {
    /// Tracks min RTT and runs the ProbeRtt entry/dwell/exit machinery
    #[inline]
    pub(super) fn update_min_rtt<C: HostConnection>(
        &mut self,
        conn: &mut C,
        rate_sample: &RateSample,
        random_generator: &mut dyn random::Generator,
    ) {
        let now = conn.tcp_mstamp();
        let filter_expired = self.min_rtt_estimator.is_expired(now);
        self.min_rtt_estimator.update(rate_sample.rtt_us, now);

        if filter_expired && !self.idle_restart && self.mode != Mode::ProbeRtt {
            self.enter_probe_rtt(conn);
        }

        if self.mode == Mode::ProbeRtt {
            self.handle_probe_rtt(conn, random_generator, now);
        }

        self.idle_restart = false;
    }

    /// Enters `ProbeRtt`, dipping inflight to re-probe the propagation delay
    #[inline]
    fn enter_probe_rtt<C: HostConnection>(&mut self, conn: &C) {
        self.transition_to(Mode::ProbeRtt);
        self.pacing_gain = GAIN_UNIT;
        self.cwnd_gain = GAIN_UNIT;
        // Note the cwnd so it can be restored on exit
        self.save_cwnd(conn);
        self.probe_rtt_state.done_timestamp = None;
    }

    /// Maintains the minimum inflight for max(200 ms, 1 round), then exits
    #[inline]
    fn handle_probe_rtt<C: HostConnection>(
        &mut self,
        conn: &mut C,
        random_generator: &mut dyn random::Generator,
        now: u64,
    ) {
        // Ignore low rate samples during this mode
        let app_limited = conn.delivered().saturating_add(conn.packets_in_flight() as u64);
        conn.set_app_limited(app_limited.max(1));

        if self.probe_rtt_state.done_timestamp.is_none()
            && conn.packets_in_flight() <= CWND_MIN_TARGET
        {
            self.probe_rtt_state.done_timestamp = Some(now.saturating_add(PROBE_RTT_DURATION_US));
            self.probe_rtt_state.round_done = false;
            self.round_counter.start(conn.delivered());
        } else if let Some(done_timestamp) = self.probe_rtt_state.done_timestamp {
            if self.round_counter.round_start() {
                self.probe_rtt_state.round_done = true;
            }
            if self.probe_rtt_state.round_done && now > done_timestamp {
                self.min_rtt_estimator.schedule_next_probe(now);
                // Snap back to the cwnd held before the dip
                self.recovery_state.request_restore_cwnd();
                self.reset_mode(conn, random_generator);
            }
        }
    }

    /// Re-enters Startup or ProbeBw depending on whether the pipe was filled
    #[inline]
    pub(super) fn reset_mode<C: HostConnection>(
        &mut self,
        conn: &C,
        random_generator: &mut dyn random::Generator,
    ) {
        if !self.full_bw_reached() {
            self.enter_startup();
        } else {
            self.enter_probe_bw(conn, random_generator);
        }
    }
}
