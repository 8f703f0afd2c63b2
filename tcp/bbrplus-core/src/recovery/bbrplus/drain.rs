// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    random,
    recovery::{
        bbrplus::{startup, BbrPlusCongestionController, Mode, GAIN_UNIT},
        congestion_controller::HostConnection,
    },
};

/// The inverse of the Startup pacing gain, calculated to typically drain the
/// queue created in Startup in a single round
pub(crate) const PACING_GAIN: u16 = (GAIN_UNIT as u32 * 1000 / 2885) as u16;

/// The cwnd is maintained during Drain; only the pacing rate backs off
pub(crate) const CWND_GAIN: u16 = startup::CWND_GAIN;

/// Methods related to the Drain mode
impl BbrPlusCongestionController {
    /// Enters `Drain`, paced slowly to drain the queue Startup built
    #[inline]
    pub(super) fn enter_drain(&mut self) {
        self.transition_to(Mode::Drain);
        self.pacing_gain = PACING_GAIN;
        self.cwnd_gain = CWND_GAIN;
    }

    /// If the pipe is probably full, drain the queue and enter steady state
    #[inline]
    pub(super) fn check_drain<C: HostConnection>(
        &mut self,
        conn: &C,
        random_generator: &mut dyn random::Generator,
    ) {
        if self.mode == Mode::Startup && self.full_bw_reached() {
            self.enter_drain();
        }
        // Fall through to check if in-flight is already small
        if self.mode == Mode::Drain
            && conn.packets_in_flight() <= self.inflight(self.max_bw(), GAIN_UNIT)
        {
            // We estimate the queue is drained
            self.enter_probe_bw(conn, random_generator);
        }
    }
}
