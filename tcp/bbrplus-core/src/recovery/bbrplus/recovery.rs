// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::recovery::{
    bbrplus::{BbrPlusCongestionController, Mode},
    congestion_controller::{CaState, HostConnection},
    RateSample,
};

/// Loss-recovery bookkeeping for the congestion window
///
/// On the first round of recovery the window follows the packet conservation
/// principle: release P packets per P packets acked. Afterwards it slow-starts
/// back toward the target, and when recovery finishes (or is undone) the
/// window saved on entry is restored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct State {
    /// The cwnd saved upon entering loss recovery or ProbeRtt
    pub(super) prior_cwnd: u32,
    /// The sender's congestion-avoidance state on the previous ack
    pub(super) prev_ca_state: CaState,
    /// True during the first round of recovery
    packet_conservation: bool,
    /// True once a decision was made to revert the cwnd to `prior_cwnd`
    restore_cwnd: bool,
}

impl Default for State {
    fn default() -> Self {
        Self {
            prior_cwnd: 0,
            prev_ca_state: CaState::Open,
            packet_conservation: false,
            restore_cwnd: false,
        }
    }
}

impl State {
    /// Ends the packet-conservation round
    #[inline]
    pub fn end_packet_conservation(&mut self) {
        self.packet_conservation = false;
    }

    /// Requests that the next cwnd update restores the saved window
    #[inline]
    pub fn request_restore_cwnd(&mut self) {
        self.restore_cwnd = true;
    }
}

impl BbrPlusCongestionController {
    /// Saves the last-known good cwnd so it can be restored after losses or
    /// ProbeRtt
    #[inline]
    pub(super) fn save_cwnd<C: HostConnection>(&mut self, conn: &C) {
        if self.recovery_state.prev_ca_state < CaState::Recovery && self.mode != Mode::ProbeRtt {
            // This cwnd is good enough
            self.recovery_state.prior_cwnd = conn.snd_cwnd();
        } else {
            // Loss recovery or ProbeRtt have temporarily cut the cwnd
            self.recovery_state.prior_cwnd = self.recovery_state.prior_cwnd.max(conn.snd_cwnd());
        }
    }

    /// Applies recovery entry/exit and restore policy to the cwnd
    ///
    /// Returns the adjusted cwnd and whether packet conservation settled the
    /// update: an ACK for P packets should release at most 2*P packets, so
    /// lost packets are deducted here and `set_cwnd` slow-starts the remainder
    /// back toward the target.
    #[inline]
    pub(super) fn modulate_cwnd_for_recovery<C: HostConnection>(
        &mut self,
        conn: &C,
        rate_sample: &RateSample,
        acked: u32,
    ) -> (u32, bool) {
        let prev_state = self.recovery_state.prev_ca_state;
        let state = conn.ca_state();
        let mut cwnd = conn.snd_cwnd();

        if rate_sample.losses > 0 {
            cwnd = cwnd.saturating_sub(rate_sample.losses).max(1);
        }

        if state == CaState::Recovery && prev_state != CaState::Recovery {
            // Starting the first round of recovery, so do packet conservation
            self.recovery_state.packet_conservation = true;
            // Start the round now
            self.round_counter.start(conn.delivered());
            // Cut unused cwnd from app behavior, TSQ, or TSO deferral
            cwnd = conn.packets_in_flight().saturating_add(acked);
        } else if prev_state >= CaState::Recovery && state < CaState::Recovery {
            // Exiting loss recovery; restore the cwnd saved before recovery
            self.recovery_state.restore_cwnd = true;
            self.recovery_state.packet_conservation = false;
        }
        self.recovery_state.prev_ca_state = state;

        if self.recovery_state.restore_cwnd {
            cwnd = cwnd.max(self.recovery_state.prior_cwnd);
            self.recovery_state.restore_cwnd = false;
        }

        if self.recovery_state.packet_conservation {
            return (cwnd.max(conn.packets_in_flight().saturating_add(acked)), true);
        }
        (cwnd, false)
    }
}
