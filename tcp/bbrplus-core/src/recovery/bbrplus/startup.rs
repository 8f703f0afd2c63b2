// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::recovery::bbrplus::{BbrPlusCongestionController, Mode, GAIN_UNIT};

/// We use a high gain of 2/ln(2) because it's the smallest pacing gain that
/// will allow a smoothly increasing pacing rate that doubles each RTT and
/// sends the same number of packets per RTT that an un-paced, slow-starting
/// Reno or CUBIC flow would
pub(crate) const PACING_GAIN: u16 = (GAIN_UNIT as u32 * 2885 / 1000 + 1) as u16;

pub(crate) const CWND_GAIN: u16 = PACING_GAIN;

/// Methods related to the Startup mode
impl BbrPlusCongestionController {
    /// Enters `Startup`, ramping the sending rate rapidly to fill the pipe
    #[inline]
    pub(super) fn enter_startup(&mut self) {
        self.transition_to(Mode::Startup);
        self.pacing_gain = PACING_GAIN;
        self.cwnd_gain = CWND_GAIN;
    }
}
