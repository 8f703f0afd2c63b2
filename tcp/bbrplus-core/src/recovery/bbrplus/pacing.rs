// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::recovery::{
    bbrplus::{BbrPlusCongestionController, BW_SCALE, BW_UNIT, GAIN_SCALE},
    congestion_controller::HostConnection,
};

pub(super) const USEC_PER_SEC: u64 = 1_000_000;
pub(super) const USEC_PER_MSEC: u64 = 1_000;

/// Skip TSO below this bandwidth (bits/sec)
const MIN_TSO_RATE: u64 = 1_200_000;

/// The most segments we will aim for in a single transmitted aggregate
const MAX_TSO_SEGS: u32 = 0x7F;

/// Converts a scaled bandwidth and gain to a rate in bytes per second
///
/// The operand order interleaves shifts between the multiplications so the
/// intermediate products stay within a u64 for input rates up to ~2.9Tbit/sec
/// with a gain of 2.89x.
#[inline]
pub(super) fn rate_bytes_per_sec<C: HostConnection>(conn: &C, rate: u64, gain: u16) -> u64 {
    let mut rate = rate.saturating_mul(conn.mss_to_mtu(conn.mss_cache()) as u64);
    rate = rate.saturating_mul(gain as u64);
    rate >>= GAIN_SCALE;
    rate = rate.saturating_mul(USEC_PER_SEC);
    rate >> BW_SCALE
}

/// Pacing rate and segmentation outputs
///
/// The average pacing rate aims to sit very slightly below the estimated
/// bandwidth; that margin falls out of excluding link-layer framing from the
/// packet size used in the conversion.
impl BbrPlusCongestionController {
    /// Converts a bandwidth estimate and gain to a pacing rate, capped by the
    /// socket's limit
    #[inline]
    fn bw_to_pacing_rate<C: HostConnection>(conn: &C, bw: u64, gain: u16) -> u64 {
        rate_bytes_per_sec(conn, bw, gain).min(conn.max_pacing_rate())
    }

    /// Seeds the pacing rate at high_gain * init_cwnd / RTT
    #[inline]
    pub(super) fn init_pacing_rate<C: HostConnection>(&mut self, conn: &mut C) {
        let rtt_us = if conn.srtt_us() != 0 {
            self.has_seen_rtt = true;
            (conn.srtt_us() >> 3).max(1)
        } else {
            // No RTT sample yet, use a nominal default
            USEC_PER_MSEC as u32
        };

        let bw = conn.snd_cwnd() as u64 * BW_UNIT / rtt_us as u64;
        let rate = Self::bw_to_pacing_rate(conn, bw, super::startup::PACING_GAIN);
        conn.set_pacing_rate(rate);
    }

    /// Publishes the pacing rate for the current bandwidth estimate and gain
    ///
    /// Until the pipe is estimated full, only increases are published so a
    /// transient dip in the model cannot slow the Startup ramp.
    #[inline]
    pub(super) fn set_pacing_rate<C: HostConnection>(&mut self, conn: &mut C, bw: u32, gain: u16) {
        let rate = Self::bw_to_pacing_rate(conn, bw as u64, gain);

        if !self.has_seen_rtt && conn.srtt_us() != 0 {
            self.init_pacing_rate(conn);
        }
        if self.full_bw_reached() || rate > conn.pacing_rate() {
            conn.set_pacing_rate(rate);

            #[cfg(feature = "event-tracing")]
            tracing::trace!(pacing_rate = rate, "pacing rate updated");
        }
    }

    /// Recomputes the number of segments to aim for in each transmitted
    /// aggregate
    #[inline]
    pub(super) fn set_tso_segs_goal<C: HostConnection>(&mut self, conn: &C) {
        let min_segs = if conn.pacing_rate() < MIN_TSO_RATE >> 3 {
            1
        } else {
            2
        };
        self.tso_segs_goal = conn
            .tso_autosize(conn.mss_cache(), min_segs)
            .min(MAX_TSO_SEGS) as u8;
    }
}
