// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{random, recovery::RateSample};
use zerocopy::{Immutable, IntoBytes, KnownLayout};

/// The default initial congestion window used while no RTT sample is available
pub const TCP_INIT_CWND: u32 = 10;

/// Sentinel slow-start threshold for congestion controllers that do not use one
pub const TCP_INFINITE_SSTHRESH: u32 = 0x7fff_ffff;

/// The size in bytes of the slot the host reserves in its per-connection
/// control block for congestion-control state
///
/// Controllers must fit their state object within this budget; the check is
/// performed at build time.
pub const CA_PRIV_SIZE: usize = 320;

/// Diagnostic extension bit positions, matching the host's socket diagnostics
pub const INET_DIAG_VEGASINFO: u32 = 3;
pub const INET_DIAG_BBRINFO: u32 = 16;

/// Sender congestion-avoidance states, in the host stack's escalation order
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum CaState {
    /// Normal operation, no outstanding suspicion of loss
    Open,
    /// Reordering observed, not yet treated as loss
    Disorder,
    /// Congestion window reduction in response to ECN or local notification
    Cwr,
    /// Fast recovery after duplicate ACKs or SACK-signaled loss
    Recovery,
    /// Retransmission timeout fired
    Loss,
}

/// Notable connection events forwarded to the congestion controller
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum CongestionEvent {
    /// First transmission when no packets were in flight
    TxStart,
    /// Congestion window restart after an idle period
    CwndRestart,
    /// End of congestion window reduction
    CompleteCwr,
    /// A loss timeout fired
    Loss,
}

/// Transport pacing status of the connection's socket
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacingStatus {
    /// The socket is not paced
    None,
    /// A congestion controller requested pacing; the stack provides it
    Needed,
    /// An external packet scheduler owns pacing
    Fq,
}

/// The view of a TCP connection a congestion controller is given by the host
///
/// This is the narrow capability set the host grants instead of handing out
/// its full connection state. Mutators publish control outputs (congestion
/// window, pacing rate) and the app-limited marker; everything else is
/// read-only model input. All timestamps share a single monotonic microsecond
/// clock. All calls for one connection are serialized by the host.
pub trait HostConnection {
    /// The current time on the connection's microsecond clock
    fn tcp_mstamp(&self) -> u64;
    /// Total packets delivered to the peer over the lifetime of the connection
    fn delivered(&self) -> u64;
    /// The time at which `delivered` was last updated
    fn delivered_mstamp(&self) -> u64;
    /// Total packets marked lost over the lifetime of the connection
    fn lost(&self) -> u64;
    /// The current effective sender maximum segment size in bytes
    fn mss_cache(&self) -> u32;
    /// Converts an MSS to the on-the-wire MTU it occupies
    fn mss_to_mtu(&self, mss: u32) -> u32;
    /// The smoothed RTT estimate in microseconds, left-shifted by 3; zero when
    /// no RTT sample has been taken
    fn srtt_us(&self) -> u32;
    /// The connection-lifetime minimum RTT in microseconds, `u32::MAX` when
    /// no sample exists
    fn min_rtt_us(&self) -> u32;
    /// The current congestion window in packets
    fn snd_cwnd(&self) -> u32;
    /// Publishes a new congestion window in packets
    fn set_snd_cwnd(&mut self, cwnd: u32);
    /// The upper bound the host places on any congestion window
    fn snd_cwnd_clamp(&self) -> u32;
    /// Nonzero while the flow is marked application-limited; the value is the
    /// delivered count that ends the limited period
    fn app_limited(&self) -> u64;
    /// Marks the flow application-limited until `delivered` passes `value`
    fn set_app_limited(&mut self, value: u64);
    /// The number of packets currently in flight
    fn packets_in_flight(&self) -> u32;
    /// The socket's current pacing rate in bytes per second
    fn pacing_rate(&self) -> u64;
    /// Publishes a new pacing rate in bytes per second
    fn set_pacing_rate(&mut self, rate: u64);
    /// The maximum pacing rate allowed on this socket
    fn max_pacing_rate(&self) -> u64;
    /// The socket's pacing status
    fn pacing_status(&self) -> PacingStatus;
    /// Updates the socket's pacing status
    fn set_pacing_status(&mut self, status: PacingStatus);
    /// The host's segmentation-offload autosizing decision for the given MSS
    /// and minimum segment count
    fn tso_autosize(&self, mss: u32, min_tso_segs: u32) -> u32;
    /// The sender's current congestion-avoidance state
    fn ca_state(&self) -> CaState;
    /// True if the send queue holds a segment that has not been transmitted
    fn has_send_head(&self) -> bool;
    /// True if the peer's receive window admits the segment at the head of
    /// the send queue
    fn send_window_allows_head(&self) -> bool;
}

/// Diagnostic record describing the controller's current model
///
/// Layout-compatible with the host's socket-diagnostics congestion record:
/// `bw_lo`/`bw_hi` form a 64-bit estimate in bytes per second, `min_rtt` is in
/// microseconds, and the gains are fractions scaled by 2^8.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct CongestionInfo {
    pub bw_lo: u32,
    pub bw_hi: u32,
    pub min_rtt: u32,
    pub pacing_gain: u32,
    pub cwnd_gain: u32,
}

/// The capability set a congestion-control algorithm exposes to the host stack
///
/// The host owns one implementing object per connection, embedded in the
/// connection control block, and dispatches these operations through it. The
/// host calls `init` before any other operation.
pub trait CongestionControl {
    /// The name the algorithm is registered under
    const NAME: &'static str;

    /// Called once when the connection is established
    fn init<C: HostConnection>(&mut self, conn: &mut C);

    /// Called on every ACK event with a fresh rate sample
    fn cong_control<C: HostConnection>(
        &mut self,
        conn: &mut C,
        rate_sample: &RateSample,
        random_generator: &mut dyn random::Generator,
    );

    /// Called on notable connection events
    fn cwnd_event<C: HostConnection>(&mut self, conn: &mut C, event: CongestionEvent);

    /// Called when the sender's congestion-avoidance state changes
    fn set_state<C: HostConnection>(
        &mut self,
        conn: &mut C,
        new_state: CaState,
        random_generator: &mut dyn random::Generator,
    );

    /// Returns the slow-start threshold to apply on entering recovery
    fn ssthresh<C: HostConnection>(&mut self, conn: &C) -> u32;

    /// Returns the congestion window to restore when a loss is found spurious
    fn undo_cwnd<C: HostConnection>(&mut self, conn: &C) -> u32;

    /// Returns the multiple of the congestion window the socket send buffer
    /// should provision for
    fn sndbuf_expand<C: HostConnection>(&self, conn: &C) -> u32;

    /// Returns the number of segments to aim for in each transmitted
    /// aggregate, or 0 for the host default
    fn tso_segs_goal<C: HostConnection>(&self, conn: &C) -> u32;

    /// Serializes the diagnostic record when the extension mask requests it,
    /// returning the attribute identifying the record
    fn get_info<C: HostConnection>(&self, conn: &C, ext: u32) -> Option<(u16, CongestionInfo)>;
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use super::{CaState, HostConnection, PacingStatus, TCP_INIT_CWND};

    /// An in-memory host connection for driving a congestion controller in
    /// tests
    ///
    /// Fields are public so tests can stage whatever connection state a
    /// scenario needs between ACK events.
    #[derive(Clone, Debug)]
    pub struct Connection {
        pub tcp_mstamp: u64,
        pub delivered: u64,
        pub delivered_mstamp: u64,
        pub lost: u64,
        pub mss_cache: u32,
        pub srtt_us: u32,
        pub min_rtt_us: u32,
        pub snd_cwnd: u32,
        pub snd_cwnd_clamp: u32,
        pub app_limited: u64,
        pub packets_in_flight: u32,
        pub pacing_rate: u64,
        pub max_pacing_rate: u64,
        pub pacing_status: PacingStatus,
        pub ca_state: CaState,
        pub has_send_head: bool,
        pub send_window_allows_head: bool,
    }

    impl Default for Connection {
        fn default() -> Self {
            Self {
                tcp_mstamp: 0,
                delivered: 0,
                delivered_mstamp: 0,
                lost: 0,
                mss_cache: 1460,
                srtt_us: 0,
                min_rtt_us: u32::MAX,
                snd_cwnd: TCP_INIT_CWND,
                snd_cwnd_clamp: u32::MAX,
                app_limited: 0,
                packets_in_flight: 0,
                pacing_rate: 0,
                max_pacing_rate: u64::MAX,
                pacing_status: PacingStatus::None,
                ca_state: CaState::Open,
                has_send_head: true,
                send_window_allows_head: true,
            }
        }
    }

    impl HostConnection for Connection {
        fn tcp_mstamp(&self) -> u64 {
            self.tcp_mstamp
        }

        fn delivered(&self) -> u64 {
            self.delivered
        }

        fn delivered_mstamp(&self) -> u64 {
            self.delivered_mstamp
        }

        fn lost(&self) -> u64 {
            self.lost
        }

        fn mss_cache(&self) -> u32 {
            self.mss_cache
        }

        fn mss_to_mtu(&self, mss: u32) -> u32 {
            // IPv4 + TCP headers without options
            mss + 40
        }

        fn srtt_us(&self) -> u32 {
            self.srtt_us
        }

        fn min_rtt_us(&self) -> u32 {
            self.min_rtt_us
        }

        fn snd_cwnd(&self) -> u32 {
            self.snd_cwnd
        }

        fn set_snd_cwnd(&mut self, cwnd: u32) {
            self.snd_cwnd = cwnd;
        }

        fn snd_cwnd_clamp(&self) -> u32 {
            self.snd_cwnd_clamp
        }

        fn app_limited(&self) -> u64 {
            self.app_limited
        }

        fn set_app_limited(&mut self, value: u64) {
            self.app_limited = value;
        }

        fn packets_in_flight(&self) -> u32 {
            self.packets_in_flight
        }

        fn pacing_rate(&self) -> u64 {
            self.pacing_rate
        }

        fn set_pacing_rate(&mut self, rate: u64) {
            self.pacing_rate = rate;
        }

        fn max_pacing_rate(&self) -> u64 {
            self.max_pacing_rate
        }

        fn pacing_status(&self) -> PacingStatus {
            self.pacing_status
        }

        fn set_pacing_status(&mut self, status: PacingStatus) {
            self.pacing_status = status;
        }

        fn tso_autosize(&self, mss: u32, min_tso_segs: u32) -> u32 {
            // One pacing interval's worth of data, as the host stack sizes it
            let bytes = self.pacing_rate >> 10;
            let segs = (bytes / mss.max(1) as u64) as u32;
            segs.max(min_tso_segs)
        }

        fn ca_state(&self) -> CaState {
            self.ca_state
        }

        fn has_send_head(&self) -> bool {
            self.has_send_head
        }

        fn send_window_allows_head(&self) -> bool {
            self.send_window_allows_head
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ca_state_ordering() {
        assert!(CaState::Open < CaState::Disorder);
        assert!(CaState::Disorder < CaState::Cwr);
        assert!(CaState::Cwr < CaState::Recovery);
        assert!(CaState::Recovery < CaState::Loss);
    }

    #[test]
    fn congestion_info_layout() {
        let info = CongestionInfo {
            bw_lo: 1,
            bw_hi: 2,
            min_rtt: 3,
            pacing_gain: 4,
            cwnd_gain: 5,
        };

        let bytes = info.as_bytes();
        assert_eq!(20, bytes.len());
        assert_eq!(1, u32::from_ne_bytes(bytes[..4].try_into().unwrap()));
        assert_eq!(5, u32::from_ne_bytes(bytes[16..].try_into().unwrap()));
    }
}
