// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

/// A delivery rate sample produced by the host's rate estimator for one ACK event
///
/// The host constructs these per the delivery rate estimation method in
/// <https://datatracker.ietf.org/doc/draft-cheng-iccrg-delivery-rate-estimation/>:
/// `interval_us` must exceed the maximum of the send interval and the ACK
/// interval, and `prior_delivered` is the value of the delivered counter at the
/// time the first newly-acked packet was sent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(any(test, feature = "generator"), derive(bolero_generator::TypeGenerator))]
pub struct RateSample {
    /// The number of packets marked as delivered over the sampling interval,
    /// negative when no sample is available
    pub delivered: i32,
    /// The length of the sampling interval in microseconds, zero or negative
    /// when no sample is available
    pub interval_us: i64,
    /// The RTT measured by the most recently acked packet in microseconds,
    /// negative when unavailable
    pub rtt_us: i64,
    /// The number of packets newly marked as lost at this ACK event
    pub losses: u32,
    /// The number of packets newly acked or SACKed at this ACK event
    pub acked_sacked: u32,
    /// The number of packets that were in flight before this ACK arrived
    pub prior_in_flight: u32,
    /// The delivered counter at the time the first newly-acked packet was sent
    pub prior_delivered: u64,
    /// True if the flow was limited by the application rather than the network
    /// when the acked packets were sent
    pub is_app_limited: bool,
}

impl RateSample {
    /// True if the sample describes an actual delivery interval
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.delivered >= 0 && self.interval_us > 0
    }
}
