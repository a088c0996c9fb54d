//! Sender Report timing data
//!
//! RTCP Sender Reports carry an NTP wall-clock timestamp paired with an RTP
//! timestamp. That pair is what lets a forwarder reconcile the RTP clocks of
//! different simulcast streams of the same source: the difference between
//! two streams' NTP clocks, converted to RTP ticks, aligns their timestamp
//! spaces.

/// The (NTP wall-clock, RTP timestamp) pair from the last Sender Report
/// seen on a stream.
///
/// The wall-clock is carried as absolute milliseconds; millisecond
/// resolution is all the cross-stream alignment math needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderReportInfo {
    /// NTP wall-clock of the report, in absolute milliseconds.
    pub ntp_ms: u64,

    /// RTP timestamp corresponding to the NTP timestamp.
    pub rtp_ts: u32,
}
