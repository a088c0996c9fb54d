//! Read-only surface of an upstream simulcast stream
//!
//! One implementation lives in the media router's receive path; consumers
//! only ever read from it. All queries are synchronous and non-blocking.

use rsfu_rtp_core::SenderReportInfo;

/// What a consumer may ask of the upstream stream behind one spatial layer.
pub trait ProducerRtpStream {
    /// Mapped SSRC identifying this stream.
    fn ssrc(&self) -> u32;

    /// Stream health, 0 (dead) to 10.
    fn score(&self) -> u8;

    /// Number of temporal layers this stream carries.
    fn temporal_layers(&self) -> u8;

    /// Milliseconds this stream has been continuously active.
    fn active_time_ms(&self) -> u64;

    /// Cumulative bitrate (bps) of temporal layers `0..=temporal_layer`,
    /// sampled at `now_ms`. Zero means the temporal layer is inactive.
    fn bitrate(&self, now_ms: u64, temporal_layer: u8) -> u32;

    /// Incremental bitrate (bps) contributed by exactly `temporal_layer`,
    /// sampled at `now_ms`.
    fn layer_bitrate(&self, now_ms: u64, temporal_layer: u8) -> u32;

    /// The last RTCP Sender Report seen on this stream, if any.
    fn sender_report(&self) -> Option<SenderReportInfo>;
}
