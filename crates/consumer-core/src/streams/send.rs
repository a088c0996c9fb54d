//! Outgoing RTP stream state
//!
//! The slice of send-side state the forwarding engine needs: identity and
//! clock of the outgoing stream, the highest forwarded sequence/timestamp
//! pair (the anchor for cross-layer timestamp splicing), health score, and
//! downstream loss. Retransmission buffering, NACK handling and RTCP
//! generation live with the transport.

use std::collections::VecDeque;

use rsfu_rtp_core::seq::is_seq_higher_than;
use rsfu_rtp_core::RtpPacket;

use crate::types::{MimeType, RtcpFeedback, RtpCodecParameters, RtpEncodingParameters};

/// Window over which the transmission rate is computed.
const RATE_WINDOW_MS: u64 = 1000;

/// Immutable parameters of the outgoing stream.
#[derive(Debug, Clone)]
pub struct SendStreamParams {
    pub ssrc: u32,
    pub payload_type: u8,
    pub mime_type: MimeType,
    pub clock_rate: u32,
    pub cname: String,
    pub spatial_layers: u8,
    pub temporal_layers: u8,
    pub use_nack: bool,
    pub use_pli: bool,
    pub use_fir: bool,
    pub use_dtx: bool,
}

impl SendStreamParams {
    /// Derive stream parameters from the negotiated outgoing encoding and
    /// its media codec.
    pub fn from_encoding(
        encoding: &RtpEncodingParameters,
        codec: &RtpCodecParameters,
        cname: &str,
    ) -> Self {
        let mut use_nack = false;
        let mut use_pli = false;
        let mut use_fir = false;

        for fb in &codec.rtcp_feedback {
            match fb {
                RtcpFeedback::Nack => use_nack = true,
                RtcpFeedback::NackPli => use_pli = true,
                RtcpFeedback::CcmFir => use_fir = true,
                _ => {}
            }
        }

        Self {
            ssrc: encoding.ssrc,
            payload_type: codec.payload_type,
            mime_type: codec.mime_type,
            clock_rate: codec.clock_rate,
            cname: cname.to_string(),
            spatial_layers: encoding.spatial_layers,
            temporal_layers: encoding.temporal_layers,
            use_nack,
            use_pli,
            use_fir,
            use_dtx: encoding.dtx,
        }
    }
}

/// Byte counter samples within the rate window.
#[derive(Debug, Default)]
struct RateSamples {
    samples: VecDeque<(u64, usize)>,
    window_bytes: usize,
}

impl RateSamples {
    fn update(&mut self, now_ms: u64, bytes: usize) {
        self.samples.push_back((now_ms, bytes));
        self.window_bytes += bytes;
        self.trim(now_ms);
    }

    fn rate_bps(&mut self, now_ms: u64) -> u32 {
        self.trim(now_ms);
        (self.window_bytes as u64 * 8 * 1000 / RATE_WINDOW_MS) as u32
    }

    fn trim(&mut self, now_ms: u64) {
        while let Some(&(ms, bytes)) = self.samples.front() {
            if now_ms.saturating_sub(ms) <= RATE_WINDOW_MS {
                break;
            }
            self.window_bytes -= bytes;
            self.samples.pop_front();
        }
    }
}

/// The consumer's exclusively-owned outgoing stream.
#[derive(Debug)]
pub struct SendStream {
    params: SendStreamParams,
    rtx: Option<(u8, u32)>,
    paused: bool,
    score: u8,
    /// Fraction of packets lost as reported by the receiver (Q8).
    fraction_lost: u8,
    started: bool,
    max_seq: u16,
    max_packet_ts: u32,
    packets_sent: u64,
    bytes_sent: u64,
    rate: RateSamples,
}

impl SendStream {
    pub fn new(params: SendStreamParams) -> Self {
        Self {
            params,
            rtx: None,
            paused: false,
            // Perfect until the receiver reports otherwise.
            score: 10,
            fraction_lost: 0,
            started: false,
            max_seq: 0,
            max_packet_ts: 0,
            packets_sent: 0,
            bytes_sent: 0,
            rate: RateSamples::default(),
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.params.ssrc
    }

    pub fn payload_type(&self) -> u8 {
        self.params.payload_type
    }

    pub fn clock_rate(&self) -> u32 {
        self.params.clock_rate
    }

    pub fn spatial_layers(&self) -> u8 {
        self.params.spatial_layers
    }

    pub fn temporal_layers(&self) -> u8 {
        self.params.temporal_layers
    }

    pub fn params(&self) -> &SendStreamParams {
        &self.params
    }

    /// Associate the RTX payload type and SSRC advertised by the outgoing
    /// encoding.
    pub fn set_rtx(&mut self, payload_type: u8, ssrc: u32) {
        self.rtx = Some((payload_type, ssrc));
    }

    pub fn rtx(&self) -> Option<(u8, u32)> {
        self.rtx
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn score(&self) -> u8 {
        self.score
    }

    /// Force the score to a fixed value without notifying anyone.
    pub fn reset_score(&mut self, score: u8) {
        self.score = score;
    }

    pub fn set_fraction_lost(&mut self, fraction_lost: u8) {
        self.fraction_lost = fraction_lost;
    }

    /// Downstream loss as a percentage.
    pub fn loss_percentage(&self) -> f64 {
        self.fraction_lost as f64 * 100.0 / 256.0
    }

    /// Timestamp of the highest-sequence packet forwarded so far.
    pub fn max_packet_ts(&self) -> u32 {
        self.max_packet_ts
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Outgoing bitrate (bps) over the last second.
    pub fn transmission_rate(&mut self, now_ms: u64) -> u32 {
        self.rate.rate_bps(now_ms)
    }

    /// Record a rewritten packet about to be forwarded. Returns whether the
    /// stream accepted it.
    pub fn receive_packet(&mut self, packet: &RtpPacket, now_ms: u64) -> bool {
        if self.paused {
            return false;
        }

        let seq = packet.sequence_number();

        if !self.started {
            self.started = true;
            self.max_seq = seq;
            self.max_packet_ts = packet.timestamp();
        } else if is_seq_higher_than(seq as u32, self.max_seq as u32, u16::MAX as u32) {
            self.max_seq = seq;
            self.max_packet_ts = packet.timestamp();
        }

        self.packets_sent += 1;
        self.bytes_sent += packet.size() as u64;
        self.rate.update(now_ms, packet.size());

        true
    }
}
