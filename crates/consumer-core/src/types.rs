//! Shared types for the consumer engine

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Streams scoring at or above this are preferred during candidate
/// selection.
pub const STREAM_GOOD_SCORE: u8 = 5;

/// A stream must have been active this long before it is considered while a
/// better-established candidate exists.
pub const STREAM_MIN_ACTIVE_TIME_MS: u64 = 2000;

/// Outgoing stream score right after a spatial switch.
pub const SPATIAL_SWITCH_RESET_SCORE: u8 = 10;

/// Prune the timestamp extra-offset map after this many packets while any
/// non-zero extra offset is being applied.
pub const TS_EXTRA_OFFSET_ACTIVE_MAX_PACKETS: u32 = 200;

/// Prune the timestamp extra-offset map unconditionally after this many
/// packets.
pub const TS_EXTRA_OFFSET_MAX_PACKETS: u32 = 500;

/// Unique consumer identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConsumerId(String);

impl ConsumerId {
    /// Generate a fresh identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConsumerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConsumerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Media kind of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Codec MIME type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MimeType {
    Vp8,
    Vp9,
    H264,
    Opus,
    Pcmu,
    Pcma,
    Rtx,
}

impl MimeType {
    pub fn kind(&self) -> MediaKind {
        match self {
            MimeType::Vp8 | MimeType::Vp9 | MimeType::H264 | MimeType::Rtx => MediaKind::Video,
            MimeType::Opus | MimeType::Pcmu | MimeType::Pcma => MediaKind::Audio,
        }
    }

    /// Whether the codec can carry layered (simulcast/SVC) video.
    pub fn supports_simulcast(&self) -> bool {
        matches!(self, MimeType::Vp8 | MimeType::Vp9 | MimeType::H264)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MimeType::Vp8 => "video/VP8",
            MimeType::Vp9 => "video/VP9",
            MimeType::H264 => "video/H264",
            MimeType::Opus => "audio/opus",
            MimeType::Pcmu => "audio/PCMU",
            MimeType::Pcma => "audio/PCMA",
            MimeType::Rtx => "video/rtx",
        }
    }
}

impl fmt::Display for MimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// RTCP feedback capability advertised for a codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RtcpFeedback {
    Nack,
    NackPli,
    CcmFir,
    TransportCc,
    GoogRemb,
}

/// Negotiated codec parameters for the outgoing stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub payload_type: u8,
    pub mime_type: MimeType,
    pub clock_rate: u32,
    #[serde(default)]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

/// RTX parameters of an encoding.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RtxParameters {
    pub ssrc: u32,
}

/// One RTP encoding: a single outgoing encoding for the consumer, or one
/// consumable (upstream) simulcast encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpEncodingParameters {
    pub ssrc: u32,
    #[serde(default)]
    pub rtx: Option<RtxParameters>,
    /// Total number of spatial layers (simulcast streams) of the source.
    pub spatial_layers: u8,
    /// Temporal layers within each spatial layer.
    pub temporal_layers: u8,
    #[serde(default)]
    pub dtx: bool,
}

/// RTCP session parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RtcpParameters {
    #[serde(default)]
    pub cname: String,
}

/// Negotiated RTP parameters of the consumer's outgoing stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtpParameters {
    pub codecs: Vec<RtpCodecParameters>,
    pub encodings: Vec<RtpEncodingParameters>,
    #[serde(default)]
    pub rtcp: RtcpParameters,
}

impl RtpParameters {
    /// The media codec for the given encoding (first non-RTX codec).
    pub fn media_codec(&self) -> Option<&RtpCodecParameters> {
        self.codecs.iter().find(|c| c.mime_type != MimeType::Rtx)
    }

    /// The RTX codec, when negotiated.
    pub fn rtx_codec(&self) -> Option<&RtpCodecParameters> {
        self.codecs.iter().find(|c| c.mime_type == MimeType::Rtx)
    }
}

/// Receiver-requested ceiling on forwarded layers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreferredLayers {
    pub spatial_layer: u16,
    #[serde(default)]
    pub temporal_layer: Option<u16>,
}

/// The layers a consumer is currently forwarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerLayers {
    pub spatial_layer: i16,
    pub temporal_layer: i16,
}

/// Health summary of the outgoing stream and the upstream stream currently
/// feeding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerScore {
    /// Score of the outgoing RTP stream (0-10).
    pub score: u8,
    /// Score of the upstream stream behind the current spatial layer
    /// (0 when none is selected).
    pub producer_score: u8,
}

/// Construction input for a consumer.
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// The consumable upstream encodings, ordered by spatial layer.
    pub consumable_rtp_encodings: Vec<RtpEncodingParameters>,
    /// Negotiated parameters of the single outgoing stream.
    pub rtp_parameters: RtpParameters,
    /// Initial receiver preference; defaults to the maxima when absent.
    pub preferred_layers: Option<PreferredLayers>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mime_type_simulcast_capability() {
        assert!(MimeType::Vp8.supports_simulcast());
        assert!(MimeType::Vp9.supports_simulcast());
        assert!(!MimeType::Opus.supports_simulcast());
        assert!(!MimeType::Rtx.supports_simulcast());
    }

    #[test]
    fn test_consumer_layers_wire_format() {
        let layers = ConsumerLayers {
            spatial_layer: 2,
            temporal_layer: 1,
        };

        let json = serde_json::to_value(&layers).unwrap();
        assert_eq!(json["spatialLayer"], 2);
        assert_eq!(json["temporalLayer"], 1);
    }

    #[test]
    fn test_preferred_layers_temporal_is_optional() {
        let prefs: PreferredLayers = serde_json::from_str(r#"{"spatialLayer": 1}"#).unwrap();

        assert_eq!(prefs.spatial_layer, 1);
        assert!(prefs.temporal_layer.is_none());
    }

    #[test]
    fn test_media_codec_skips_rtx() {
        let params = RtpParameters {
            codecs: vec![
                RtpCodecParameters {
                    payload_type: 97,
                    mime_type: MimeType::Rtx,
                    clock_rate: 90000,
                    rtcp_feedback: vec![],
                },
                RtpCodecParameters {
                    payload_type: 96,
                    mime_type: MimeType::Vp8,
                    clock_rate: 90000,
                    rtcp_feedback: vec![RtcpFeedback::Nack],
                },
            ],
            encodings: vec![],
            rtcp: RtcpParameters::default(),
        };

        assert_eq!(params.media_codec().unwrap().payload_type, 96);
        assert_eq!(params.rtx_codec().unwrap().payload_type, 97);
    }
}
