//! Shared fixtures for consumer integration tests:
//! a scriptable upstream stream, a recording listener, and VP8 packet
//! builders.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc::UnboundedReceiver;

use rsfu_consumer_core::prelude::*;

/// An upstream stream whose health, bitrates and Sender Report are set by
/// the test script.
pub struct MockProducerStream {
    ssrc: u32,
    temporal_layers: u8,
    score: Cell<u8>,
    active_time_ms: Cell<u64>,
    /// Cumulative bitrate per temporal layer (bps); zero = inactive.
    bitrates: RefCell<Vec<u32>>,
    /// Per-layer bitrate (bps) reported for temporal upgrades.
    layer_bitrates: RefCell<Vec<u32>>,
    sender_report: Cell<Option<SenderReportInfo>>,
}

impl MockProducerStream {
    pub fn new(ssrc: u32, temporal_layers: u8) -> Arc<Self> {
        Arc::new(Self {
            ssrc,
            temporal_layers,
            score: Cell::new(8),
            active_time_ms: Cell::new(10_000),
            bitrates: RefCell::new(vec![0; temporal_layers as usize]),
            layer_bitrates: RefCell::new(vec![0; temporal_layers as usize]),
            sender_report: Cell::new(None),
        })
    }

    pub fn set_score(&self, score: u8) {
        self.score.set(score);
    }

    pub fn set_active_time_ms(&self, ms: u64) {
        self.active_time_ms.set(ms);
    }

    pub fn set_bitrates(&self, bitrates: Vec<u32>) {
        *self.bitrates.borrow_mut() = bitrates;
    }

    pub fn set_layer_bitrates(&self, bitrates: Vec<u32>) {
        *self.layer_bitrates.borrow_mut() = bitrates;
    }

    pub fn set_sender_report(&self, ntp_ms: u64, rtp_ts: u32) {
        self.sender_report
            .set(Some(SenderReportInfo { ntp_ms, rtp_ts }));
    }
}

impl ProducerRtpStream for MockProducerStream {
    fn ssrc(&self) -> u32 {
        self.ssrc
    }

    fn score(&self) -> u8 {
        self.score.get()
    }

    fn temporal_layers(&self) -> u8 {
        self.temporal_layers
    }

    fn active_time_ms(&self) -> u64 {
        self.active_time_ms.get()
    }

    fn bitrate(&self, _now_ms: u64, temporal_layer: u8) -> u32 {
        self.bitrates
            .borrow()
            .get(temporal_layer as usize)
            .copied()
            .unwrap_or(0)
    }

    fn layer_bitrate(&self, _now_ms: u64, temporal_layer: u8) -> u32 {
        self.layer_bitrates
            .borrow()
            .get(temporal_layer as usize)
            .copied()
            .unwrap_or(0)
    }

    fn sender_report(&self) -> Option<SenderReportInfo> {
        self.sender_report.get()
    }
}

/// A forwarded packet as seen by the transport.
#[derive(Debug, Clone)]
pub struct SentPacket {
    pub ssrc: u32,
    pub seq: u16,
    pub timestamp: u32,
    pub key_frame: bool,
}

/// Listener that records every downward callback.
#[derive(Default)]
pub struct RecordingListener {
    pub sent: Vec<SentPacket>,
    pub retransmitted: Vec<u16>,
    pub key_frame_requests: Vec<u32>,
    pub need_bitrate_change_count: u32,
}

impl ConsumerListener for RecordingListener {
    fn on_consumer_send_rtp_packet(&mut self, _consumer_id: &ConsumerId, packet: &RtpPacket) {
        self.sent.push(SentPacket {
            ssrc: packet.ssrc(),
            seq: packet.sequence_number(),
            timestamp: packet.timestamp(),
            key_frame: packet.is_key_frame(),
        });
    }

    fn on_consumer_retransmit_rtp_packet(
        &mut self,
        _consumer_id: &ConsumerId,
        packet: &RtpPacket,
    ) {
        self.retransmitted.push(packet.sequence_number());
    }

    fn on_consumer_key_frame_requested(&mut self, _consumer_id: &ConsumerId, mapped_ssrc: u32) {
        self.key_frame_requests.push(mapped_ssrc);
    }

    fn on_consumer_need_bitrate_change(&mut self, _consumer_id: &ConsumerId) {
        self.need_bitrate_change_count += 1;
    }
}

/// Upstream SSRCs by spatial layer.
pub const LAYER_SSRCS: [u32; 3] = [1000, 2000, 3000];

/// SSRC of the consumer's outgoing stream.
pub const OUT_SSRC: u32 = 5000;

pub const PAYLOAD_TYPE: u8 = 96;

fn consumable_encoding(ssrc: u32) -> RtpEncodingParameters {
    RtpEncodingParameters {
        ssrc,
        rtx: None,
        spatial_layers: 3,
        temporal_layers: 3,
        dtx: false,
    }
}

/// A three-layer VP8 consumer plus its event receiver.
pub fn video_consumer() -> (SimulcastConsumer, UnboundedReceiver<ConsumerEvent>) {
    let options = ConsumerOptions {
        consumable_rtp_encodings: LAYER_SSRCS.iter().map(|&s| consumable_encoding(s)).collect(),
        rtp_parameters: RtpParameters {
            codecs: vec![RtpCodecParameters {
                payload_type: PAYLOAD_TYPE,
                mime_type: MimeType::Vp8,
                clock_rate: 90000,
                rtcp_feedback: vec![RtcpFeedback::Nack, RtcpFeedback::NackPli],
            }],
            encodings: vec![RtpEncodingParameters {
                ssrc: OUT_SSRC,
                rtx: None,
                spatial_layers: 3,
                temporal_layers: 3,
                dtx: false,
            }],
            rtcp: RtcpParameters {
                cname: "test-consumer".to_string(),
            },
        },
        preferred_layers: None,
    };

    let (events, rx) = consumer_event_channel();
    let consumer = SimulcastConsumer::new(ConsumerId::new(), options, events)
        .expect("valid consumer options");

    (consumer, rx)
}

/// Build a VP8 payload with a full descriptor (15-bit PictureID, TL0PICIDX
/// and TID).
pub fn vp8_payload(picture_id: u16, tl0: u8, tid: u8, layer_sync: bool, key_frame: bool) -> Bytes {
    let mut data = Vec::new();

    // X=1, S=1, PartID=0
    data.push(0x90u8);
    // I=1, L=1, T=1
    data.push(0xE0u8);
    data.push(0x80 | ((picture_id >> 8) as u8 & 0x7F));
    data.push(picture_id as u8);
    data.push(tl0);
    let mut tid_byte = tid << 6;
    if layer_sync {
        tid_byte |= 0x20;
    }
    data.push(tid_byte);
    // First VP8 frame header octet: P bit clear marks a key frame.
    data.push(if key_frame { 0x00 } else { 0x01 });
    data.extend_from_slice(&[0xAB; 16]);

    Bytes::from(data)
}

/// A media packet on the given spatial layer.
pub fn media_packet(spatial_layer: usize, seq: u16, timestamp: u32, key_frame: bool) -> RtpPacket {
    media_packet_with_tid(spatial_layer, seq, timestamp, 0, key_frame)
}

/// A media packet on the given spatial layer and temporal layer.
pub fn media_packet_with_tid(
    spatial_layer: usize,
    seq: u16,
    timestamp: u32,
    tid: u8,
    key_frame: bool,
) -> RtpPacket {
    RtpPacket::new(
        LAYER_SSRCS[spatial_layer],
        seq,
        timestamp,
        PAYLOAD_TYPE,
        false,
        vp8_payload(seq & 0x7FFF, seq as u8, tid, key_frame, key_frame),
        FrameInfo {
            key_frame,
            temporal_layer: Some(tid),
            layer_sync: key_frame,
        },
    )
}

/// Assert outgoing sequence numbers are strictly monotonic modulo 2^16 and
/// timestamps non-decreasing modulo 2^32.
pub fn assert_monotonic_output(sent: &[SentPacket]) {
    for pair in sent.windows(2) {
        let seq_step = pair[1].seq.wrapping_sub(pair[0].seq);
        assert!(
            seq_step >= 1 && seq_step < 0x8000,
            "sequence numbers not strictly monotonic: {} then {}",
            pair[0].seq,
            pair[1].seq
        );

        let ts_step = pair[1].timestamp.wrapping_sub(pair[0].timestamp);
        assert!(
            ts_step < 0x8000_0000,
            "timestamps regressed: {} then {}",
            pair[0].timestamp,
            pair[1].timestamp
        );
    }
}
