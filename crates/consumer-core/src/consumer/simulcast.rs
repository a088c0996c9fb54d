//! Simulcast consumer
//!
//! Forwards exactly one of N upstream simulcast streams to a receiver,
//! switching spatial layers on key frames and temporal layers through the
//! codec encoding context. Sequence numbers and timestamps are rewritten so
//! the receiver sees a single continuous RTP stream; cross-layer timestamp
//! alignment relies on the upstream Sender Reports.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use rsfu_rtp_core::{now_ms, RtpPacket, SeqManager};

use crate::codecs::{encoding_context_for, EncodingContext, EncodingContextParams};
use crate::consumer::{Consumer, ConsumerDump, ConsumerKind, ConsumerListener, ConsumerRequest};
use crate::error::{Error, Result};
use crate::events::{ConsumerEvent, ConsumerEventSender};
use crate::streams::{ProducerRtpStream, SendStream, SendStreamParams};
use crate::types::{
    ConsumerId, ConsumerLayers, ConsumerOptions, ConsumerScore, MediaKind, PreferredLayers,
    RtpEncodingParameters, SPATIAL_SWITCH_RESET_SCORE, STREAM_GOOD_SCORE,
    STREAM_MIN_ACTIVE_TIME_MS, TS_EXTRA_OFFSET_ACTIVE_MAX_PACKETS, TS_EXTRA_OFFSET_MAX_PACKETS,
};

/// A consumer that selects among N>1 upstream simulcast streams.
pub struct SimulcastConsumer {
    id: ConsumerId,
    kind: MediaKind,
    consumable_rtp_encodings: Vec<RtpEncodingParameters>,
    /// Payload types this consumer can forward.
    supported_payload_types: HashSet<u8>,
    /// Mapped SSRC to spatial layer index. Built once, never mutated.
    ssrc_to_spatial_layer: HashMap<u32, i16>,
    /// Upstream streams by spatial layer; externally owned, read-only here.
    producer_rtp_streams: Vec<Option<Arc<dyn ProducerRtpStream>>>,
    /// The single outgoing stream, exclusively owned.
    rtp_stream: SendStream,
    encoding_context: Box<dyn EncodingContext>,
    events: ConsumerEventSender,

    paused: bool,
    producer_paused: bool,
    transport_connected: bool,
    externally_managed_bitrate: bool,

    preferred_spatial_layer: i16,
    preferred_temporal_layer: i16,
    target_spatial_layer: i16,
    target_temporal_layer: i16,
    current_spatial_layer: i16,
    provisional_target_spatial_layer: i16,
    provisional_target_temporal_layer: i16,
    /// First layer ever targeted; anchors cross-layer timestamp alignment.
    /// Never reassigned once set.
    ts_reference_spatial_layer: i16,

    rtp_seq_manager: SeqManager,
    /// Subtracted from every outgoing RTP timestamp.
    ts_offset: u32,
    /// Additional forward offsets keyed by input timestamp, applied when a
    /// layer switch would otherwise regress the output timestamp.
    ts_extra_offsets: HashMap<u32, u32>,
    ts_extra_offset_packet_count: u32,
    sync_required: bool,
}

impl SimulcastConsumer {
    pub fn new(
        id: ConsumerId,
        options: ConsumerOptions,
        events: ConsumerEventSender,
    ) -> Result<Self> {
        let ConsumerOptions {
            consumable_rtp_encodings,
            rtp_parameters,
            preferred_layers,
        } = options;

        if consumable_rtp_encodings.len() <= 1 {
            return Err(Error::config("invalid consumableRtpEncodings with size <= 1"));
        }

        let encoding = rtp_parameters
            .encodings
            .first()
            .ok_or_else(|| Error::config("missing encodings[0] in rtpParameters"))?
            .clone();

        if encoding.spatial_layers as usize != consumable_rtp_encodings.len() {
            return Err(Error::config(
                "spatialLayers does not match number of consumableRtpEncodings",
            ));
        }

        if consumable_rtp_encodings
            .iter()
            .any(|e| e.spatial_layers != encoding.spatial_layers)
        {
            return Err(Error::config(
                "consumableRtpEncodings disagree on spatialLayers",
            ));
        }

        let media_codec = rtp_parameters
            .media_codec()
            .ok_or_else(|| Error::config("missing media codec in rtpParameters"))?
            .clone();

        if !media_codec.mime_type.supports_simulcast() {
            return Err(Error::UnsupportedCodec {
                mime_type: media_codec.mime_type,
            });
        }

        let encoding_context = encoding_context_for(
            media_codec.mime_type,
            EncodingContextParams {
                spatial_layers: encoding.spatial_layers,
                temporal_layers: encoding.temporal_layers,
            },
        )
        .ok_or(Error::UnsupportedCodec {
            mime_type: media_codec.mime_type,
        })?;

        let mut ssrc_to_spatial_layer = HashMap::new();
        for (idx, consumable) in consumable_rtp_encodings.iter().enumerate() {
            ssrc_to_spatial_layer.insert(consumable.ssrc, idx as i16);
        }

        let max_spatial_layer = encoding.spatial_layers as i16 - 1;
        let max_temporal_layer = encoding.temporal_layers as i16 - 1;

        let (preferred_spatial_layer, preferred_temporal_layer) = match preferred_layers {
            Some(PreferredLayers {
                spatial_layer,
                temporal_layer,
            }) => (
                (spatial_layer as i16).min(max_spatial_layer),
                temporal_layer
                    .map(|t| (t as i16).min(max_temporal_layer))
                    .unwrap_or(max_temporal_layer),
            ),
            None => (max_spatial_layer, max_temporal_layer),
        };

        let supported_payload_types = rtp_parameters
            .codecs
            .iter()
            .filter(|c| c.mime_type == media_codec.mime_type)
            .map(|c| c.payload_type)
            .collect();

        let mut rtp_stream = SendStream::new(SendStreamParams::from_encoding(
            &encoding,
            &media_codec,
            &rtp_parameters.rtcp.cname,
        ));

        if let (Some(rtx_codec), Some(rtx)) = (rtp_parameters.rtx_codec(), encoding.rtx) {
            rtp_stream.set_rtx(rtx_codec.payload_type, rtx.ssrc);
        }

        let stream_count = consumable_rtp_encodings.len();

        Ok(Self {
            id,
            kind: media_codec.mime_type.kind(),
            consumable_rtp_encodings,
            supported_payload_types,
            ssrc_to_spatial_layer,
            producer_rtp_streams: (0..stream_count).map(|_| None).collect(),
            rtp_stream,
            encoding_context,
            events,
            paused: false,
            producer_paused: false,
            transport_connected: false,
            externally_managed_bitrate: false,
            preferred_spatial_layer,
            preferred_temporal_layer,
            target_spatial_layer: -1,
            target_temporal_layer: -1,
            current_spatial_layer: -1,
            provisional_target_spatial_layer: -1,
            provisional_target_temporal_layer: -1,
            ts_reference_spatial_layer: -1,
            rtp_seq_manager: SeqManager::new(16),
            ts_offset: 0,
            ts_extra_offsets: HashMap::new(),
            ts_extra_offset_packet_count: 0,
            sync_required: false,
        })
    }

    pub fn preferred_layers(&self) -> (i16, i16) {
        (self.preferred_spatial_layer, self.preferred_temporal_layer)
    }

    pub fn target_layers(&self) -> (i16, i16) {
        (self.target_spatial_layer, self.target_temporal_layer)
    }

    pub fn current_spatial_layer(&self) -> i16 {
        self.current_spatial_layer
    }

    pub fn ts_reference_spatial_layer(&self) -> i16 {
        self.ts_reference_spatial_layer
    }

    pub fn send_stream(&self) -> &SendStream {
        &self.rtp_stream
    }

    pub fn send_stream_mut(&mut self) -> &mut SendStream {
        &mut self.rtp_stream
    }

    /// Outgoing bitrate over the last second, or zero while inactive.
    pub fn transmission_rate(&mut self, now_ms: u64) -> u32 {
        if !self.is_active() {
            return 0;
        }

        self.rtp_stream.transmission_rate(now_ms)
    }

    /// Register the upstream stream behind `mapped_ssrc` without re-planning
    /// (used when attaching a consumer to already-known streams).
    pub fn on_producer_rtp_stream(
        &mut self,
        stream: Arc<dyn ProducerRtpStream>,
        mapped_ssrc: u32,
    ) {
        let spatial_layer = self.spatial_layer_for_ssrc(mapped_ssrc);

        self.producer_rtp_streams[spatial_layer as usize] = Some(stream);
    }

    /// A new upstream stream appeared; re-plan if active.
    pub fn on_producer_new_rtp_stream(
        &mut self,
        stream: Arc<dyn ProducerRtpStream>,
        mapped_ssrc: u32,
        listener: &mut dyn ConsumerListener,
    ) {
        let spatial_layer = self.spatial_layer_for_ssrc(mapped_ssrc);

        self.producer_rtp_streams[spatial_layer as usize] = Some(stream);

        if self.is_active() {
            self.may_change_layers(false, listener);
        }
    }

    /// An upstream stream's health score changed.
    pub fn on_producer_rtp_stream_score(
        &mut self,
        stream: &Arc<dyn ProducerRtpStream>,
        score: u8,
        previous_score: u8,
        listener: &mut dyn ConsumerListener,
    ) {
        // Only the stream currently being forwarded is score-visible
        // downstream.
        let is_current = self
            .producer_current_rtp_stream()
            .is_some_and(|current| Arc::ptr_eq(current, stream));

        if is_current {
            self.emit_score();
        }

        if self.is_active() {
            // When bitrate is externally managed, only a death or rebirth
            // justifies bothering the allocator.
            if !self.externally_managed_bitrate || score == 0 || previous_score == 0 {
                self.may_change_layers(false, listener);
            }
        }
    }

    /// A Sender Report arrived on an upstream stream. Only the first one per
    /// stream can unlock new switch targets.
    pub fn on_producer_rtcp_sender_report(
        &mut self,
        stream: &Arc<dyn ProducerRtpStream>,
        first: bool,
        listener: &mut dyn ConsumerListener,
    ) {
        if !first {
            return;
        }

        info!(ssrc = stream.ssrc(), "first Sender Report received");

        // If the stream we are forwarding has no Sender Report yet, no
        // switch can be validated.
        let current_has_sr = self
            .producer_current_rtp_stream()
            .is_some_and(|s| s.sender_report().is_some());

        if !current_has_sr {
            return;
        }

        if self.is_active() {
            self.may_change_layers(false, listener);
        }
    }

    /// Planning priority for the external allocator: the highest viable
    /// spatial layer plus one, never exceeding the preference when a layer
    /// at or below it is viable. Returns 1 with no viable layer at all, so
    /// the allocator still calls [`SimulcastConsumer::use_available_bitrate`]
    /// and the consumer can transition to the no-target state.
    pub fn get_bitrate_priority(&self) -> u16 {
        assert!(
            self.externally_managed_bitrate,
            "bitrate is not externally managed"
        );

        if !self.is_active() {
            return 0;
        }

        let mut priority_spatial_layer: i16 = -1;

        for (s_idx, entry) in self.producer_rtp_streams.iter().enumerate() {
            let spatial_layer = s_idx as i16;

            // Do not choose a layer above the preferred one once a layer at
            // or below it is viable.
            if spatial_layer > self.preferred_spatial_layer && priority_spatial_layer != -1 {
                break;
            }

            let Some(stream) = entry else {
                continue;
            };

            if stream.score() == 0 {
                continue;
            }

            priority_spatial_layer = spatial_layer;
        }

        if priority_spatial_layer == -1 {
            return 1;
        }

        (priority_spatial_layer + 1) as u16
    }

    /// Plan the largest (spatial, temporal) pair fitting within `bitrate`
    /// and store it as the provisional target. Returns the bitrate consumed.
    pub fn use_available_bitrate(&mut self, bitrate: u32, consider_loss: bool) -> u32 {
        assert!(
            self.externally_managed_bitrate,
            "bitrate is not externally managed"
        );

        self.provisional_target_spatial_layer = -1;
        self.provisional_target_temporal_layer = -1;

        if !self.is_active() {
            return 0;
        }

        let virtual_bitrate = self.virtual_bitrate(bitrate, consider_loss);

        let mut used_bitrate = 0u32;
        let mut max_producer_score = 0u8;
        let now = now_ms();

        'spatial: for s_idx in 0..self.producer_rtp_streams.len() {
            let spatial_layer = s_idx as i16;
            let Some(stream) = self.producer_rtp_streams[s_idx].clone() else {
                continue;
            };
            let producer_score = stream.score();

            if producer_score == 0 {
                continue;
            }

            // A stream that just came to life must prove itself before it
            // may displace an established choice.
            if used_bitrate > 0 && stream.active_time_ms() < STREAM_MIN_ACTIVE_TIME_MS {
                continue;
            }

            if !self.can_switch_to_spatial_layer(spatial_layer) {
                continue;
            }

            if producer_score < max_producer_score && producer_score < STREAM_GOOD_SCORE {
                continue;
            }

            max_producer_score = producer_score;

            for temporal_layer in 0..stream.temporal_layers() {
                let required_bitrate = stream.bitrate(now, temporal_layer);

                debug!(
                    spatial_layer,
                    temporal_layer, virtual_bitrate, required_bitrate, "testing layers"
                );

                // Inactive temporal layer: move to the next spatial layer.
                if required_bitrate == 0 {
                    break;
                }

                // Above budget: keep the previously chosen layers, if any.
                if required_bitrate > virtual_bitrate {
                    break 'spatial;
                }

                self.provisional_target_spatial_layer = spatial_layer;
                self.provisional_target_temporal_layer = temporal_layer as i16;
                used_bitrate = required_bitrate;

                if self.provisional_target_spatial_layer == self.preferred_spatial_layer
                    && self.provisional_target_temporal_layer == self.preferred_temporal_layer
                    && producer_score >= STREAM_GOOD_SCORE
                {
                    break 'spatial;
                }
            }

            if self.provisional_target_spatial_layer >= self.preferred_spatial_layer
                && producer_score >= STREAM_GOOD_SCORE
            {
                break;
            }
        }

        debug!(
            spatial_layer = self.provisional_target_spatial_layer,
            temporal_layer = self.provisional_target_temporal_layer,
            bitrate,
            virtual_bitrate,
            used_bitrate,
            consumer_id = %self.id,
            "choosing layers"
        );

        // Recompute the consumed bitrate relative to the real budget.
        if used_bitrate <= bitrate {
            used_bitrate
        } else if used_bitrate <= virtual_bitrate {
            bitrate
        } else {
            used_bitrate
        }
    }

    /// Try to bump the provisional temporal layer by one. Returns the
    /// additional bitrate that buys, or zero.
    pub fn increase_temporal_layer(&mut self, bitrate: u32, consider_loss: bool) -> u32 {
        assert!(
            self.externally_managed_bitrate,
            "bitrate is not externally managed"
        );

        if !self.is_active() {
            return 0;
        }

        if self.provisional_target_spatial_layer == -1 {
            return 0;
        }

        // Already at the preferred layers.
        if self.provisional_target_spatial_layer == self.preferred_spatial_layer
            && self.provisional_target_temporal_layer == self.preferred_temporal_layer
        {
            return 0;
        }

        let virtual_bitrate = self.virtual_bitrate(bitrate, consider_loss);

        let Some(stream) = self.producer_provisional_target_rtp_stream().cloned() else {
            panic!("no producer stream for the provisional target layer");
        };

        let now = now_ms();
        let mut required_bitrate = 0u32;
        let mut temporal_layer = self.provisional_target_temporal_layer + 1;

        while temporal_layer < stream.temporal_layers() as i16 {
            // Never exceed the preferred temporal layer once at or above the
            // preferred spatial one.
            if self.provisional_target_spatial_layer >= self.preferred_spatial_layer
                && temporal_layer > self.preferred_temporal_layer
            {
                break;
            }

            required_bitrate = stream.layer_bitrate(now, temporal_layer as u8);

            // First active layer ends the walk.
            if required_bitrate != 0 {
                break;
            }

            temporal_layer += 1;
        }

        // No higher active layer.
        if required_bitrate == 0 {
            return 0;
        }

        // No luck.
        if required_bitrate > virtual_bitrate {
            return 0;
        }

        self.provisional_target_temporal_layer = temporal_layer;

        debug!(
            spatial_layer = self.provisional_target_spatial_layer,
            temporal_layer = self.provisional_target_temporal_layer,
            virtual_bitrate,
            required_bitrate,
            "upgrading temporal layer"
        );

        if required_bitrate <= bitrate {
            required_bitrate
        } else if required_bitrate <= virtual_bitrate {
            bitrate
        } else {
            required_bitrate // NOTE: This cannot happen.
        }
    }

    /// Commit the provisional layers chosen during the allocation round.
    pub fn apply_layers(&mut self, listener: &mut dyn ConsumerListener) {
        assert!(
            self.externally_managed_bitrate,
            "bitrate is not externally managed"
        );

        let provisional_target_spatial_layer = self.provisional_target_spatial_layer;
        let provisional_target_temporal_layer = self.provisional_target_temporal_layer;

        self.provisional_target_spatial_layer = -1;
        self.provisional_target_temporal_layer = -1;

        if !self.is_active() {
            return;
        }

        if provisional_target_spatial_layer != self.target_spatial_layer
            || provisional_target_temporal_layer != self.target_temporal_layer
        {
            self.update_target_layers(
                provisional_target_spatial_layer,
                provisional_target_temporal_layer,
                listener,
            );
        }
    }

    /// What this consumer would like to receive if bandwidth were no
    /// object. Mutates nothing.
    pub fn get_desired_bitrate(&self) -> u32 {
        assert!(
            self.externally_managed_bitrate,
            "bitrate is not externally managed"
        );

        if !self.is_active() {
            return 0;
        }

        let mut desired_spatial_layer: i16 = -1;
        let mut desired_temporal_layer: i16 = -1;
        let mut desired_bitrate = 0u32;
        let mut max_producer_score = 0u8;
        let now = now_ms();

        'spatial: for s_idx in 0..self.producer_rtp_streams.len() {
            let spatial_layer = s_idx as i16;
            let Some(stream) = self.producer_rtp_streams[s_idx].as_ref() else {
                continue;
            };
            let producer_score = stream.score();

            if producer_score == 0 {
                continue;
            }

            if desired_bitrate > 0 && stream.active_time_ms() < STREAM_MIN_ACTIVE_TIME_MS {
                continue;
            }

            if !self.can_switch_to_spatial_layer(spatial_layer) {
                continue;
            }

            if producer_score < max_producer_score && producer_score < STREAM_GOOD_SCORE {
                continue;
            }

            max_producer_score = producer_score;

            for temporal_layer in 0..stream.temporal_layers() {
                let bitrate = stream.bitrate(now, temporal_layer);

                if bitrate == 0 {
                    break;
                }

                desired_spatial_layer = spatial_layer;
                desired_temporal_layer = temporal_layer as i16;
                desired_bitrate = bitrate;

                if desired_spatial_layer == self.preferred_spatial_layer
                    && desired_temporal_layer == self.preferred_temporal_layer
                    && producer_score >= STREAM_GOOD_SCORE
                {
                    break 'spatial;
                }
            }

            if desired_spatial_layer >= self.preferred_spatial_layer
                && producer_score >= STREAM_GOOD_SCORE
            {
                break;
            }
        }

        if desired_spatial_layer == -1 {
            return 0;
        }

        debug!(
            current_spatial_layer = self.current_spatial_layer,
            current_temporal_layer = self.encoding_context.current_temporal_layer(),
            desired_spatial_layer,
            desired_temporal_layer,
            desired_bitrate,
            consumer_id = %self.id,
            "desired bitrate"
        );

        desired_bitrate
    }

    fn virtual_bitrate(&self, bitrate: u32, consider_loss: bool) -> u32 {
        if !consider_loss {
            return bitrate;
        }

        // Probe beyond the estimate under low loss; back off under heavy
        // loss.
        let loss_percentage = self.rtp_stream.loss_percentage();

        if loss_percentage < 2.0 {
            (1.08 * bitrate as f64) as u32
        } else if loss_percentage > 10.0 {
            ((1.0 - 0.5 * (loss_percentage / 100.0)) * bitrate as f64) as u32
        } else {
            bitrate
        }
    }

    fn may_change_layers(&mut self, force: bool, listener: &mut dyn ConsumerListener) {
        let (new_target_spatial_layer, new_target_temporal_layer, changed) =
            self.recalculate_target_layers();

        if !changed {
            return;
        }

        if self.externally_managed_bitrate {
            // The allocator owns the temporal target; only a spatial change
            // (or an explicit force) warrants a re-plan.
            if new_target_spatial_layer != self.target_spatial_layer || force {
                listener.on_consumer_need_bitrate_change(&self.id);
            }
        } else {
            self.update_target_layers(
                new_target_spatial_layer,
                new_target_temporal_layer,
                listener,
            );
        }
    }

    fn recalculate_target_layers(&self) -> (i16, i16, bool) {
        let mut new_target_spatial_layer: i16 = -1;
        let mut new_target_temporal_layer: i16 = -1;
        let mut max_producer_score = 0u8;

        for s_idx in 0..self.producer_rtp_streams.len() {
            let spatial_layer = s_idx as i16;
            let Some(stream) = self.producer_rtp_streams[s_idx].as_ref() else {
                continue;
            };
            let producer_score = stream.score();

            if producer_score == 0 {
                continue;
            }

            // Require a minimum active time only when an allocator is in
            // charge and a candidate already exists.
            if self.externally_managed_bitrate
                && new_target_spatial_layer != -1
                && stream.active_time_ms() < STREAM_MIN_ACTIVE_TIME_MS
            {
                continue;
            }

            if !self.can_switch_to_spatial_layer(spatial_layer) {
                continue;
            }

            if producer_score < max_producer_score && producer_score < STREAM_GOOD_SCORE {
                continue;
            }

            new_target_spatial_layer = spatial_layer;
            max_producer_score = producer_score;

            if spatial_layer >= self.preferred_spatial_layer && producer_score >= STREAM_GOOD_SCORE
            {
                break;
            }
        }

        if new_target_spatial_layer != -1 {
            new_target_temporal_layer = if new_target_spatial_layer == self.preferred_spatial_layer
            {
                self.preferred_temporal_layer
            } else if new_target_spatial_layer < self.preferred_spatial_layer {
                // Reduced spatial: give the receiver the richest temporal.
                self.rtp_stream.temporal_layers() as i16 - 1
            } else {
                // Above preference on spatial: minimize temporal.
                0
            };
        }

        let changed = new_target_spatial_layer != self.target_spatial_layer
            || new_target_temporal_layer != self.target_temporal_layer;

        (new_target_spatial_layer, new_target_temporal_layer, changed)
    }

    fn update_target_layers(
        &mut self,
        new_target_spatial_layer: i16,
        new_target_temporal_layer: i16,
        listener: &mut dyn ConsumerListener,
    ) {
        // The first layer ever targeted becomes the timestamp reference,
        // permanently.
        if new_target_spatial_layer != -1 && self.ts_reference_spatial_layer == -1 {
            info!(
                spatial_layer = new_target_spatial_layer,
                "using spatial layer as RTP timestamp reference"
            );

            self.ts_reference_spatial_layer = new_target_spatial_layer;
        }

        if new_target_spatial_layer == -1 {
            self.target_spatial_layer = -1;
            self.target_temporal_layer = -1;
            self.current_spatial_layer = -1;

            self.encoding_context.set_target_temporal_layer(-1);
            self.encoding_context.set_current_temporal_layer(-1);

            debug!(consumer_id = %self.id, "target layers unset");

            self.emit_layers_change();

            return;
        }

        self.target_spatial_layer = new_target_spatial_layer;
        self.target_temporal_layer = new_target_temporal_layer;

        // Temporal switches within the current spatial layer need no key
        // frame.
        if self.target_spatial_layer == self.current_spatial_layer {
            self.encoding_context
                .set_target_temporal_layer(self.target_temporal_layer);
        }

        debug!(
            spatial_layer = self.target_spatial_layer,
            temporal_layer = self.target_temporal_layer,
            consumer_id = %self.id,
            "target layers changed"
        );

        if self.target_spatial_layer != self.current_spatial_layer {
            self.request_key_frame_for_target_spatial_layer(listener);
        }
    }

    /// Whether a switch to `spatial_layer` can be validated: it is (or will
    /// become) the timestamp reference, or both it and the reference have
    /// Sender Reports.
    fn can_switch_to_spatial_layer(&self, spatial_layer: i16) -> bool {
        if self.ts_reference_spatial_layer == -1
            || spatial_layer == self.ts_reference_spatial_layer
        {
            return true;
        }

        let reference_has_sr = self
            .producer_ts_reference_rtp_stream()
            .is_some_and(|s| s.sender_report().is_some());
        let candidate_has_sr = self.producer_rtp_streams[spatial_layer as usize]
            .as_ref()
            .is_some_and(|s| s.sender_report().is_some());

        reference_has_sr && candidate_has_sr
    }

    fn request_key_frames(&mut self, listener: &mut dyn ConsumerListener) {
        if self.kind != MediaKind::Video {
            return;
        }

        let target_exists = self.producer_target_rtp_stream().is_some();
        let current_exists = self.producer_current_rtp_stream().is_some();

        if target_exists {
            let mapped_ssrc =
                self.consumable_rtp_encodings[self.target_spatial_layer as usize].ssrc;

            listener.on_consumer_key_frame_requested(&self.id, mapped_ssrc);
        }

        if current_exists && self.current_spatial_layer != self.target_spatial_layer {
            let mapped_ssrc =
                self.consumable_rtp_encodings[self.current_spatial_layer as usize].ssrc;

            listener.on_consumer_key_frame_requested(&self.id, mapped_ssrc);
        }
    }

    fn request_key_frame_for_target_spatial_layer(&mut self, listener: &mut dyn ConsumerListener) {
        if self.kind != MediaKind::Video {
            return;
        }

        if self.producer_target_rtp_stream().is_none() {
            return;
        }

        let mapped_ssrc = self.consumable_rtp_encodings[self.target_spatial_layer as usize].ssrc;

        listener.on_consumer_key_frame_requested(&self.id, mapped_ssrc);
    }

    fn request_key_frame_for_current_spatial_layer(
        &mut self,
        listener: &mut dyn ConsumerListener,
    ) {
        if self.kind != MediaKind::Video {
            return;
        }

        if self.producer_current_rtp_stream().is_none() {
            return;
        }

        let mapped_ssrc = self.consumable_rtp_encodings[self.current_spatial_layer as usize].ssrc;

        listener.on_consumer_key_frame_requested(&self.id, mapped_ssrc);
    }

    /// Health snapshot: the outgoing stream's score plus the score of the
    /// upstream stream currently being forwarded (0 when none).
    pub fn score(&self) -> ConsumerScore {
        ConsumerScore {
            score: self.rtp_stream.score(),
            producer_score: self
                .producer_current_rtp_stream()
                .map(|s| s.score())
                .unwrap_or(0),
        }
    }

    fn emit_score(&self) {
        self.events.send(ConsumerEvent::Score(self.score()));
    }

    fn emit_layers_change(&self) {
        let layers = if self.current_spatial_layer >= 0 {
            Some(ConsumerLayers {
                spatial_layer: self.current_spatial_layer,
                temporal_layer: self.encoding_context.current_temporal_layer(),
            })
        } else {
            None
        };

        debug!(?layers, consumer_id = %self.id, "current layers changed");

        self.events.send(ConsumerEvent::LayersChange(layers));
    }

    fn spatial_layer_for_ssrc(&self, mapped_ssrc: u32) -> i16 {
        let Some(&spatial_layer) = self.ssrc_to_spatial_layer.get(&mapped_ssrc) else {
            panic!("unknown mapped SSRC {mapped_ssrc}");
        };

        spatial_layer
    }

    fn producer_current_rtp_stream(&self) -> Option<&Arc<dyn ProducerRtpStream>> {
        if self.current_spatial_layer == -1 {
            return None;
        }

        self.producer_rtp_streams[self.current_spatial_layer as usize].as_ref()
    }

    fn producer_target_rtp_stream(&self) -> Option<&Arc<dyn ProducerRtpStream>> {
        if self.target_spatial_layer == -1 {
            return None;
        }

        self.producer_rtp_streams[self.target_spatial_layer as usize].as_ref()
    }

    fn producer_provisional_target_rtp_stream(&self) -> Option<&Arc<dyn ProducerRtpStream>> {
        if self.provisional_target_spatial_layer == -1 {
            return None;
        }

        self.producer_rtp_streams[self.provisional_target_spatial_layer as usize].as_ref()
    }

    fn producer_ts_reference_rtp_stream(&self) -> Option<&Arc<dyn ProducerRtpStream>> {
        if self.ts_reference_spatial_layer == -1 {
            return None;
        }

        self.producer_rtp_streams[self.ts_reference_spatial_layer as usize].as_ref()
    }

    fn user_on_transport_connected(&mut self, listener: &mut dyn ConsumerListener) {
        self.sync_required = true;
        self.rtp_stream.resume();

        if self.is_active() {
            self.may_change_layers(false, listener);
        }
    }

    fn user_on_transport_disconnected(&mut self, listener: &mut dyn ConsumerListener) {
        self.rtp_stream.pause();

        self.update_target_layers(-1, -1, listener);

        if self.externally_managed_bitrate {
            listener.on_consumer_need_bitrate_change(&self.id);
        }
    }

    fn user_on_paused(&mut self, listener: &mut dyn ConsumerListener) {
        self.rtp_stream.pause();

        self.update_target_layers(-1, -1, listener);

        // Let the transport hand our bitrate to other consumers.
        if self.externally_managed_bitrate {
            listener.on_consumer_need_bitrate_change(&self.id);
        }
    }

    fn user_on_resumed(&mut self, listener: &mut dyn ConsumerListener) {
        self.sync_required = true;
        self.rtp_stream.resume();

        if self.is_active() {
            self.may_change_layers(false, listener);
        }
    }
}

impl Consumer for SimulcastConsumer {
    fn id(&self) -> &ConsumerId {
        &self.id
    }

    fn consumer_kind(&self) -> ConsumerKind {
        ConsumerKind::Simulcast
    }

    fn media_kind(&self) -> MediaKind {
        self.kind
    }

    fn is_active(&self) -> bool {
        self.transport_connected && !self.paused && !self.producer_paused
    }

    fn is_paused(&self) -> bool {
        self.paused
    }

    fn dump(&self) -> ConsumerDump {
        ConsumerDump {
            id: self.id.to_string(),
            kind: ConsumerKind::Simulcast,
            paused: self.paused,
            producer_paused: self.producer_paused,
            preferred_spatial_layer: self.preferred_spatial_layer,
            preferred_temporal_layer: self.preferred_temporal_layer,
            target_spatial_layer: self.target_spatial_layer,
            target_temporal_layer: self.target_temporal_layer,
            current_spatial_layer: self.current_spatial_layer,
            current_temporal_layer: self.encoding_context.current_temporal_layer(),
            score: self.score(),
        }
    }

    fn set_externally_managed_bitrate(&mut self) {
        self.externally_managed_bitrate = true;
    }

    fn handle_request(
        &mut self,
        request: ConsumerRequest,
        listener: &mut dyn ConsumerListener,
    ) -> Result<()> {
        match request {
            ConsumerRequest::RequestKeyFrame => {
                if self.is_active() {
                    self.request_key_frames(listener);
                }

                Ok(())
            }

            ConsumerRequest::SetPreferredLayers(data) => {
                let previous_preferred_spatial_layer = self.preferred_spatial_layer;
                let previous_preferred_temporal_layer = self.preferred_temporal_layer;

                let preferred: PreferredLayers = serde_json::from_value(data)
                    .map_err(|e| Error::request(format!("invalid preferredLayers: {e}")))?;

                let max_spatial_layer = self.rtp_stream.spatial_layers() as i16 - 1;
                let max_temporal_layer = self.rtp_stream.temporal_layers() as i16 - 1;

                self.preferred_spatial_layer =
                    (preferred.spatial_layer as i16).min(max_spatial_layer);
                self.preferred_temporal_layer = preferred
                    .temporal_layer
                    .map(|t| (t as i16).min(max_temporal_layer))
                    .unwrap_or(max_temporal_layer);

                debug!(
                    spatial_layer = self.preferred_spatial_layer,
                    temporal_layer = self.preferred_temporal_layer,
                    consumer_id = %self.id,
                    "preferred layers changed"
                );

                if self.is_active()
                    && (self.preferred_spatial_layer != previous_preferred_spatial_layer
                        || self.preferred_temporal_layer != previous_preferred_temporal_layer)
                {
                    self.may_change_layers(true, listener);
                }

                Ok(())
            }
        }
    }

    fn transport_connected(&mut self, listener: &mut dyn ConsumerListener) {
        self.transport_connected = true;

        self.user_on_transport_connected(listener);
    }

    fn transport_disconnected(&mut self, listener: &mut dyn ConsumerListener) {
        self.transport_connected = false;

        self.user_on_transport_disconnected(listener);
    }

    fn pause(&mut self, listener: &mut dyn ConsumerListener) {
        if self.paused {
            return;
        }

        self.paused = true;

        if self.transport_connected {
            self.user_on_paused(listener);
        }
    }

    fn resume(&mut self, listener: &mut dyn ConsumerListener) {
        if !self.paused {
            return;
        }

        self.paused = false;

        if self.transport_connected {
            self.user_on_resumed(listener);
        }
    }

    fn producer_pause(&mut self, listener: &mut dyn ConsumerListener) {
        if self.producer_paused {
            return;
        }

        self.producer_paused = true;

        if self.transport_connected {
            self.user_on_paused(listener);
        }
    }

    fn producer_resume(&mut self, listener: &mut dyn ConsumerListener) {
        if !self.producer_paused {
            return;
        }

        self.producer_paused = false;

        if self.transport_connected {
            self.user_on_resumed(listener);
        }
    }

    fn send_rtp_packet(&mut self, packet: &mut RtpPacket, listener: &mut dyn ConsumerListener) {
        if !self.is_active() {
            return;
        }

        if self.target_temporal_layer == -1 {
            return;
        }

        // The producer may carry codecs this consumer did not negotiate.
        if !self.supported_payload_types.contains(&packet.payload_type()) {
            debug!(
                payload_type = packet.payload_type(),
                "payload type not supported"
            );

            return;
        }

        let spatial_layer = self.spatial_layer_for_ssrc(packet.ssrc());

        // Waiting for a key frame on the target layer in order to switch.
        if self.current_spatial_layer != self.target_spatial_layer
            && spatial_layer == self.target_spatial_layer
        {
            if !packet.is_key_frame() {
                return;
            }

            self.current_spatial_layer = self.target_spatial_layer;

            self.encoding_context
                .set_target_temporal_layer(self.target_temporal_layer);
            self.encoding_context
                .set_current_temporal_layer(packet.temporal_layer() as i16);

            // Fresh stream, fresh score.
            self.rtp_stream.reset_score(SPATIAL_SWITCH_RESET_SCORE);

            self.emit_layers_change();
            self.emit_score();

            self.sync_required = true;
        }

        // Packets of unselected layers are dropped.
        if spatial_layer != self.current_spatial_layer {
            return;
        }

        // While resyncing, only a key frame may restart the stream.
        if self.sync_required && !packet.is_key_frame() {
            return;
        }

        let is_sync_packet = self.sync_required;

        if is_sync_packet {
            debug!(
                seq = packet.sequence_number(),
                ts = packet.timestamp(),
                "sync key frame received"
            );

            self.rtp_seq_manager
                .sync(packet.sequence_number().wrapping_sub(1) as u32);

            if spatial_layer == self.ts_reference_spatial_layer {
                self.ts_offset = 0;
            } else {
                // Cross-layer switch: align clocks through the Sender
                // Reports of the reference and current streams. The switch
                // eligibility gate guarantees both exist.
                let Some(reference_sr) = self
                    .producer_ts_reference_rtp_stream()
                    .and_then(|s| s.sender_report())
                else {
                    panic!("no Sender Report for the timestamp reference stream");
                };
                let Some(current_sr) = self
                    .producer_current_rtp_stream()
                    .and_then(|s| s.sender_report())
                else {
                    panic!("no Sender Report for the current stream");
                };

                let diff_ms = current_sr.ntp_ms as i64 - reference_sr.ntp_ms as i64;
                let diff_ts = diff_ms * self.rtp_stream.clock_rate() as i64 / 1000;
                let new_ts = current_sr.rtp_ts.wrapping_sub(diff_ts as u32);

                self.ts_offset = new_ts.wrapping_sub(reference_sr.rtp_ts);
            }

            self.ts_extra_offsets.clear();
            self.ts_extra_offset_packet_count = 0;

            // The new stream's key frame may carry a timestamp at or below
            // the last one sent; force monotonicity with an extra offset.
            if packet.timestamp().wrapping_sub(self.ts_offset) <= self.rtp_stream.max_packet_ts() {
                let ts_extra_offset = self
                    .rtp_stream
                    .max_packet_ts()
                    .wrapping_sub(packet.timestamp())
                    .wrapping_add(self.ts_offset)
                    .wrapping_add(1);

                self.ts_extra_offsets.insert(packet.timestamp(), ts_extra_offset);

                warn!(
                    ts_in = packet.timestamp(),
                    ts_out = packet.timestamp().wrapping_sub(self.ts_offset),
                    ts_max_out = self.rtp_stream.max_packet_ts(),
                    ts_offset = self.ts_offset,
                    "ts extra offset needed"
                );
            }

            self.encoding_context.mark_sync_required();

            self.sync_required = false;
        }

        let previous_temporal_layer = self.encoding_context.current_temporal_layer();

        // Rewrite the payload; the codec may reject the whole packet.
        if !self.encoding_context.process_payload(packet) {
            self.rtp_seq_manager
                .drop_input(packet.sequence_number() as u32);

            return;
        }

        if previous_temporal_layer != self.encoding_context.current_temporal_layer() {
            self.emit_layers_change();
        }

        let Some(seq) = self.rtp_seq_manager.input(packet.sequence_number() as u32) else {
            packet.restore_payload();

            return;
        };
        let seq = seq as u16;

        let mut timestamp = packet.timestamp().wrapping_sub(self.ts_offset);

        if !self.ts_extra_offsets.is_empty() {
            let mut ts_extra_offset = 0u32;

            if let Some(&offset) = self.ts_extra_offsets.get(&packet.timestamp()) {
                ts_extra_offset = offset;

                debug!(
                    ts_in = packet.timestamp(),
                    ts_out = timestamp,
                    ts_extra_offset,
                    "ts extra offset mapping found"
                );
            } else if timestamp < self.rtp_stream.max_packet_ts() {
                ts_extra_offset = self
                    .rtp_stream
                    .max_packet_ts()
                    .wrapping_sub(timestamp)
                    .wrapping_add(1);

                self.ts_extra_offsets.insert(packet.timestamp(), ts_extra_offset);

                debug!(
                    ts_in = packet.timestamp(),
                    ts_out = timestamp,
                    ts_extra_offset,
                    "ts extra offset generated"
                );
            }

            timestamp = timestamp.wrapping_add(ts_extra_offset);

            if ts_extra_offset != 0 {
                self.ts_extra_offset_packet_count += 1;
            }

            if (ts_extra_offset != 0
                && self.ts_extra_offset_packet_count > TS_EXTRA_OFFSET_ACTIVE_MAX_PACKETS)
                || self.ts_extra_offset_packet_count > TS_EXTRA_OFFSET_MAX_PACKETS
            {
                debug!("clearing ts extra offset map");

                self.ts_extra_offsets.clear();
                self.ts_extra_offset_packet_count = 0;
            }
        }

        let orig_ssrc = packet.ssrc();
        let orig_seq = packet.sequence_number();
        let orig_timestamp = packet.timestamp();

        packet.set_ssrc(self.rtp_stream.ssrc());
        packet.set_sequence_number(seq);
        packet.set_timestamp(timestamp);

        if is_sync_packet {
            debug!(
                ssrc = packet.ssrc(),
                seq = packet.sequence_number(),
                ts = packet.timestamp(),
                orig_ssrc,
                orig_seq,
                orig_timestamp,
                "sending sync packet"
            );
        }

        if self.rtp_stream.receive_packet(packet, now_ms()) {
            listener.on_consumer_send_rtp_packet(&self.id, packet);
        } else {
            warn!(
                ssrc = packet.ssrc(),
                seq = packet.sequence_number(),
                ts = packet.timestamp(),
                orig_ssrc,
                orig_seq,
                orig_timestamp,
                "failed to send packet"
            );
        }

        // Leave the packet as we found it; other consumers may get it next.
        packet.set_ssrc(orig_ssrc);
        packet.set_sequence_number(orig_seq);
        packet.set_timestamp(orig_timestamp);
        packet.restore_payload();
    }

    fn receive_key_frame_request(&mut self, listener: &mut dyn ConsumerListener) {
        if self.is_active() {
            self.request_key_frame_for_current_spatial_layer(listener);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::events::consumer_event_channel;
    use crate::types::{
        MimeType, RtcpFeedback, RtcpParameters, RtpCodecParameters, RtpParameters, RtxParameters,
    };

    use super::*;

    fn encoding(ssrc: u32) -> RtpEncodingParameters {
        RtpEncodingParameters {
            ssrc,
            rtx: None,
            spatial_layers: 3,
            temporal_layers: 3,
            dtx: false,
        }
    }

    fn options() -> ConsumerOptions {
        ConsumerOptions {
            consumable_rtp_encodings: vec![encoding(1000), encoding(2000), encoding(3000)],
            rtp_parameters: RtpParameters {
                codecs: vec![RtpCodecParameters {
                    payload_type: 96,
                    mime_type: MimeType::Vp8,
                    clock_rate: 90000,
                    rtcp_feedback: vec![RtcpFeedback::Nack, RtcpFeedback::NackPli],
                }],
                encodings: vec![RtpEncodingParameters {
                    ssrc: 5000,
                    rtx: Some(RtxParameters { ssrc: 5001 }),
                    spatial_layers: 3,
                    temporal_layers: 3,
                    dtx: false,
                }],
                rtcp: RtcpParameters {
                    cname: "consumer".to_string(),
                },
            },
            preferred_layers: None,
        }
    }

    fn new_consumer(options: ConsumerOptions) -> Result<SimulcastConsumer> {
        let (events, _rx) = consumer_event_channel();
        SimulcastConsumer::new(ConsumerId::new(), options, events)
    }

    #[test]
    fn test_preferred_layers_default_to_maxima() {
        let consumer = new_consumer(options()).unwrap();

        assert_eq!(consumer.preferred_layers(), (2, 2));
        assert_eq!(consumer.target_layers(), (-1, -1));
        assert_eq!(consumer.current_spatial_layer(), -1);
        assert_eq!(consumer.ts_reference_spatial_layer(), -1);
    }

    #[test]
    fn test_preferred_layers_are_clamped() {
        let mut opts = options();
        opts.preferred_layers = Some(PreferredLayers {
            spatial_layer: 99,
            temporal_layer: Some(99),
        });

        let consumer = new_consumer(opts).unwrap();

        assert_eq!(consumer.preferred_layers(), (2, 2));
    }

    #[test]
    fn test_rejects_single_encoding() {
        let mut opts = options();
        opts.consumable_rtp_encodings.truncate(1);

        assert!(matches!(
            new_consumer(opts),
            Err(Error::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_rejects_spatial_layer_mismatch() {
        let mut opts = options();
        opts.rtp_parameters.encodings[0].spatial_layers = 2;

        assert!(matches!(
            new_consumer(opts),
            Err(Error::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_rejects_non_simulcast_codec() {
        let mut opts = options();
        opts.rtp_parameters.codecs[0].mime_type = MimeType::Opus;

        assert!(matches!(
            new_consumer(opts),
            Err(Error::UnsupportedCodec { .. })
        ));
    }

    #[test]
    fn test_rtx_is_wired_to_send_stream() {
        let mut opts = options();
        opts.rtp_parameters.codecs.push(RtpCodecParameters {
            payload_type: 97,
            mime_type: MimeType::Rtx,
            clock_rate: 90000,
            rtcp_feedback: vec![],
        });

        let consumer = new_consumer(opts).unwrap();

        assert_eq!(consumer.send_stream().rtx(), Some((97, 5001)));
    }
}
