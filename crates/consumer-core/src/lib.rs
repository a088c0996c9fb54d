//! # Consumer forwarding engine for the rsfu project
//!
//! `rsfu-consumer-core` implements the per-consumer side of a selective
//! forwarding unit: each receiving endpoint gets a consumer that picks
//! exactly one of the producer's simulcast streams at any moment and
//! forwards it as a single continuous RTP stream.
//!
//! ## Core Components
//!
//! - **SimulcastConsumer**: the layer state machine (preferred / target /
//!   current spatial and temporal layers), the bitrate probing protocol
//!   driven by an external congestion allocator, and the packet rewriting
//!   pipeline that splices streams across layer switches.
//! - **Streams**: the read-only [`streams::ProducerRtpStream`] surface of
//!   upstream streams and the exclusively-owned outgoing
//!   [`streams::SendStream`].
//! - **Codecs**: per-codec [`codecs::EncodingContext`] implementations that
//!   filter temporal layers and keep codec counters continuous.
//! - **Events**: the non-blocking notification channel carrying `score` and
//!   `layerschange` events to the control plane.
//!
//! The engine runs on a single-threaded cooperative executor: no internal
//! locks, no suspension; every listener callback completes before control
//! returns.

pub mod codecs;
pub mod consumer;
pub mod error;
pub mod events;
pub mod streams;
pub mod types;

pub use consumer::{
    Consumer, ConsumerDump, ConsumerKind, ConsumerListener, ConsumerRequest, SimulcastConsumer,
};
pub use error::{Error, Result};
pub use events::{consumer_event_channel, ConsumerEvent, ConsumerEventSender};
pub use types::{
    ConsumerId, ConsumerLayers, ConsumerOptions, ConsumerScore, MediaKind, MimeType,
    PreferredLayers,
};

/// Prelude module with commonly used types
pub mod prelude {
    pub use crate::codecs::{EncodingContext, EncodingContextParams};
    pub use crate::consumer::{
        Consumer, ConsumerKind, ConsumerListener, ConsumerRequest, SimulcastConsumer,
    };
    pub use crate::error::{Error, Result};
    pub use crate::events::{consumer_event_channel, ConsumerEvent};
    pub use crate::streams::{ProducerRtpStream, SendStream, SendStreamParams};
    pub use crate::types::{
        ConsumerId, ConsumerLayers, ConsumerOptions, ConsumerScore, MediaKind, MimeType,
        PreferredLayers, RtcpFeedback, RtcpParameters, RtpCodecParameters, RtpEncodingParameters,
        RtpParameters, RtxParameters,
    };

    pub use rsfu_rtp_core::{FrameInfo, RtpPacket, SenderReportInfo, SeqManager};
}
