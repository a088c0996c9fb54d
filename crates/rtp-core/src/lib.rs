//! # RTP core primitives for the rsfu project
//!
//! `rsfu-rtp-core` provides the low-level RTP plumbing that the forwarding
//! engine in `rsfu-consumer-core` builds on:
//!
//! - **RtpPacket**: an in-memory RTP packet whose header fields can be
//!   rewritten and later restored, so one parsed packet can be offered to
//!   many consumers.
//! - **SeqManager**: an injective, monotonic input→output sequence mapping
//!   with drop and sync support, usable for RTP sequence numbers as well as
//!   codec-level counters (VP8 PictureID, TL0PICIDX).
//! - **SenderReportInfo**: the (NTP-ms, RTP-ts) Sender Report pair used for
//!   cross-stream clock alignment.
//! - **clock**: a monotonic millisecond clock read on demand.

pub mod clock;
pub mod ntp;
pub mod packet;
pub mod seq;

pub use clock::now_ms;
pub use ntp::SenderReportInfo;
pub use packet::{FrameInfo, RtpPacket};
pub use seq::SeqManager;

/// RTP synchronization source identifier.
pub type RtpSsrc = u32;

/// RTP timestamp (32 bits, wrapping).
pub type RtpTimestamp = u32;
