//! Consumer notification channel
//!
//! Notifications travel over an unbounded channel so that emitting from the
//! packet path never blocks. The receiving side (control plane) forwards
//! them to the application.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::types::{ConsumerLayers, ConsumerScore};

/// Upward notifications emitted by a consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum ConsumerEvent {
    /// Outgoing and upstream-current stream health changed.
    Score(ConsumerScore),
    /// The forwarded layers changed; `None` means nothing is forwarded.
    #[serde(rename = "layerschange")]
    LayersChange(Option<ConsumerLayers>),
}

/// Sending half of a consumer's notification channel.
#[derive(Debug, Clone)]
pub struct ConsumerEventSender {
    inner: mpsc::UnboundedSender<ConsumerEvent>,
}

impl ConsumerEventSender {
    /// Emit an event. Never blocks; a closed receiver is logged and the
    /// event discarded.
    pub fn send(&self, event: ConsumerEvent) {
        if self.inner.send(event).is_err() {
            debug!("consumer event receiver closed, discarding event");
        }
    }
}

/// Create the notification channel for one consumer.
pub fn consumer_event_channel() -> (ConsumerEventSender, mpsc::UnboundedReceiver<ConsumerEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ConsumerEventSender { inner: tx }, rx)
}
