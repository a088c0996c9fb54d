//! Stream surfaces the consumer engine works against
//!
//! Upstream producer streams are owned by the media router and exposed to
//! consumers through the read-only [`ProducerRtpStream`] trait. The outgoing
//! send stream is exclusively owned by its consumer.

pub mod producer;
pub mod send;

pub use producer::ProducerRtpStream;
pub use send::{SendStream, SendStreamParams};
