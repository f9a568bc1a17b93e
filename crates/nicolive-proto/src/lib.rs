//! Wire schema for the Niconico live message channel.
//!
//! The message channel is a chain of HTTPS responses, each a stream of
//! protobuf messages prefixed by a varint length. [`pb`] declares the message
//! types referenced by the entry, segment, and backward endpoints;
//! [`framing`] turns a lazy sequence of byte chunks into decoded messages.

pub mod framing;
pub mod pb;

pub use framing::{FramingError, StreamDecoder, MAX_FRAME_SIZE};
