//! Protobuf message types for the entry, segment, and backward endpoints.
//!
//! Declared as `prost` messages rather than generated at build time; tags
//! follow the published schema. Only the payload fields the client inspects
//! are modelled in full — chat payloads keep the fields consumers actually
//! read, everything else passes through opaquely.

use prost_types::Timestamp;

/// One element of the entry stream returned by `GET <viewUri>?at=...`.
///
/// Within a single fetch the server orders entries `backward`, then
/// `previous`, then `segment`, then `next`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChunkedEntry {
    #[prost(oneof = "chunked_entry::Entry", tags = "1, 2, 3, 4")]
    pub entry: Option<chunked_entry::Entry>,
}

pub mod chunked_entry {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Entry {
        /// Pointer to historic bulk fetches (segment and snapshot chains).
        #[prost(message, tag = "1")]
        Backward(super::BackwardSegment),
        /// A one-shot historic sub-segment to inline before live segments.
        #[prost(message, tag = "2")]
        Previous(super::PreviousSegment),
        /// A forward live sub-segment.
        #[prost(message, tag = "3")]
        Segment(super::MessageSegment),
        /// Rearm instruction: refetch the entry endpoint with `?at=<at>`.
        #[prost(message, tag = "4")]
        Next(super::ReadyForNext),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BackwardSegment {
    #[prost(message, optional, tag = "1")]
    pub until: Option<Timestamp>,
    #[prost(message, optional, tag = "2")]
    pub segment: Option<SegmentPointer>,
    #[prost(message, optional, tag = "3")]
    pub snapshot: Option<SegmentPointer>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PreviousSegment {
    #[prost(message, optional, tag = "1")]
    pub until: Option<Timestamp>,
    #[prost(string, tag = "2")]
    pub uri: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MessageSegment {
    #[prost(message, optional, tag = "1")]
    pub from: Option<Timestamp>,
    #[prost(message, optional, tag = "2")]
    pub until: Option<Timestamp>,
    #[prost(string, tag = "3")]
    pub uri: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SegmentPointer {
    #[prost(string, tag = "1")]
    pub uri: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReadyForNext {
    /// Seconds value for the next `?at=` parameter.
    #[prost(int64, tag = "1")]
    pub at: i64,
}

/// One message of a live segment or backward page.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChunkedMessage {
    #[prost(message, optional, tag = "1")]
    pub meta: Option<chunked_message::Meta>,
    #[prost(oneof = "chunked_message::Payload", tags = "2, 3, 4")]
    pub payload: Option<chunked_message::Payload>,
}

pub mod chunked_message {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Meta {
        /// Opaque unique id, used as the resume cursor across reconnects.
        #[prost(string, tag = "1")]
        pub id: String,
        #[prost(message, optional, tag = "2")]
        pub at: Option<::prost_types::Timestamp>,
    }

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "2")]
        Message(super::NicoliveMessage),
        #[prost(message, tag = "3")]
        State(super::NicoliveState),
        #[prost(enumeration = "super::Signal", tag = "4")]
        Signal(i32),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Signal {
    Flushed = 0,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NicoliveMessage {
    #[prost(oneof = "nicolive_message::Data", tags = "1, 2")]
    pub data: Option<nicolive_message::Data>,
}

pub mod nicolive_message {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Data {
        #[prost(message, tag = "1")]
        Chat(super::Chat),
        #[prost(message, tag = "2")]
        SimpleNotification(super::SimpleNotification),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Chat {
    #[prost(string, tag = "1")]
    pub content: String,
    #[prost(string, optional, tag = "2")]
    pub name: Option<String>,
    #[prost(int32, optional, tag = "3")]
    pub vpos: Option<i32>,
    #[prost(string, optional, tag = "4")]
    pub hashed_user_id: Option<String>,
    #[prost(string, optional, tag = "5")]
    pub raw_user_id: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SimpleNotification {
    #[prost(string, tag = "1")]
    pub message: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NicoliveState {
    #[prost(message, optional, tag = "1")]
    pub program_status: Option<ProgramStatus>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProgramStatus {
    #[prost(enumeration = "program_status::State", tag = "1")]
    pub state: i32,
}

pub mod program_status {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum State {
        Unknown = 0,
        Ended = 1,
    }
}

/// One historic page fetched through a backward URI.
///
/// `messages` is forward-chronological within the page; `next` walks further
/// into the past, `snapshot` walks the state-only chain.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PackedSegment {
    #[prost(message, repeated, tag = "1")]
    pub messages: Vec<ChunkedMessage>,
    #[prost(message, optional, tag = "2")]
    pub next: Option<packed_segment::Next>,
    #[prost(message, optional, tag = "3")]
    pub snapshot: Option<packed_segment::StateSnapshot>,
}

pub mod packed_segment {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Next {
        #[prost(string, tag = "1")]
        pub uri: String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct StateSnapshot {
        #[prost(string, tag = "1")]
        pub uri: String,
    }
}

impl ChunkedMessage {
    /// Meta id, when the server attached one.
    pub fn meta_id(&self) -> Option<&str> {
        self.meta.as_ref().map(|meta| meta.id.as_str())
    }

    /// True for the state message that marks the end of the program.
    pub fn is_program_ended(&self) -> bool {
        match &self.payload {
            Some(chunked_message::Payload::State(state)) => state
                .program_status
                .as_ref()
                .is_some_and(|status| status.state() == program_status::State::Ended),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_ended_requires_state_payload() {
        let chat = ChunkedMessage {
            meta: None,
            payload: Some(chunked_message::Payload::Message(NicoliveMessage {
                data: Some(nicolive_message::Data::Chat(Chat {
                    content: "hello".into(),
                    ..Default::default()
                })),
            })),
        };
        assert!(!chat.is_program_ended());

        let ended = ChunkedMessage {
            meta: None,
            payload: Some(chunked_message::Payload::State(NicoliveState {
                program_status: Some(ProgramStatus {
                    state: program_status::State::Ended as i32,
                }),
            })),
        };
        assert!(ended.is_program_ended());

        let unknown_state = ChunkedMessage {
            meta: None,
            payload: Some(chunked_message::Payload::State(NicoliveState {
                program_status: Some(ProgramStatus { state: 42 }),
            })),
        };
        assert!(!unknown_state.is_program_ended());
    }

    #[test]
    fn meta_id_is_exposed() {
        let msg = ChunkedMessage {
            meta: Some(chunked_message::Meta {
                id: "abc".into(),
                at: None,
            }),
            payload: None,
        };
        assert_eq!(msg.meta_id(), Some("abc"));
        assert_eq!(ChunkedMessage::default().meta_id(), None);
    }
}
