//! Client engine for the Niconico live comment infrastructure.
//!
//! Two cooperating channels drive a broadcast: the watch channel (a
//! WebSocket session negotiating viewing parameters and carrying control
//! events) and the message channel (a chain of size-delimited protobuf
//! streams carrying chat and state). [`NicoliveClient`] supervises both,
//! reconnects on migration or network loss without duplicating or dropping
//! messages, and serves program history on demand.

pub mod cancel;
pub mod channel;
pub mod client;
pub mod comment;
pub mod fetch;
pub mod page;
pub mod watch;

pub use nicolive_proto as proto;

pub use cancel::CancelToken;
pub use client::{
    ConnectorError, ConnectorOptions, ConnectorState, NicoliveClient, NicoliveClientBuilder,
    RECONNECT_DELAYS,
};
pub use comment::{BroadcasterComment, BroadcasterCommentClient, CommentError};
pub use fetch::{BackwardBatch, BackwardFetch, EntryFrom, FetchError};
pub use page::{NicolivePageData, PageClient, PageError};
pub use watch::{MessageServer, Schedule, WatchError};
