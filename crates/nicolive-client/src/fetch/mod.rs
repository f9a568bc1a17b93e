//! Message-channel fetching: the entry chain, live segments, and backward
//! history pages.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use nicolive_proto::FramingError;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

pub mod backward;
pub mod entry;
pub mod message;

pub use backward::{BackwardBatch, BackwardFetch, BackwardFetcher, BackwardState, BackwardUris};
pub use entry::{EntryFetcher, EntryFrom, SegmentHint};
pub use message::{FetchSignal, MessageFetcher};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("unexpected http status {status} from {uri}")]
    Status { status: u16, uri: String },
    #[error(transparent)]
    Framing(#[from] FramingError),
    /// Transport-layer failure; the supervisor's reconnect trigger.
    #[error("network error: {0}")]
    Network(String),
    #[error("fetch aborted")]
    Aborted,
}

impl FetchError {
    /// True for errors the supervisor recovers from by reconnecting.
    pub fn is_network(&self) -> bool {
        matches!(self, FetchError::Network(_))
    }
}

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, FetchError>> + Send>>;

/// HTTP access used by the fetchers. Production uses [`HttpSegmentClient`];
/// tests substitute scripted implementations.
#[async_trait]
pub trait SegmentClient: Send + Sync {
    /// Opens `uri` as a streaming body.
    async fn open_stream(&self, uri: &str) -> Result<ByteStream, FetchError>;

    /// Fetches `uri` as one complete body.
    async fn fetch_body(&self, uri: &str) -> Result<Bytes, FetchError>;
}

pub struct HttpSegmentClient {
    client: reqwest::Client,
}

impl HttpSegmentClient {
    pub fn new() -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| FetchError::Network(err.to_string()))?;
        Ok(Self { client })
    }

    async fn get(&self, uri: &str) -> Result<reqwest::Response, FetchError> {
        let response = self
            .client
            .get(uri)
            .send()
            .await
            .map_err(|err| FetchError::Network(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                uri: uri.to_string(),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl SegmentClient for HttpSegmentClient {
    async fn open_stream(&self, uri: &str) -> Result<ByteStream, FetchError> {
        let response = self.get(uri).await?;
        Ok(Box::pin(response.bytes_stream().map(|item| {
            item.map_err(|err| FetchError::Network(err.to_string()))
        })))
    }

    async fn fetch_body(&self, uri: &str) -> Result<Bytes, FetchError> {
        let response = self.get(uri).await?;
        response
            .bytes()
            .await
            .map_err(|err| FetchError::Network(err.to_string()))
    }
}
