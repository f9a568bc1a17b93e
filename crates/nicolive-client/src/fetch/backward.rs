//! Backward (historic) message fetching.
//!
//! Walks `PackedSegment` chains in reverse chronological order, one page per
//! request, pacing requests with a caller-chosen delay. At most one walk is
//! in flight per connector.

use super::{FetchError, SegmentClient};
use crate::cancel::CancelToken;
use nicolive_proto::pb::{ChunkedMessage, PackedSegment};
use prost::Message;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Current segment/snapshot chain heads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackwardUris {
    pub segment: Option<String>,
    pub snapshot: Option<String>,
}

impl BackwardUris {
    fn select(&self, snapshot: bool) -> Option<&str> {
        if snapshot {
            self.snapshot.as_deref()
        } else {
            self.segment.as_deref()
        }
    }
}

/// Walk position, shared with the entry fetcher (which discovers the first
/// pointer) and preserved across reconnects.
#[derive(Debug, Default)]
pub struct BackwardState {
    uris: Mutex<Option<BackwardUris>>,
    in_flight: AtomicBool,
}

impl BackwardState {
    /// Registers the pointer discovered on the entry chain. Only the first
    /// offer wins; later entry fetches republish pointers into history the
    /// walker has already consumed.
    pub fn offer_initial(&self, uris: BackwardUris) {
        let mut current = self.uris.lock().unwrap();
        if current.is_none() {
            debug!(?uris, "backward chain registered");
            *current = Some(uris);
        }
    }

    pub fn current(&self) -> Option<BackwardUris> {
        self.uris.lock().unwrap().clone()
    }

    fn select_uri(&self, snapshot: bool) -> Option<String> {
        self.uris
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|uris| uris.select(snapshot).map(str::to_string))
    }

    fn store(&self, uris: BackwardUris) {
        *self.uris.lock().unwrap() = Some(uris);
    }
}

/// One resolved backward walk.
#[derive(Debug, Clone, PartialEq)]
pub struct BackwardBatch {
    /// Oldest-first: pages reversed, each page's internal order preserved.
    pub messages: Vec<ChunkedMessage>,
    pub segment_uri: Option<String>,
    pub snapshot_uri: Option<String>,
}

/// Handle on an in-flight walk: abort it, then await the partial batch.
pub struct BackwardFetch {
    cancel: CancelToken,
    task: JoinHandle<Result<BackwardBatch, FetchError>>,
}

impl BackwardFetch {
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub async fn wait(self) -> Result<BackwardBatch, FetchError> {
        match self.task.await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Aborted),
        }
    }
}

pub struct BackwardFetcher {
    client: Arc<dyn SegmentClient>,
    state: Arc<BackwardState>,
}

impl BackwardFetcher {
    pub fn new(client: Arc<dyn SegmentClient>, state: Arc<BackwardState>) -> Self {
        Self { client, state }
    }

    pub fn state(&self) -> Arc<BackwardState> {
        self.state.clone()
    }

    /// Starts a walk, or returns `None` while one is in flight or the
    /// selected chain head is absent.
    ///
    /// `max_pages == 0` means unbounded.
    pub fn fetch(
        &self,
        delay: Duration,
        max_pages: usize,
        snapshot: bool,
    ) -> Option<BackwardFetch> {
        if self
            .state
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return None;
        }
        let guard = InFlightGuard(self.state.clone());
        if self.state.select_uri(snapshot).is_none() {
            return None;
        }

        let cancel = CancelToken::new();
        let task = tokio::spawn(run_walk(
            self.client.clone(),
            self.state.clone(),
            delay,
            max_pages,
            snapshot,
            cancel.clone(),
            guard,
        ));
        Some(BackwardFetch { cancel, task })
    }
}

struct InFlightGuard(Arc<BackwardState>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.in_flight.store(false, Ordering::SeqCst);
    }
}

async fn run_walk(
    client: Arc<dyn SegmentClient>,
    state: Arc<BackwardState>,
    delay: Duration,
    max_pages: usize,
    snapshot: bool,
    cancel: CancelToken,
    _guard: InFlightGuard,
) -> Result<BackwardBatch, FetchError> {
    let limit = if max_pages == 0 {
        usize::MAX
    } else {
        max_pages
    };
    let mut pages: Vec<Vec<ChunkedMessage>> = Vec::new();

    while pages.len() < limit {
        let Some(uri) = state.select_uri(snapshot) else {
            break;
        };
        if cancel.is_cancelled() {
            break;
        }
        debug!(uri = %uri, page = pages.len(), "fetching backward page");
        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = client.fetch_body(&uri) => match result {
                Ok(body) => body,
                Err(err) => {
                    if pages.is_empty() {
                        return Err(err);
                    }
                    warn!(error = %err, "backward walk stopped early; returning partial batch");
                    break;
                }
            }
        };
        let packed = match PackedSegment::decode(body) {
            Ok(packed) => packed,
            Err(err) => {
                if pages.is_empty() {
                    return Err(nicolive_proto::FramingError::Decode(err).into());
                }
                warn!(error = %err, "backward page undecodable; returning partial batch");
                break;
            }
        };
        // Advisory only: history may carry the ended state while the live
        // feed is still running.
        if packed.messages.last().is_some_and(|m| m.is_program_ended()) {
            info!("backward page carries a program-ended state message");
        }
        pages.push(packed.messages);
        state.store(BackwardUris {
            segment: packed.next.map(|next| next.uri),
            snapshot: packed.snapshot.map(|snapshot| snapshot.uri),
        });

        if pages.len() < limit && state.select_uri(snapshot).is_some() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    let current = state.current().unwrap_or_default();
    Ok(BackwardBatch {
        messages: pages.into_iter().rev().flatten().collect(),
        segment_uri: current.segment,
        snapshot_uri: current.snapshot,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::ByteStream;
    use async_trait::async_trait;
    use bytes::Bytes;
    use nicolive_proto::pb::{chunked_message, packed_segment};
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    struct ScriptedClient {
        bodies: StdMutex<HashMap<String, Vec<u8>>>,
    }

    impl ScriptedClient {
        fn new(routes: Vec<(&str, Vec<u8>)>) -> Arc<Self> {
            Arc::new(Self {
                bodies: StdMutex::new(
                    routes
                        .into_iter()
                        .map(|(uri, body)| (uri.to_string(), body))
                        .collect(),
                ),
            })
        }
    }

    #[async_trait]
    impl SegmentClient for ScriptedClient {
        async fn open_stream(&self, uri: &str) -> Result<ByteStream, FetchError> {
            Err(FetchError::Status {
                status: 404,
                uri: uri.to_string(),
            })
        }

        async fn fetch_body(&self, uri: &str) -> Result<Bytes, FetchError> {
            self.bodies
                .lock()
                .unwrap()
                .remove(uri)
                .map(Bytes::from)
                .ok_or_else(|| FetchError::Network(format!("no route for {uri}")))
        }
    }

    fn message(id: &str) -> ChunkedMessage {
        ChunkedMessage {
            meta: Some(chunked_message::Meta {
                id: id.to_string(),
                at: None,
            }),
            payload: None,
        }
    }

    fn page(ids: &[&str], next: Option<&str>, snapshot: Option<&str>) -> Vec<u8> {
        let packed = PackedSegment {
            messages: ids.iter().map(|id| message(id)).collect(),
            next: next.map(|uri| packed_segment::Next {
                uri: uri.to_string(),
            }),
            snapshot: snapshot.map(|uri| packed_segment::StateSnapshot {
                uri: uri.to_string(),
            }),
        };
        packed.encode_to_vec()
    }

    fn state_at(segment: &str) -> Arc<BackwardState> {
        let state = Arc::new(BackwardState::default());
        state.offer_initial(BackwardUris {
            segment: Some(segment.to_string()),
            snapshot: None,
        });
        state
    }

    fn ids(batch: &BackwardBatch) -> Vec<&str> {
        batch
            .messages
            .iter()
            .filter_map(|m| m.meta_id())
            .collect()
    }

    #[tokio::test]
    async fn pages_flatten_oldest_first_with_inner_order_preserved() {
        let client = ScriptedClient::new(vec![
            ("p1", page(&["y", "z"], Some("p2"), None)),
            ("p2", page(&["w", "x"], None, Some("p2-snapshot"))),
        ]);
        let state = state_at("p1");
        let fetcher = BackwardFetcher::new(client, state);

        let fetch = fetcher
            .fetch(Duration::from_millis(1), 2, false)
            .expect("walk starts");
        let batch = fetch.wait().await.unwrap();

        assert_eq!(ids(&batch), ["w", "x", "y", "z"]);
        assert_eq!(batch.segment_uri, None);
        assert_eq!(batch.snapshot_uri.as_deref(), Some("p2-snapshot"));
    }

    #[tokio::test]
    async fn only_one_walk_is_in_flight_at_a_time() {
        let client = ScriptedClient::new(vec![
            ("p1", page(&["a"], Some("p2"), None)),
            ("p2", page(&["b"], None, None)),
        ]);
        let fetcher = BackwardFetcher::new(client, state_at("p1"));

        let first = fetcher
            .fetch(Duration::from_millis(200), 2, false)
            .expect("first walk starts");
        assert!(
            fetcher.fetch(Duration::from_millis(1), 1, false).is_none(),
            "second walk must be rejected while the first is in flight"
        );
        let batch = first.wait().await.unwrap();
        assert_eq!(ids(&batch), ["b", "a"]);

        // Completed: a new walk is allowed (and finds an exhausted chain).
        assert!(fetcher.fetch(Duration::from_millis(1), 1, false).is_none());
        assert!(!fetcher.state().in_flight.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn max_pages_bounds_the_walk() {
        let client = ScriptedClient::new(vec![
            ("p1", page(&["c"], Some("p2"), None)),
            ("p2", page(&["b"], Some("p3"), None)),
        ]);
        let fetcher = BackwardFetcher::new(client, state_at("p1"));

        let batch = fetcher
            .fetch(Duration::from_millis(1), 2, false)
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(ids(&batch), ["b", "c"]);
        // Position is retained for a later walk.
        assert_eq!(batch.segment_uri.as_deref(), Some("p3"));
    }

    #[tokio::test]
    async fn truncated_page_fails_only_when_nothing_was_collected() {
        let fetcher = BackwardFetcher::new(
            ScriptedClient::new(vec![("p1", b"\xff\xff\xff".to_vec())]),
            state_at("p1"),
        );
        let err = fetcher
            .fetch(Duration::from_millis(1), 0, false)
            .unwrap()
            .wait()
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Framing(_)));

        let fetcher = BackwardFetcher::new(
            ScriptedClient::new(vec![
                ("q1", page(&["z"], Some("q2"), None)),
                ("q2", b"\xff\xff\xff".to_vec()),
            ]),
            state_at("q1"),
        );
        let batch = fetcher
            .fetch(Duration::from_millis(1), 0, false)
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(ids(&batch), ["z"]);
        // The chain head reflects the last fully decoded page.
        assert_eq!(batch.segment_uri.as_deref(), Some("q2"));
    }

    #[tokio::test]
    async fn missing_chain_head_returns_none() {
        let fetcher = BackwardFetcher::new(
            ScriptedClient::new(vec![]),
            Arc::new(BackwardState::default()),
        );
        assert!(fetcher.fetch(Duration::from_millis(1), 1, false).is_none());
        // The rejected call must release the single-flight latch.
        assert!(!fetcher.state().in_flight.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn abort_returns_the_partial_batch() {
        let client = ScriptedClient::new(vec![
            ("p1", page(&["a"], Some("p2"), None)),
            ("p2", page(&["b"], None, None)),
        ]);
        let fetcher = BackwardFetcher::new(client, state_at("p1"));

        // A long inter-page delay keeps the walk parked after page one.
        let fetch = fetcher
            .fetch(Duration::from_secs(3600), 0, false)
            .expect("walk starts");
        tokio::time::sleep(Duration::from_millis(50)).await;
        fetch.abort();
        let batch = fetch.wait().await.unwrap();
        assert_eq!(ids(&batch), ["a"]);
        assert_eq!(batch.segment_uri.as_deref(), Some("p2"));
    }

    #[tokio::test]
    async fn snapshot_walk_follows_the_snapshot_chain() {
        let client = ScriptedClient::new(vec![
            ("snap1", page(&["s1"], None, Some("snap2"))),
            ("snap2", page(&["s0"], None, None)),
        ]);
        let state = Arc::new(BackwardState::default());
        state.offer_initial(BackwardUris {
            segment: None,
            snapshot: Some("snap1".to_string()),
        });
        let fetcher = BackwardFetcher::new(client, state);

        let batch = fetcher
            .fetch(Duration::from_millis(1), 0, true)
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(ids(&batch), ["s0", "s1"]);
    }
}
