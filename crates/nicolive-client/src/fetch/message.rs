//! Live message fetching.
//!
//! Consumes segment descriptors from the entry chain, streams each segment
//! as `ChunkedMessage`s, and re-emits one normalized sequence. Tracks the
//! last delivered meta id for reconnect carryover, supports an inclusive
//! skip-to-meta-id filter, and terminates cleanly on the program-ended state
//! message.

use super::{FetchError, SegmentClient, SegmentHint};
use crate::cancel::CancelToken;
use crate::channel::{FilterDecision, Receiver, Sender};
use futures_util::StreamExt;
use nicolive_proto::pb::ChunkedMessage;
use nicolive_proto::StreamDecoder;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Teardown-time notifications to the supervisor.
#[derive(Debug)]
pub enum FetchSignal {
    /// The program-ended state message was delivered; the sequence is closed.
    Ended,
    /// Network-class failure; reconnect instead of surfacing it.
    Reconnect(Arc<FetchError>),
    /// Non-recoverable failure already surfaced on the message sequence.
    Fatal(Arc<FetchError>),
}

#[derive(Debug, Default)]
pub struct MessagePorts {
    last_meta_id: Mutex<Option<String>>,
}

impl MessagePorts {
    fn record(&self, id: &str) {
        *self.last_meta_id.lock().unwrap() = Some(id.to_string());
    }

    /// Meta id of the most recent live message. Carryover state.
    pub fn last_meta_id(&self) -> Option<String> {
        self.last_meta_id.lock().unwrap().clone()
    }
}

pub struct MessageFetcher {
    ports: Arc<MessagePorts>,
    task: JoinHandle<()>,
}

impl MessageFetcher {
    /// Spawns the segment consumer.
    ///
    /// `out` is the long-lived consumer-facing channel owned by the
    /// supervisor; the fetcher never closes it on cancellation, only on
    /// clean termination. `ready` resolves once, when the first segment
    /// fetch succeeds.
    pub fn spawn(
        client: Arc<dyn SegmentClient>,
        segments: Receiver<SegmentHint, FetchError>,
        out: Sender<ChunkedMessage, FetchError>,
        skip_to_meta_id: Option<String>,
        ready: oneshot::Sender<()>,
        signals: mpsc::UnboundedSender<FetchSignal>,
        cancel: CancelToken,
    ) -> Self {
        if let Some(target) = skip_to_meta_id {
            debug!(meta_id = %target, "skipping forward to the last delivered message");
            out.set_filter(Some(Box::new(move |message: &ChunkedMessage| {
                if message.meta_id() == Some(target.as_str()) {
                    // Inclusive: the matching message was already delivered
                    // before the reconnect.
                    FilterDecision::skip_last()
                } else {
                    FilterDecision::skip()
                }
            })));
        }

        let ports = Arc::new(MessagePorts::default());
        let task = tokio::spawn(run_segments(
            client,
            segments,
            out,
            ports.clone(),
            ready,
            signals,
            cancel,
        ));
        Self { ports, task }
    }

    pub fn ports(&self) -> Arc<MessagePorts> {
        self.ports.clone()
    }

    pub fn last_meta_id(&self) -> Option<String> {
        self.ports.last_meta_id()
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

async fn run_segments(
    client: Arc<dyn SegmentClient>,
    segments: Receiver<SegmentHint, FetchError>,
    out: Sender<ChunkedMessage, FetchError>,
    ports: Arc<MessagePorts>,
    ready: oneshot::Sender<()>,
    signals: mpsc::UnboundedSender<FetchSignal>,
    cancel: CancelToken,
) {
    let mut ready = Some(ready);
    loop {
        let hint = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            hint = segments.recv() => hint,
        };
        match hint {
            Ok(Some(hint)) => {
                if !stream_segment(&client, &hint, &out, &ports, &mut ready, &signals, &cancel)
                    .await
                {
                    return;
                }
            }
            // The entry chain completed with no rearm link.
            Ok(None) => {
                out.close();
                return;
            }
            Err(err) => {
                report_failure(err, &out, &signals, &cancel);
                return;
            }
        }
    }
}

/// Streams one segment into `out`. Returns false when fetching must stop.
async fn stream_segment(
    client: &Arc<dyn SegmentClient>,
    hint: &SegmentHint,
    out: &Sender<ChunkedMessage, FetchError>,
    ports: &MessagePorts,
    ready: &mut Option<oneshot::Sender<()>>,
    signals: &mpsc::UnboundedSender<FetchSignal>,
    cancel: &CancelToken,
) -> bool {
    debug!(uri = %hint.uri, "fetching message segment");
    let mut stream = tokio::select! {
        biased;
        _ = cancel.cancelled() => return false,
        result = client.open_stream(&hint.uri) => match result {
            Ok(stream) => stream,
            Err(err) => {
                report_failure(Arc::new(err), out, signals, cancel);
                return false;
            }
        }
    };
    if let Some(tx) = ready.take() {
        let _ = tx.send(());
    }

    let mut decoder = StreamDecoder::<ChunkedMessage>::new();
    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            chunk = stream.next() => chunk,
        };
        match chunk {
            Some(Ok(bytes)) => {
                let messages = match decoder.push(&bytes) {
                    Ok(messages) => messages,
                    Err(err) => {
                        report_failure(Arc::new(err.into()), out, signals, cancel);
                        return false;
                    }
                };
                for message in messages {
                    if let Some(id) = message.meta_id() {
                        ports.record(id);
                    }
                    let ended = message.is_program_ended();
                    out.push(message);
                    if ended {
                        out.close();
                        let _ = signals.send(FetchSignal::Ended);
                        return false;
                    }
                }
            }
            Some(Err(err)) => {
                report_failure(Arc::new(err), out, signals, cancel);
                return false;
            }
            None => break,
        }
    }
    if let Err(err) = decoder.finish() {
        report_failure(Arc::new(err.into()), out, signals, cancel);
        return false;
    }
    true
}

fn report_failure(
    err: Arc<FetchError>,
    out: &Sender<ChunkedMessage, FetchError>,
    signals: &mpsc::UnboundedSender<FetchSignal>,
    cancel: &CancelToken,
) {
    if cancel.is_cancelled() {
        return;
    }
    if err.is_network() {
        warn!(error = %err, "message stream lost; requesting reconnect");
        let _ = signals.send(FetchSignal::Reconnect(err));
    } else {
        warn!(error = %err, "message stream failed");
        out.fail_arc(err.clone());
        let _ = signals.send(FetchSignal::Fatal(err));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel;
    use crate::fetch::ByteStream;
    use async_trait::async_trait;
    use bytes::Bytes;
    use nicolive_proto::pb::{
        chunked_message, program_status, NicoliveState, ProgramStatus,
    };
    use prost::Message;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    struct ScriptedClient {
        bodies: StdMutex<HashMap<String, Result<Vec<u8>, FetchError>>>,
    }

    impl ScriptedClient {
        fn new(routes: Vec<(&str, Result<Vec<u8>, FetchError>)>) -> Arc<Self> {
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
            let body = self
                .bodies
                .lock()
                .unwrap()
                .remove(uri)
                .unwrap_or_else(|| panic!("unexpected fetch of {uri}"))?;
            Ok(Box::pin(futures_util::stream::once(async move {
                Ok(Bytes::from(body))
            })))
        }

        async fn fetch_body(&self, _uri: &str) -> Result<Bytes, FetchError> {
            unimplemented!("message fetching never uses one-shot bodies")
        }
    }

    fn chat(id: &str) -> ChunkedMessage {
        ChunkedMessage {
            meta: Some(chunked_message::Meta {
                id: id.to_string(),
                at: None,
            }),
            payload: None,
        }
    }

    fn ended(id: &str) -> ChunkedMessage {
        ChunkedMessage {
            meta: Some(chunked_message::Meta {
                id: id.to_string(),
                at: None,
            }),
            payload: Some(chunked_message::Payload::State(NicoliveState {
                program_status: Some(ProgramStatus {
                    state: program_status::State::Ended as i32,
                }),
            })),
        }
    }

    fn encode(messages: Vec<ChunkedMessage>) -> Vec<u8> {
        let mut body = Vec::new();
        for message in messages {
            message.encode_length_delimited(&mut body).unwrap();
        }
        body
    }

    fn hint(uri: &str) -> SegmentHint {
        SegmentHint {
            uri: uri.to_string(),
        }
    }

    async fn drain_ids(
        rx: &channel::Receiver<ChunkedMessage, FetchError>,
    ) -> Result<Vec<String>, Arc<FetchError>> {
        let mut ids = Vec::new();
        loop {
            match rx.recv().await? {
                Some(message) => ids.push(message.meta_id().unwrap_or("?").to_string()),
                None => return Ok(ids),
            }
        }
    }

    fn setup() -> (
        channel::Sender<SegmentHint, FetchError>,
        channel::Receiver<SegmentHint, FetchError>,
        channel::Sender<ChunkedMessage, FetchError>,
        channel::Receiver<ChunkedMessage, FetchError>,
        mpsc::UnboundedSender<FetchSignal>,
        mpsc::UnboundedReceiver<FetchSignal>,
    ) {
        let (seg_tx, seg_rx) = channel::channel();
        let (out_tx, out_rx) = channel::channel();
        let (sig_tx, sig_rx) = mpsc::unbounded_channel();
        (seg_tx, seg_rx, out_tx, out_rx, sig_tx, sig_rx)
    }

    #[tokio::test]
    async fn concatenates_segments_in_order() {
        let client = ScriptedClient::new(vec![
            ("s1", Ok(encode(vec![chat("a"), chat("b")]))),
            ("s2", Ok(encode(vec![chat("c")]))),
        ]);
        let (seg_tx, seg_rx, out_tx, out_rx, sig_tx, _sig_rx) = setup();
        seg_tx.push(hint("s1"));
        seg_tx.push(hint("s2"));
        seg_tx.close();
        let (ready_tx, mut ready_rx) = oneshot::channel();

        let fetcher = MessageFetcher::spawn(
            client,
            seg_rx,
            out_tx,
            None,
            ready_tx,
            sig_tx,
            CancelToken::new(),
        );

        assert_eq!(drain_ids(&out_rx).await.unwrap(), ["a", "b", "c"]);
        assert_eq!(fetcher.last_meta_id(), Some("c".to_string()));
        // The first successful segment fetch resolved the readiness latch.
        assert!(ready_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn skip_to_meta_id_is_inclusive() {
        let client = ScriptedClient::new(vec![(
            "s1",
            Ok(encode(vec![chat("b"), chat("c"), chat("d")])),
        )]);
        let (seg_tx, seg_rx, out_tx, out_rx, sig_tx, _sig_rx) = setup();
        seg_tx.push(hint("s1"));
        seg_tx.close();

        let (ready_tx, _ready_rx) = oneshot::channel();
        let fetcher = MessageFetcher::spawn(
            client,
            seg_rx,
            out_tx,
            Some("b".to_string()),
            ready_tx,
            sig_tx,
            CancelToken::new(),
        );

        assert_eq!(drain_ids(&out_rx).await.unwrap(), ["c", "d"]);
        // The skipped duplicate still advances the carryover cursor.
        assert_eq!(fetcher.last_meta_id(), Some("d".to_string()));
    }

    #[tokio::test]
    async fn program_ended_closes_the_sequence_immediately() {
        let client = ScriptedClient::new(vec![(
            "s1",
            Ok(encode(vec![chat("a"), chat("b"), ended("end")])),
        )]);
        let (seg_tx, seg_rx, out_tx, out_rx, sig_tx, mut sig_rx) = setup();
        seg_tx.push(hint("s1"));
        // A queued follow-up segment must never be fetched; the scripted
        // client panics on unexpected uris.
        seg_tx.push(hint("s2"));

        let (ready_tx, _ready_rx) = oneshot::channel();
        let _fetcher = MessageFetcher::spawn(
            client,
            seg_rx,
            out_tx,
            None,
            ready_tx,
            sig_tx,
            CancelToken::new(),
        );

        assert_eq!(drain_ids(&out_rx).await.unwrap(), ["a", "b", "end"]);
        assert!(matches!(sig_rx.recv().await, Some(FetchSignal::Ended)));
    }

    #[tokio::test]
    async fn network_errors_request_reconnect_without_failing_consumers() {
        let client = ScriptedClient::new(vec![(
            "s1",
            Err(FetchError::Network("connection reset".into())),
        )]);
        let (seg_tx, seg_rx, out_tx, out_rx, sig_tx, mut sig_rx) = setup();
        seg_tx.push(hint("s1"));

        let (ready_tx, mut ready_rx) = oneshot::channel();
        let _fetcher = MessageFetcher::spawn(
            client,
            seg_rx,
            out_tx,
            None,
            ready_tx,
            sig_tx,
            CancelToken::new(),
        );

        assert!(matches!(
            sig_rx.recv().await,
            Some(FetchSignal::Reconnect(_))
        ));
        // The fetch never succeeded, so readiness never resolved.
        assert!(ready_rx.try_recv().is_err());
        // The consumer channel stays open for the post-reconnect suffix.
        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            out_rx.recv(),
        )
        .await;
        assert!(pending.is_err(), "sequence must not end on a network error");
    }

    #[tokio::test]
    async fn http_errors_surface_to_consumers() {
        let client = ScriptedClient::new(vec![(
            "s1",
            Err(FetchError::Status {
                status: 500,
                uri: "s1".into(),
            }),
        )]);
        let (seg_tx, seg_rx, out_tx, out_rx, sig_tx, mut sig_rx) = setup();
        seg_tx.push(hint("s1"));

        let (ready_tx, _ready_rx) = oneshot::channel();
        let _fetcher = MessageFetcher::spawn(
            client,
            seg_rx,
            out_tx,
            None,
            ready_tx,
            sig_tx,
            CancelToken::new(),
        );

        let err = drain_ids(&out_rx).await.unwrap_err();
        assert!(matches!(&*err, FetchError::Status { status: 500, .. }));
        assert!(matches!(sig_rx.recv().await, Some(FetchSignal::Fatal(_))));
    }
}
