//! Entry-chain driver.
//!
//! Fetches `GET <viewUri>?at=<seconds|"now">` as a `ChunkedEntry` stream,
//! follows `next` rearm links across fetches, inlines `previous`/`segment`
//! pointers into the forward segment sequence, and records the first
//! `backward` pointer for the history walker.

use super::{backward::BackwardState, BackwardUris, FetchError, SegmentClient};
use crate::cancel::CancelToken;
use crate::channel::Sender;
use futures_util::StreamExt;
use nicolive_proto::pb::{chunked_entry::Entry, ChunkedEntry};
use nicolive_proto::StreamDecoder;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

/// Where the entry chain starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryFrom {
    /// `?at=now`: live head.
    Now,
    /// `?at=<seconds>`: resume or seek.
    At(i64),
}

impl EntryFrom {
    fn at_param(&self) -> String {
        match self {
            EntryFrom::Now => "now".to_string(),
            EntryFrom::At(seconds) => seconds.to_string(),
        }
    }
}

/// A forward live sub-segment discovered on the entry chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHint {
    pub uri: String,
}

#[derive(Debug, Default)]
pub struct EntryPorts {
    last_entry_at: Mutex<Option<i64>>,
}

impl EntryPorts {
    fn record(&self, at: i64) {
        *self.last_entry_at.lock().unwrap() = Some(at);
    }

    /// Latest `next.at` seen, in seconds. Carryover state for reconnect.
    pub fn last_entry_at(&self) -> Option<i64> {
        *self.last_entry_at.lock().unwrap()
    }
}

pub struct EntryFetcher {
    ports: Arc<EntryPorts>,
    task: JoinHandle<()>,
}

impl EntryFetcher {
    /// Spawns the chain driver. `ready` resolves once, on the first forward
    /// segment emission.
    pub fn spawn(
        client: Arc<dyn SegmentClient>,
        view_uri: Url,
        from: EntryFrom,
        segments: Sender<SegmentHint, FetchError>,
        backward: Arc<BackwardState>,
        ready: oneshot::Sender<()>,
        cancel: CancelToken,
    ) -> Self {
        let ports = Arc::new(EntryPorts::default());
        let task = tokio::spawn(run_entry_chain(
            client,
            view_uri,
            from,
            segments,
            backward,
            ready,
            ports.clone(),
            cancel,
        ));
        Self { ports, task }
    }

    pub fn ports(&self) -> Arc<EntryPorts> {
        self.ports.clone()
    }

    pub fn last_entry_at(&self) -> Option<i64> {
        self.ports.last_entry_at()
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

async fn run_entry_chain(
    client: Arc<dyn SegmentClient>,
    view_uri: Url,
    from: EntryFrom,
    segments: Sender<SegmentHint, FetchError>,
    backward: Arc<BackwardState>,
    ready: oneshot::Sender<()>,
    ports: Arc<EntryPorts>,
    cancel: CancelToken,
) {
    let mut ready = Some(ready);
    let mut at = from.at_param();
    loop {
        let mut uri = view_uri.clone();
        uri.query_pairs_mut().append_pair("at", &at);
        debug!(uri = %uri, "fetching entry stream");

        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                segments.close();
                return;
            }
            result = client.open_stream(uri.as_str()) => match result {
                Ok(stream) => stream,
                Err(err) => {
                    finish_with_error(&segments, &cancel, err);
                    return;
                }
            }
        };

        let mut decoder = StreamDecoder::<ChunkedEntry>::new();
        let mut saw_segment = false;
        let mut next_at: Option<i64> = None;
        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    segments.close();
                    return;
                }
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(Ok(bytes)) => {
                    let entries = match decoder.push(&bytes) {
                        Ok(entries) => entries,
                        Err(err) => {
                            finish_with_error(&segments, &cancel, err.into());
                            return;
                        }
                    };
                    for entry in entries {
                        handle_entry(
                            entry,
                            &mut saw_segment,
                            &mut next_at,
                            &segments,
                            &backward,
                            &ports,
                            &mut ready,
                        );
                    }
                }
                Some(Err(err)) => {
                    finish_with_error(&segments, &cancel, err);
                    return;
                }
                None => break,
            }
        }
        if let Err(err) = decoder.finish() {
            finish_with_error(&segments, &cancel, err.into());
            return;
        }

        match next_at {
            Some(next) => at = next.to_string(),
            // No rearm link: the chain is complete.
            None => break,
        }
    }
    segments.close();
}

fn handle_entry(
    entry: ChunkedEntry,
    saw_segment: &mut bool,
    next_at: &mut Option<i64>,
    segments: &Sender<SegmentHint, FetchError>,
    backward: &BackwardState,
    ports: &EntryPorts,
    ready: &mut Option<oneshot::Sender<()>>,
) {
    match entry.entry {
        Some(Entry::Next(next)) => {
            *next_at = Some(next.at);
            ports.record(next.at);
        }
        Some(Entry::Segment(segment)) => {
            *saw_segment = true;
            segments.push(SegmentHint { uri: segment.uri });
            mark_ready(ready);
        }
        // backward/previous entries that follow a segment in the same fetch
        // are stale and dropped.
        Some(Entry::Previous(previous)) => {
            if !*saw_segment {
                segments.push(SegmentHint { uri: previous.uri });
                mark_ready(ready);
            }
        }
        Some(Entry::Backward(pointer)) => {
            if !*saw_segment {
                backward.offer_initial(BackwardUris {
                    segment: pointer.segment.map(|p| p.uri),
                    snapshot: pointer.snapshot.map(|p| p.uri),
                });
            }
        }
        None => {}
    }
}

fn mark_ready(ready: &mut Option<oneshot::Sender<()>>) {
    if let Some(tx) = ready.take() {
        let _ = tx.send(());
    }
}

fn finish_with_error(
    segments: &Sender<SegmentHint, FetchError>,
    cancel: &CancelToken,
    err: FetchError,
) {
    if cancel.is_cancelled() {
        segments.close();
    } else {
        warn!(error = %err, "entry chain failed");
        segments.fail(err);
    }
}
