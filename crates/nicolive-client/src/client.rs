//! Connection supervisor.
//!
//! Owns one watch session plus the entry/message fetcher pair, applies the
//! reconnect policy on migration, socket loss, or network-class fetch
//! errors, and presents the caller one continuous message sequence across
//! reconnects. The consumer-facing channels and the backward walk position
//! outlive any individual connection epoch.

use crate::cancel::CancelToken;
use crate::channel::{self, Receiver, Sender};
use crate::comment::{BroadcasterComment, BroadcasterCommentClient, CommentError};
use crate::fetch::{
    BackwardFetch, BackwardFetcher, BackwardState, EntryFetcher, EntryFrom, FetchError,
    FetchSignal, HttpSegmentClient, MessageFetcher, SegmentClient,
};
use crate::page::NicolivePageData;
use crate::watch::protocol::{
    CommentOptions, DisconnectReason, StreamSpec, WatchReceiveMessage, WatchSendMessage,
};
use crate::watch::{
    MessageServer, Schedule, TungsteniteConnector, WatchConnector, WatchError, WatchEvent,
    WatchSession, WatchState,
};
use nicolive_proto::pb::ChunkedMessage;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

/// Fixed backoff schedule; its length is the reconnect attempt budget.
pub const RECONNECT_DELAYS: [Duration; 5] = [
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(15),
    Duration::from_secs(30),
    Duration::from_secs(30),
];

/// How long a fresh connection may take to deliver `messageServer` before
/// the attempt falls back to cached parameters (reconnect) or fails.
const MESSAGE_SERVER_WAIT: Duration = Duration::from_secs(15);

const AUDIENCE_TOKEN_PARAM: &str = "audience_token";

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error(transparent)]
    Watch(#[from] WatchError),
    #[error("message fetch failed: {0}")]
    Fetch(Arc<FetchError>),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("message server parameters were not provided")]
    MissingMessageServer,
    #[error("connector is closed")]
    Closed,
    #[error("page data lacks a broadcaster comment token")]
    MissingCommentToken,
    #[error(transparent)]
    Comment(#[from] CommentError),
}

/// Supervisor state, published on a `watch` channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Connecting,
    Opened,
    Reconnecting,
    Disconnected,
    ReconnectFailed,
}

#[derive(Debug, Clone)]
pub struct ConnectorOptions {
    /// Where the entry chain starts on first connect.
    pub from: EntryFrom,
    /// Stream parameters for `startWatching`, when a media stream is wanted.
    pub stream: Option<StreamSpec>,
}

impl Default for ConnectorOptions {
    fn default() -> Self {
        Self {
            from: EntryFrom::Now,
            stream: None,
        }
    }
}

pub struct NicoliveClientBuilder {
    page: NicolivePageData,
    options: ConnectorOptions,
    watch_connector: Arc<dyn WatchConnector>,
    segment_client: Option<Arc<dyn SegmentClient>>,
}

impl NicoliveClientBuilder {
    pub fn new(page: NicolivePageData) -> Self {
        Self {
            page,
            options: ConnectorOptions::default(),
            watch_connector: Arc::new(TungsteniteConnector),
            segment_client: None,
        }
    }

    pub fn from(mut self, from: EntryFrom) -> Self {
        self.options.from = from;
        self
    }

    pub fn stream(mut self, stream: StreamSpec) -> Self {
        self.options.stream = Some(stream);
        self
    }

    pub fn watch_connector(mut self, connector: Arc<dyn WatchConnector>) -> Self {
        self.watch_connector = connector;
        self
    }

    pub fn segment_client(mut self, client: Arc<dyn SegmentClient>) -> Self {
        self.segment_client = Some(client);
        self
    }

    /// Establishes the first connection epoch and spawns the supervisor.
    pub async fn connect(self) -> Result<NicoliveClient, ConnectorError> {
        let ws_url = Url::parse(&self.page.websocket_url)
            .map_err(|err| ConnectorError::InvalidUrl(err.to_string()))?;
        let segment_client = match self.segment_client {
            Some(client) => client,
            None => Arc::new(
                HttpSegmentClient::new().map_err(|err| ConnectorError::Fetch(Arc::new(err)))?,
            ),
        };

        let (messages_tx, messages_rx) = channel::channel();
        let (frames_tx, frames_rx) = channel::channel();
        let (state_tx, state_rx) = watch::channel(ConnectorState::Connecting);
        let cancel = CancelToken::new();
        let watch_state = Arc::new(WatchState::default());
        let backward_state = Arc::new(BackwardState::default());
        let shared_session = Arc::new(RwLock::new(None));

        let mut supervisor = Supervisor {
            watch_connector: self.watch_connector,
            segment_client: segment_client.clone(),
            ws_url,
            options: self.options,
            watch_state: watch_state.clone(),
            backward_state: backward_state.clone(),
            messages_tx,
            frames_tx,
            state_tx,
            shared_session: shared_session.clone(),
            cancel: cancel.clone(),
            carry: Carryover::default(),
        };

        // The state stays `Connecting` until the entry chain has emitted its
        // first forward segment and the first segment fetch has succeeded;
        // the supervisor loop flips it on the fetchers' readiness latches.
        let epoch = supervisor.establish(false).await?;
        let task = tokio::spawn(supervisor.run(epoch));

        Ok(NicoliveClient {
            page: self.page,
            messages_rx,
            frames_rx,
            state_rx,
            watch_state,
            backward: BackwardFetcher::new(segment_client, backward_state),
            shared_session,
            cancel,
            supervisor: Mutex::new(Some(task)),
        })
    }
}

pub struct NicoliveClient {
    page: NicolivePageData,
    messages_rx: Receiver<ChunkedMessage, FetchError>,
    frames_rx: Receiver<WatchReceiveMessage, WatchError>,
    state_rx: watch::Receiver<ConnectorState>,
    watch_state: Arc<WatchState>,
    backward: BackwardFetcher,
    shared_session: Arc<RwLock<Option<Arc<WatchSession>>>>,
    cancel: CancelToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl NicoliveClient {
    /// Connects with default transports.
    pub async fn connect(page: NicolivePageData) -> Result<Self, ConnectorError> {
        NicoliveClientBuilder::new(page).connect().await
    }

    pub fn builder(page: NicolivePageData) -> NicoliveClientBuilder {
        NicoliveClientBuilder::new(page)
    }

    /// Shared live message sequence. Receivers race; each message is
    /// delivered to exactly one of them.
    pub fn messages(&self) -> Receiver<ChunkedMessage, FetchError> {
        self.messages_rx.clone()
    }

    /// Shared watch-frame sequence (every inbound ws frame, across
    /// reconnects).
    pub fn watch_frames(&self) -> Receiver<WatchReceiveMessage, WatchError> {
        self.frames_rx.clone()
    }

    pub fn state(&self) -> watch::Receiver<ConnectorState> {
        self.state_rx.clone()
    }

    pub fn current_state(&self) -> ConnectorState {
        *self.state_rx.borrow()
    }

    pub fn page_data(&self) -> &NicolivePageData {
        &self.page
    }

    pub fn schedule(&self) -> Option<Schedule> {
        self.watch_state.schedule()
    }

    pub fn message_server(&self) -> Option<MessageServer> {
        self.watch_state.message_server()
    }

    /// Starts a backward history walk; `None` while one is in flight or no
    /// backward pointer is known yet. `max_pages == 0` means unbounded.
    pub fn backward_messages(
        &self,
        delay: Duration,
        max_pages: usize,
        snapshot: bool,
    ) -> Option<BackwardFetch> {
        self.backward.fetch(delay, max_pages, snapshot)
    }

    pub fn send(&self, message: WatchSendMessage) -> Result<(), ConnectorError> {
        self.session()?.send(message).map_err(ConnectorError::from)
    }

    pub fn post_comment(
        &self,
        text: impl Into<String>,
        is_anonymous: bool,
        options: CommentOptions,
    ) -> Result<(), ConnectorError> {
        self.session()?
            .post_comment(text, is_anonymous, options)
            .map_err(ConnectorError::from)
    }

    /// REST client for the pinned broadcaster comment, using the token from
    /// the watch page.
    pub fn broadcaster_comment_client(&self) -> Result<BroadcasterCommentClient, ConnectorError> {
        let token = self
            .page
            .broadcaster_comment_token
            .as_deref()
            .ok_or(ConnectorError::MissingCommentToken)?;
        Ok(BroadcasterCommentClient::new(&self.page.live_id, token)?)
    }

    pub async fn put_broadcaster_comment(
        &self,
        comment: &BroadcasterComment,
    ) -> Result<(), ConnectorError> {
        Ok(self.broadcaster_comment_client()?.put(comment).await?)
    }

    pub async fn delete_broadcaster_comment(&self) -> Result<(), ConnectorError> {
        Ok(self.broadcaster_comment_client()?.delete().await?)
    }

    /// Cooperative shutdown; resolves once the supervisor has torn down.
    pub async fn close(&self) {
        self.cancel.cancel();
        let task = self.supervisor.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    fn session(&self) -> Result<Arc<WatchSession>, ConnectorError> {
        self.shared_session
            .read()
            .unwrap()
            .clone()
            .ok_or(ConnectorError::Closed)
    }
}

impl Drop for NicoliveClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Cross-reconnect resume state. The backward walk position lives in
/// [`BackwardState`] and carries over by construction.
#[derive(Debug, Clone, Default)]
struct Carryover {
    last_entry_at: Option<i64>,
    last_meta_id: Option<String>,
}

struct Epoch {
    session: Arc<WatchSession>,
    entry: EntryFetcher,
    message: MessageFetcher,
    watch_events: mpsc::UnboundedReceiver<WatchEvent>,
    fetch_signals: mpsc::UnboundedReceiver<FetchSignal>,
    signals_open: bool,
    /// One-shot latches: first forward segment emission and first
    /// successful segment fetch. Both must resolve before the initial
    /// `Opened` transition.
    entry_ready: Option<oneshot::Receiver<()>>,
    message_ready: Option<oneshot::Receiver<()>>,
    entry_fired: bool,
    message_fired: bool,
    cancel: CancelToken,
}

enum Trigger {
    /// Caller close().
    Close,
    /// Program ended (state message or END_PROGRAM disconnect).
    Ended,
    /// Errorful server disconnect; terminal.
    Terminal(DisconnectReason),
    /// Fetch error already surfaced on the message sequence; terminal.
    Fatal,
    Reconnect {
        wait: Option<Duration>,
        audience_token: Option<String>,
    },
}

enum ReconnectOutcome {
    Connected(Epoch),
    Terminal(DisconnectReason),
    Exhausted,
    Cancelled,
}

struct Supervisor {
    watch_connector: Arc<dyn WatchConnector>,
    segment_client: Arc<dyn SegmentClient>,
    ws_url: Url,
    options: ConnectorOptions,
    watch_state: Arc<WatchState>,
    backward_state: Arc<BackwardState>,
    messages_tx: Sender<ChunkedMessage, FetchError>,
    frames_tx: Sender<WatchReceiveMessage, WatchError>,
    state_tx: watch::Sender<ConnectorState>,
    shared_session: Arc<RwLock<Option<Arc<WatchSession>>>>,
    cancel: CancelToken,
    carry: Carryover,
}

impl Supervisor {
    fn set_state(&self, state: ConnectorState) {
        info!(?state, "connector state");
        self.state_tx.send_replace(state);
    }

    /// Builds one connection epoch: watch session, message-server
    /// negotiation, entry and message fetchers.
    async fn establish(&mut self, reconnect: bool) -> Result<Epoch, ConnectorError> {
        let epoch_cancel = self.cancel.child();
        let (watch_tx, mut watch_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        let socket = self.watch_connector.connect(&self.ws_url).await?;
        let session = Arc::new(
            WatchSession::open(
                socket,
                reconnect,
                self.options.stream.clone(),
                self.watch_state.clone(),
                self.frames_tx.clone(),
                watch_tx,
                epoch_cancel.clone(),
            )
            .await?,
        );

        let server = match self.wait_for_message_server(&mut watch_rx, reconnect).await {
            Ok(server) => server,
            Err(err) => {
                session.abort();
                return Err(err);
            }
        };
        let view_uri = Url::parse(&server.view_uri)
            .map_err(|err| ConnectorError::InvalidUrl(err.to_string()))?;

        let from = match (reconnect, self.carry.last_entry_at) {
            (true, Some(at)) => EntryFrom::At(at),
            _ => self.options.from,
        };
        let skip_to = if reconnect {
            self.carry.last_meta_id.clone()
        } else {
            None
        };

        let (segment_tx, segment_rx) = channel::channel();
        let (entry_ready_tx, entry_ready_rx) = oneshot::channel();
        let (message_ready_tx, message_ready_rx) = oneshot::channel();
        let entry = EntryFetcher::spawn(
            self.segment_client.clone(),
            view_uri,
            from,
            segment_tx,
            self.backward_state.clone(),
            entry_ready_tx,
            epoch_cancel.clone(),
        );
        let message = MessageFetcher::spawn(
            self.segment_client.clone(),
            segment_rx,
            self.messages_tx.clone(),
            skip_to,
            message_ready_tx,
            signal_tx,
            epoch_cancel.clone(),
        );

        *self.shared_session.write().unwrap() = Some(session.clone());
        Ok(Epoch {
            session,
            entry,
            message,
            watch_events: watch_rx,
            fetch_signals: signal_rx,
            signals_open: true,
            entry_ready: Some(entry_ready_rx),
            message_ready: Some(message_ready_rx),
            entry_fired: false,
            message_fired: false,
            cancel: epoch_cancel,
        })
    }

    /// A fresh connection must deliver `messageServer`; a reconnect may fall
    /// back to the parameters negotiated before. Failing both is a protocol
    /// error.
    async fn wait_for_message_server(
        &self,
        watch_rx: &mut mpsc::UnboundedReceiver<WatchEvent>,
        reconnect: bool,
    ) -> Result<MessageServer, ConnectorError> {
        let fresh = tokio::time::timeout(MESSAGE_SERVER_WAIT, async {
            while let Some(event) = watch_rx.recv().await {
                match event {
                    WatchEvent::MessageServer(server) => return Ok(server),
                    WatchEvent::Disconnect(reason) => {
                        return Err(ConnectorError::Watch(WatchError::Disconnected(reason)));
                    }
                    // A socket that dies during the handshake fails this
                    // attempt outright.
                    WatchEvent::ReconnectRequest { .. } | WatchEvent::Closed => break,
                }
            }
            Err(ConnectorError::Watch(WatchError::SocketClosed))
        })
        .await;

        match fresh {
            Ok(result) => result,
            // Alive but silent: a reconnect may reuse the parameters
            // negotiated before.
            Err(_elapsed) if reconnect => self
                .watch_state
                .message_server()
                .ok_or(ConnectorError::MissingMessageServer),
            Err(_elapsed) => Err(ConnectorError::MissingMessageServer),
        }
    }

    async fn run(mut self, mut epoch: Epoch) {
        loop {
            let trigger = self.wait_trigger(&mut epoch).await;
            self.teardown(&epoch);

            match trigger {
                Trigger::Close => {
                    debug!("connector closed by caller");
                    self.finish(ConnectorState::Disconnected);
                    return;
                }
                Trigger::Ended => {
                    info!("program ended");
                    self.finish(ConnectorState::Disconnected);
                    return;
                }
                Trigger::Terminal(reason) => {
                    warn!(?reason, "server terminated the session");
                    self.finish(ConnectorState::Disconnected);
                    return;
                }
                Trigger::Fatal => {
                    self.finish(ConnectorState::Disconnected);
                    return;
                }
                Trigger::Reconnect {
                    wait,
                    audience_token,
                } => {
                    if let Some(token) = audience_token {
                        rotate_audience_token(&mut self.ws_url, &token);
                    }
                    self.set_state(ConnectorState::Reconnecting);
                    match self.reconnect_loop(wait).await {
                        ReconnectOutcome::Connected(next) => {
                            epoch = next;
                            self.set_state(ConnectorState::Opened);
                        }
                        ReconnectOutcome::Terminal(reason) => {
                            warn!(?reason, "server terminated the session during reconnect");
                            self.finish(ConnectorState::Disconnected);
                            return;
                        }
                        ReconnectOutcome::Cancelled => {
                            self.finish(ConnectorState::Disconnected);
                            return;
                        }
                        ReconnectOutcome::Exhausted => {
                            self.messages_tx.fail(FetchError::Network(
                                "reconnect attempts exhausted".into(),
                            ));
                            self.finish(ConnectorState::ReconnectFailed);
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn wait_trigger(&self, epoch: &mut Epoch) -> Trigger {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Trigger::Close,
                event = epoch.watch_events.recv() => match event {
                    // Parameters were refreshed; already latched in WatchState.
                    Some(WatchEvent::MessageServer(_)) => continue,
                    Some(WatchEvent::ReconnectRequest { audience_token, wait_time }) => {
                        return Trigger::Reconnect {
                            wait: Some(wait_time),
                            audience_token: Some(audience_token),
                        };
                    }
                    Some(WatchEvent::Disconnect(reason)) => {
                        return if reason.is_normal() {
                            Trigger::Ended
                        } else {
                            Trigger::Terminal(reason)
                        };
                    }
                    Some(WatchEvent::Closed) | None => {
                        return Trigger::Reconnect { wait: None, audience_token: None };
                    }
                },
                // Readiness resolves before any fetch signal from the same
                // segment, so an instantly-ending program still passes
                // through `Opened`.
                ready = async { epoch.entry_ready.as_mut().expect("checked by the branch precondition").await },
                    if epoch.entry_ready.is_some() =>
                {
                    epoch.entry_ready = None;
                    if ready.is_ok() {
                        epoch.entry_fired = true;
                    }
                    self.flip_opened_if_ready(epoch);
                }
                ready = async { epoch.message_ready.as_mut().expect("checked by the branch precondition").await },
                    if epoch.message_ready.is_some() =>
                {
                    epoch.message_ready = None;
                    if ready.is_ok() {
                        epoch.message_fired = true;
                    }
                    self.flip_opened_if_ready(epoch);
                }
                signal = epoch.fetch_signals.recv(), if epoch.signals_open => match signal {
                    Some(FetchSignal::Ended) => return Trigger::Ended,
                    Some(FetchSignal::Reconnect(_)) => {
                        return Trigger::Reconnect { wait: None, audience_token: None };
                    }
                    Some(FetchSignal::Fatal(_)) => return Trigger::Fatal,
                    // Fetchers finished (entry chain complete); the ws side
                    // alone decides what happens next.
                    None => epoch.signals_open = false,
                },
            }
        }
    }

    /// Initial `Connecting → Opened` transition: watch handshake done (a
    /// precondition of the epoch existing), first forward segment emitted,
    /// first segment fetch succeeded. Rebuilt epochs transition on rebuild
    /// success instead, so this only fires out of `Connecting`.
    fn flip_opened_if_ready(&self, epoch: &Epoch) {
        if epoch.entry_fired
            && epoch.message_fired
            && *self.state_tx.borrow() == ConnectorState::Connecting
        {
            self.set_state(ConnectorState::Opened);
        }
    }

    /// Snapshots carryover, then cancels the epoch's tasks.
    fn teardown(&mut self, epoch: &Epoch) {
        if let Some(at) = epoch.entry.last_entry_at() {
            self.carry.last_entry_at = Some(at);
        }
        if let Some(id) = epoch.message.last_meta_id() {
            self.carry.last_meta_id = Some(id);
        }
        debug!(carry = ?self.carry, "epoch torn down");
        epoch.cancel.cancel();
        epoch.session.abort();
        *self.shared_session.write().unwrap() = None;
    }

    async fn reconnect_loop(&mut self, server_wait: Option<Duration>) -> ReconnectOutcome {
        // A server migration dictates its own wait before the first attempt.
        let mut first_wait = server_wait;
        for (attempt, delay) in RECONNECT_DELAYS.iter().enumerate() {
            let wait = first_wait.take().unwrap_or(*delay);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return ReconnectOutcome::Cancelled,
                _ = tokio::time::sleep(wait) => {}
            }
            info!(attempt = attempt + 1, "reconnecting");
            match self.establish(true).await {
                Ok(epoch) => return ReconnectOutcome::Connected(epoch),
                Err(ConnectorError::Watch(WatchError::Disconnected(reason)))
                    if !reason.is_normal() =>
                {
                    return ReconnectOutcome::Terminal(reason);
                }
                Err(err) => {
                    warn!(attempt = attempt + 1, error = %err, "reconnect attempt failed");
                }
            }
            if self.cancel.is_cancelled() {
                return ReconnectOutcome::Cancelled;
            }
        }
        ReconnectOutcome::Exhausted
    }

    fn finish(&self, state: ConnectorState) {
        self.messages_tx.close();
        self.frames_tx.close();
        self.set_state(state);
    }
}

fn rotate_audience_token(url: &mut Url, token: &str) {
    let retained: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| key != AUDIENCE_TOKEN_PARAM)
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    url.query_pairs_mut()
        .clear()
        .extend_pairs(retained)
        .append_pair(AUDIENCE_TOKEN_PARAM, token);
}
