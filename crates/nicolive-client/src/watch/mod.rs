//! The watch channel: a WebSocket session that negotiates viewing
//! parameters and carries control events.
//!
//! The session replies to server `ping`s (keep-alive is strictly on-ping;
//! client timers are unreliable under background throttling), latches the
//! message-server parameters and schedule, and raises reconnect/disconnect
//! events for the supervisor. All inbound frames, including internally
//! handled ones, are forwarded to the caller's shared frame sequence.

use crate::cancel::CancelToken;
use crate::channel::Sender;
use async_trait::async_trait;
use chrono::DateTime;
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

pub mod protocol;

use protocol::{
    CommentOptions, DisconnectReason, PostCommentData, StartWatchingData, StreamSpec,
    WatchReceiveMessage, WatchSendMessage,
};

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("websocket connect failed: {0}")]
    Connect(String),
    #[error("watch protocol error: {0}")]
    Protocol(String),
    #[error("websocket transport error: {0}")]
    Socket(String),
    #[error("server disconnected: {0:?}")]
    Disconnected(DisconnectReason),
    #[error("watch socket closed")]
    SocketClosed,
}

/// Message-server parameters with `vposBaseTime` resolved to epoch ms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageServer {
    pub view_uri: String,
    pub vpos_base_time_ms: i64,
    pub hashed_user_id: Option<String>,
}

/// Program schedule in epoch ms, updated by `schedule` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub begin_ms: i64,
    pub end_ms: i64,
}

/// Session state that outlives a single socket: the supervisor passes the
/// same instance to each rebuilt session so the negotiated parameters are
/// reusable across reconnects.
#[derive(Debug, Default)]
pub struct WatchState {
    message_server: RwLock<Option<MessageServer>>,
    schedule: RwLock<Option<Schedule>>,
}

impl WatchState {
    pub fn message_server(&self) -> Option<MessageServer> {
        self.message_server.read().unwrap().clone()
    }

    pub fn schedule(&self) -> Option<Schedule> {
        *self.schedule.read().unwrap()
    }
}

/// Control events raised to the supervisor.
#[derive(Debug)]
pub enum WatchEvent {
    /// Message-server parameters latched (also stored in [`WatchState`]).
    MessageServer(MessageServer),
    /// Server-initiated migration; reopen with the new token after waiting.
    ReconnectRequest {
        audience_token: String,
        wait_time: Duration,
    },
    /// Terminal disconnect frame.
    Disconnect(DisconnectReason),
    /// Socket closed without a disconnect frame (including transport
    /// errors); non-terminal.
    Closed,
}

/// Socket abstraction so sessions are testable without a network;
/// production uses [`TungsteniteConnector`].
#[async_trait]
pub trait WatchSocket: Send {
    async fn send_text(&mut self, text: String) -> Result<(), WatchError>;
    /// Next text frame; `None` on clean close.
    async fn next_text(&mut self) -> Option<Result<String, WatchError>>;
    async fn close(&mut self);
}

#[async_trait]
pub trait WatchConnector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<Box<dyn WatchSocket>, WatchError>;
}

pub struct TungsteniteConnector;

#[async_trait]
impl WatchConnector for TungsteniteConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn WatchSocket>, WatchError> {
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| WatchError::Connect(err.to_string()))?;
        Ok(Box::new(TungsteniteSocket { stream }))
    }
}

struct TungsteniteSocket {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl WatchSocket for TungsteniteSocket {
    async fn send_text(&mut self, text: String) -> Result<(), WatchError> {
        self.stream
            .send(tungstenite::Message::Text(text))
            .await
            .map_err(|err| WatchError::Socket(err.to_string()))
    }

    async fn next_text(&mut self) -> Option<Result<String, WatchError>> {
        while let Some(message) = self.stream.next().await {
            match message {
                Ok(tungstenite::Message::Text(text)) => return Some(Ok(text)),
                Ok(tungstenite::Message::Close(_)) => return None,
                // Ping/pong and binary frames are not part of the protocol.
                Ok(_) => continue,
                Err(err) => return Some(Err(WatchError::Socket(err.to_string()))),
            }
        }
        None
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

pub struct WatchSession {
    out_tx: mpsc::UnboundedSender<WatchSendMessage>,
    state: Arc<WatchState>,
    cancel: CancelToken,
    task: JoinHandle<()>,
}

impl WatchSession {
    /// Performs the `startWatching` handshake and spawns the frame loop.
    pub async fn open(
        mut socket: Box<dyn WatchSocket>,
        reconnect: bool,
        stream: Option<StreamSpec>,
        state: Arc<WatchState>,
        frames: Sender<WatchReceiveMessage, WatchError>,
        events: mpsc::UnboundedSender<WatchEvent>,
        cancel: CancelToken,
    ) -> Result<Self, WatchError> {
        let start = WatchSendMessage::StartWatching {
            data: StartWatchingData { reconnect, stream },
        };
        let text =
            serde_json::to_string(&start).map_err(|err| WatchError::Protocol(err.to_string()))?;
        socket.send_text(text).await?;
        info!(reconnect, "watch session opened");

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_session(
            socket,
            out_rx,
            state.clone(),
            frames,
            events,
            cancel.clone(),
        ));
        Ok(Self {
            out_tx,
            state,
            cancel,
            task,
        })
    }

    /// Queues a frame; frames are transmitted in call order.
    pub fn send(&self, message: WatchSendMessage) -> Result<(), WatchError> {
        self.out_tx
            .send(message)
            .map_err(|_| WatchError::SocketClosed)
    }

    /// Posts a viewer comment, computing `vpos` from the negotiated base
    /// time and the wall clock.
    pub fn post_comment(
        &self,
        text: impl Into<String>,
        is_anonymous: bool,
        options: CommentOptions,
    ) -> Result<(), WatchError> {
        let base_ms = self
            .state
            .message_server()
            .map(|server| server.vpos_base_time_ms)
            .ok_or_else(|| WatchError::Protocol("message server not negotiated yet".into()))?;
        let vpos = compute_vpos(chrono::Utc::now().timestamp_millis(), base_ms);
        self.send(WatchSendMessage::PostComment {
            data: PostCommentData {
                text: text.into(),
                vpos,
                is_anonymous,
                color: options.color,
                size: options.size,
                position: options.position,
                font: options.font,
            },
        })
    }

    pub fn state(&self) -> Arc<WatchState> {
        self.state.clone()
    }

    /// Signals the frame loop to close the socket and exit.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub async fn close(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Centiseconds since the program's `vpos = 0` reference.
pub fn compute_vpos(now_ms: i64, base_ms: i64) -> i64 {
    ((now_ms - base_ms) as f64 / 10.0).round() as i64
}

enum Flow {
    Continue,
    Stop,
}

async fn run_session(
    mut socket: Box<dyn WatchSocket>,
    mut out_rx: mpsc::UnboundedReceiver<WatchSendMessage>,
    state: Arc<WatchState>,
    frames: Sender<WatchReceiveMessage, WatchError>,
    events: mpsc::UnboundedSender<WatchEvent>,
    cancel: CancelToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                socket.close().await;
                return;
            }
            outbound = out_rx.recv() => match outbound {
                Some(message) => {
                    let text = match serde_json::to_string(&message) {
                        Ok(text) => text,
                        Err(err) => {
                            warn!(error = %err, "dropping unserializable outbound frame");
                            continue;
                        }
                    };
                    if let Err(err) = socket.send_text(text).await {
                        warn!(error = %err, "watch send failed");
                        let _ = events.send(WatchEvent::Closed);
                        return;
                    }
                }
                // Session handle dropped; shut the socket down.
                None => {
                    socket.close().await;
                    return;
                }
            },
            frame = socket.next_text() => match frame {
                Some(Ok(text)) => {
                    if let Flow::Stop =
                        handle_frame(&text, &mut socket, &state, &frames, &events).await
                    {
                        return;
                    }
                }
                Some(Err(err)) => {
                    warn!(error = %err, "watch socket errored");
                    let _ = events.send(WatchEvent::Closed);
                    return;
                }
                None => {
                    debug!("watch socket closed by server");
                    let _ = events.send(WatchEvent::Closed);
                    return;
                }
            },
        }
    }
}

async fn handle_frame(
    text: &str,
    socket: &mut Box<dyn WatchSocket>,
    state: &Arc<WatchState>,
    frames: &Sender<WatchReceiveMessage, WatchError>,
    events: &mpsc::UnboundedSender<WatchEvent>,
) -> Flow {
    let message: WatchReceiveMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(err) => {
            warn!(error = %err, frame = text, "unparseable watch frame");
            return Flow::Continue;
        }
    };

    let flow = match &message {
        // Keep-alive rides on the server ping; both replies go out before
        // the next inbound frame is serviced.
        WatchReceiveMessage::Ping => {
            for reply in [WatchSendMessage::Pong, WatchSendMessage::KeepSeat] {
                let text = serde_json::to_string(&reply).expect("static frames serialize");
                if let Err(err) = socket.send_text(text).await {
                    warn!(error = %err, "keep-alive send failed");
                    let _ = events.send(WatchEvent::Closed);
                    return Flow::Stop;
                }
            }
            Flow::Continue
        }
        WatchReceiveMessage::Schedule { data } => {
            match (parse_iso_ms(&data.begin), parse_iso_ms(&data.end)) {
                (Some(begin_ms), Some(end_ms)) => {
                    *state.schedule.write().unwrap() = Some(Schedule { begin_ms, end_ms });
                }
                _ => warn!(begin = %data.begin, end = %data.end, "unparseable schedule"),
            }
            Flow::Continue
        }
        WatchReceiveMessage::MessageServer { data } => {
            match parse_iso_ms(&data.vpos_base_time) {
                Some(vpos_base_time_ms) => {
                    let server = MessageServer {
                        view_uri: data.view_uri.clone(),
                        vpos_base_time_ms,
                        hashed_user_id: data.hashed_user_id.clone(),
                    };
                    *state.message_server.write().unwrap() = Some(server.clone());
                    let _ = events.send(WatchEvent::MessageServer(server));
                }
                None => warn!(raw = %data.vpos_base_time, "unparseable vposBaseTime"),
            }
            Flow::Continue
        }
        WatchReceiveMessage::Reconnect { data } => {
            info!(wait_time_sec = data.wait_time_sec, "server requested migration");
            let _ = events.send(WatchEvent::ReconnectRequest {
                audience_token: data.audience_token.clone(),
                wait_time: Duration::from_secs(data.wait_time_sec),
            });
            socket.close().await;
            Flow::Stop
        }
        WatchReceiveMessage::Disconnect { data } => {
            info!(reason = ?data.reason, "server disconnected the session");
            let _ = events.send(WatchEvent::Disconnect(data.reason));
            socket.close().await;
            Flow::Stop
        }
        // `seat` needs no action: keep-alive is piggybacked on ping.
        _ => Flow::Continue,
    };

    frames.push(message);
    flow
}

fn parse_iso_ms(raw: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|at| at.timestamp_millis())
}
