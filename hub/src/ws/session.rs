use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures::stream::{SplitSink, SplitStream, StreamExt};
use futures::SinkExt;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::{AuthData, Envelope};
use crate::error::HubError;
use crate::state::AppState;

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

/// Lifecycle of one replay connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    AwaitingAuth,
    Streaming,
    Closing,
    Closed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Outbound frames buffered between the pipeline and the socket writer.
    pub sink_capacity: usize,
    /// Pause between sending the close frame and dropping the transport.
    pub close_grace: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            sink_capacity: 64,
            close_grace: Duration::from_millis(100),
        }
    }
}

/// Counts the session as active on `AppState` until dropped.
struct ActiveSession(Arc<AppState>);

impl ActiveSession {
    fn enter(state: &Arc<AppState>) -> Self {
        state.session_opened();
        Self(Arc::clone(state))
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.0.session_closed();
    }
}

#[derive(Clone)]
struct Status(Arc<Mutex<SessionState>>);

impl Status {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(SessionState::Connected)))
    }

    fn get(&self) -> SessionState {
        *self.0.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set(&self, next: SessionState) {
        let mut cur = self.0.lock().unwrap_or_else(|p| p.into_inner());
        if *cur != next {
            tracing::debug!(from = ?*cur, to = ?next, "session state");
            *cur = next;
        }
    }

    /// Record a cancellation unless the session already finished its work.
    fn cancelled(&self) {
        let mut cur = self.0.lock().unwrap_or_else(|p| p.into_inner());
        if matches!(*cur, SessionState::Connected | SessionState::AwaitingAuth | SessionState::Streaming) {
            tracing::debug!(from = ?*cur, "session cancelled");
            *cur = SessionState::Cancelled;
        }
    }
}

/// Drive one replay connection to completion.
///
/// Three tasks share a cancellation token derived from the process shutdown
/// token: the reader (inbound frames, auth hand-off), the authenticator (one
/// resolve plus one pipeline run) and the writer (outbound frames). Once all
/// three finish the socket is closed with `1000 "bye"`.
pub async fn run_session(socket: WebSocket, state: Arc<AppState>) {
    let settings = SessionSettings {
        sink_capacity: state.config.sink_capacity,
        close_grace: state.config.close_grace(),
    };
    let span = tracing::info_span!("replay_session", session_id = %uuid::Uuid::new_v4());
    drive(socket, state, settings).instrument(span).await
}

async fn drive(socket: WebSocket, state: Arc<AppState>, settings: SessionSettings) {
    let _active = ActiveSession::enter(&state);
    let status = Status::new();
    let cancel = state.shutdown.child_token();
    let (ws_tx, ws_rx) = socket.split();

    let (auth_tx, auth_rx) = oneshot::channel::<Value>();
    let (authed_tx, authed_rx) = oneshot::channel::<()>();
    let (sink_tx, sink_rx) = mpsc::channel::<String>(settings.sink_capacity.max(1));

    tracing::info!("replay session connected");
    status.set(SessionState::AwaitingAuth);

    let span = tracing::Span::current();
    let reader = tokio::spawn(
        read_loop(ws_rx, auth_tx, authed_rx, cancel.clone(), status.clone()).instrument(span.clone()),
    );
    let authenticator = tokio::spawn(
        authenticate_and_stream(
            Arc::clone(&state),
            auth_rx,
            authed_tx,
            sink_tx,
            cancel.clone(),
            status.clone(),
        )
        .instrument(span.clone()),
    );
    let writer = tokio::spawn(write_loop(ws_tx, sink_rx, cancel.clone()).instrument(span));

    let (reader, authenticator, writer) = tokio::join!(reader, authenticator, writer);
    for (task, res) in [("reader", reader), ("authenticator", authenticator)] {
        if let Err(e) = res {
            tracing::error!(task, error = %e, "session task failed");
        }
    }

    if status.get() != SessionState::Cancelled {
        status.set(SessionState::Closing);
    }
    match writer {
        Ok(ws_tx) => close_gracefully(ws_tx, settings.close_grace).await,
        Err(e) => tracing::error!(task = "writer", error = %e, "session task failed"),
    }

    let outcome = status.get();
    status.set(SessionState::Closed);
    tracing::info!(outcome = ?outcome, "replay session closed");
}

async fn read_loop(
    mut ws_rx: WsStream,
    auth_tx: oneshot::Sender<Value>,
    authed_rx: oneshot::Receiver<()>,
    cancel: CancellationToken,
    status: Status,
) {
    let mut auth_tx = Some(auth_tx);
    let mut authed_rx = Some(authed_rx);

    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = ws_rx.next() => frame,
        };

        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(frame))) => {
                tracing::debug!(?frame, "peer closed the connection");
                status.cancelled();
                cancel.cancel();
                break;
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Binary(bytes))) => {
                let err = HubError::Protocol(format!("binary frame ({} bytes)", bytes.len()));
                tracing::warn!(error = %err, "skipping frame");
                continue;
            }
            Some(Err(e)) => {
                let err = HubError::AbnormalClose(e.to_string());
                tracing::warn!(error = %err, "read failed");
                status.cancelled();
                cancel.cancel();
                break;
            }
            None => {
                let err = HubError::AbnormalClose("stream ended without close frame".into());
                tracing::warn!(error = %err, "read failed");
                status.cancelled();
                cancel.cancel();
                break;
            }
        };

        let envelope = match Envelope::parse(text.as_str()) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "skipping frame");
                continue;
            }
        };

        if !envelope.is_auth() {
            tracing::debug!(msg_type = %envelope.msg_type, "ignoring message");
            continue;
        }

        let Some(tx) = auth_tx.take() else {
            tracing::warn!("ignoring repeated auth message");
            continue;
        };
        if tx.send(envelope.data).is_err() {
            break;
        }

        // Hold further reads until the authenticator has accepted or rejected
        // the payload. A dropped sender means it gave up and cancelled.
        if let Some(rx) = authed_rx.take() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = rx => {}
            }
        }
    }
}

async fn authenticate_and_stream(
    state: Arc<AppState>,
    auth_rx: oneshot::Receiver<Value>,
    authed_tx: oneshot::Sender<()>,
    sink: mpsc::Sender<String>,
    cancel: CancellationToken,
    status: Status,
) {
    let data = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        data = auth_rx => match data {
            Ok(data) => data,
            Err(_) => return,
        },
    };

    let auth = match AuthData::from_value(data) {
        Ok(auth) => auth,
        Err(e) => {
            tracing::warn!(error = %e, "auth rejected");
            status.cancelled();
            cancel.cancel();
            return;
        }
    };
    let _ = authed_tx.send(());

    let descriptor = match state.registry.resolve(&auth.channel, &auth.token) {
        Ok(descriptor) => descriptor,
        Err(e) => {
            tracing::warn!(channel = %auth.channel, error = %e, "auth rejected");
            status.cancelled();
            cancel.cancel();
            return;
        }
    };

    status.set(SessionState::Streaming);
    tracing::info!(
        channel = %auth.channel,
        exchange = %descriptor.exchange,
        symbol = %descriptor.symbol,
        interval = %descriptor.interval,
        playback_speed = descriptor.playback_speed,
        start = %descriptor.start,
        end = %descriptor.end,
        "replay started"
    );

    match state.pipeline().run(descriptor, sink, cancel.clone()).await {
        Ok(summary) if summary.cancelled => {
            status.cancelled();
            tracing::info!(emitted = summary.emitted, pages = summary.pages, "replay cancelled");
        }
        Ok(summary) => {
            tracing::info!(emitted = summary.emitted, pages = summary.pages, "replay finished");
        }
        Err(e) => {
            status.cancelled();
            tracing::error!(error = %e, "replay failed");
        }
    }
    cancel.cancel();
}

/// Forward queued frames to the socket. Frames already queued are flushed
/// before cancellation is observed. Returns the sink half for the close frame.
async fn write_loop(
    mut ws_tx: WsSink,
    mut sink_rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
) -> WsSink {
    loop {
        let frame = tokio::select! {
            biased;
            frame = sink_rx.recv() => frame,
            _ = cancel.cancelled() => None,
        };
        let Some(frame) = frame else { break };

        // A failed send leaves the socket unusable. The reader sees the same
        // failure and cancels the session.
        if let Err(e) = ws_tx.send(Message::Text(frame.into())).await {
            if cancel.is_cancelled() || is_connection_closing(&e) {
                tracing::debug!(error = %e, "writer stopping: connection closing");
            } else {
                tracing::warn!(error = %e, "write failed");
            }
            break;
        }
    }
    ws_tx
}

/// True when `err` comes from a transport the peer already tore down.
fn is_connection_closing(err: &axum::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> =
        Some(err as &(dyn std::error::Error + 'static));
    while let Some(e) = source {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            return matches!(
                io.kind(),
                std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset
            );
        }
        source = e.source();
    }
    false
}

async fn close_gracefully(mut ws_tx: WsSink, grace: Duration) {
    let frame = CloseFrame {
        code: close_code::NORMAL,
        reason: "bye".into(),
    };
    if let Err(e) = ws_tx.send(Message::Close(Some(frame))).await {
        tracing::debug!(error = %e, "close frame not sent");
        return;
    }
    tokio::time::sleep(grace).await;
    if let Err(e) = ws_tx.close().await {
        tracing::debug!(error = %e, "transport close failed");
    }
}
