//! One WebSocket connection, from upgrade through disconnect.
//!
//! Each connection runs four cooperating parts:
//!
//! - the reader (this task): decodes frames and counts protocol strikes
//! - a dispatcher: routes decoded messages through the session manager in
//!   arrival order
//! - a writer: drains the session outbox, sends pings, flushes on close
//! - a heartbeat: closes the session when the peer goes silent
//!
//! Whatever ends first moves the session to `Closing`; the others observe
//! the session's closing signal and wind down.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message as WsMessage, Utf8Bytes, WebSocket};
use blum_core::{ConnectionId, ErrorCode, InboundFrame, Message, Outgoing, SessionError};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::connection::ConnectionLiveness;
use super::heartbeat::{HeartbeatResult, run_heartbeat};
use crate::config::ServerConfig;
use crate::session::{CloseReason, Outbox, Session, SessionManager};

/// Decoded messages buffered between the reader and the dispatcher.
const INBOUND_QUEUE: usize = 64;

/// Upper bound on sending the final Close frame.
const CLOSE_SEND_TIMEOUT: Duration = Duration::from_secs(1);

const MIN_PING_INTERVAL: Duration = Duration::from_millis(1);

type WsSink = SplitSink<WebSocket, WsMessage>;

/// Serve one upgraded socket until the session closes.
#[instrument(skip_all, fields(connection_id = %connection_id))]
pub async fn run_connection(
    socket: WebSocket,
    connection_id: ConnectionId,
    sessions: SessionManager,
    config: Arc<ServerConfig>,
) {
    let started = Instant::now();
    counter!("ws_connections_total").increment(1);

    let (session, outbox) = match sessions.open_session(connection_id).await {
        Ok(pair) => pair,
        Err(err) => {
            refuse(socket, &err).await;
            return;
        }
    };
    gauge!("ws_connections_active").increment(1.0);

    let (ws_tx, ws_rx) = socket.split();
    let liveness = Arc::new(ConnectionLiveness::new());

    let mut writer = tokio::spawn(run_writer(
        ws_tx,
        outbox,
        Arc::clone(&session),
        config.heartbeat_interval,
        config.flush_timeout,
    ));

    let heartbeat_cancel = CancellationToken::new();
    let heartbeat = tokio::spawn(watch_heartbeat(
        Arc::clone(&session),
        Arc::clone(&liveness),
        config.heartbeat_interval,
        config.heartbeat_timeout,
        heartbeat_cancel.clone(),
    ));

    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
    let _dispatcher = tokio::spawn(run_dispatcher(sessions.clone(), inbound_rx));

    let reason = read_frames(
        ws_rx,
        &session,
        &liveness,
        &inbound_tx,
        config.max_protocol_errors,
    )
    .await;
    drop(inbound_tx);
    heartbeat_cancel.cancel();

    let _ = sessions.close_session(session.id(), reason).await;
    let grace = config.flush_timeout + CLOSE_SEND_TIMEOUT;
    if time::timeout(grace, &mut writer).await.is_err() {
        warn!("writer did not finish within {grace:?}, aborting");
        writer.abort();
    }
    let _ = heartbeat.await;

    gauge!("ws_connections_active").decrement(1.0);
    histogram!("ws_connection_duration_seconds").record(started.elapsed().as_secs_f64());
    info!(
        session_id = %session.id(),
        reason = %session.close_reason().unwrap_or(reason),
        "connection finished"
    );
}

/// Close frame carrying `reason`'s code and text.
pub fn close_message(reason: CloseReason) -> WsMessage {
    WsMessage::Close(Some(CloseFrame {
        code: reason.code(),
        reason: Utf8Bytes::from_static(reason.as_str()),
    }))
}

async fn refuse(mut socket: WebSocket, err: &SessionError) {
    warn!(error = %err, "connection refused");
    let _ = time::timeout(CLOSE_SEND_TIMEOUT, socket.send(close_message(CloseReason::Refused))).await;
}

/// Read until the peer leaves, the session starts closing, or the peer
/// exhausts its protocol strikes. Returns the reason to close with.
async fn read_frames(
    mut ws_rx: SplitStream<WebSocket>,
    session: &Session,
    liveness: &ConnectionLiveness,
    inbound: &mpsc::Sender<Message>,
    max_protocol_errors: u32,
) -> CloseReason {
    let closing = session.closing_signal();
    let server_reason = || session.close_reason().unwrap_or(CloseReason::ServerShutdown);
    let mut strikes: u32 = 0;

    loop {
        let next = tokio::select! {
            biased;
            () = closing.cancelled() => return server_reason(),
            next = ws_rx.next() => next,
        };
        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => {
                warn!(error = %err, "websocket read failed");
                return CloseReason::ProtocolError;
            }
            None => return CloseReason::TransportError,
        };
        liveness.mark_alive();

        let decoded = match frame {
            WsMessage::Text(text) => InboundFrame::decode(text.as_str()),
            WsMessage::Binary(data) => InboundFrame::decode_bytes(&data),
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            WsMessage::Close(frame) => {
                debug!(?frame, "client sent close frame");
                return CloseReason::ClientClosed;
            }
        };

        match decoded {
            Ok(frame) => {
                strikes = 0;
                counter!("ws_messages_received_total").increment(1);
                let msg = frame.into_message(session.id().clone());
                tokio::select! {
                    biased;
                    () = closing.cancelled() => return server_reason(),
                    sent = inbound.send(msg) => {
                        if sent.is_err() {
                            return CloseReason::TransportError;
                        }
                    }
                }
            }
            Err(err) => {
                strikes += 1;
                counter!("protocol_errors_total").increment(1);
                warn!(error = %err, strikes, "malformed frame rejected");
                let _ = session.enqueue(Outgoing::error(
                    ErrorCode::ProtocolError,
                    err.to_string(),
                    None,
                ));
                if strikes >= max_protocol_errors.max(1) {
                    return CloseReason::ProtocolError;
                }
            }
        }
    }
}

/// Route inbound messages one at a time so replies keep arrival order.
async fn run_dispatcher(sessions: SessionManager, mut inbound: mpsc::Receiver<Message>) {
    while let Some(msg) = inbound.recv().await {
        match sessions.route(msg).await {
            Ok(_) => {}
            Err(err @ SessionError::OutOfOrder { .. }) => {
                counter!("out_of_order_total").increment(1);
                warn!(error = %err, "message dropped");
            }
            Err(SessionError::SessionGone(id)) => {
                debug!(session_id = %id, "session gone, dispatcher stopping");
                break;
            }
            Err(err) => debug!(error = %err, "reply not delivered"),
        }
    }
}

/// Drain the outbox to the socket and ping on `ping_every`. Once the session
/// starts closing, flush what is queued within `flush_timeout`, send the
/// Close frame, and mark the session closed.
async fn run_writer(
    mut ws_tx: WsSink,
    mut outbox: Outbox,
    session: Arc<Session>,
    ping_every: Duration,
    flush_timeout: Duration,
) {
    let closing = session.closing_signal();
    let mut ping = time::interval(ping_every.max(MIN_PING_INTERVAL));
    // Skip the immediate first tick
    let _ = ping.tick().await;
    let mut healthy = true;

    loop {
        tokio::select! {
            biased;
            () = closing.cancelled() => break,
            msg = outbox.recv() => {
                let Some(msg) = msg else { break };
                if let Err(err) = send_frame(&mut ws_tx, &msg).await {
                    debug!(error = %err, "websocket write failed");
                    healthy = false;
                    break;
                }
            }
            _ = ping.tick() => {
                if ws_tx.send(WsMessage::Ping(Bytes::new())).await.is_err() {
                    healthy = false;
                    break;
                }
            }
        }
    }

    if healthy {
        let reason = session.close_reason().unwrap_or(CloseReason::ServerShutdown);
        match time::timeout(flush_timeout, flush(&mut ws_tx, &mut outbox)).await {
            Ok(Ok(sent)) => debug!(sent, "outbox flushed"),
            Ok(Err(err)) => debug!(error = %err, "flush interrupted by write failure"),
            Err(_) => warn!(discarded = outbox.len(), "flush deadline passed"),
        }
        let _ = time::timeout(CLOSE_SEND_TIMEOUT, ws_tx.send(close_message(reason))).await;
    } else {
        let _ = session.begin_close(CloseReason::TransportError);
    }
    let _ = session.finish_close();
}

async fn flush(ws_tx: &mut WsSink, outbox: &mut Outbox) -> Result<usize, axum::Error> {
    let mut sent = 0;
    while let Some(msg) = outbox.try_recv() {
        send_frame(ws_tx, &msg).await?;
        sent += 1;
    }
    Ok(sent)
}

async fn send_frame(ws_tx: &mut WsSink, msg: &Message) -> Result<(), axum::Error> {
    let text = match msg.to_frame_json() {
        Ok(text) => text,
        Err(err) => {
            warn!(topic = msg.topic(), error = %err, "unencodable message dropped");
            return Ok(());
        }
    };
    ws_tx.send(WsMessage::Text(text.into())).await?;
    counter!("ws_messages_sent_total").increment(1);
    Ok(())
}

async fn watch_heartbeat(
    session: Arc<Session>,
    liveness: Arc<ConnectionLiveness>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) {
    if run_heartbeat(liveness, interval, timeout, cancel).await == HeartbeatResult::TimedOut {
        warn!(session_id = %session.id(), "no traffic within {timeout:?}");
        let _ = session.begin_close(CloseReason::HeartbeatTimeout);
    }
}
