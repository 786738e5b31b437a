use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use bytes::Bytes;
use chrono::Utc;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::time::{Instant, interval_at};
use tracing::{debug, info, trace, warn};

use parley_types::codec;
use parley_types::envelope::Envelope;

use crate::handler::handle_command;
use crate::queue::{CloseReason, Outbound};
use crate::registry::Session;
use crate::state::GatewayState;

/// Time the writer gets to flush the close frame after the reader stops.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct ConnectionConfig {
    /// The server pings this often. Two unanswered pings drop the session.
    pub heartbeat_interval: Duration,
    /// Sessions that send no commands for this long are dropped, even if
    /// they keep answering pings.
    pub idle_timeout: Duration,
    /// Time allowed for the `Identify` frame.
    pub handshake_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Handle one upgraded websocket until either side closes it.
pub async fn handle_connection(socket: WebSocket, state: GatewayState) {
    let (sender, receiver) = socket.split();
    serve(sender, receiver, state).await;
}

/// Drive a connection over any websocket-shaped sink/stream pair.
pub async fn serve<Si, St>(mut sender: Si, mut receiver: St, state: GatewayState)
where
    Si: Sink<Message> + Unpin + Send + 'static,
    St: Stream<Item = Result<Message, axum::Error>> + Unpin + Send + 'static,
{
    // Identify; the session's queue already holds Ready
    let session = match handshake(&mut receiver, &state).await {
        Ok(session) => session,
        Err(reason) => {
            warn!("handshake failed: {}", reason.reason());
            let _ = sender.send(close_message(reason)).await;
            return;
        }
    };

    info!(
        "{} ({}) connected to gateway as session {}",
        session.username(),
        session.user_id(),
        session.id()
    );

    let pong_received = Arc::new(AtomicBool::new(true));

    let mut send_task = tokio::spawn(write_loop(
        sender,
        state.clone(),
        session.clone(),
        pong_received.clone(),
    ));

    let writer_finished = tokio::select! {
        reason = read_loop(&mut receiver, &state, &session, &pong_received) => {
            state.registry.close(session.id(), reason);
            false
        }
        _ = &mut send_task => true,
    };

    if writer_finished {
        state.registry.unregister(session.id());
    } else if tokio::time::timeout(CLOSE_GRACE, &mut send_task).await.is_err() {
        send_task.abort();
    }

    info!(
        "{} ({}) disconnected from gateway (session {})",
        session.username(),
        session.user_id(),
        session.id()
    );
}

async fn handshake<St>(receiver: &mut St, state: &GatewayState) -> Result<Arc<Session>, CloseReason>
where
    St: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let identify = async {
        while let Some(msg) = receiver.next().await {
            let data = match msg {
                Ok(Message::Binary(data)) => data,
                Ok(Message::Text(_)) => return Err(CloseReason::UnsupportedData),
                Ok(Message::Ping(_) | Message::Pong(_)) => continue,
                Ok(Message::Close(_)) | Err(_) => return Err(CloseReason::Normal),
            };

            return match codec::decode(&data) {
                Ok(Envelope::Identify { token, device_id }) => Ok((token, device_id)),
                Ok(other) => {
                    warn!("expected identify, got {}", other.kind());
                    Err(CloseReason::AuthFailed)
                }
                Err(e) => {
                    warn!("malformed handshake frame: {}", e);
                    Err(CloseReason::ProtocolViolation)
                }
            };
        }
        Err(CloseReason::Normal)
    };

    let (token, device_id) = tokio::time::timeout(state.config.handshake_timeout, identify)
        .await
        .map_err(|_| CloseReason::AuthFailed)??;

    let session = state.registry.register(&token, &device_id).map_err(|e| {
        warn!("identify from device {} rejected: {}", device_id, e);
        CloseReason::AuthFailed
    })?;

    // Sends are validated against the users table, so record who we saw.
    let db = state.db.clone();
    let (user_id, username) = (session.user_id(), session.username().to_string());
    let recorded = tokio::task::spawn_blocking(move || db.upsert_user(user_id, &username)).await;
    match recorded {
        Ok(Ok(())) => Ok(session),
        Ok(Err(e)) => {
            warn!("could not record user {}: {}", user_id, e);
            state.registry.close(session.id(), CloseReason::InternalError);
            Err(CloseReason::InternalError)
        }
        Err(e) => {
            warn!("could not record user {}: {}", user_id, e);
            state.registry.close(session.id(), CloseReason::InternalError);
            Err(CloseReason::InternalError)
        }
    }
}

/// Read client frames until the connection should end, and say why.
async fn read_loop<St>(
    receiver: &mut St,
    state: &GatewayState,
    session: &Session,
    pong_received: &AtomicBool,
) -> CloseReason
where
    St: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    while let Some(msg) = receiver.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                debug!("session {} read error: {}", session.id(), e);
                return CloseReason::Normal;
            }
        };
        match msg {
            Message::Binary(data) => match codec::decode(&data) {
                Ok(envelope) => {
                    session.touch();
                    handle_command(state, session, envelope).await
                }
                Err(e) => {
                    warn!(
                        "{} ({}) sent a malformed frame: {}",
                        session.username(),
                        session.user_id(),
                        e
                    );
                    return CloseReason::ProtocolViolation;
                }
            },
            Message::Text(_) => {
                warn!(
                    "{} ({}) sent a text frame, closing",
                    session.username(),
                    session.user_id()
                );
                return CloseReason::UnsupportedData;
            }
            Message::Pong(_) => pong_received.store(true, Ordering::Release),
            // Answered by the websocket layer.
            Message::Ping(_) => {}
            Message::Close(_) => return CloseReason::Normal,
        }
    }
    CloseReason::Normal
}

/// Drain the session's queue into the socket, with heartbeat.
async fn write_loop<Si>(
    mut sender: Si,
    state: GatewayState,
    session: Arc<Session>,
    pong_received: Arc<AtomicBool>,
) where
    Si: Sink<Message> + Unpin,
{
    let period = state.config.heartbeat_interval;
    let mut heartbeat = interval_at(Instant::now() + period, period);
    let mut missed_heartbeats: u8 = 0;

    loop {
        tokio::select! {
            next = session.outbound().pop() => match next {
                Outbound::Frame(frame) => {
                    trace!("session {} <- {} bytes", session.id(), frame.len());
                    if sender.send(Message::Binary(frame)).await.is_err() {
                        break;
                    }
                }
                Outbound::Closed(reason) => {
                    let _ = sender.send(close_message(reason)).await;
                    break;
                }
            },
            _ = heartbeat.tick() => {
                if pong_received.swap(false, Ordering::Acquire) {
                    missed_heartbeats = 0;
                } else {
                    missed_heartbeats += 1;
                }

                let idle = session
                    .idle_for(Utc::now())
                    .to_std()
                    .is_ok_and(|idle| idle >= state.config.idle_timeout);
                if missed_heartbeats >= 2 || idle {
                    warn!(
                        "session {} timed out (missed {} pongs, idle {}), dropping connection",
                        session.id(),
                        missed_heartbeats,
                        idle
                    );
                    // The queue now yields Closed on the next turn.
                    state.registry.close(session.id(), CloseReason::IdleTimeout);
                    continue;
                }

                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}

fn close_message(reason: CloseReason) -> Message {
    Message::Close(Some(CloseFrame {
        code: reason.code(),
        reason: Utf8Bytes::from_static(reason.reason()),
    }))
}
