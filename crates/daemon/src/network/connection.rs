//! Per-connection relay between a WebSocket and a session.
//!
//! The socket is split: a writer task drains the connection's outbound
//! queue into the sink, and the reader loop applies client messages in the
//! order they arrive. The session only ever sees the connection through
//! its [`Attachment`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use protocol::{ClientMessage, ProtocolError, ServerMessage};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use super::handshake::ConnectIntent;
use crate::session::{
    next_connection_id, AttachedSession, Attachment, ConnectionId, EndReason, SessionError,
    SessionId, SessionManager, SessionManagerImpl, DEFAULT_CHANNEL_CAPACITY,
};

type WsSink<S> = SplitSink<WebSocketStream<S>, WsMessage>;

/// How long a closing connection may spend sending what is still queued.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Runs one upgraded connection to completion.
pub(crate) async fn serve<S>(
    ws: WebSocketStream<S>,
    peer: SocketAddr,
    intent: ConnectIntent,
    manager: Arc<SessionManagerImpl>,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let conn_id = next_connection_id();
    let (mut ws_sink, ws_stream) = ws.split();
    let (out_tx, out_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);

    let session = match bind_session(&manager, &intent, &conn_id, &out_tx).await {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!(conn_id = %conn_id, %peer, error = %e, "Failed to open session");
            reject(&mut ws_sink, &e).await;
            return;
        }
    };

    let session_id = session.info.id.clone();
    tracing::info!(
        conn_id = %conn_id,
        %peer,
        session_id = %session_id,
        replayed_bytes = session.replayed_bytes,
        "Connection bound to session"
    );

    let conn_cancel = cancel.child_token();
    let writer = tokio::spawn(write_loop(ws_sink, out_rx, conn_cancel.clone()));

    read_loop(ws_stream, &manager, &conn_id, &out_tx, &conn_cancel).await;

    if let Err(e) = manager.detach(&session_id, &conn_id).await {
        tracing::debug!(conn_id = %conn_id, session_id = %session_id, error = %e, "Detach skipped");
    }

    drop(out_tx);
    conn_cancel.cancel();
    if let Err(e) = writer.await {
        tracing::warn!(conn_id = %conn_id, error = %e, "Writer task failed");
    }

    tracing::info!(conn_id = %conn_id, %peer, session_id = %session_id, "Connection closed");
}

/// Resumes the requested session, or creates one when no id was given or
/// the id no longer resolves.
async fn bind_session(
    manager: &SessionManagerImpl,
    intent: &ConnectIntent,
    conn_id: &ConnectionId,
    out_tx: &mpsc::Sender<ServerMessage>,
) -> Result<AttachedSession, SessionError> {
    if let Some(session_id) = &intent.session_id {
        let attachment = Attachment::new(conn_id.clone(), out_tx.clone());
        match manager
            .attach(session_id, attachment, intent.device_label.clone())
            .await
        {
            Ok(attached) => return Ok(attached),
            Err(SessionError::NotFound(_)) => {
                tracing::info!(
                    conn_id = %conn_id,
                    session_id = %session_id,
                    "Requested session is gone, creating a new one"
                );
            }
            Err(e) => return Err(e),
        }
    }

    let attachment = Attachment::new(conn_id.clone(), out_tx.clone());
    manager.create(intent.create_request(), attachment).await
}

/// Reports a failed session open and closes the socket.
async fn reject<S>(ws_sink: &mut WsSink<S>, error: &SessionError)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let code = match error {
        SessionError::SandboxViolation(_) | SessionError::InvalidGeometry { .. } => {
            CloseCode::Policy
        }
        _ => CloseCode::Error,
    };

    if let Ok(json) = ServerMessage::error(error.to_string()).to_json() {
        let _ = ws_sink.send(WsMessage::Text(json)).await;
    }
    let frame = CloseFrame {
        code,
        reason: "session unavailable".into(),
    };
    let _ = ws_sink.send(WsMessage::Close(Some(frame))).await;
}

async fn write_loop<S>(
    mut ws_sink: WsSink<S>,
    mut out_rx: mpsc::Receiver<ServerMessage>,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let flush = flush_pending(&mut ws_sink, &mut out_rx);
                if tokio::time::timeout(FLUSH_TIMEOUT, flush).await.is_err() {
                    tracing::debug!("Gave up flushing queued messages");
                }
                break;
            }
            msg = out_rx.recv() => {
                let Some(msg) = msg else {
                    let _ = ws_sink.send(WsMessage::Close(None)).await;
                    break;
                };

                if forward(&mut ws_sink, msg).await != Forwarded::Sent {
                    cancel.cancel();
                    break;
                }
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Forwarded {
    Sent,
    /// The session ended and the socket was closed.
    Ended,
    Failed,
}

/// Writes one message. A terminal message is followed by a close frame.
async fn forward<S>(ws_sink: &mut WsSink<S>, msg: ServerMessage) -> Forwarded
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ended = msg.is_terminal();
    match msg.to_json() {
        Ok(json) => {
            if let Err(e) = ws_sink.send(WsMessage::Text(json)).await {
                tracing::debug!(error = %e, "WebSocket send failed");
                return Forwarded::Failed;
            }
        }
        Err(e) => tracing::error!(error = %e, "Failed to encode outbound message"),
    }

    if !ended {
        return Forwarded::Sent;
    }

    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: "session ended".into(),
    };
    let _ = ws_sink.send(WsMessage::Close(Some(frame))).await;
    Forwarded::Ended
}

/// Sends whatever is already queued, then closes the socket unless a
/// terminal message already did.
async fn flush_pending<S>(ws_sink: &mut WsSink<S>, out_rx: &mut mpsc::Receiver<ServerMessage>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Ok(msg) = out_rx.try_recv() {
        if forward(ws_sink, msg).await != Forwarded::Sent {
            return;
        }
    }

    let frame = CloseFrame {
        code: CloseCode::Away,
        reason: "connection closing".into(),
    };
    let _ = ws_sink.send(WsMessage::Close(Some(frame))).await;
}

async fn read_loop<S>(
    mut ws_stream: SplitStream<WebSocketStream<S>>,
    manager: &SessionManagerImpl,
    conn_id: &ConnectionId,
    out_tx: &mpsc::Sender<ServerMessage>,
    cancel: &CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = ws_stream.next() => frame,
        };

        match frame {
            Some(Ok(WsMessage::Text(text))) => {
                if let Some(reply) = apply(manager, &text).await {
                    reply_to(out_tx, conn_id, reply);
                }
            }
            Some(Ok(WsMessage::Binary(_))) => {
                let err = ProtocolError::UnsupportedFrame("binary".to_string());
                reply_to(out_tx, conn_id, ServerMessage::error(err.to_string()));
            }
            Some(Ok(WsMessage::Close(_))) | None => break,
            // Ping/pong frames are answered by tungstenite.
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::debug!(conn_id = %conn_id, error = %e, "WebSocket read failed");
                break;
            }
        }
    }
}

/// Applies one client frame. Returns the reply to send, if any.
async fn apply(manager: &SessionManagerImpl, text: &str) -> Option<ServerMessage> {
    let msg = match ClientMessage::parse(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::debug!(error = %e, "Rejected client frame");
            return Some(ServerMessage::error(e.to_string()));
        }
    };

    tracing::trace!(session_id = ?msg.session_id(), "Applying client frame");

    match msg {
        ClientMessage::Input { session_id, data } => manager
            .write(&session_id, data.as_bytes())
            .await
            .err()
            .map(|e| ServerMessage::error(e.to_string())),
        ClientMessage::Resize {
            session_id,
            cols,
            rows,
        } => manager
            .resize(&session_id, cols, rows)
            .await
            .err()
            .map(|e| ServerMessage::error(e.to_string())),
        ClientMessage::Close { session_id } => {
            if manager.destroy(&session_id, EndReason::ClosedByUser).await {
                None
            } else {
                Some(not_found(session_id))
            }
        }
        ClientMessage::Ping => Some(ServerMessage::Pong),
    }
}

fn not_found(session_id: SessionId) -> ServerMessage {
    ServerMessage::error(SessionError::NotFound(session_id).to_string())
}

fn reply_to(out_tx: &mpsc::Sender<ServerMessage>, conn_id: &ConnectionId, reply: ServerMessage) {
    if let Err(e) = out_tx.try_send(reply) {
        tracing::debug!(conn_id = %conn_id, error = %e, "Dropped reply");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{CreateSessionRequest, SessionSettings};

    fn manager() -> SessionManagerImpl {
        SessionManagerImpl::new(SessionSettings {
            shell: "/bin/sh".to_string(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_apply_malformed_frame() {
        let manager = manager();
        let reply = apply(&manager, "{not json").await;
        assert!(matches!(reply, Some(ServerMessage::Error { .. })));

        let reply = apply(&manager, r#"{"type":"teleport"}"#).await;
        assert!(matches!(reply, Some(ServerMessage::Error { .. })));
        assert_eq!(manager.count(), 0);
    }

    #[tokio::test]
    async fn test_apply_ping() {
        let manager = manager();
        assert_eq!(apply(&manager, r#"{"type":"ping"}"#).await, Some(ServerMessage::Pong));
    }

    #[tokio::test]
    async fn test_apply_unknown_session() {
        let manager = manager();
        for frame in [
            r#"{"type":"input","sessionId":"nope","data":"ls\n"}"#,
            r#"{"type":"resize","sessionId":"nope","cols":100,"rows":30}"#,
            r#"{"type":"close","sessionId":"nope"}"#,
        ] {
            match apply(&manager, frame).await {
                Some(ServerMessage::Error { message }) => assert!(message.contains("nope")),
                other => panic!("expected error for {frame}, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_apply_close_destroys_session() {
        let manager = manager();
        let (tx, mut rx) = mpsc::channel(64);
        let attached = manager
            .create(
                CreateSessionRequest {
                    cols: 80,
                    rows: 24,
                    ..Default::default()
                },
                Attachment::new("conn-test".to_string(), tx),
            )
            .await
            .unwrap();
        let id = attached.info.id;

        let frame = format!(r#"{{"type":"close","sessionId":"{id}"}}"#);
        assert_eq!(apply(&manager, &frame).await, None);
        assert!(!manager.exists(&id));

        let mut ended = false;
        while let Ok(Some(msg)) =
            tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv()).await
        {
            if let ServerMessage::SessionEnded { reason, .. } = msg {
                assert_eq!(reason, "closed by user");
                ended = true;
                break;
            }
        }
        assert!(ended);
    }
}
