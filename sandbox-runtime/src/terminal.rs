//! Interactive terminal bridge between a websocket client and a container
//! exec TTY.
//!
//! Three cooperative pumps run per connection: container→client output,
//! client→container input/resize, and a ping keepalive. Any pump ending
//! cancels the shared scope and the others return promptly. All writes to
//! the client are serialized through one mutex. The bridge is transparent:
//! no input bytes are filtered.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::manager::SandboxManager;

/// Output is re-framed into chunks of at most this many bytes.
const OUTPUT_CHUNK: usize = 4096;
/// Keepalive ping cadence.
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// Read deadline; each pong pushes it out again.
const READ_WINDOW: Duration = Duration::from_secs(40);
/// Budget for any single write to the client.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// Initial TTY geometry before the client reports its own.
const INITIAL_ROWS: u16 = 24;
const INITIAL_COLS: u16 = 80;

/// JSON message envelope spoken over the terminal stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    Input { data: String },
    Output { data: String },
    Resize { cols: u16, rows: u16 },
    Connected,
    Error { data: String },
    Exit { code: i32 },
}

type WsSink = Arc<Mutex<SplitSink<WebSocket, Message>>>;

async fn send_frame(sink: &WsSink, frame: &Frame) -> bool {
    let Ok(text) = serde_json::to_string(frame) else {
        return false;
    };
    let mut guard = sink.lock().await;
    tokio::time::timeout(WRITE_TIMEOUT, guard.send(Message::Text(text.into())))
        .await
        .map(|sent| sent.is_ok())
        .unwrap_or(false)
}

async fn send_ping(sink: &WsSink) -> bool {
    let mut guard = sink.lock().await;
    tokio::time::timeout(
        WRITE_TIMEOUT,
        guard.send(Message::Ping(Bytes::from_static(b"keepalive"))),
    )
    .await
    .map(|sent| sent.is_ok())
    .unwrap_or(false)
}

/// Split raw exec output into transmission-sized chunks.
fn chunk_output(bytes: &[u8]) -> impl Iterator<Item = &[u8]> {
    bytes.chunks(OUTPUT_CHUNK)
}

/// Bridge an upgraded websocket to an exec inside `container_id`.
///
/// Callers have already verified the sandbox exists and is running (or, in
/// session mode, that the presented token maps to an active session bound
/// to this sandbox).
pub async fn serve(manager: Arc<SandboxManager>, socket: WebSocket, container_id: String) {
    let (sink, stream) = socket.split();
    let sink: WsSink = Arc::new(Mutex::new(sink));

    let (exec_id, exec) = match manager.exec_attach(&container_id).await {
        Ok(attached) => attached,
        Err(err) => {
            warn!(%container_id, "exec attach failed: {err}");
            send_frame(&sink, &Frame::Error { data: format!("attach failed: {err}") }).await;
            let mut guard = sink.lock().await;
            let _ = guard.send(Message::Close(None)).await;
            return;
        }
    };

    // Some runtimes refuse to resize an attached exec; log and carry on.
    if let Err(err) = manager.exec_resize(&exec_id, INITIAL_ROWS, INITIAL_COLS).await {
        debug!(%exec_id, "initial resize failed: {err}");
    }

    if !send_frame(&sink, &Frame::Connected).await {
        return;
    }

    let scope = CancellationToken::new();

    // Container → client.
    let output_task = {
        let sink = sink.clone();
        let scope = scope.clone();
        let mut output = exec.output;
        tokio::spawn(async move {
            loop {
                let chunk = tokio::select! {
                    _ = scope.cancelled() => break,
                    chunk = output.next() => chunk,
                };
                match chunk {
                    Some(Ok(bytes)) => {
                        for piece in chunk_output(&bytes) {
                            let frame = Frame::Output {
                                data: String::from_utf8_lossy(piece).into_owned(),
                            };
                            if !send_frame(&sink, &frame).await {
                                scope.cancel();
                                return;
                            }
                        }
                    }
                    Some(Err(err)) => {
                        debug!("exec read error: {err}");
                        break;
                    }
                    None => {
                        send_frame(&sink, &Frame::Exit { code: 0 }).await;
                        break;
                    }
                }
            }
            scope.cancel();
        })
    };

    // Keepalive.
    let keepalive_task = {
        let sink = sink.clone();
        let scope = scope.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PING_INTERVAL);
            ticker.tick().await; // immediate tick is not a keepalive
            loop {
                tokio::select! {
                    _ = scope.cancelled() => return,
                    _ = ticker.tick() => {
                        if !send_ping(&sink).await {
                            scope.cancel();
                            return;
                        }
                    }
                }
            }
        })
    };

    // Client → container, with the read deadline on this task.
    client_pump(&manager, &exec_id, exec.input, stream, &scope).await;

    scope.cancel();
    let _ = output_task.await;
    let _ = keepalive_task.await;

    let mut guard = sink.lock().await;
    let _ = guard.send(Message::Close(None)).await;
    info!(%container_id, "terminal session closed");
}

async fn client_pump(
    manager: &SandboxManager,
    exec_id: &str,
    mut input: std::pin::Pin<Box<dyn tokio::io::AsyncWrite + Send>>,
    mut stream: SplitStream<WebSocket>,
    scope: &CancellationToken,
) {
    let mut deadline = Instant::now() + READ_WINDOW;
    loop {
        let message = tokio::select! {
            _ = scope.cancelled() => return,
            message = tokio::time::timeout_at(deadline, stream.next()) => message,
        };
        let message = match message {
            Ok(message) => message,
            Err(_) => {
                debug!("client read deadline exceeded");
                return;
            }
        };
        match message {
            Some(Ok(Message::Text(text))) => {
                let Ok(frame) = serde_json::from_str::<Frame>(text.as_str()) else {
                    // Unknown or malformed frame types are ignored.
                    continue;
                };
                match frame {
                    Frame::Input { data } => {
                        if input.write_all(data.as_bytes()).await.is_err() {
                            return;
                        }
                        if input.flush().await.is_err() {
                            return;
                        }
                    }
                    Frame::Resize { cols, rows } => {
                        if cols > 0 && rows > 0 {
                            if let Err(err) = manager.exec_resize(exec_id, rows, cols).await {
                                debug!(%exec_id, "resize failed: {err}");
                            }
                        }
                    }
                    _ => {}
                }
            }
            Some(Ok(Message::Pong(_))) => {
                deadline = Instant::now() + READ_WINDOW;
            }
            Some(Ok(Message::Close(_))) | None => return,
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                debug!("client read error: {err}");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_serialize_to_wire_envelope() {
        let json = serde_json::to_string(&Frame::Input { data: "ls\n".into() }).unwrap();
        assert_eq!(json, r#"{"type":"input","data":"ls\n"}"#);

        let json = serde_json::to_string(&Frame::Resize { cols: 120, rows: 40 }).unwrap();
        assert_eq!(json, r#"{"type":"resize","cols":120,"rows":40}"#);

        let json = serde_json::to_string(&Frame::Connected).unwrap();
        assert_eq!(json, r#"{"type":"connected"}"#);

        let json = serde_json::to_string(&Frame::Exit { code: 130 }).unwrap();
        assert_eq!(json, r#"{"type":"exit","code":130}"#);
    }

    #[test]
    fn frames_parse_from_client_json() {
        let frame: Frame = serde_json::from_str(r#"{"type":"input","data":"echo hello\n"}"#).unwrap();
        assert_eq!(frame, Frame::Input { data: "echo hello\n".into() });

        let frame: Frame = serde_json::from_str(r#"{"type":"resize","cols":80,"rows":24}"#).unwrap();
        assert_eq!(frame, Frame::Resize { cols: 80, rows: 24 });

        // Unknown types fail to parse and are ignored by the pump.
        assert!(serde_json::from_str::<Frame>(r#"{"type":"ping"}"#).is_err());
    }

    #[test]
    fn output_is_rechunked_at_4k() {
        let data = vec![b'x'; OUTPUT_CHUNK * 2 + 5];
        let chunks: Vec<&[u8]> = chunk_output(&data).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), OUTPUT_CHUNK);
        assert_eq!(chunks[2].len(), 5);
    }
}
