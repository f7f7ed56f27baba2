//! Per-connection websocket plumbing.
//!
//! Each accepted socket gets a sender task draining a bounded outbound
//! channel and a read loop that decodes frames and forwards them to the
//! owning shard. The shard owns all connection state; this module only
//! moves bytes.

use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio_util::sync::CancellationToken;

use gingham_common::wire::{ClientMessage, ServerMessage, codes};

use crate::shard::{SOCKET_QUEUE, ShardHandle, ShardMsg};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

async fn sender_main(
    mut sink: SplitSink<WebSocket, Message>,
    out_rx: async_channel::Receiver<Bytes>,
    control_rx: async_channel::Receiver<Message>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = out_rx.recv() => {
                match frame {
                    Ok(frame) => {
                        if sink.send(Message::Binary(frame)).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            msg = control_rx.recv() => {
                match msg {
                    Ok(msg) => {
                        if sink.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        }
    }
    let _ = sink.close().await;
}

/// Drive one accepted websocket until it closes or is replaced.
pub async fn serve_socket(
    socket: WebSocket,
    shard: ShardHandle,
    uid: String,
    name: String,
    token: String,
) {
    let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
    let (sink, mut stream) = socket.split();
    let (out_tx, out_rx) = async_channel::bounded::<Bytes>(SOCKET_QUEUE);
    let (control_tx, control_rx) = async_channel::bounded::<Message>(8);
    let conn_cancel = CancellationToken::new();

    tokio::spawn({
        let cancel = conn_cancel.clone();
        async move { sender_main(sink, out_rx, control_rx, cancel).await }
    });

    if shard
        .send(ShardMsg::Accept {
            uid: uid.clone(),
            name,
            token,
            conn_id,
            out: out_tx.clone(),
            conn_cancel: conn_cancel.clone(),
        })
        .await
        .is_err()
    {
        conn_cancel.cancel();
        return;
    }

    tracing::debug!(shard = shard.name(), uid, conn_id, "websocket attached");

    loop {
        let msg = tokio::select! {
            // The shard cancels this token when a fresh connection for the
            // same uid replaces us.
            _ = conn_cancel.cancelled() => break,
            msg = stream.next() => msg,
        };
        match msg {
            Some(Ok(Message::Binary(data))) => match ClientMessage::decode(&data) {
                Ok(Some(msg)) => {
                    if shard
                        .send(ShardMsg::Inbound {
                            uid: uid.clone(),
                            conn_id,
                            msg,
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(None) => {
                    // Unknown tag: a newer client talking to an older
                    // server. Skipped silently.
                    tracing::debug!(uid, conn_id, "unknown frame tag ignored");
                }
                Err(e) => {
                    // Malformed frames answer locally; the shard never
                    // sees them and no state changes.
                    tracing::debug!(uid, conn_id, ?e, "bad frame");
                    crate::metrics::err_emitted(codes::BAD_MESSAGE);
                    let err = ServerMessage::Err {
                        code: codes::BAD_MESSAGE.to_owned(),
                        msg: "malformed frame".to_owned(),
                    };
                    let _ = out_tx.try_send(err.encode());
                }
            },
            Some(Ok(Message::Text(_))) => {
                // The protocol is binary-only; text frames are ignored for
                // forward compatibility.
            }
            Some(Ok(Message::Ping(data))) => {
                let _ = control_tx.try_send(Message::Pong(data));
            }
            Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                tracing::debug!(uid, conn_id, ?e, "websocket error");
                break;
            }
        }
    }

    let _ = shard
        .send(ShardMsg::Disconnected {
            uid: uid.clone(),
            conn_id,
        })
        .await;
    conn_cancel.cancel();
    tracing::debug!(shard = shard.name(), uid, conn_id, "websocket detached");
}
