//! Reconnecting websocket transport.
//!
//! Owns the socket lifecycle: exponential backoff on reconnect, a bounded
//! drop-oldest send queue that survives connection loss, and a paced drain
//! after reconnect so a backlog does not slam the server (or trip its rate
//! limits) in one burst.

use std::collections::VecDeque;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Duration, sleep};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use gingham_common::domain::{
    MAX_PENDING_SENDS, PACED_DRAIN_BATCH, PACED_DRAIN_INTERVAL_MS, RECONNECT_BACKOFF_MS,
};
use gingham_common::wire::{ClientMessage, ServerMessage};

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Socket opened. `reconnected` is false only for the first open.
    Open { reconnected: bool },
    /// Decoded server frame.
    Message(ServerMessage),
    /// Socket closed; `disposed` means the app asked for it and no
    /// reconnect will follow.
    Closed { disposed: bool },
}

enum Cmd {
    Send(ClientMessage),
    SetUrl(String),
    Dispose,
}

/// Cheap handle to the transport task.
#[derive(Clone)]
pub struct Transport {
    cmd_tx: mpsc::UnboundedSender<Cmd>,
}

impl Transport {
    /// Spawn the transport task; events arrive on the returned channel.
    pub fn connect(url: String) -> (Self, async_channel::Receiver<TransportEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = async_channel::bounded(1024);
        let task = TransportTask {
            url,
            queue: VecDeque::new(),
            cmd_rx,
            events: event_tx,
            opened_before: false,
        };
        tokio::spawn(task.run());
        (Self { cmd_tx }, event_rx)
    }

    /// Queue a frame. Queued frames persist across reconnects up to the
    /// queue cap; overflow drops the oldest.
    pub fn send(&self, msg: ClientMessage) {
        let _ = self.cmd_tx.send(Cmd::Send(msg));
    }

    /// Replace the URL used for the next (re)connect, e.g. after a token
    /// refresh.
    pub fn set_url(&self, url: String) {
        let _ = self.cmd_tx.send(Cmd::SetUrl(url));
    }

    pub fn dispose(&self) {
        let _ = self.cmd_tx.send(Cmd::Dispose);
    }
}

enum Drive {
    Disposed,
    Lost,
}

struct TransportTask {
    url: String,
    queue: VecDeque<ClientMessage>,
    cmd_rx: mpsc::UnboundedReceiver<Cmd>,
    events: async_channel::Sender<TransportEvent>,
    opened_before: bool,
}

impl TransportTask {
    fn enqueue(&mut self, msg: ClientMessage) {
        if self.queue.len() >= MAX_PENDING_SENDS {
            self.queue.pop_front();
        }
        self.queue.push_back(msg);
    }

    async fn run(mut self) {
        let mut backoff_idx = 0usize;
        loop {
            match connect_async(self.url.as_str()).await {
                Ok((ws, _)) => {
                    backoff_idx = 0;
                    let reconnected = self.opened_before;
                    self.opened_before = true;
                    if self
                        .events
                        .send(TransportEvent::Open { reconnected })
                        .await
                        .is_err()
                    {
                        return;
                    }
                    match self.drive(ws, reconnected).await {
                        Drive::Disposed => {
                            let _ = self.events.send(TransportEvent::Closed { disposed: true }).await;
                            return;
                        }
                        Drive::Lost => {
                            if self
                                .events
                                .send(TransportEvent::Closed { disposed: false })
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!(url = %self.url, ?e, "connect failed");
                }
            }

            // Back off before the next attempt, still accepting commands so
            // offline sends keep queueing.
            let delay = RECONNECT_BACKOFF_MS[backoff_idx.min(RECONNECT_BACKOFF_MS.len() - 1)];
            backoff_idx = backoff_idx.saturating_add(1);
            let snooze = sleep(Duration::from_millis(delay));
            tokio::pin!(snooze);
            loop {
                tokio::select! {
                    _ = &mut snooze => break,
                    cmd = self.cmd_rx.recv() => match cmd {
                        Some(Cmd::Send(msg)) => self.enqueue(msg),
                        Some(Cmd::SetUrl(url)) => self.url = url,
                        Some(Cmd::Dispose) | None => {
                            let _ = self
                                .events
                                .send(TransportEvent::Closed { disposed: true })
                                .await;
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn drive(
        &mut self,
        ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
        reconnected: bool,
    ) -> Drive {
        let (mut sink, mut stream) = ws.split();
        // Paced drain after a reconnect: small batches on an interval
        // until the backlog clears, then full speed.
        let mut paced = reconnected;
        let mut allowance = PACED_DRAIN_BATCH;
        let mut pace_tick = tokio::time::interval(Duration::from_millis(PACED_DRAIN_INTERVAL_MS));
        pace_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        pace_tick.reset();

        loop {
            while let Some(front) = self.queue.front() {
                if paced && allowance == 0 {
                    break;
                }
                let frame = front.encode();
                if sink.send(WsMessage::Binary(frame.to_vec())).await.is_err() {
                    return Drive::Lost;
                }
                self.queue.pop_front();
                if paced {
                    allowance -= 1;
                }
            }
            if paced && self.queue.is_empty() {
                paced = false;
            }

            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Cmd::Send(msg)) => self.enqueue(msg),
                    Some(Cmd::SetUrl(url)) => self.url = url,
                    Some(Cmd::Dispose) | None => {
                        let _ = sink.send(WsMessage::Close(None)).await;
                        return Drive::Disposed;
                    }
                },
                msg = stream.next() => match msg {
                    Some(Ok(WsMessage::Binary(data))) => {
                        match ServerMessage::decode(&data) {
                            Ok(Some(decoded)) => {
                                if self
                                    .events
                                    .send(TransportEvent::Message(decoded))
                                    .await
                                    .is_err()
                                {
                                    return Drive::Disposed;
                                }
                            }
                            // Unknown tag from a newer server: skip.
                            Ok(None) => {}
                            Err(e) => {
                                tracing::warn!(?e, "undecodable server frame");
                            }
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        if sink.send(WsMessage::Pong(data)).await.is_err() {
                            return Drive::Lost;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => return Drive::Lost,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(?e, "websocket read failed");
                        return Drive::Lost;
                    }
                },
                _ = pace_tick.tick(), if paced => {
                    allowance = PACED_DRAIN_BATCH;
                }
            }
        }
    }
}
