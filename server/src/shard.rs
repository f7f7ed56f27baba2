//! Connection shard actor.
//!
//! Each shard owns a uid-hash bucket of client sockets, the per-client
//! subscription sets, and the shard-side half of the two-level subscription
//! graph (client↔shard here, shard↔owner at the tile owner). One task per
//! shard; every socket's messages funnel through its inbox in order, and
//! the socket close path is the single source of cleanup.

use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use gingham_common::domain::{
    MAX_TILES_SUBSCRIBED, MAX_TILE_CHURN_PER_MIN, SETCELL_BURST_LIMIT, SETCELL_BURST_WINDOW_MS,
    SETCELL_SUSTAINED_LIMIT, SETCELL_SUSTAINED_WINDOW_MS, TileKey,
};
use gingham_common::now_ms;
use gingham_common::rate_limit::{DualWindow, SlidingWindow, WindowConfig};
use gingham_common::wire::{CellUpBatch, ClientMessage, ServerMessage, codes};
use gingham_engine::{OwnerRegistry, SetCellRequest};

use crate::cursor::{CursorCoordinator, CursorPresence};

/// Outbound socket queue depth per connection. Overflow drops frames; the
/// client's gap detection turns a dropped update into a resync.
pub const SOCKET_QUEUE: usize = 256;

pub enum ShardMsg {
    Accept {
        uid: String,
        name: String,
        token: String,
        conn_id: u64,
        out: async_channel::Sender<Bytes>,
        conn_cancel: CancellationToken,
    },
    Inbound {
        uid: String,
        conn_id: u64,
        msg: ClientMessage,
    },
    Disconnected {
        uid: String,
        conn_id: u64,
    },
    CursorRelay {
        from: String,
        updates: Vec<CursorPresence>,
    },
}

#[derive(Clone)]
pub struct ShardHandle {
    name: Arc<str>,
    tx: mpsc::Sender<ShardMsg>,
}

impl ShardHandle {
    pub fn new(name: &str, tx: mpsc::Sender<ShardMsg>) -> Self {
        Self {
            name: Arc::from(name),
            tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn send(&self, msg: ShardMsg) -> Result<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| anyhow::anyhow!("shard {} is gone", self.name))
    }

    /// Lossy cursor relay delivery; a full peer inbox drops the batch.
    pub fn relay(&self, from: &str, updates: Vec<CursorPresence>) -> bool {
        self.tx
            .try_send(ShardMsg::CursorRelay {
                from: from.to_owned(),
                updates,
            })
            .is_ok()
    }
}

pub struct ClientRecord {
    pub uid: String,
    pub name: String,
    pub conn_id: u64,
    pub out: async_channel::Sender<Bytes>,
    pub conn_cancel: CancellationToken,
    pub subscribed: FxHashSet<TileKey>,
    pub churn: SlidingWindow,
    pub setcell: DualWindow,
    pub last_cursor: Option<(f32, f32)>,
    pub cursor_subs: FxHashSet<String>,
}

impl ClientRecord {
    fn new(
        uid: String,
        name: String,
        conn_id: u64,
        out: async_channel::Sender<Bytes>,
        conn_cancel: CancellationToken,
    ) -> Self {
        Self {
            uid,
            name,
            conn_id,
            out,
            conn_cancel,
            subscribed: FxHashSet::default(),
            churn: SlidingWindow::new(WindowConfig {
                limit: MAX_TILE_CHURN_PER_MIN,
                window_ms: 60_000,
            }),
            setcell: DualWindow::new(
                WindowConfig {
                    limit: SETCELL_BURST_LIMIT,
                    window_ms: SETCELL_BURST_WINDOW_MS,
                },
                WindowConfig {
                    limit: SETCELL_SUSTAINED_LIMIT,
                    window_ms: SETCELL_SUSTAINED_WINDOW_MS,
                },
            ),
            last_cursor: None,
            cursor_subs: FxHashSet::default(),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(uid: &str) -> (Self, async_channel::Receiver<Bytes>) {
        let (out, rx) = async_channel::bounded(SOCKET_QUEUE);
        (
            Self::new(
                uid.to_owned(),
                "TestHand1".to_owned(),
                1,
                out,
                CancellationToken::new(),
            ),
            rx,
        )
    }
}

fn msg_kind(msg: &ServerMessage) -> &'static str {
    match msg {
        ServerMessage::Hello { .. } => "hello",
        ServerMessage::TileSnap { .. } => "tileSnap",
        ServerMessage::CellUp { .. } => "cellUp",
        ServerMessage::CellUpBatch(_) => "cellUpBatch",
        ServerMessage::CurUp { .. } => "curUp",
        ServerMessage::Err { .. } => "err",
    }
}

/// Non-blocking socket emission. Send errors are ignored here on purpose:
/// the close handler is the single cleanup path.
pub fn emit_to(out: &async_channel::Sender<Bytes>, msg: &ServerMessage) {
    if out.try_send(msg.encode()).is_err() {
        crate::metrics::message_dropped(msg_kind(msg));
    }
}

fn emit_err(out: &async_channel::Sender<Bytes>, code: &'static str, detail: &str) {
    crate::metrics::err_emitted(code);
    emit_to(
        out,
        &ServerMessage::Err {
            code: code.to_owned(),
            msg: detail.to_owned(),
        },
    );
}

pub struct ConnectionShard {
    name: String,
    registry: OwnerRegistry,
    peers: Arc<Vec<ShardHandle>>,
    clients: FxHashMap<String, ClientRecord>,
    tile_to_clients: FxHashMap<TileKey, FxHashSet<String>>,
    cursors: CursorCoordinator,
}

/// Create the shard's inbox pair and spawn its actor task.
pub fn spawn_shard(
    name: String,
    registry: OwnerRegistry,
    peers: Arc<Vec<ShardHandle>>,
    inbox: mpsc::Receiver<ShardMsg>,
    batches: mpsc::Receiver<CellUpBatch>,
    cancel: CancellationToken,
) {
    let shard = ConnectionShard {
        cursors: CursorCoordinator::new(name.clone()),
        name,
        registry,
        peers,
        clients: FxHashMap::default(),
        tile_to_clients: FxHashMap::default(),
    };
    tokio::spawn(shard.run(inbox, batches, cancel));
}

impl ConnectionShard {
    async fn run(
        mut self,
        mut inbox: mpsc::Receiver<ShardMsg>,
        mut batches: mpsc::Receiver<CellUpBatch>,
        cancel: CancellationToken,
    ) {
        loop {
            let relay_deadline = self.cursors.relay_deadline();
            let refresh_deadline = self.cursors.refresh_deadline();
            tokio::select! {
                _ = cancel.cancelled() => break,
                msg = inbox.recv() => match msg {
                    Some(msg) => self.handle(msg).await,
                    None => break,
                },
                batch = batches.recv() => {
                    if let Some(batch) = batch {
                        self.fanout_batch(batch);
                    }
                }
                _ = sleep_until(relay_deadline.unwrap_or_else(Instant::now)),
                    if relay_deadline.is_some() =>
                {
                    self.cursors.flush_relays(&self.peers);
                }
                _ = sleep_until(refresh_deadline.unwrap_or_else(Instant::now)),
                    if refresh_deadline.is_some() =>
                {
                    self.cursors.refresh(&mut self.clients, now_ms());
                }
            }
        }
        // Teardown: close every socket; owners and peers outlive us or are
        // shutting down along with us.
        for client in self.clients.values() {
            client.conn_cancel.cancel();
        }
    }

    async fn handle(&mut self, msg: ShardMsg) {
        match msg {
            ShardMsg::Accept {
                uid,
                name,
                token,
                conn_id,
                out,
                conn_cancel,
            } => self.accept(uid, name, token, conn_id, out, conn_cancel).await,
            ShardMsg::Inbound { uid, conn_id, msg } => self.inbound(uid, conn_id, msg).await,
            ShardMsg::Disconnected { uid, conn_id } => self.disconnected(&uid, conn_id).await,
            ShardMsg::CursorRelay { from, updates } => {
                self.cursors.apply_relay(&from, updates, &self.clients);
            }
        }
    }

    async fn accept(
        &mut self,
        uid: String,
        name: String,
        token: String,
        conn_id: u64,
        out: async_channel::Sender<Bytes>,
        conn_cancel: CancellationToken,
    ) {
        // A fresh connection for a known uid replaces the old one: the old
        // socket closes and its record fully tears down (unsubs included)
        // before the new record exists.
        if let Some(old) = self.clients.remove(&uid) {
            crate::metrics::connection_replaced(&self.name);
            self.teardown(old).await;
        }

        let record = ClientRecord::new(uid.clone(), name.clone(), conn_id, out, conn_cancel);
        emit_to(
            &record.out,
            &ServerMessage::Hello {
                uid: uid.clone(),
                name,
                token,
            },
        );
        self.clients.insert(uid, record);
        crate::metrics::connection_opened(&self.name);
        self.cursors.refresh(&mut self.clients, now_ms());
    }

    async fn disconnected(&mut self, uid: &str, conn_id: u64) {
        // Ignore close notifications from sockets that were already
        // replaced; their record is gone.
        let matches = self
            .clients
            .get(uid)
            .is_some_and(|c| c.conn_id == conn_id);
        if !matches {
            return;
        }
        let record = self.clients.remove(uid).expect("checked above");
        self.teardown(record).await;
        self.cursors.refresh(&mut self.clients, now_ms());
    }

    async fn teardown(&mut self, record: ClientRecord) {
        record.conn_cancel.cancel();
        for tile in &record.subscribed {
            if let Some(bucket) = self.tile_to_clients.get_mut(tile) {
                bucket.remove(&record.uid);
                if bucket.is_empty() {
                    self.tile_to_clients.remove(tile);
                    self.watch_unsub(*tile).await;
                }
            }
        }
        self.cursors.remove_uid(&record.uid);
        crate::metrics::connection_closed(&self.name);
    }

    /// Drop this shard from a tile's watcher set. Only loaded owners are
    /// touched; unsub never spawns one.
    async fn watch_unsub(&self, tile: TileKey) {
        if let Some(owner) = self.registry.owner_if_loaded(tile)
            && let Err(e) = owner.watch(&self.name, false).await
        {
            tracing::warn!(shard = %self.name, %tile, ?e, "watch unsub failed");
        }
    }

    async fn inbound(&mut self, uid: String, conn_id: u64, msg: ClientMessage) {
        let current = self
            .clients
            .get(&uid)
            .is_some_and(|c| c.conn_id == conn_id);
        if !current {
            return;
        }
        let result = match msg {
            ClientMessage::Sub { tiles } => {
                crate::metrics::message_received("sub");
                self.handle_sub(&uid, tiles).await
            }
            ClientMessage::Unsub { tiles } => {
                crate::metrics::message_received("unsub");
                self.handle_unsub(&uid, tiles).await
            }
            ClientMessage::SetCell { tile, i, v, op } => {
                crate::metrics::message_received("setCell");
                self.handle_set_cell(&uid, tile, i, v, op).await
            }
            ClientMessage::ResyncTile { tile, have_ver } => {
                crate::metrics::message_received("resyncTile");
                self.handle_resync(&uid, tile, have_ver).await
            }
            ClientMessage::Cur { x, y } => {
                crate::metrics::message_received("cur");
                self.handle_cursor(&uid, x, y);
                Ok(())
            }
        };
        if let Err(e) = result {
            tracing::warn!(shard = %self.name, uid, ?e, "message handling failed");
            if let Some(client) = self.clients.get(&uid) {
                emit_err(&client.out, codes::INTERNAL, "internal error");
            }
        }
    }

    async fn handle_sub(&mut self, uid: &str, tiles: Vec<TileKey>) -> Result<()> {
        let Some(out) = self.clients.get(uid).map(|c| c.out.clone()) else {
            return Ok(());
        };
        let now = now_ms();
        let mut changed = false;
        for tile in tiles {
            enum Verdict {
                Stop,
                Next,
                Proceed { first_local: bool },
            }
            let verdict = {
                let client = self.clients.get_mut(uid).expect("present for this message");
                if client.subscribed.contains(&tile) {
                    continue;
                }
                if client.subscribed.len() >= MAX_TILES_SUBSCRIBED {
                    emit_err(&out, codes::SUB_LIMIT, "tile subscription limit reached");
                    Verdict::Stop
                } else if client.churn.record_then_over(now) {
                    crate::metrics::rate_limited("churn");
                    emit_err(&out, codes::CHURN_LIMIT, "tile churn limit reached");
                    Verdict::Stop
                } else if !tile.is_valid() {
                    emit_err(&out, codes::BAD_TILE, "tile key out of bounds");
                    Verdict::Next
                } else {
                    client.subscribed.insert(tile);
                    let bucket = self.tile_to_clients.entry(tile).or_default();
                    let first_local = bucket.is_empty();
                    bucket.insert(uid.to_owned());
                    Verdict::Proceed { first_local }
                }
            };
            let first_local = match verdict {
                Verdict::Stop => break,
                Verdict::Next => continue,
                Verdict::Proceed { first_local } => first_local,
            };
            changed = true;

            if first_local && !self.watch_sub(uid, tile, &out).await {
                break;
            }
            self.push_snapshot(tile, &out).await;
        }
        if changed {
            self.cursors.refresh(&mut self.clients, now);
        }
        Ok(())
    }

    /// First local subscriber for a tile: register this shard as a watcher.
    /// On denial or failure the local add rolls back so the refcounts stay
    /// truthful. Returns false when sub processing must stop.
    async fn watch_sub(
        &mut self,
        uid: &str,
        tile: TileKey,
        out: &async_channel::Sender<Bytes>,
    ) -> bool {
        let denied = match self.registry.owner(tile).await {
            Ok(owner) => match owner.watch(&self.name, true).await {
                Ok(outcome) if outcome.ok => return true,
                Ok(_) => None,
                Err(e) => Some(e),
            },
            Err(e) => Some(e),
        };
        if let Some(bucket) = self.tile_to_clients.get_mut(&tile) {
            bucket.remove(uid);
            if bucket.is_empty() {
                self.tile_to_clients.remove(&tile);
            }
        }
        if let Some(client) = self.clients.get_mut(uid) {
            client.subscribed.remove(&tile);
        }
        match denied {
            None => emit_err(out, codes::TILE_SUB_DENIED, "tile is over watcher capacity"),
            Some(e) => {
                tracing::warn!(shard = %self.name, %tile, ?e, "watch sub failed");
                emit_err(out, codes::INTERNAL, "tile unavailable");
            }
        }
        false
    }

    async fn handle_unsub(&mut self, uid: &str, tiles: Vec<TileKey>) -> Result<()> {
        let now = now_ms();
        let mut changed = false;
        for tile in tiles {
            let removed = {
                let Some(client) = self.clients.get_mut(uid) else {
                    return Ok(());
                };
                // Unsubs count toward the churn window but are never
                // blocked: refusing cleanup would leak refcounts.
                client.churn.record_then_over(now);
                client.subscribed.remove(&tile)
            };
            if !removed {
                continue;
            }
            changed = true;
            if let Some(bucket) = self.tile_to_clients.get_mut(&tile) {
                bucket.remove(uid);
                if bucket.is_empty() {
                    self.tile_to_clients.remove(&tile);
                    self.watch_unsub(tile).await;
                }
            }
        }
        if changed {
            self.cursors.refresh(&mut self.clients, now);
        }
        Ok(())
    }

    async fn handle_set_cell(
        &mut self,
        uid: &str,
        tile: TileKey,
        i: u16,
        v: u8,
        op: String,
    ) -> Result<()> {
        let now = now_ms();
        let (out, name, admitted, subscribed) = {
            let Some(client) = self.clients.get_mut(uid) else {
                return Ok(());
            };
            (
                client.out.clone(),
                client.name.clone(),
                client.setcell.try_acquire(now),
                client.subscribed.contains(&tile),
            )
        };
        if !admitted {
            crate::metrics::rate_limited("setcell");
            emit_err(&out, codes::SETCELL_LIMIT, "setCell rate limit reached");
            return Ok(());
        }
        if !tile.is_valid() {
            emit_err(&out, codes::BAD_TILE, "tile key out of bounds");
            return Ok(());
        }
        if !subscribed {
            // Stale-client recovery: refuse the write but hand over a
            // fresh snapshot so the client can converge and retry.
            emit_err(&out, codes::NOT_SUBSCRIBED, "subscribe before writing");
            self.push_snapshot(tile, &out).await;
            return Ok(());
        }

        let owner = self.registry.owner(tile).await?;
        // Reassert the watch on every write: owners recycle and forget
        // their watcher set, and this is how it heals.
        let watch = owner.watch(&self.name, true).await?;
        if !watch.ok {
            emit_err(
                &out,
                watch.code.unwrap_or(codes::TILE_SUB_DENIED),
                "tile is over watcher capacity",
            );
            return Ok(());
        }

        let outcome = owner
            .set_cell(SetCellRequest {
                i,
                v,
                op,
                uid: uid.to_owned(),
                name,
                at_ms: now,
            })
            .await?;
        if !outcome.accepted {
            emit_err(
                &out,
                codes::SETCELL_REJECTED,
                outcome.reason.unwrap_or("rejected"),
            );
        } else if !outcome.changed {
            // No broadcast will follow; push a snapshot so a stale local
            // cache still converges.
            self.push_snapshot(tile, &out).await;
        }
        Ok(())
    }

    async fn handle_resync(&mut self, uid: &str, tile: TileKey, have_ver: u32) -> Result<()> {
        let Some(out) = self.clients.get(uid).map(|c| c.out.clone()) else {
            return Ok(());
        };
        if !tile.is_valid() {
            emit_err(&out, codes::BAD_TILE, "tile key out of bounds");
            return Ok(());
        }
        tracing::debug!(shard = %self.name, uid, %tile, have_ver, "resync requested");
        self.push_snapshot(tile, &out).await;
        Ok(())
    }

    fn handle_cursor(&mut self, uid: &str, x: f32, y: f32) {
        let now = now_ms();
        let name = {
            let Some(client) = self.clients.get_mut(uid) else {
                return;
            };
            client.last_cursor = Some((x, y));
            client.name.clone()
        };
        self.cursors.on_local(uid, &name, x, y, now, &self.clients);
    }

    async fn push_snapshot(&self, tile: TileKey, out: &async_channel::Sender<Bytes>) {
        let snapshot = match self.registry.owner(tile).await {
            Ok(owner) => owner.snapshot().await,
            Err(e) => Err(e),
        };
        match snapshot {
            Ok(snap) => emit_to(
                out,
                &ServerMessage::TileSnap {
                    tile: snap.tile,
                    ver: snap.ver,
                    bits: snap.bits,
                },
            ),
            Err(e) => {
                tracing::warn!(shard = %self.name, %tile, ?e, "snapshot fetch failed");
                emit_err(out, codes::INTERNAL, "snapshot unavailable");
            }
        }
    }

    /// Owner broadcast arriving on the batch inbox: forward to every local
    /// socket subscribed to the tile. The frame encodes once.
    fn fanout_batch(&mut self, batch: CellUpBatch) {
        let Some(bucket) = self.tile_to_clients.get(&batch.tile) else {
            return;
        };
        let frame = ServerMessage::CellUpBatch(batch).encode();
        let mut delivered = 0;
        for uid in bucket {
            if let Some(client) = self.clients.get(uid) {
                if client.out.try_send(frame.clone()).is_ok() {
                    delivered += 1;
                } else {
                    crate::metrics::message_dropped("cellUpBatch");
                }
            }
        }
        crate::metrics::batch_fanout(delivered);
    }
}
