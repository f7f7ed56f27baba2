//! The tile owner actor.
//!
//! One task per live tile, sole authority over that tile's state. All
//! writes are serialized through its inbox, which is the linearization
//! point for concurrent edits. Broadcasts to watcher shards are batched
//! (WAL-style) and never awaited on the write path, so a shard awaiting an
//! owner reply can never deadlock against the owner fanning out to it.

use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;

use anyhow::{Context, Result, ensure};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use gingham_common::domain::{
    RECENT_EDITS, RECENT_OP_IDS, SNAPSHOT_FLUSH_MS, SNAPSHOT_FLUSH_OPS, TILE_CELL_COUNT,
    TILE_DENY_WATCHER_THRESHOLD, TILE_READONLY_WATCHER_THRESHOLD, TileKey, WAL_FLUSH_MS,
    WAL_FLUSH_OPS, is_cell_index_valid,
};
use gingham_common::rle::{decode_rle64, encode_rle64};
use gingham_common::wire::{CellUpBatch, codes};

use crate::persistence::{PersistedEdit, TilePersistence, TileRecord, TileSnapshot};
use crate::registry::ShardDirectory;

/// setCell rejection / no-op reasons.
pub mod reasons {
    pub const INVALID_CELL_INDEX: &str = "invalid_cell_index";
    pub const DUPLICATE_OP: &str = "duplicate_op";
}

#[derive(Debug, Clone)]
pub struct SetCellRequest {
    pub i: u16,
    pub v: u8,
    pub op: String,
    pub uid: String,
    pub name: String,
    pub at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetCellOutcome {
    pub accepted: bool,
    pub changed: bool,
    pub ver: u32,
    pub reason: Option<&'static str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchOutcome {
    pub ok: bool,
    pub code: Option<&'static str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellEdit {
    pub uid: String,
    pub name: String,
    pub at_ms: i64,
}

/// Owner's answer to a snapshot request, ready for the wire.
#[derive(Debug, Clone)]
pub struct SnapshotReply {
    pub tile: TileKey,
    pub ver: u32,
    pub bits: String,
}

pub enum OwnerCommand {
    Watch {
        shard: String,
        sub: bool,
        reply: oneshot::Sender<WatchOutcome>,
    },
    SetCell {
        req: SetCellRequest,
        reply: oneshot::Sender<SetCellOutcome>,
    },
    Snapshot {
        reply: oneshot::Sender<SnapshotReply>,
    },
    CellLastEdit {
        i: u16,
        reply: oneshot::Sender<Option<CellEdit>>,
    },
}

/// Cheap cloneable handle to one tile owner task.
#[derive(Clone)]
pub struct OwnerHandle {
    tile: TileKey,
    tx: mpsc::Sender<OwnerCommand>,
}

impl OwnerHandle {
    pub fn tile(&self) -> TileKey {
        self.tile
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> OwnerCommand,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| anyhow::anyhow!("tile owner {} is gone", self.tile))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("tile owner {} dropped reply", self.tile))
    }

    pub async fn watch(&self, shard: &str, sub: bool) -> Result<WatchOutcome> {
        let shard = shard.to_owned();
        self.call(|reply| OwnerCommand::Watch { shard, sub, reply })
            .await
    }

    pub async fn set_cell(&self, req: SetCellRequest) -> Result<SetCellOutcome> {
        self.call(|reply| OwnerCommand::SetCell { req, reply }).await
    }

    pub async fn snapshot(&self) -> Result<SnapshotReply> {
        self.call(|reply| OwnerCommand::Snapshot { reply }).await
    }

    pub async fn cell_last_edit(&self, i: u16) -> Result<Option<CellEdit>> {
        self.call(|reply| OwnerCommand::CellLastEdit { i, reply })
            .await
    }
}

const INBOX_CAPACITY: usize = 256;

/// Validate a loaded record and spawn the owner task for `tile`.
pub(crate) fn spawn_owner(
    tile: TileKey,
    record: TileRecord,
    persistence: Arc<TilePersistence>,
    shards: ShardDirectory,
    cancel: CancellationToken,
) -> Result<OwnerHandle> {
    let mut owner = TileOwner::blank(tile, persistence, shards);
    if let Some(snapshot) = record.snapshot {
        owner.load_snapshot(snapshot)?;
    }
    owner.watchers = record.subscribers.into_iter().collect();

    let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
    crate::metrics::owner_spawned();
    tokio::spawn(async move { owner.run(rx, cancel).await });
    Ok(OwnerHandle { tile, tx })
}

struct TileOwner {
    tile: TileKey,
    bits: Box<[u8]>,
    version: u32,
    last_edits: FxHashMap<u16, CellEdit>,
    recent_ops: VecDeque<String>,
    recent_ops_set: FxHashSet<String>,
    recent_edits: VecDeque<(u16, i64)>,
    watchers: FxHashSet<String>,

    // Pending broadcast batch. from_ver is the version after the first
    // queued apply, so to_ver = from_ver + ops - 1 is always the current
    // version at flush time.
    wal_ops: Vec<(u16, u8)>,
    wal_from_ver: u32,
    wal_first_at: Option<Instant>,

    // Snapshot write-behind. `dirty` means memory is ahead of persistence;
    // `follow_up` means changes landed while a flush was in flight.
    dirty: bool,
    follow_up: bool,
    ops_since_flush: u64,
    last_flush_at: Instant,

    persistence: Arc<TilePersistence>,
    shards: ShardDirectory,
}

impl TileOwner {
    fn blank(tile: TileKey, persistence: Arc<TilePersistence>, shards: ShardDirectory) -> Self {
        Self {
            tile,
            bits: vec![0u8; TILE_CELL_COUNT].into_boxed_slice(),
            version: 0,
            last_edits: FxHashMap::default(),
            recent_ops: VecDeque::new(),
            recent_ops_set: FxHashSet::default(),
            recent_edits: VecDeque::new(),
            watchers: FxHashSet::default(),
            wal_ops: Vec::new(),
            wal_from_ver: 0,
            wal_first_at: None,
            dirty: false,
            follow_up: false,
            ops_since_flush: 0,
            last_flush_at: Instant::now(),
            persistence,
            shards,
        }
    }

    /// Initialize from a persisted snapshot. Resets the dedup ring: op-ids
    /// do not survive an owner recycle, which is why shards reassert their
    /// watch on every setCell.
    fn load_snapshot(&mut self, snapshot: TileSnapshot) -> Result<()> {
        let bits = decode_rle64(&snapshot.bits).context("bad_snapshot")?;
        ensure!(bits.len() == TILE_CELL_COUNT, "bad_snapshot: cell count");
        self.bits = bits.into_boxed_slice();
        self.version = snapshot.ver;
        self.last_edits = snapshot
            .edits
            .into_iter()
            .map(|e| {
                (
                    e.i,
                    CellEdit {
                        uid: e.uid,
                        name: e.name,
                        at_ms: e.at_ms,
                    },
                )
            })
            .collect();
        self.recent_ops.clear();
        self.recent_ops_set.clear();
        Ok(())
    }

    async fn run(mut self, mut rx: mpsc::Receiver<OwnerCommand>, cancel: CancellationToken) {
        let mut flush_task: Option<JoinHandle<Result<()>>> = None;
        loop {
            let wal_deadline = self
                .wal_first_at
                .map(|t| t + Duration::from_millis(WAL_FLUSH_MS));
            let snapshot_armed = self.dirty && flush_task.is_none();
            let snapshot_deadline = self.last_flush_at + Duration::from_millis(SNAPSHOT_FLUSH_MS);

            tokio::select! {
                _ = cancel.cancelled() => break,
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd, &mut flush_task).await,
                    None => break,
                },
                _ = sleep_until(wal_deadline.unwrap_or_else(Instant::now)),
                    if wal_deadline.is_some() =>
                {
                    self.flush_wal();
                }
                _ = sleep_until(snapshot_deadline), if snapshot_armed => {
                    self.begin_snapshot_flush(&mut flush_task);
                }
                res = async { flush_task.as_mut().expect("guarded").await },
                    if flush_task.is_some() =>
                {
                    flush_task = None;
                    self.finish_snapshot_flush(res, &mut flush_task);
                }
            }
        }
        self.teardown(flush_task).await;
    }

    /// Drain everything on the way out so a clean shutdown loses nothing.
    async fn teardown(mut self, flush_task: Option<JoinHandle<Result<()>>>) {
        self.flush_wal();
        if let Some(task) = flush_task {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(tile = %self.tile, ?e, "snapshot flush failed during teardown");
                    self.dirty = true;
                }
                Err(e) => {
                    tracing::warn!(tile = %self.tile, ?e, "snapshot flush panicked during teardown");
                    self.dirty = true;
                }
            }
        }
        if self.dirty {
            let snapshot = self.snapshot_doc();
            if let Err(e) = self.persistence.save_snapshot(self.tile, &snapshot).await {
                tracing::error!(tile = %self.tile, ?e, "final snapshot flush failed");
            }
        }
    }

    async fn handle(&mut self, cmd: OwnerCommand, flush_task: &mut Option<JoinHandle<Result<()>>>) {
        match cmd {
            OwnerCommand::Watch { shard, sub, reply } => {
                let (outcome, changed) = self.watch(shard, sub);
                if changed {
                    // Awaited inline so successive watch changes persist in
                    // order. Failure only logs: the set is advisory and
                    // self-heals through shard reassertions.
                    self.persist_watchers().await;
                }
                reply.send(outcome).ok();
            }
            OwnerCommand::SetCell { req, reply } => {
                let outcome = self.set_cell(req, flush_task);
                reply.send(outcome).ok();
            }
            OwnerCommand::Snapshot { reply } => {
                reply
                    .send(SnapshotReply {
                        tile: self.tile,
                        ver: self.version,
                        bits: encode_rle64(&self.bits),
                    })
                    .ok();
            }
            OwnerCommand::CellLastEdit { i, reply } => {
                reply.send(self.last_edits.get(&i).cloned()).ok();
            }
        }
    }

    /// Mutate the watcher set. The boolean reports whether the set
    /// actually changed and needs persisting.
    fn watch(&mut self, shard: String, sub: bool) -> (WatchOutcome, bool) {
        let changed = if sub {
            if !self.watchers.contains(&shard)
                && self.watchers.len() >= TILE_DENY_WATCHER_THRESHOLD
            {
                return (
                    WatchOutcome {
                        ok: false,
                        code: Some(codes::TILE_SUB_DENIED),
                    },
                    false,
                );
            }
            self.watchers.insert(shard)
        } else {
            self.watchers.remove(&shard)
        };
        (WatchOutcome { ok: true, code: None }, changed)
    }

    async fn persist_watchers(&self) {
        let mut subscribers: Vec<String> = self.watchers.iter().cloned().collect();
        subscribers.sort();
        if let Err(e) = self
            .persistence
            .save_subscribers(self.tile, &subscribers)
            .await
        {
            tracing::warn!(tile = %self.tile, ?e, "subscriber persistence failed");
        }
    }

    fn set_cell(
        &mut self,
        req: SetCellRequest,
        flush_task: &mut Option<JoinHandle<Result<()>>>,
    ) -> SetCellOutcome {
        if !is_cell_index_valid(req.i as u32) {
            crate::metrics::setcell("invalid_cell_index");
            return SetCellOutcome {
                accepted: false,
                changed: false,
                ver: self.version,
                reason: Some(reasons::INVALID_CELL_INDEX),
            };
        }
        if self.watchers.len() >= TILE_READONLY_WATCHER_THRESHOLD {
            crate::metrics::setcell("readonly_hot");
            return SetCellOutcome {
                accepted: false,
                changed: false,
                ver: self.version,
                reason: Some(codes::TILE_READONLY_HOT),
            };
        }
        if self.recent_ops_set.contains(&req.op) {
            crate::metrics::setcell("duplicate");
            return SetCellOutcome {
                accepted: true,
                changed: false,
                ver: self.version,
                reason: Some(reasons::DUPLICATE_OP),
            };
        }
        let i = req.i as usize;
        if self.bits[i] == req.v {
            crate::metrics::setcell("unchanged");
            return SetCellOutcome {
                accepted: true,
                changed: false,
                ver: self.version,
                reason: None,
            };
        }

        self.bits[i] = req.v;
        self.version += 1;
        self.last_edits.insert(
            req.i,
            CellEdit {
                uid: req.uid,
                name: req.name,
                at_ms: req.at_ms,
            },
        );
        self.remember_op(req.op);
        self.recent_edits.push_back((req.i, req.at_ms));
        if self.recent_edits.len() > RECENT_EDITS {
            self.recent_edits.pop_front();
        }

        if self.wal_ops.is_empty() {
            self.wal_from_ver = self.version;
            self.wal_first_at = Some(Instant::now());
        }
        self.wal_ops.push((req.i, req.v));
        if self.wal_ops.len() >= WAL_FLUSH_OPS {
            self.flush_wal();
        }

        self.dirty = true;
        self.ops_since_flush += 1;
        if self.ops_since_flush >= SNAPSHOT_FLUSH_OPS {
            self.begin_snapshot_flush(flush_task);
        }

        crate::metrics::setcell("changed");
        SetCellOutcome {
            accepted: true,
            changed: true,
            ver: self.version,
            reason: None,
        }
    }

    fn remember_op(&mut self, op: String) {
        if self.recent_ops.len() >= RECENT_OP_IDS {
            if let Some(evicted) = self.recent_ops.pop_front() {
                self.recent_ops_set.remove(&evicted);
            }
        }
        self.recent_ops_set.insert(op.clone());
        self.recent_ops.push_back(op);
    }

    /// Emit the pending batch to every watcher shard. Fire-and-forget: a
    /// full or closed shard inbox drops the batch for that shard, which
    /// recovers via snapshot resync.
    fn flush_wal(&mut self) {
        if self.wal_ops.is_empty() {
            return;
        }
        let ops = mem::take(&mut self.wal_ops);
        self.wal_first_at = None;
        let to_ver = self.wal_from_ver + ops.len() as u32 - 1;
        debug_assert_eq!(to_ver, self.version);
        let batch = CellUpBatch {
            tile: self.tile,
            from_ver: self.wal_from_ver,
            to_ver,
            ops,
        };
        crate::metrics::wal_batch(batch.ops.len());
        for shard in &self.watchers {
            if !self.shards.deliver(shard, batch.clone()) {
                crate::metrics::broadcast_dropped();
                tracing::debug!(tile = %self.tile, shard, "tile batch dropped");
            }
        }
    }

    fn snapshot_doc(&self) -> TileSnapshot {
        let mut edits: Vec<PersistedEdit> = self
            .last_edits
            .iter()
            .map(|(&i, e)| PersistedEdit {
                i,
                uid: e.uid.clone(),
                name: e.name.clone(),
                at_ms: e.at_ms,
            })
            .collect();
        edits.sort_by_key(|e| e.i);
        TileSnapshot {
            bits: encode_rle64(&self.bits),
            ver: self.version,
            edits,
        }
    }

    fn begin_snapshot_flush(&mut self, flush_task: &mut Option<JoinHandle<Result<()>>>) {
        if flush_task.is_some() {
            self.follow_up = true;
            return;
        }
        let snapshot = self.snapshot_doc();
        self.dirty = false;
        self.ops_since_flush = 0;
        self.last_flush_at = Instant::now();
        let persistence = self.persistence.clone();
        let tile = self.tile;
        *flush_task = Some(tokio::spawn(async move {
            persistence.save_snapshot(tile, &snapshot).await
        }));
    }

    fn finish_snapshot_flush(
        &mut self,
        res: Result<Result<()>, tokio::task::JoinError>,
        flush_task: &mut Option<JoinHandle<Result<()>>>,
    ) {
        match res {
            Ok(Ok(())) => crate::metrics::snapshot_flush(true),
            Ok(Err(e)) => {
                crate::metrics::snapshot_flush(false);
                // Memory stays authoritative; the flush timer retries.
                tracing::warn!(tile = %self.tile, ?e, "snapshot flush failed");
                self.dirty = true;
            }
            Err(e) => {
                crate::metrics::snapshot_flush(false);
                tracing::error!(tile = %self.tile, ?e, "snapshot flush panicked");
                self.dirty = true;
            }
        }
        if mem::take(&mut self.follow_up) && self.dirty {
            self.begin_snapshot_flush(flush_task);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn request(i: u16, v: u8, op: &str) -> SetCellRequest {
        SetCellRequest {
            i,
            v,
            op: op.to_owned(),
            uid: "u_a".into(),
            name: "Abc".into(),
            at_ms: 1,
        }
    }

    struct Fixture {
        handle: OwnerHandle,
        batches: mpsc::Receiver<CellUpBatch>,
        persistence: Arc<TilePersistence>,
        cancel: CancellationToken,
    }

    fn fixture_with_record(record: TileRecord) -> Result<Fixture> {
        let (batch_tx, batches) = mpsc::channel(64);
        let shards = ShardDirectory::single("shard-0", batch_tx);
        let persistence = Arc::new(TilePersistence::ephemeral());
        let cancel = CancellationToken::new();
        let handle = spawn_owner(
            TileKey::new(0, 0),
            record,
            persistence.clone(),
            shards,
            cancel.clone(),
        )?;
        Ok(Fixture {
            handle,
            batches,
            persistence,
            cancel,
        })
    }

    fn fixture() -> Fixture {
        fixture_with_record(TileRecord::default()).unwrap()
    }

    #[tokio::test]
    async fn version_is_monotonic_and_steps_only_on_change() {
        let f = fixture();
        let mut last_ver = 0;
        for (n, (i, v)) in [(1u16, 1u8), (1, 1), (2, 1), (1, 0), (3, 1)].iter().enumerate() {
            let out = f
                .handle
                .set_cell(request(*i, *v, &format!("op-{n}")))
                .await
                .unwrap();
            assert!(out.accepted);
            assert!(out.ver >= last_ver);
            if out.changed {
                assert_eq!(out.ver, last_ver + 1);
            } else {
                assert_eq!(out.ver, last_ver);
            }
            last_ver = out.ver;
        }
        assert_eq!(last_ver, 4);
    }

    #[tokio::test]
    async fn duplicate_op_is_idempotent() {
        let f = fixture();
        let first = f.handle.set_cell(request(7, 1, "op-a")).await.unwrap();
        assert!(first.changed);
        assert_eq!(first.ver, 1);

        let second = f.handle.set_cell(request(7, 0, "op-a")).await.unwrap();
        assert!(second.accepted);
        assert!(!second.changed);
        assert_eq!(second.ver, 1);
        assert_eq!(second.reason, Some(reasons::DUPLICATE_OP));

        // The bit still holds the first op's value.
        let snap = f.handle.snapshot().await.unwrap();
        assert_eq!(decode_rle64(&snap.bits).unwrap()[7], 1);
    }

    #[tokio::test]
    async fn same_value_apply_does_not_bump_version() {
        let f = fixture();
        f.handle.set_cell(request(9, 1, "op-a")).await.unwrap();
        let out = f.handle.set_cell(request(9, 1, "op-b")).await.unwrap();
        assert!(out.accepted);
        assert!(!out.changed);
        assert_eq!(out.ver, 1);
        assert_eq!(out.reason, None);
    }

    #[tokio::test]
    async fn invalid_cell_index_is_rejected() {
        let f = fixture();
        let out = f
            .handle
            .set_cell(request(u16::MAX, 1, "op-a"))
            .await
            .unwrap();
        assert!(!out.accepted);
        assert_eq!(out.reason, Some(reasons::INVALID_CELL_INDEX));
        assert_eq!(out.ver, 0);
    }

    #[tokio::test]
    async fn readonly_and_deny_thresholds() {
        let f = fixture();
        for n in 0..TILE_READONLY_WATCHER_THRESHOLD {
            let out = f.handle.watch(&format!("shard-{n}"), true).await.unwrap();
            assert!(out.ok);
        }
        // Eight watchers: writes refused, reads and subs continue.
        let out = f.handle.set_cell(request(0, 1, "op-a")).await.unwrap();
        assert!(!out.accepted);
        assert_eq!(out.reason, Some(codes::TILE_READONLY_HOT));

        for n in TILE_READONLY_WATCHER_THRESHOLD..TILE_DENY_WATCHER_THRESHOLD {
            let out = f.handle.watch(&format!("shard-{n}"), true).await.unwrap();
            assert!(out.ok, "watcher {n} should still be admitted");
        }
        // Twelve watchers: a thirteenth distinct shard is denied...
        let out = f.handle.watch("shard-999", true).await.unwrap();
        assert!(!out.ok);
        assert_eq!(out.code, Some(codes::TILE_SUB_DENIED));
        // ...but an already-subscribed shard may reassert.
        let out = f.handle.watch("shard-0", true).await.unwrap();
        assert!(out.ok);
        // And unsub stays idempotent.
        assert!(f.handle.watch("shard-0", false).await.unwrap().ok);
        assert!(f.handle.watch("shard-0", false).await.unwrap().ok);
    }

    #[tokio::test(start_paused = true)]
    async fn wal_flushes_on_deadline_with_exact_version_span() {
        let mut f = fixture();
        f.handle.watch("shard-0", true).await.unwrap();
        for n in 0..3 {
            f.handle
                .set_cell(request(n, 1, &format!("op-{n}")))
                .await
                .unwrap();
        }
        tokio::time::advance(Duration::from_millis(WAL_FLUSH_MS + 5)).await;
        let batch = f.batches.recv().await.unwrap();
        assert_eq!(batch.from_ver, 1);
        assert_eq!(batch.to_ver, 3);
        assert_eq!(batch.ops, vec![(0, 1), (1, 1), (2, 1)]);
        assert_eq!(
            batch.to_ver - batch.from_ver + 1,
            batch.ops.len() as u32
        );
    }

    #[tokio::test]
    async fn wal_flushes_immediately_at_op_cap() {
        let mut f = fixture();
        f.handle.watch("shard-0", true).await.unwrap();
        // 128 changed ops: toggle 128 distinct cells.
        for n in 0..WAL_FLUSH_OPS as u16 {
            f.handle
                .set_cell(request(n, 1, &format!("op-{n}")))
                .await
                .unwrap();
        }
        let batch = f.batches.recv().await.unwrap();
        assert_eq!(batch.ops.len(), WAL_FLUSH_OPS);
        assert_eq!(batch.from_ver, 1);
        assert_eq!(batch.to_ver, WAL_FLUSH_OPS as u32);
    }

    #[tokio::test(start_paused = true)]
    async fn unwatched_owner_broadcasts_nothing() {
        let mut f = fixture();
        f.handle.set_cell(request(0, 1, "op-a")).await.unwrap();
        tokio::time::advance(Duration::from_millis(WAL_FLUSH_MS * 2)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(f.batches.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_flushes_on_timer() {
        let f = fixture();
        f.handle.set_cell(request(42, 1, "op-a")).await.unwrap();
        tokio::time::advance(Duration::from_millis(SNAPSHOT_FLUSH_MS + 50)).await;
        // Yield so the spawned flush task runs to completion.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        let record = f.persistence.load(TileKey::new(0, 0)).await.unwrap();
        let snapshot = record.snapshot.expect("snapshot persisted");
        assert_eq!(snapshot.ver, 1);
        assert_eq!(decode_rle64(&snapshot.bits).unwrap()[42], 1);
        assert_eq!(snapshot.edits.len(), 1);
        assert_eq!(snapshot.edits[0].i, 42);
    }

    #[tokio::test]
    async fn owner_restart_resumes_from_snapshot() {
        let f = fixture();
        f.handle.set_cell(request(5, 1, "op-a")).await.unwrap();
        f.handle.set_cell(request(6, 1, "op-b")).await.unwrap();
        // Shut the owner down; teardown writes the final snapshot.
        f.cancel.cancel();
        let record = loop {
            tokio::task::yield_now().await;
            let record = f.persistence.load(TileKey::new(0, 0)).await.unwrap();
            if record.snapshot.is_some() {
                break record;
            }
        };

        let f2 = fixture_with_record(record).unwrap();
        let snap = f2.handle.snapshot().await.unwrap();
        assert_eq!(snap.ver, 2);
        let bits = decode_rle64(&snap.bits).unwrap();
        assert_eq!(bits[5], 1);
        assert_eq!(bits[6], 1);
        // The dedup ring was cleared on load: a replayed op-id applies as a
        // fresh write rather than reporting duplicate_op.
        let out = f2.handle.set_cell(request(5, 0, "op-a")).await.unwrap();
        assert!(out.changed);
        assert_eq!(out.ver, 3);

        let edit = f2.handle.cell_last_edit(6).await.unwrap().unwrap();
        assert_eq!(edit.uid, "u_a");
    }

    #[tokio::test]
    async fn corrupt_snapshot_fails_spawn() {
        let record = TileRecord {
            snapshot: Some(TileSnapshot {
                bits: "definitely-not-rle64!!".into(),
                ver: 3,
                edits: vec![],
            }),
            subscribers: vec![],
        };
        assert!(fixture_with_record(record).is_err());
    }

    #[tokio::test]
    async fn loaded_subscribers_receive_broadcasts() {
        let record = TileRecord {
            snapshot: None,
            subscribers: vec!["shard-0".into()],
        };
        let mut f = fixture_with_record(record).unwrap();
        for n in 0..WAL_FLUSH_OPS as u16 {
            f.handle
                .set_cell(request(n, 1, &format!("op-{n}")))
                .await
                .unwrap();
        }
        assert_eq!(f.batches.recv().await.unwrap().ops.len(), WAL_FLUSH_OPS);
    }

    #[tokio::test]
    async fn cell_last_edit_absent_for_untouched_cells() {
        let f = fixture();
        assert!(f.handle.cell_last_edit(0).await.unwrap().is_none());
    }
}
