//! Owner registry and shard fanout directory.
//!
//! The registry lazily spawns one owner task per tile, loading persisted
//! state first. The directory maps shard names to their batch inboxes so
//! owners can fan out without ever awaiting a shard.

use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use gingham_common::domain::TileKey;
use gingham_common::wire::CellUpBatch;

use crate::owner::{CellEdit, OwnerHandle, spawn_owner};
use crate::persistence::TilePersistence;

/// Immutable name → batch-inbox map, built once at startup.
#[derive(Clone, Default)]
pub struct ShardDirectory {
    sinks: Arc<FxHashMap<String, mpsc::Sender<CellUpBatch>>>,
}

impl ShardDirectory {
    pub fn new(sinks: FxHashMap<String, mpsc::Sender<CellUpBatch>>) -> Self {
        Self {
            sinks: Arc::new(sinks),
        }
    }

    pub fn single(name: &str, sink: mpsc::Sender<CellUpBatch>) -> Self {
        let mut sinks = FxHashMap::default();
        sinks.insert(name.to_owned(), sink);
        Self::new(sinks)
    }

    /// Non-blocking delivery. Returns false for unknown shards and full or
    /// closed inboxes; callers treat all three as a dropped broadcast.
    pub fn deliver(&self, shard: &str, batch: CellUpBatch) -> bool {
        match self.sinks.get(shard) {
            Some(sink) => sink.try_send(batch).is_ok(),
            None => false,
        }
    }
}

pub struct OwnerRegistry {
    inner: Arc<RegistryInner>,
}

impl Clone for OwnerRegistry {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct RegistryInner {
    owners: Mutex<FxHashMap<TileKey, OwnerHandle>>,
    persistence: Arc<TilePersistence>,
    shards: ShardDirectory,
    cancel: CancellationToken,
}

impl OwnerRegistry {
    pub fn new(
        persistence: Arc<TilePersistence>,
        shards: ShardDirectory,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                owners: Mutex::new(FxHashMap::default()),
                persistence,
                shards,
                cancel,
            }),
        }
    }

    /// Handle for a tile, spawning its owner on first use. The persistence
    /// load happens outside the lock; when two callers race, the loser's
    /// loaded record is discarded in favor of the already-spawned owner.
    pub async fn owner(&self, tile: TileKey) -> Result<OwnerHandle> {
        if let Some(handle) = self.inner.owners.lock().get(&tile) {
            return Ok(handle.clone());
        }
        let record = self
            .inner
            .persistence
            .load(tile)
            .await
            .with_context(|| format!("load tile {tile}"))?;

        let mut owners = self.inner.owners.lock();
        if let Some(handle) = owners.get(&tile) {
            return Ok(handle.clone());
        }
        let handle = spawn_owner(
            tile,
            record,
            self.inner.persistence.clone(),
            self.inner.shards.clone(),
            self.inner.cancel.clone(),
        )?;
        owners.insert(tile, handle.clone());
        crate::metrics::owners_live(owners.len());
        Ok(handle)
    }

    pub fn owner_if_loaded(&self, tile: TileKey) -> Option<OwnerHandle> {
        self.inner.owners.lock().get(&tile).cloned()
    }

    /// Last-editor lookup that does not disturb the owner lifecycle: a tile
    /// nobody is watching or editing answers straight from persistence.
    pub async fn cell_last_edit(&self, tile: TileKey, i: u16) -> Result<Option<CellEdit>> {
        if let Some(handle) = self.owner_if_loaded(tile) {
            return handle.cell_last_edit(i).await;
        }
        let record = self.inner.persistence.load(tile).await?;
        Ok(record.snapshot.and_then(|snap| {
            snap.edits.into_iter().find(|e| e.i == i).map(|e| CellEdit {
                uid: e.uid,
                name: e.name,
                at_ms: e.at_ms,
            })
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::owner::SetCellRequest;

    fn registry() -> OwnerRegistry {
        OwnerRegistry::new(
            Arc::new(TilePersistence::ephemeral()),
            ShardDirectory::default(),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn owner_is_spawned_once_per_tile() {
        let registry = registry();
        let tile = TileKey::new(1, 2);
        let a = registry.owner(tile).await.unwrap();
        let b = registry.owner(tile).await.unwrap();
        // Both handles reach the same actor: a write through one is seen
        // through the other.
        a.set_cell(SetCellRequest {
            i: 3,
            v: 1,
            op: "op-a".into(),
            uid: "u_a".into(),
            name: "Abc".into(),
            at_ms: 0,
        })
        .await
        .unwrap();
        assert_eq!(b.snapshot().await.unwrap().ver, 1);
    }

    #[tokio::test]
    async fn cold_last_edit_reads_persistence_without_spawning() {
        let persistence = Arc::new(TilePersistence::ephemeral());
        let tile = TileKey::new(9, 9);
        persistence
            .save_snapshot(
                tile,
                &crate::persistence::TileSnapshot {
                    bits: gingham_common::rle::encode_rle64(&vec![0u8; 4096]),
                    ver: 1,
                    edits: vec![crate::persistence::PersistedEdit {
                        i: 11,
                        uid: "u_past".into(),
                        name: "OldHand1".into(),
                        at_ms: 99,
                    }],
                },
            )
            .await
            .unwrap();
        let registry = OwnerRegistry::new(
            persistence,
            ShardDirectory::default(),
            CancellationToken::new(),
        );

        let edit = registry.cell_last_edit(tile, 11).await.unwrap().unwrap();
        assert_eq!(edit.uid, "u_past");
        assert_eq!(edit.at_ms, 99);
        assert!(registry.cell_last_edit(tile, 12).await.unwrap().is_none());
        assert!(registry.owner_if_loaded(tile).is_none());
    }
}
