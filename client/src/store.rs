//! Client-side tile cache.
//!
//! An LRU of decoded tiles keyed by TileKey. Entries only ever advance by
//! exactly one version step at a time (a `ver+1` single op or a
//! `from_ver == ver+1` batch); anything ahead of that is a gap the caller
//! must answer with a resync, and anything entirely behind is a belated
//! echo that drops without touching the entry.

use std::num::NonZeroUsize;

use lru::LruCache;

use gingham_common::domain::{CLIENT_TILE_CACHE, TILE_CELL_COUNT, TileKey};

#[derive(Debug, Clone)]
pub struct ClientTileEntry {
    pub bits: Vec<u8>,
    pub ver: u32,
}

/// Outcome of applying a server update to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// Entry advanced to this version.
    Ok { ver: u32 },
    /// Update is entirely behind the entry; dropped without mutation.
    Stale,
    /// Update does not connect to the entry (or the entry is missing).
    /// `have_ver` is -1 when the tile is absent. The caller owes exactly
    /// one resync per gap.
    Gap { have_ver: i64 },
}

impl Applied {
    pub fn is_gap(&self) -> bool {
        matches!(self, Applied::Gap { .. })
    }
}

pub struct TileStore {
    cache: LruCache<TileKey, ClientTileEntry>,
}

impl Default for TileStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TileStore {
    pub fn new() -> Self {
        Self {
            cache: LruCache::new(NonZeroUsize::new(CLIENT_TILE_CACHE).expect("non-zero capacity")),
        }
    }

    /// Authoritative snapshot: overwrites whatever is cached.
    pub fn set_snapshot(&mut self, tile: TileKey, bits: Vec<u8>, ver: u32) {
        debug_assert_eq!(bits.len(), TILE_CELL_COUNT);
        self.cache.put(tile, ClientTileEntry { bits, ver });
    }

    pub fn get(&mut self, tile: TileKey) -> Option<&ClientTileEntry> {
        self.cache.get(&tile)
    }

    /// Version and bits without disturbing LRU order (render reads).
    pub fn peek(&self, tile: TileKey) -> Option<&ClientTileEntry> {
        self.cache.peek(&tile)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn apply_single(&mut self, tile: TileKey, i: u16, v: u8, ver: u32) -> Applied {
        let Some(entry) = self.cache.get_mut(&tile) else {
            return Applied::Gap { have_ver: -1 };
        };
        if ver <= entry.ver {
            return Applied::Stale;
        }
        if ver != entry.ver + 1 {
            return Applied::Gap {
                have_ver: entry.ver as i64,
            };
        }
        entry.bits[i as usize] = v;
        entry.ver = ver;
        Applied::Ok { ver }
    }

    pub fn apply_batch(
        &mut self,
        tile: TileKey,
        from_ver: u32,
        to_ver: u32,
        ops: &[(u16, u8)],
    ) -> Applied {
        let Some(entry) = self.cache.get_mut(&tile) else {
            return Applied::Gap { have_ver: -1 };
        };
        if to_ver <= entry.ver {
            return Applied::Stale;
        }
        if from_ver != entry.ver + 1 {
            // Ahead of us, or straddling our version: either way we cannot
            // apply it exactly once per step, so resync.
            return Applied::Gap {
                have_ver: entry.ver as i64,
            };
        }
        for &(i, v) in ops {
            entry.bits[i as usize] = v;
        }
        entry.ver = to_ver;
        Applied::Ok { ver: to_ver }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank() -> Vec<u8> {
        vec![0u8; TILE_CELL_COUNT]
    }

    fn tile() -> TileKey {
        TileKey::new(0, 0)
    }

    #[test]
    fn missing_tile_is_a_gap_with_sentinel_version() {
        let mut store = TileStore::new();
        assert_eq!(
            store.apply_single(tile(), 0, 1, 1),
            Applied::Gap { have_ver: -1 }
        );
        assert_eq!(
            store.apply_batch(tile(), 1, 1, &[(0, 1)]),
            Applied::Gap { have_ver: -1 }
        );
    }

    #[test]
    fn single_ops_advance_one_step_at_a_time() {
        let mut store = TileStore::new();
        store.set_snapshot(tile(), blank(), 0);

        assert_eq!(store.apply_single(tile(), 7, 1, 1), Applied::Ok { ver: 1 });
        // Version jump leaves the entry untouched.
        assert_eq!(
            store.apply_single(tile(), 8, 1, 3),
            Applied::Gap { have_ver: 1 }
        );
        let entry = store.get(tile()).unwrap();
        assert_eq!(entry.ver, 1);
        assert_eq!(entry.bits[8], 0);
    }

    #[test]
    fn belated_updates_drop_silently() {
        let mut store = TileStore::new();
        store.set_snapshot(tile(), blank(), 5);

        assert_eq!(store.apply_single(tile(), 0, 1, 5), Applied::Stale);
        assert_eq!(store.apply_single(tile(), 0, 1, 4), Applied::Stale);
        assert_eq!(store.apply_batch(tile(), 3, 5, &[(0, 1), (1, 1), (2, 1)]), Applied::Stale);
        // Nothing moved.
        let entry = store.get(tile()).unwrap();
        assert_eq!(entry.ver, 5);
        assert_eq!(entry.bits[0], 0);
    }

    #[test]
    fn straddling_batch_is_a_gap_not_a_partial_apply() {
        let mut store = TileStore::new();
        store.set_snapshot(tile(), blank(), 5);
        // Batch spans 4..=7: contains versions we have and versions we
        // need, so the only safe answer is resync.
        assert_eq!(
            store.apply_batch(tile(), 4, 7, &[(0, 1), (1, 1), (2, 1), (3, 1)]),
            Applied::Gap { have_ver: 5 }
        );
        assert_eq!(store.get(tile()).unwrap().ver, 5);
    }

    #[test]
    fn batch_equals_singles() {
        let ops: Vec<(u16, u8)> = vec![(1, 1), (9, 1), (1, 0), (4095, 1), (9, 0)];

        let mut batched = TileStore::new();
        batched.set_snapshot(tile(), blank(), 3);
        assert_eq!(
            batched.apply_batch(tile(), 4, 8, &ops),
            Applied::Ok { ver: 8 }
        );

        let mut single = TileStore::new();
        single.set_snapshot(tile(), blank(), 3);
        for (n, &(i, v)) in ops.iter().enumerate() {
            assert_eq!(
                single.apply_single(tile(), i, v, 4 + n as u32),
                Applied::Ok { ver: 4 + n as u32 }
            );
        }

        assert_eq!(batched.get(tile()).unwrap().ver, single.get(tile()).unwrap().ver);
        assert_eq!(batched.get(tile()).unwrap().bits, single.get(tile()).unwrap().bits);
    }

    #[test]
    fn interleavings_converge() {
        // Two replicas of the same tile stream: one sees a snapshot then
        // batches, the other sees singles with a belated duplicate mixed
        // in. Both end identical.
        let mut a = TileStore::new();
        let mut b = TileStore::new();

        a.set_snapshot(tile(), blank(), 0);
        b.set_snapshot(tile(), blank(), 0);

        assert_eq!(a.apply_batch(tile(), 1, 2, &[(10, 1), (20, 1)]), Applied::Ok { ver: 2 });
        assert_eq!(a.apply_single(tile(), 30, 1, 3), Applied::Ok { ver: 3 });

        assert_eq!(b.apply_single(tile(), 10, 1, 1), Applied::Ok { ver: 1 });
        assert_eq!(b.apply_single(tile(), 20, 1, 2), Applied::Ok { ver: 2 });
        // Belated repeat of version 2 drops.
        assert_eq!(b.apply_single(tile(), 20, 1, 2), Applied::Stale);
        assert_eq!(b.apply_batch(tile(), 3, 3, &[(30, 1)]), Applied::Ok { ver: 3 });

        assert_eq!(a.get(tile()).unwrap().bits, b.get(tile()).unwrap().bits);
        assert_eq!(a.get(tile()).unwrap().ver, b.get(tile()).unwrap().ver);
    }

    #[test]
    fn snapshot_overwrites_and_recovers_from_gap() {
        let mut store = TileStore::new();
        store.set_snapshot(tile(), blank(), 5);
        assert!(store.apply_single(tile(), 0, 1, 7).is_gap());

        let mut bits = blank();
        bits[0] = 1;
        store.set_snapshot(tile(), bits, 7);
        assert_eq!(store.get(tile()).unwrap().ver, 7);
        // Belated in-order batch from before the snapshot now drops.
        assert_eq!(store.apply_batch(tile(), 6, 7, &[(1, 1), (0, 1)]), Applied::Stale);
        // And the stream continues from the snapshot version.
        assert_eq!(store.apply_single(tile(), 2, 1, 8), Applied::Ok { ver: 8 });
    }

    #[test]
    fn lru_evicts_oldest_tiles() {
        let mut store = TileStore::new();
        for n in 0..(CLIENT_TILE_CACHE + 10) {
            store.set_snapshot(TileKey::new(n as i32, 0), blank(), 0);
        }
        assert_eq!(store.len(), CLIENT_TILE_CACHE);
        // The first tiles inserted are gone; the most recent remain.
        assert!(store.peek(TileKey::new(0, 0)).is_none());
        assert!(store.peek(TileKey::new(9, 0)).is_none());
        assert!(
            store
                .peek(TileKey::new((CLIENT_TILE_CACHE + 9) as i32, 0))
                .is_some()
        );
    }
}
