//! Offline replay buffer for local setCell intents.
//!
//! Keyed by (tile, cell) so repeated toggles of one cell collapse to the
//! latest intent. An entry dies when the server echoes a matching op
//! (observed write), when it ages out, or when its replay attempts are
//! spent. Replay is paced by the caller's tick.

use rustc_hash::FxHashMap;

use gingham_common::domain::{
    OUTBOX_CAPACITY, OUTBOX_MAX_ATTEMPTS, OUTBOX_TTL_MS, PACED_DRAIN_BATCH, TileKey,
};
use gingham_common::wire::ClientMessage;

#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub tile: TileKey,
    pub i: u16,
    pub v: u8,
    pub op: String,
    pub updated_at_ms: i64,
    pub attempts: u32,
}

impl OutboxEntry {
    fn message(&self) -> ClientMessage {
        ClientMessage::SetCell {
            tile: self.tile,
            i: self.i,
            v: self.v,
            op: self.op.clone(),
        }
    }
}

#[derive(Default)]
pub struct Outbox {
    entries: FxHashMap<(TileKey, u16), OutboxEntry>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record (or refresh) a local intent. At capacity the oldest entry is
    /// evicted; a lost old intent beats a lost fresh one.
    pub fn record(&mut self, tile: TileKey, i: u16, v: u8, op: String, now_ms: i64) {
        if self.entries.len() >= OUTBOX_CAPACITY && !self.entries.contains_key(&(tile, i)) {
            if let Some(oldest) = self
                .entries
                .values()
                .min_by_key(|e| e.updated_at_ms)
                .map(|e| (e.tile, e.i))
            {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(
            (tile, i),
            OutboxEntry {
                tile,
                i,
                v,
                op,
                updated_at_ms: now_ms,
                attempts: 0,
            },
        );
    }

    /// The server observed a write for (tile, i, v): drop the matching
    /// intent. A mismatched value means someone else wrote that cell; the
    /// intent stays until our own echo or expiry.
    pub fn ack(&mut self, tile: TileKey, i: u16, v: u8) {
        if self
            .entries
            .get(&(tile, i))
            .is_some_and(|e| e.v == v)
        {
            self.entries.remove(&(tile, i));
        }
    }

    /// Pull the next replay batch: evict dead entries, then return up to
    /// PACED_DRAIN_BATCH messages, oldest first, charging one attempt each.
    pub fn replay_batch(&mut self, now_ms: i64) -> Vec<ClientMessage> {
        self.entries.retain(|_, e| {
            now_ms - e.updated_at_ms <= OUTBOX_TTL_MS && e.attempts < OUTBOX_MAX_ATTEMPTS
        });

        let mut keys: Vec<(TileKey, u16)> = self.entries.keys().copied().collect();
        keys.sort_by_key(|k| self.entries[k].updated_at_ms);
        keys.truncate(PACED_DRAIN_BATCH);

        keys.into_iter()
            .map(|k| {
                let entry = self.entries.get_mut(&k).expect("key just collected");
                entry.attempts += 1;
                entry.message()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tile() -> TileKey {
        TileKey::new(0, 0)
    }

    #[test]
    fn echo_ack_removes_matching_entry_only() {
        let mut outbox = Outbox::new();
        outbox.record(tile(), 7, 1, "op-a".into(), 0);

        // Foreign write to the same cell with a different value: keep.
        outbox.ack(tile(), 7, 0);
        assert_eq!(outbox.len(), 1);
        // Unrelated cell: keep.
        outbox.ack(tile(), 8, 1);
        assert_eq!(outbox.len(), 1);
        // Our echo: gone.
        outbox.ack(tile(), 7, 1);
        assert!(outbox.is_empty());
    }

    #[test]
    fn replay_is_paced_and_oldest_first() {
        let mut outbox = Outbox::new();
        for n in 0..5u16 {
            outbox.record(tile(), n, 1, format!("op-{n}"), n as i64);
        }

        let batch = outbox.replay_batch(100);
        assert_eq!(batch.len(), PACED_DRAIN_BATCH);
        match &batch[0] {
            ClientMessage::SetCell { i, op, .. } => {
                assert_eq!(*i, 0);
                assert_eq!(op, "op-0");
            }
            other => panic!("unexpected {other:?}"),
        }
        match &batch[1] {
            ClientMessage::SetCell { i, .. } => assert_eq!(*i, 1),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn entries_expire_by_age() {
        let mut outbox = Outbox::new();
        outbox.record(tile(), 0, 1, "op-a".into(), 0);
        outbox.record(tile(), 1, 1, "op-b".into(), 50_000);

        let batch = outbox.replay_batch(OUTBOX_TTL_MS + 1);
        // Only the younger entry survives.
        assert_eq!(batch.len(), 1);
        assert_eq!(outbox.len(), 1);
    }

    #[test]
    fn attempts_are_bounded() {
        let mut outbox = Outbox::new();
        outbox.record(tile(), 0, 1, "op-a".into(), 0);

        for _ in 0..OUTBOX_MAX_ATTEMPTS {
            assert_eq!(outbox.replay_batch(1).len(), 1);
        }
        // Attempts exhausted: entry evicted on the next pull.
        assert!(outbox.replay_batch(2).is_empty());
        assert!(outbox.is_empty());
    }

    #[test]
    fn rerecording_resets_attempts_and_freshness() {
        let mut outbox = Outbox::new();
        outbox.record(tile(), 0, 1, "op-a".into(), 0);
        outbox.replay_batch(1);
        outbox.replay_batch(2);

        // The user toggled again: new op id, fresh budget.
        outbox.record(tile(), 0, 0, "op-b".into(), 10);
        let batch = outbox.replay_batch(11);
        assert_eq!(batch.len(), 1);
        match &batch[0] {
            ClientMessage::SetCell { v, op, .. } => {
                assert_eq!(*v, 0);
                assert_eq!(op, "op-b");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn capacity_evicts_oldest() {
        let mut outbox = Outbox::new();
        for n in 0..OUTBOX_CAPACITY as u16 {
            outbox.record(tile(), n, 1, format!("op-{n}"), n as i64);
        }
        assert_eq!(outbox.len(), OUTBOX_CAPACITY);

        outbox.record(TileKey::new(1, 1), 0, 1, "op-new".into(), 10_000);
        assert_eq!(outbox.len(), OUTBOX_CAPACITY);
        // The oldest entry (cell 0, recorded at t=0) made room.
        assert!(!outbox.entries.contains_key(&(tile(), 0)));
        assert!(outbox.entries.contains_key(&(TileKey::new(1, 1), 0)));
    }
}
