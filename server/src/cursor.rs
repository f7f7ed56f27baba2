//! Per-shard cursor presence.
//!
//! Cursors are intentionally lossy: local updates go out immediately to the
//! clients already watching that uid, relays to peer shards are batched on
//! a 100 ms timer and dropped on back-pressure, and the nearest-N selection
//! refresh is throttled to 250 ms unless forced by a connect, disconnect or
//! subscription change. Per-uid sequence numbers keep relay application
//! ordered; everything else is best effort.

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::time::{Duration, Instant};

use gingham_common::domain::{
    CURSOR_REFRESH_MIN_MS, CURSOR_RELAY_MS, CURSOR_TTL_MS, MAX_REMOTE_CURSORS, TileKey,
};
use gingham_common::wire::ServerMessage;

use crate::shard::{ClientRecord, ShardHandle, emit_to};

#[derive(Debug, Clone, PartialEq)]
pub struct CursorPresence {
    pub uid: String,
    pub name: String,
    pub x: f32,
    pub y: f32,
    pub seen_at: i64,
    pub seq: u64,
    pub tile: TileKey,
}

impl CursorPresence {
    fn is_fresh(&self, now_ms: i64) -> bool {
        now_ms - self.seen_at <= CURSOR_TTL_MS
    }

    fn cur_up(&self) -> ServerMessage {
        ServerMessage::CurUp {
            uid: self.uid.clone(),
            name: self.name.clone(),
            x: self.x,
            y: self.y,
        }
    }
}

fn tile_of_cursor(x: f32, y: f32) -> TileKey {
    TileKey::of_world(x.floor() as i64, y.floor() as i64)
}

pub struct CursorCoordinator {
    shard_name: String,
    by_uid: FxHashMap<String, CursorPresence>,
    tile_index: FxHashMap<TileKey, FxHashSet<String>>,
    local_seq: FxHashMap<String, u64>,
    pending_relays: Vec<CursorPresence>,
    first_pending_at: Option<Instant>,
    selection_dirty: bool,
    last_refresh: Instant,
}

impl CursorCoordinator {
    pub fn new(shard_name: String) -> Self {
        Self {
            shard_name,
            by_uid: FxHashMap::default(),
            tile_index: FxHashMap::default(),
            local_seq: FxHashMap::default(),
            pending_relays: Vec::new(),
            first_pending_at: None,
            selection_dirty: false,
            last_refresh: Instant::now(),
        }
    }

    /// Deadline for the pending relay batch, if one exists.
    pub fn relay_deadline(&self) -> Option<Instant> {
        self.first_pending_at
            .map(|t| t + Duration::from_millis(CURSOR_RELAY_MS))
    }

    /// Deadline for the throttled selection refresh, if one is owed.
    pub fn refresh_deadline(&self) -> Option<Instant> {
        self.selection_dirty
            .then(|| self.last_refresh + Duration::from_millis(CURSOR_REFRESH_MIN_MS))
    }

    /// A local client moved its cursor.
    pub fn on_local(
        &mut self,
        uid: &str,
        name: &str,
        x: f32,
        y: f32,
        now_ms: i64,
        clients: &FxHashMap<String, ClientRecord>,
    ) {
        let seq = self
            .local_seq
            .entry(uid.to_owned())
            .and_modify(|s| *s += 1)
            .or_insert(1);
        let presence = CursorPresence {
            uid: uid.to_owned(),
            name: name.to_owned(),
            x,
            y,
            seen_at: now_ms,
            seq: *seq,
            tile: tile_of_cursor(x, y),
        };
        self.upsert(presence.clone());
        self.selection_dirty = true;

        // Motion within an existing selection is delivered on this path;
        // the refresh only announces uids entering a selection.
        let msg = presence.cur_up();
        for client in clients.values() {
            if client.cursor_subs.contains(uid) {
                emit_to(&client.out, &msg);
            }
        }

        self.pending_relays.push(presence);
        self.first_pending_at.get_or_insert_with(Instant::now);
    }

    /// A relay batch arrived from a peer shard. Updates apply only when
    /// their per-uid seq advances; late arrivals drop silently.
    pub fn apply_relay(
        &mut self,
        from: &str,
        updates: Vec<CursorPresence>,
        clients: &FxHashMap<String, ClientRecord>,
    ) {
        if from == self.shard_name {
            // A shard never relays to itself; drop the echo just in case.
            return;
        }
        for update in updates {
            if let Some(existing) = self.by_uid.get(&update.uid)
                && update.seq <= existing.seq
            {
                continue;
            }
            let msg = update.cur_up();
            let uid = update.uid.clone();
            self.upsert(update);
            self.selection_dirty = true;
            for client in clients.values() {
                if client.cursor_subs.contains(&uid) {
                    emit_to(&client.out, &msg);
                }
            }
        }
    }

    /// Ship the pending batch to every peer shard (never self). Lossy.
    pub fn flush_relays(&mut self, peers: &[ShardHandle]) {
        if self.pending_relays.is_empty() {
            self.first_pending_at = None;
            return;
        }
        let updates = std::mem::take(&mut self.pending_relays);
        self.first_pending_at = None;
        crate::metrics::cursor_relay_flushed(updates.len());
        for peer in peers {
            if peer.name() == self.shard_name {
                continue;
            }
            peer.relay(&self.shard_name, updates.clone());
        }
    }

    fn upsert(&mut self, presence: CursorPresence) {
        if let Some(existing) = self.by_uid.get(&presence.uid)
            && existing.tile != presence.tile
            && let Some(bucket) = self.tile_index.get_mut(&existing.tile)
        {
            bucket.remove(&presence.uid);
            if bucket.is_empty() {
                self.tile_index.remove(&existing.tile);
            }
        }
        self.tile_index
            .entry(presence.tile)
            .or_default()
            .insert(presence.uid.clone());
        self.by_uid.insert(presence.uid.clone(), presence);
    }

    /// Forget a uid entirely (local disconnect). Peers age it out by TTL.
    pub fn remove_uid(&mut self, uid: &str) {
        if let Some(presence) = self.by_uid.remove(uid)
            && let Some(bucket) = self.tile_index.get_mut(&presence.tile)
        {
            bucket.remove(uid);
            if bucket.is_empty() {
                self.tile_index.remove(&presence.tile);
            }
        }
        self.local_seq.remove(uid);
        self.selection_dirty = true;
    }

    fn collect_stale(&mut self, now_ms: i64) {
        let stale: Vec<String> = self
            .by_uid
            .values()
            .filter(|p| !p.is_fresh(now_ms))
            .map(|p| p.uid.clone())
            .collect();
        for uid in stale {
            if let Some(presence) = self.by_uid.remove(&uid)
                && let Some(bucket) = self.tile_index.get_mut(&presence.tile)
            {
                bucket.remove(&uid);
                if bucket.is_empty() {
                    self.tile_index.remove(&presence.tile);
                }
            }
        }
    }

    /// Recompute each client's nearest-N cursor selection. Newly selected
    /// uids get one `curUp` carrying the latest known state.
    pub fn refresh(&mut self, clients: &mut FxHashMap<String, ClientRecord>, now_ms: i64) {
        self.collect_stale(now_ms);
        self.last_refresh = Instant::now();
        self.selection_dirty = false;
        crate::metrics::cursor_selection_refreshed();

        for client in clients.values_mut() {
            let Some((cx, cy)) = client.last_cursor else {
                continue;
            };

            let mut candidates: FxHashSet<String> = FxHashSet::default();
            for tile in &client.subscribed {
                if let Some(bucket) = self.tile_index.get(tile) {
                    candidates.extend(bucket.iter().cloned());
                }
            }
            // Sparse neighborhoods top up from the global fresh set so a
            // lone client still sees activity elsewhere.
            if candidates.len() < MAX_REMOTE_CURSORS {
                candidates.extend(
                    self.by_uid
                        .values()
                        .filter(|p| p.is_fresh(now_ms))
                        .map(|p| p.uid.clone()),
                );
            }
            candidates.remove(&client.uid);

            let mut ranked: Vec<&CursorPresence> = candidates
                .iter()
                .filter_map(|uid| self.by_uid.get(uid))
                .filter(|p| p.is_fresh(now_ms))
                .collect();
            ranked.sort_by(|a, b| {
                let da = (a.x - cx) * (a.x - cx) + (a.y - cy) * (a.y - cy);
                let db = (b.x - cx) * (b.x - cx) + (b.y - cy) * (b.y - cy);
                da.partial_cmp(&db)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(b.seen_at.cmp(&a.seen_at))
            });
            ranked.truncate(MAX_REMOTE_CURSORS);

            let selected: FxHashSet<String> = ranked.iter().map(|p| p.uid.clone()).collect();
            for presence in &ranked {
                if !client.cursor_subs.contains(&presence.uid) {
                    emit_to(&client.out, &presence.cur_up());
                }
            }
            client.cursor_subs = selected;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn coordinator() -> CursorCoordinator {
        CursorCoordinator::new("shard-0".into())
    }

    fn client(uid: &str, cursor: Option<(f32, f32)>, tiles: &[TileKey]) -> (ClientRecord, async_channel::Receiver<Bytes>) {
        let (record, rx) = ClientRecord::for_tests(uid);
        let mut record = record;
        record.last_cursor = cursor;
        record.subscribed = tiles.iter().copied().collect();
        (record, rx)
    }

    fn presence(uid: &str, x: f32, y: f32, seq: u64, seen_at: i64) -> CursorPresence {
        CursorPresence {
            uid: uid.into(),
            name: "RemoteHand1".into(),
            x,
            y,
            seen_at,
            seq,
            tile: tile_of_cursor(x, y),
        }
    }

    fn drain(rx: &async_channel::Receiver<Bytes>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(ServerMessage::decode(&frame).unwrap().expect("known tag"));
        }
        out
    }

    #[tokio::test]
    async fn selection_keeps_nearest_n_by_squared_distance() {
        let mut c = coordinator();
        let tile = TileKey::new(0, 0);
        let mut clients = FxHashMap::default();
        let (viewer, viewer_rx) = client("u_viewer", Some((0.5, 0.5)), &[tile]);
        clients.insert("u_viewer".to_owned(), viewer);

        // Twelve remote cursors on the subscribed tile, distinct x.
        for n in 0..12 {
            c.apply_relay(
                "shard-1",
                vec![presence(&format!("u_r{n}"), n as f32, 0.5, 1, 0)],
                &clients,
            );
        }
        c.refresh(&mut clients, 0);

        let subs = &clients["u_viewer"].cursor_subs;
        assert_eq!(subs.len(), MAX_REMOTE_CURSORS);
        // Nearest ten by squared distance to x=0.5 are x=0..=9.
        for n in 0..10 {
            assert!(subs.contains(&format!("u_r{n}")), "missing u_r{n}");
        }
        assert!(!subs.contains("u_r10"));
        assert!(!subs.contains("u_r11"));

        // Exactly one announcement per selected uid, none for the others.
        let announced = drain(&viewer_rx);
        assert_eq!(announced.len(), MAX_REMOTE_CURSORS);
    }

    #[tokio::test]
    async fn stale_and_self_cursors_are_dropped() {
        let mut c = coordinator();
        let tile = TileKey::new(0, 0);
        let mut clients = FxHashMap::default();
        let (viewer, viewer_rx) = client("u_viewer", Some((0.0, 0.0)), &[tile]);
        clients.insert("u_viewer".to_owned(), viewer);

        let now = 100_000;
        c.apply_relay("shard-1", vec![presence("u_fresh", 1.0, 0.0, 1, now)], &clients);
        c.apply_relay(
            "shard-1",
            vec![presence("u_stale", 2.0, 0.0, 1, now - CURSOR_TTL_MS - 1)],
            &clients,
        );
        // The viewer's own cursor never selects itself.
        c.on_local("u_viewer", "Viewer1", 0.0, 0.0, now, &clients);

        c.refresh(&mut clients, now);
        let subs = &clients["u_viewer"].cursor_subs;
        assert_eq!(subs.len(), 1);
        assert!(subs.contains("u_fresh"));
        drop(viewer_rx);
    }

    #[tokio::test]
    async fn relay_applies_only_newer_seq() {
        let mut c = coordinator();
        let mut clients = FxHashMap::default();
        let (viewer, viewer_rx) = client("u_viewer", Some((0.0, 0.0)), &[TileKey::new(0, 0)]);
        clients.insert("u_viewer".to_owned(), viewer);

        c.apply_relay("shard-1", vec![presence("u_r", 1.0, 0.0, 5, 0)], &clients);
        c.refresh(&mut clients, 0);
        drain(&viewer_rx);

        // Older seq: dropped, no emission, position unchanged.
        c.apply_relay("shard-1", vec![presence("u_r", 9.0, 9.0, 4, 10)], &clients);
        assert!(drain(&viewer_rx).is_empty());
        assert_eq!(c.by_uid["u_r"].x, 1.0);

        // Newer seq: applied and pushed to the subscribed viewer.
        c.apply_relay("shard-1", vec![presence("u_r", 2.0, 0.0, 6, 10)], &clients);
        let got = drain(&viewer_rx);
        assert_eq!(got.len(), 1);
        match &got[0] {
            ServerMessage::CurUp { uid, x, .. } => {
                assert_eq!(uid, "u_r");
                assert_eq!(*x, 2.0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn local_updates_push_to_subscribed_clients_immediately() {
        let mut c = coordinator();
        let mut clients = FxHashMap::default();
        let (mover, mover_rx) = client("u_mover", Some((0.0, 0.0)), &[TileKey::new(0, 0)]);
        let (watcher, watcher_rx) = client("u_watcher", Some((0.0, 0.0)), &[TileKey::new(0, 0)]);
        clients.insert("u_mover".to_owned(), mover);
        clients.insert("u_watcher".to_owned(), watcher);

        // First move: nobody subscribed yet, so only the refresh announces.
        c.on_local("u_mover", "Mover1", 1.0, 1.0, 0, &clients);
        c.refresh(&mut clients, 0);
        assert_eq!(drain(&watcher_rx).len(), 1);

        // Second move: delivered on the update path without a refresh.
        c.on_local("u_mover", "Mover1", 2.0, 2.0, 10, &clients);
        let got = drain(&watcher_rx);
        assert_eq!(got.len(), 1);
        match &got[0] {
            ServerMessage::CurUp { x, .. } => assert_eq!(*x, 2.0),
            other => panic!("unexpected {other:?}"),
        }
        // The mover itself hears nothing.
        assert!(drain(&mover_rx).is_empty());
    }

    #[tokio::test]
    async fn local_moves_queue_relays_with_increasing_seq() {
        let mut c = coordinator();
        let clients = FxHashMap::default();
        c.on_local("u_a", "Mover1", 1.0, 0.0, 0, &clients);
        c.on_local("u_a", "Mover1", 2.0, 0.0, 5, &clients);
        assert_eq!(c.pending_relays.len(), 2);
        assert_eq!(c.pending_relays[0].seq, 1);
        assert_eq!(c.pending_relays[1].seq, 2);
        assert!(c.relay_deadline().is_some());
    }

    #[tokio::test]
    async fn top_up_from_global_set_when_neighborhood_sparse() {
        let mut c = coordinator();
        let mut clients = FxHashMap::default();
        let (viewer, viewer_rx) = client("u_viewer", Some((0.0, 0.0)), &[TileKey::new(0, 0)]);
        clients.insert("u_viewer".to_owned(), viewer);

        // A single cursor far outside the subscribed tiles still shows up.
        c.apply_relay(
            "shard-1",
            vec![presence("u_far", 10_000.0, 10_000.0, 1, 0)],
            &clients,
        );
        c.refresh(&mut clients, 0);
        assert!(clients["u_viewer"].cursor_subs.contains("u_far"));
        drop(viewer_rx);
    }
}
