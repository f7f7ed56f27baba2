//! Grid domain math: tile/cell coordinates, bounds, strict key parsing,
//! and uid-hash shard selection. Everything here is pure.

use anyhow::{Result, bail, ensure};
use serde::{Deserialize, Serialize};

/// Cells per tile side.
pub const TILE_SIZE: i64 = 64;
/// Cells per tile (TILE_SIZE squared).
pub const TILE_CELL_COUNT: usize = 4096;
/// Absolute cap on world coordinates.
pub const WORLD_MAX: i64 = 1_000_000_000;
/// Absolute cap on tile coordinates.
pub const MAX_TILE_ABS: i32 = (WORLD_MAX / TILE_SIZE) as i32;

/// Number of connection shards.
pub const SHARD_COUNT: u32 = 8;

/// Per-client subscription cap.
pub const MAX_TILES_SUBSCRIBED: usize = 300;
/// Per-client tile churn cap (sub + unsub combined), per minute.
pub const MAX_TILE_CHURN_PER_MIN: usize = 600;
/// setCell burst window: 20 per second.
pub const SETCELL_BURST_LIMIT: usize = 20;
pub const SETCELL_BURST_WINDOW_MS: i64 = 1_000;
/// setCell sustained window: 5/s averaged over 10 s.
pub const SETCELL_SUSTAINED_LIMIT: usize = 50;
pub const SETCELL_SUSTAINED_WINDOW_MS: i64 = 10_000;

/// Cursor fanout bound per viewing client.
pub const MAX_REMOTE_CURSORS: usize = 10;
/// Cursor presence expiry.
pub const CURSOR_TTL_MS: i64 = 5_000;
/// Cross-shard cursor relay cadence.
pub const CURSOR_RELAY_MS: u64 = 100;
/// Minimum interval between throttled cursor selection refreshes.
pub const CURSOR_REFRESH_MIN_MS: u64 = 250;

/// Watcher count at which a tile stops accepting writes.
pub const TILE_READONLY_WATCHER_THRESHOLD: usize = 8;
/// Watcher count at which new shard subscriptions are refused.
pub const TILE_DENY_WATCHER_THRESHOLD: usize = 12;

/// WAL broadcast batching: flush at this many ops or after the deadline.
pub const WAL_FLUSH_OPS: usize = 128;
pub const WAL_FLUSH_MS: u64 = 50;
/// Snapshot persistence cadence.
pub const SNAPSHOT_FLUSH_OPS: u64 = 500;
pub const SNAPSHOT_FLUSH_MS: u64 = 5_000;
/// Recent op-id dedup ring capacity.
pub const RECENT_OP_IDS: usize = 4096;
/// Recent edit sampling ring capacity.
pub const RECENT_EDITS: usize = 256;

/// Client-side caps.
pub const MAX_PENDING_SENDS: usize = 512;
pub const CLIENT_TILE_CACHE: usize = 512;
pub const OUTBOX_CAPACITY: usize = 100;
pub const OUTBOX_TTL_MS: i64 = 90_000;
pub const OUTBOX_MAX_ATTEMPTS: u32 = 6;
/// Reconnect backoff ladder, capped at the last entry.
pub const RECONNECT_BACKOFF_MS: [u64; 5] = [250, 500, 1_000, 2_000, 4_000];
/// Paced drain after reconnect: this many messages per pacing interval.
pub const PACED_DRAIN_BATCH: usize = 2;
pub const PACED_DRAIN_INTERVAL_MS: u64 = 500;
/// Continuous-disconnect threshold before the client surfaces a warning.
pub const OFFLINE_WARNING_MS: i64 = 30_000;

/// A tile coordinate pair. Canonical text form is `"tx:ty"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileKey {
    pub tx: i32,
    pub ty: i32,
}

impl TileKey {
    pub fn new(tx: i32, ty: i32) -> Self {
        Self { tx, ty }
    }

    /// Bounds check against MAX_TILE_ABS.
    pub fn is_valid(&self) -> bool {
        self.tx.unsigned_abs() <= MAX_TILE_ABS as u32 && self.ty.unsigned_abs() <= MAX_TILE_ABS as u32
    }

    /// The tile containing a world cell coordinate (floor division, so
    /// negative coordinates land in the expected tile).
    pub fn of_world(world_x: i64, world_y: i64) -> Self {
        Self {
            tx: world_x.div_euclid(TILE_SIZE) as i32,
            ty: world_y.div_euclid(TILE_SIZE) as i32,
        }
    }

    /// Canonical `"tx:ty"` form.
    pub fn canonical(&self) -> String {
        format!("{}:{}", self.tx, self.ty)
    }

    /// Strict parse of the canonical form: exactly one `:`, no whitespace,
    /// no `+` signs, no leading zeros (a bare `0` is the only zero form;
    /// `-0` is rejected).
    pub fn parse(s: &str) -> Result<Self> {
        let Some((xs, ys)) = s.split_once(':') else {
            bail!("tile key missing ':': {s:?}");
        };
        let tx = parse_coord(xs)?;
        let ty = parse_coord(ys)?;
        let key = Self { tx, ty };
        ensure!(key.is_valid(), "tile key out of bounds: {s:?}");
        Ok(key)
    }
}

impl std::fmt::Display for TileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.tx, self.ty)
    }
}

fn parse_coord(s: &str) -> Result<i32> {
    let digits = s.strip_prefix('-').unwrap_or(s);
    ensure!(!digits.is_empty(), "empty tile coordinate");
    ensure!(
        digits.bytes().all(|b| b.is_ascii_digit()),
        "non-digit in tile coordinate: {s:?}"
    );
    // "0" is the only coordinate allowed to start with a zero, and it may
    // not be signed.
    if digits.len() > 1 {
        ensure!(!digits.starts_with('0'), "leading zero in tile coordinate: {s:?}");
    } else if digits == "0" {
        ensure!(s == "0", "signed zero tile coordinate: {s:?}");
    }
    s.parse::<i32>()
        .map_err(|e| anyhow::anyhow!("tile coordinate overflow: {s:?}: {e}"))
}

/// Cell index within a tile for a world coordinate, row-major with
/// mathematical (non-negative) modulo so negative coordinates wrap
/// correctly.
pub fn cell_index(world_x: i64, world_y: i64) -> u16 {
    let cx = world_x.rem_euclid(TILE_SIZE);
    let cy = world_y.rem_euclid(TILE_SIZE);
    (cy * TILE_SIZE + cx) as u16
}

pub fn is_cell_index_valid(i: u32) -> bool {
    (i as usize) < TILE_CELL_COUNT
}

/// World coordinate bounds check for cursor positions.
pub fn is_world_coord_valid(v: f32) -> bool {
    v.is_finite() && v.abs() <= WORLD_MAX as f32
}

/// FNV-1a 32-bit, used for uid → shard affinity.
pub fn fnv1a32(data: &str) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for b in data.bytes() {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Shard index for a uid.
pub fn shard_index_for_uid(uid: &str) -> u32 {
    fnv1a32(uid) % SHARD_COUNT
}

/// Shard name for a uid, `shard-0` .. `shard-7`.
pub fn shard_name_for_uid(uid: &str) -> String {
    format!("shard-{}", shard_index_for_uid(uid))
}
