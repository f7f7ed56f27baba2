//! Viewport → subscription reconciliation.
//!
//! Every frame (or viewport change) the camera rectangle maps to the set
//! of tiles it touches plus a one-tile margin; the diff against the
//! current subscriptions becomes at most one `sub` and one `unsub`.

use rustc_hash::FxHashSet;

use gingham_common::domain::{MAX_TILES_SUBSCRIBED, MAX_TILE_ABS, TILE_SIZE, TileKey};

/// Camera rectangle in world cell coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraRect {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl CameraRect {
    fn center(&self) -> (f64, f64) {
        (
            (self.min_x + self.max_x) / 2.0,
            (self.min_y + self.max_y) / 2.0,
        )
    }
}

/// Tiles whose cells intersect the camera rect, expanded by a one-tile
/// margin and clamped to world bounds. Oversized viewports keep the tiles
/// nearest the camera center so the result always fits a `sub` frame.
pub fn visible_tiles(camera: &CameraRect) -> FxHashSet<TileKey> {
    let clamp = |t: f64| t.clamp(-(MAX_TILE_ABS as f64), MAX_TILE_ABS as f64) as i32;
    let min_tx = clamp((camera.min_x / TILE_SIZE as f64).floor() - 1.0);
    let min_ty = clamp((camera.min_y / TILE_SIZE as f64).floor() - 1.0);
    let max_tx = clamp((camera.max_x / TILE_SIZE as f64).floor() + 1.0);
    let max_ty = clamp((camera.max_y / TILE_SIZE as f64).floor() + 1.0);

    let span_x = (max_tx - min_tx + 1) as usize;
    let span_y = (max_ty - min_ty + 1) as usize;
    if span_x * span_y <= MAX_TILES_SUBSCRIBED {
        let mut tiles = FxHashSet::default();
        for ty in min_ty..=max_ty {
            for tx in min_tx..=max_tx {
                tiles.insert(TileKey::new(tx, ty));
            }
        }
        return tiles;
    }

    // Zoomed far out: keep the nearest tiles to the viewport center. The
    // nearest MAX_TILES_SUBSCRIBED tiles always fit well inside a ±150
    // window around the center, so enumeration stays bounded no matter
    // how absurd the viewport is.
    let (cx, cy) = camera.center();
    let ctx = clamp((cx / TILE_SIZE as f64).floor());
    let cty = clamp((cy / TILE_SIZE as f64).floor());
    let min_tx = min_tx.max(ctx.saturating_sub(150));
    let max_tx = max_tx.min(ctx.saturating_add(150));
    let min_ty = min_ty.max(cty.saturating_sub(150));
    let max_ty = max_ty.min(cty.saturating_add(150));
    let mut all: Vec<TileKey> = Vec::new();
    for ty in min_ty..=max_ty {
        for tx in min_tx..=max_tx {
            all.push(TileKey::new(tx, ty));
        }
    }
    let dist2 = |t: &TileKey| {
        let tx = (t.tx as f64 + 0.5) * TILE_SIZE as f64 - cx;
        let ty = (t.ty as f64 + 0.5) * TILE_SIZE as f64 - cy;
        tx * tx + ty * ty
    };
    all.sort_by(|a, b| {
        dist2(a)
            .partial_cmp(&dist2(b))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    all.truncate(MAX_TILES_SUBSCRIBED);
    all.into_iter().collect()
}

#[derive(Default)]
pub struct Reconciler {
    subscribed: FxHashSet<TileKey>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Diff the viewport against current subscriptions. Returns
    /// (to_sub, to_unsub), each sorted for deterministic frames.
    pub fn reconcile(&mut self, camera: &CameraRect) -> (Vec<TileKey>, Vec<TileKey>) {
        let visible = visible_tiles(camera);
        let mut to_sub: Vec<TileKey> = visible.difference(&self.subscribed).copied().collect();
        let mut to_unsub: Vec<TileKey> = self.subscribed.difference(&visible).copied().collect();
        to_sub.sort();
        to_unsub.sort();
        self.subscribed = visible;
        (to_sub, to_unsub)
    }

    /// Forget everything; the next reconcile resubscribes from scratch.
    /// Called on transport reconnect so the shard rebuilds its state.
    pub fn reset(&mut self) {
        self.subscribed.clear();
    }

    pub fn subscribed(&self) -> &FxHashSet<TileKey> {
        &self.subscribed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> CameraRect {
        CameraRect {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    #[test]
    fn single_tile_viewport_includes_margin() {
        let tiles = visible_tiles(&rect(10.0, 10.0, 20.0, 20.0));
        // Tile 0:0 plus the full one-tile margin ring.
        assert_eq!(tiles.len(), 9);
        for tx in -1..=1 {
            for ty in -1..=1 {
                assert!(tiles.contains(&TileKey::new(tx, ty)));
            }
        }
    }

    #[test]
    fn negative_coordinates_map_to_negative_tiles() {
        let tiles = visible_tiles(&rect(-70.0, -10.0, -65.0, -5.0));
        assert!(tiles.contains(&TileKey::new(-2, -1)));
        assert!(tiles.contains(&TileKey::new(-3, -2)));
        assert!(!tiles.contains(&TileKey::new(1, 1)));
    }

    #[test]
    fn oversized_viewport_keeps_nearest_tiles() {
        // A viewport spanning far more than the subscription cap.
        let tiles = visible_tiles(&rect(0.0, 0.0, 64.0 * 40.0, 64.0 * 40.0));
        assert_eq!(tiles.len(), MAX_TILES_SUBSCRIBED);
        // The center tile of the rect is always kept.
        assert!(tiles.contains(&TileKey::new(20, 20)));
    }

    #[test]
    fn clamps_at_world_edge() {
        let edge = (MAX_TILE_ABS as f64) * 64.0;
        let tiles = visible_tiles(&rect(edge - 1.0, edge - 1.0, edge + 1e9, edge + 1e9));
        assert!(!tiles.is_empty());
        for tile in &tiles {
            assert!(tile.is_valid());
        }
    }

    #[test]
    fn reconcile_diffs_and_replaces() {
        let mut r = Reconciler::new();

        let (sub, unsub) = r.reconcile(&rect(10.0, 10.0, 20.0, 20.0));
        assert_eq!(sub.len(), 9);
        assert!(unsub.is_empty());

        // Pan one tile to the right: one column enters, one leaves.
        let (sub, unsub) = r.reconcile(&rect(74.0, 10.0, 84.0, 20.0));
        assert_eq!(sub.len(), 3);
        assert_eq!(unsub.len(), 3);
        assert!(sub.iter().all(|t| t.tx == 2));
        assert!(unsub.iter().all(|t| t.tx == -1));

        // No movement: no traffic.
        let (sub, unsub) = r.reconcile(&rect(74.0, 10.0, 84.0, 20.0));
        assert!(sub.is_empty());
        assert!(unsub.is_empty());
    }

    #[test]
    fn reset_resubscribes_everything() {
        let mut r = Reconciler::new();
        let camera = rect(10.0, 10.0, 20.0, 20.0);
        r.reconcile(&camera);
        assert_eq!(r.subscribed().len(), 9);

        r.reset();
        assert!(r.subscribed().is_empty());
        let (sub, unsub) = r.reconcile(&camera);
        assert_eq!(sub.len(), 9);
        assert!(unsub.is_empty());
    }
}
