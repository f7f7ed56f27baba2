//! Prometheus metrics for the tile engine.

use metrics::{counter, gauge, histogram};

/// Record a setCell outcome at the owner.
pub fn setcell(result: &'static str) {
    counter!("gingham_engine_setcell_total", "result" => result).increment(1);
}

/// Record a WAL batch flush and its size.
pub fn wal_batch(ops: usize) {
    counter!("gingham_engine_wal_batches_total").increment(1);
    histogram!("gingham_engine_wal_batch_ops").record(ops as f64);
}

/// Record a broadcast dropped on the floor (full or gone shard inbox).
pub fn broadcast_dropped() {
    counter!("gingham_engine_broadcast_dropped_total").increment(1);
}

/// Record a snapshot flush attempt.
pub fn snapshot_flush(ok: bool) {
    let result = if ok { "ok" } else { "error" };
    counter!("gingham_engine_snapshot_flush_total", "result" => result).increment(1);
}

/// Record a snapshot read by source strategy.
pub fn snapshot_read(source: &'static str, found: bool) {
    counter!(
        "gingham_engine_snapshot_reads_total",
        "source" => source,
        "found" => if found { "true" } else { "false" }
    )
    .increment(1);
}

/// Record an owner task spawn.
pub fn owner_spawned() {
    counter!("gingham_engine_owners_spawned_total").increment(1);
}

/// Track the number of live owners.
pub fn owners_live(count: usize) {
    gauge!("gingham_engine_owners_live").set(count as f64);
}
