//! Prometheus metrics for the connection shards and gateway.

use metrics::{counter, gauge};

pub fn connection_opened(shard: &str) {
    gauge!("gingham_server_connections", "shard" => shard.to_string()).increment(1);
}

pub fn connection_closed(shard: &str) {
    gauge!("gingham_server_connections", "shard" => shard.to_string()).decrement(1);
}

pub fn connection_replaced(shard: &str) {
    counter!("gingham_server_connections_replaced_total", "shard" => shard.to_string())
        .increment(1);
}

pub fn message_received(kind: &'static str) {
    counter!("gingham_server_messages_received_total", "type" => kind).increment(1);
}

pub fn message_dropped(kind: &'static str) {
    counter!("gingham_server_messages_dropped_total", "type" => kind).increment(1);
}

pub fn err_emitted(code: &'static str) {
    counter!("gingham_server_errors_emitted_total", "code" => code).increment(1);
}

pub fn rate_limited(kind: &'static str) {
    counter!("gingham_server_rate_limited_total", "kind" => kind).increment(1);
}

pub fn batch_fanout(sockets: usize) {
    counter!("gingham_server_batch_fanout_total").increment(1);
    counter!("gingham_server_batch_fanout_sockets_total").increment(sockets as u64);
}

pub fn cursor_relay_flushed(updates: usize) {
    counter!("gingham_server_cursor_relays_total").increment(1);
    counter!("gingham_server_cursor_relay_updates_total").increment(updates as u64);
}

pub fn cursor_selection_refreshed() {
    counter!("gingham_server_cursor_refreshes_total").increment(1);
}

pub fn guest_identity_minted() {
    counter!("gingham_server_guest_identities_total").increment(1);
}
