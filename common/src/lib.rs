pub mod args;
pub mod cors;
pub mod domain;
pub mod identity;
pub mod metrics;
pub mod rate_limit;
pub mod rle;
pub mod shutdown;
pub mod token;
pub mod wire;

/// Wall-clock milliseconds since the unix epoch, the timestamp unit used
/// everywhere (edits, cursors, rate windows, outbox).
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Wall-clock seconds since the unix epoch (token expiry granularity).
pub fn now_s() -> i64 {
    chrono::Utc::now().timestamp()
}

pub fn init() {
    let disable_colors = ["1", "true"].contains(
        &std::env::var("DISABLE_COLORS")
            .unwrap_or_else(|_| String::new())
            .to_lowercase()
            .as_str(),
    );
    owo_colors::set_override(!disable_colors);
}

pub fn signal_ready() {
    if let Err(e) = std::fs::write("/etc/ready", "ready") {
        tracing::debug!(?e, "not writing readiness file");
    }
}
