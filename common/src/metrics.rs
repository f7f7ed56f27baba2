use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use owo_colors::OwoColorize;
use std::sync::OnceLock;
use std::time::Instant;
use tokio::net::TcpListener;

use crate::shutdown::shutdown_signal;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static SERVER_STARTED: OnceLock<()> = OnceLock::new();

fn install_recorder_once() -> &'static PrometheusHandle {
    PROM_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("install global metrics recorder")
    })
}

/// Start the Prometheus endpoint when METRICS_PORT is set. Safe to call
/// more than once; only the first call spawns the server.
pub fn maybe_spawn_metrics_server() {
    let Some(port) = metric_port_env() else {
        return;
    };
    // Exit the process on any thread panic so the container restarts
    // instead of limping along without its metrics or actor tasks.
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));

    if SERVER_STARTED.set(()).is_ok() {
        let _ = install_recorder_once();
        tokio::spawn(run_metrics_server(port));
    }
}

pub async fn run_metrics_server(port: u16) {
    let handle = install_recorder_once().clone();
    let metrics_route = {
        let handle = handle.clone();
        axum::routing::get(move || async move { handle.render() })
    };
    let app = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }))
        .route("/metrics", metrics_route);
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| {
            eprintln!("🛑 Failed to bind metrics server to {}: {}", addr, e);
            e
        })
        .unwrap();
    println!(
        "{}{}",
        "📈 Starting metrics server • port=".green(),
        format!("{}", port).green().dimmed(),
    );
    let started = Instant::now();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Failed to serve metrics");
    println!(
        "{} {}",
        "🛑 Metrics server stopped gracefully • uptime was".red(),
        format!("{:.2?}", started.elapsed()).red().dimmed()
    );
}

fn metric_port_env() -> Option<u16> {
    std::env::var("METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
}
