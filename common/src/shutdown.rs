use owo_colors::OwoColorize;
use tokio_util::sync::CancellationToken;

pub async fn shutdown_signal() {
    // Listen for both SIGINT (Ctrl+C) and SIGTERM (K8s)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = sigint.recv()  => eprintln!("{}", "🛑 Received SIGINT".red()),
            _ = sigterm.recv() => eprintln!("{}", "🛑 Received SIGTERM".red()),
        }
    }

    #[cfg(not(unix))]
    {
        // Fallback: only Ctrl+C on non-Unix
        tokio::signal::ctrl_c()
            .await
            .expect("install Ctrl+C handler");
    }
}

/// Spawn a task that cancels `cancel` when a shutdown signal arrives. The
/// returned token is the same one passed in, for chained construction.
pub fn cancel_on_signal(cancel: CancellationToken) -> CancellationToken {
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_cancel.cancel();
    });
    cancel
}
