//! Headless exerciser for the client data core: connects, parks a viewport
//! over a patch of the grid, and toggles random cells while reporting what
//! converges back. Handy for soaking a server without a browser.

use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::{Duration, sleep};

use gingham_client::{CameraRect, SessionEvent, start};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Websocket endpoint of the gateway.
    #[arg(long, env = "GINGHAM_URL", default_value = "ws://127.0.0.1:3000/ws")]
    url: String,

    /// Center of the viewport, world cell coordinates.
    #[arg(long, default_value_t = 0)]
    center_x: i64,

    #[arg(long, default_value_t = 0)]
    center_y: i64,

    /// Viewport half-size in cells.
    #[arg(long, default_value_t = 128)]
    half_size: i64,

    /// Toggles per second.
    #[arg(long, default_value_t = 2.0)]
    rate: f64,

    /// Stop after this many toggles (0 = run forever).
    #[arg(long, default_value_t = 0)]
    count: u64,

    /// RNG seed, so two robots can replay the same toggle sequence.
    #[arg(long, default_value_t = 1)]
    seed: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    gingham_common::init();
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let (session, events) = start(args.url.clone());

    session.viewport(CameraRect {
        min_x: (args.center_x - args.half_size) as f64,
        min_y: (args.center_y - args.half_size) as f64,
        max_x: (args.center_x + args.half_size) as f64,
        max_y: (args.center_y + args.half_size) as f64,
    });

    // Report inbound activity in the background.
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SessionEvent::Ready { uid, name } => {
                    tracing::info!(uid, name, "session ready");
                }
                SessionEvent::TileUpdated { tile } => {
                    tracing::debug!(%tile, "tile updated");
                }
                SessionEvent::RemoteCursor { uid, x, y, .. } => {
                    tracing::debug!(uid, x, y, "remote cursor");
                }
                SessionEvent::ServerError { code, msg } => {
                    tracing::warn!(code, msg, "server error");
                }
                SessionEvent::Offline { for_ms, unsynced } => {
                    tracing::warn!(for_ms, unsynced, "offline");
                }
                SessionEvent::Online => {
                    tracing::info!("back online");
                }
            }
        }
    });

    let period = Duration::from_secs_f64(1.0 / args.rate.max(0.01));
    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut toggles = 0u64;
    loop {
        let dx = rng.random_range(-args.half_size..=args.half_size);
        let dy = rng.random_range(-args.half_size..=args.half_size);
        let v: u8 = rng.random_range(0..=1);

        let x = args.center_x + dx;
        let y = args.center_y + dy;
        session.set_cell(x, y, v);
        session.cursor(x as f32, y as f32);
        tracing::debug!(x, y, v, "toggled");

        toggles += 1;
        if args.count != 0 && toggles >= args.count {
            break;
        }
        sleep(period).await;
    }

    session.dispose();
    // Give the close handshake a moment before the process exits.
    sleep(Duration::from_millis(250)).await;
    Ok(())
}
