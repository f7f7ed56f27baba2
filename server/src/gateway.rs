//! Stateless front door.
//!
//! Resolves identity (signed token or freshly minted guest), picks the
//! shard by uid hash, and hands the upgraded socket to that shard. Also
//! serves the public read surface: `/health` and `/cell-last-edit`.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use rustc_hash::FxHashMap;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use gingham_common::domain::{SHARD_COUNT, TileKey, is_cell_index_valid, shard_index_for_uid};
use gingham_common::identity::{generate_name, generate_uid};
use gingham_common::{now_s, token};
use gingham_engine::{OwnerRegistry, ShardDirectory, TilePersistence};

use crate::args::{PersistenceKind, ServerArgs};
use crate::shard::{ShardHandle, spawn_shard};
use crate::socket::serve_socket;

const SHARD_INBOX: usize = 1024;
const SHARD_BATCH_INBOX: usize = 1024;

#[derive(Clone)]
pub struct GatewayState {
    shards: Arc<Vec<ShardHandle>>,
    registry: OwnerRegistry,
    secret: Arc<[u8]>,
}

pub async fn run_server(args: ServerArgs) -> Result<()> {
    let cancel = gingham_common::shutdown::cancel_on_signal(CancellationToken::new());

    let persistence = match args.persistence {
        PersistenceKind::Memory => TilePersistence::ephemeral(),
        PersistenceKind::Kv => TilePersistence::local_kv(&args.redis).await?,
        PersistenceKind::Blob => {
            TilePersistence::migrating_blob(&args.blob, &args.redis).await?
        }
    };

    // Wire the fleet: batch sinks for owner fanout, inboxes for sockets and
    // peer relays, then one actor per shard.
    let mut batch_sinks = FxHashMap::default();
    let mut pending = Vec::new();
    let mut handles = Vec::new();
    for idx in 0..SHARD_COUNT {
        let name = format!("shard-{idx}");
        let (batch_tx, batch_rx) = mpsc::channel(SHARD_BATCH_INBOX);
        let (inbox_tx, inbox_rx) = mpsc::channel(SHARD_INBOX);
        batch_sinks.insert(name.clone(), batch_tx);
        handles.push(ShardHandle::new(&name, inbox_tx));
        pending.push((name, inbox_rx, batch_rx));
    }
    let shards = Arc::new(handles);
    let registry = OwnerRegistry::new(
        Arc::new(persistence),
        ShardDirectory::new(batch_sinks),
        cancel.clone(),
    );
    for (name, inbox_rx, batch_rx) in pending {
        spawn_shard(
            name,
            registry.clone(),
            shards.clone(),
            inbox_rx,
            batch_rx,
            cancel.clone(),
        );
    }

    let state = GatewayState {
        shards,
        registry,
        secret: Arc::from(args.token.token_secret.as_bytes()),
    };
    let cors = if args.allowed_origins.is_empty() {
        gingham_common::cors::permissive()
    } else {
        let origins: Vec<&str> = args.allowed_origins.iter().map(String::as_str).collect();
        gingham_common::cors::pinned(&origins)
    };
    let app = Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .route(
            "/cell-last-edit",
            get(cell_last_edit).options(cell_last_edit_preflight),
        )
        .layer(cors)
        .with_state(state);

    let addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    tracing::info!(%addr, shards = SHARD_COUNT, "starting gingham gateway");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    gingham_common::signal_ready();
    axum::serve(listener, app)
        .with_graceful_shutdown({
            let cancel = cancel.clone();
            async move { cancel.cancelled().await }
        })
        .await?;
    cancel.cancel();
    tracing::info!("gateway stopped gracefully");
    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(json!({"ok": true, "ws": "/ws"}))
}

#[derive(Deserialize)]
struct WsQuery {
    token: Option<String>,
}

/// Token claims win; anything else in the query is untrusted and a guest
/// identity is minted instead.
fn resolve_identity(secret: &[u8], presented: Option<&str>, now_s: i64) -> (String, String) {
    if let Some(claims) = presented.and_then(|t| token::verify(secret, t, now_s)) {
        return (claims.uid, claims.name);
    }
    crate::metrics::guest_identity_minted();
    (generate_uid(), generate_name())
}

async fn ws_handler(
    State(state): State<GatewayState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let now = now_s();
    let (uid, name) = resolve_identity(&state.secret, query.token.as_deref(), now);

    let shard_idx = shard_index_for_uid(&uid) as usize;
    let shard = state.shards[shard_idx].clone();

    // Every accepted connection leaves with a fresh short-TTL token so the
    // client can keep its identity across reconnects.
    let fresh = match token::mint(&state.secret, &uid, &name, now) {
        Ok(token) => token,
        Err(e) => {
            tracing::error!(?e, "token mint failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    tracing::debug!(uid, shard = shard.name(), "upgrading websocket");
    ws.on_upgrade(move |socket| serve_socket(socket, shard, uid, name, fresh))
}

#[derive(Deserialize)]
struct CellLastEditQuery {
    tile: String,
    i: String,
}

/// Strict decimal parse for the cell index: digits only, no sign, no
/// leading zeros beyond a bare `0`, value inside the tile.
fn parse_cell_index(s: &str) -> Option<u16> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if s.len() > 1 && s.starts_with('0') {
        return None;
    }
    let v: u32 = s.parse().ok()?;
    is_cell_index_valid(v).then_some(v as u16)
}

fn cors_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, OPTIONS"),
    );
    headers
}

async fn cell_last_edit_preflight() -> impl IntoResponse {
    (StatusCode::NO_CONTENT, cors_headers())
}

async fn cell_last_edit(
    State(state): State<GatewayState>,
    Query(query): Query<CellLastEditQuery>,
) -> Response {
    let Ok(tile) = TileKey::parse(&query.tile) else {
        return bad_request("invalid tile key");
    };
    let Some(i) = parse_cell_index(&query.i) else {
        return bad_request("invalid cell index");
    };

    match state.registry.cell_last_edit(tile, i).await {
        Ok(edit) => {
            let edit = edit.map(|e| json!({"uid": e.uid, "name": e.name, "atMs": e.at_ms}));
            (
                cors_headers(),
                Json(json!({
                    "tile": tile.canonical(),
                    "i": i,
                    "edit": edit,
                })),
            )
                .into_response()
        }
        Err(e) => {
            tracing::warn!(%tile, i, ?e, "cell-last-edit lookup failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                cors_headers(),
                Json(json!({"reason": "lookup failed"})),
            )
                .into_response()
        }
    }
}

fn bad_request(reason: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        cors_headers(),
        Json(json!({"reason": reason})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_index_parsing_is_strict() {
        assert_eq!(parse_cell_index("0"), Some(0));
        assert_eq!(parse_cell_index("7"), Some(7));
        assert_eq!(parse_cell_index("4095"), Some(4095));
        for bad in ["", "4096", "-1", "+1", "07", " 7", "7 ", "1e3", "99999999999"] {
            assert_eq!(parse_cell_index(bad), None, "should reject {bad:?}");
        }
    }

    #[test]
    fn identity_resolution_prefers_valid_token() {
        let secret = b"secret";
        let now = 1_000;
        let minted = token::mint(secret, "u_known", "KnownHand1", now).unwrap();

        let (uid, name) = resolve_identity(secret, Some(&minted), now);
        assert_eq!(uid, "u_known");
        assert_eq!(name, "KnownHand1");

        // Invalid, expired, or absent tokens all mint a guest identity.
        for presented in [None, Some("garbage"), Some("v1.a.b")] {
            let (uid, name) = resolve_identity(secret, presented, now);
            assert!(gingham_common::identity::is_valid_uid(&uid));
            assert!(gingham_common::identity::is_valid_name(&name));
            assert_ne!(uid, "u_known");
        }

        let expired = token::sign(
            secret,
            &token::Claims {
                uid: "u_known".into(),
                name: "KnownHand1".into(),
                exp: now - 1,
            },
        )
        .unwrap();
        let (uid, _) = resolve_identity(secret, Some(&expired), now);
        assert_ne!(uid, "u_known");
    }

    #[test]
    fn shard_selection_spreads_by_uid_hash() {
        // The routing function is shared with the shard names generated in
        // run_server; this pins the format they must agree on.
        let idx = shard_index_for_uid("u_deadbeef");
        assert!(idx < SHARD_COUNT);
        assert_eq!(format!("shard-{idx}"), {
            gingham_common::domain::shard_name_for_uid("u_deadbeef")
        });
    }
}
