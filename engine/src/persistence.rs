//! Tile persistence strategies.
//!
//! A tagged variant rather than a trait object: the three strategies share
//! the same three-method contract (`load`, `save_snapshot`,
//! `save_subscribers`) and callers never need dynamic dispatch.
//!
//! - `Ephemeral`: in-memory map, for tests and single-node dev runs.
//! - `LocalKv`: one Redis key per field.
//! - `MigratingBlob`: reads prefer the bucket, fall back to Redis and
//!   lazily rewrite; snapshot writes go to both while the migration runs.
//!   Subscriber sets stay in Redis (small, hot, no reason to pay blob
//!   latency).

use anyhow::{Context, Result};
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::primitives::ByteStream;
use deadpool_redis::Pool;
use parking_lot::Mutex;
use redis::AsyncCommands;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use gingham_common::args::{BlobStoreArgs, RedisArgs};
use gingham_common::domain::TileKey;

/// One persisted last-edit entry, ordered by cell index in the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedEdit {
    pub i: u16,
    pub uid: String,
    pub name: String,
    #[serde(rename = "atMs")]
    pub at_ms: i64,
}

/// Persisted tile snapshot: rle64 bit text, version, sparse edit table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileSnapshot {
    pub bits: String,
    pub ver: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edits: Vec<PersistedEdit>,
}

/// Everything persistence knows about one tile.
#[derive(Debug, Clone, Default)]
pub struct TileRecord {
    pub snapshot: Option<TileSnapshot>,
    pub subscribers: Vec<String>,
}

#[derive(Default)]
pub struct EphemeralStore {
    tiles: Mutex<FxHashMap<TileKey, TileRecord>>,
}

pub enum TilePersistence {
    Ephemeral(EphemeralStore),
    LocalKv {
        pool: Pool,
    },
    MigratingBlob {
        s3: S3Client,
        bucket: String,
        pool: Pool,
    },
}

fn kv_snapshot_key(tile: TileKey) -> String {
    format!("tile:{}:{}:snapshot", tile.tx, tile.ty)
}

fn kv_subs_key(tile: TileKey) -> String {
    format!("tile:{}:{}:subs", tile.tx, tile.ty)
}

/// Bucket key layout, versioned so a future layout can migrate the same way
/// the KV → blob migration works today.
pub fn blob_key(tile: TileKey) -> String {
    format!("tiles/v1/tx={}/ty={}.json", tile.tx, tile.ty)
}

/// Fraction of snapshot reads that log a structured telemetry event.
const READ_SAMPLE_RATE: f32 = 0.02;

fn sample_read(tile: TileKey, source: &'static str, found: bool) {
    if rand::random::<f32>() < READ_SAMPLE_RATE {
        tracing::info!(tile = %tile, source, found, "tile snapshot read");
    }
    crate::metrics::snapshot_read(source, found);
}

impl TilePersistence {
    pub fn ephemeral() -> Self {
        Self::Ephemeral(EphemeralStore::default())
    }

    /// Connect the Local-KV strategy.
    pub async fn local_kv(args: &RedisArgs) -> Result<Self> {
        Ok(Self::LocalKv {
            pool: init_redis(args).await?,
        })
    }

    /// Connect the migrating blob strategy: bucket for snapshots, Redis for
    /// the fallback reads and subscriber sets.
    pub async fn migrating_blob(blob: &BlobStoreArgs, redis: &RedisArgs) -> Result<Self> {
        let bucket = blob
            .blob_bucket
            .clone()
            .context("blob persistence requires --blob-bucket")?;
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(blob.blob_region.clone()));
        if let Some(ref endpoint) = blob.blob_endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let config = loader.load().await;
        Ok(Self::MigratingBlob {
            s3: S3Client::new(&config),
            bucket,
            pool: init_redis(redis).await?,
        })
    }

    pub async fn load(&self, tile: TileKey) -> Result<TileRecord> {
        match self {
            TilePersistence::Ephemeral(store) => {
                let record = store
                    .tiles
                    .lock()
                    .get(&tile)
                    .cloned()
                    .unwrap_or_default();
                sample_read(tile, "ephemeral", record.snapshot.is_some());
                Ok(record)
            }
            TilePersistence::LocalKv { pool } => {
                let mut conn = pool.get().await.context("redis connection")?;
                let snapshot = read_kv_snapshot(&mut conn, tile).await?;
                let subscribers = read_kv_subscribers(&mut conn, tile).await?;
                sample_read(tile, "kv", snapshot.is_some());
                Ok(TileRecord {
                    snapshot,
                    subscribers,
                })
            }
            TilePersistence::MigratingBlob { s3, bucket, pool } => {
                let mut conn = pool.get().await.context("redis connection")?;
                let subscribers = read_kv_subscribers(&mut conn, tile).await?;

                if let Some(snapshot) = read_blob_snapshot(s3, bucket, tile).await? {
                    sample_read(tile, "blob", true);
                    return Ok(TileRecord {
                        snapshot: Some(snapshot),
                        subscribers,
                    });
                }

                // Bucket miss: fall back to KV and lazily rewrite so the
                // next read is served from the bucket.
                let snapshot = read_kv_snapshot(&mut conn, tile).await?;
                sample_read(tile, "kv-fallback", snapshot.is_some());
                if let Some(ref snap) = snapshot {
                    let s3 = s3.clone();
                    let bucket = bucket.clone();
                    let body = serde_json::to_vec(snap)?;
                    tokio::spawn(async move {
                        if let Err(e) = put_blob(&s3, &bucket, tile, body).await {
                            tracing::warn!(tile = %tile, ?e, "lazy blob rewrite failed");
                        }
                    });
                }
                Ok(TileRecord {
                    snapshot,
                    subscribers,
                })
            }
        }
    }

    pub async fn save_snapshot(&self, tile: TileKey, snapshot: &TileSnapshot) -> Result<()> {
        match self {
            TilePersistence::Ephemeral(store) => {
                store
                    .tiles
                    .lock()
                    .entry(tile)
                    .or_default()
                    .snapshot = Some(snapshot.clone());
                Ok(())
            }
            TilePersistence::LocalKv { pool } => {
                let mut conn = pool.get().await.context("redis connection")?;
                let json = serde_json::to_string(snapshot)?;
                conn.set::<_, _, ()>(kv_snapshot_key(tile), json)
                    .await
                    .context("redis snapshot write")?;
                Ok(())
            }
            TilePersistence::MigratingBlob { s3, bucket, pool } => {
                let body = serde_json::to_vec(snapshot)?;
                put_blob(s3, bucket, tile, body).await?;
                // Dual-write to KV while the migration is running, so a
                // rollback never loses tiles.
                let mut conn = pool.get().await.context("redis connection")?;
                let json = serde_json::to_string(snapshot)?;
                conn.set::<_, _, ()>(kv_snapshot_key(tile), json)
                    .await
                    .context("redis snapshot write")?;
                Ok(())
            }
        }
    }

    pub async fn save_subscribers(&self, tile: TileKey, subscribers: &[String]) -> Result<()> {
        match self {
            TilePersistence::Ephemeral(store) => {
                store
                    .tiles
                    .lock()
                    .entry(tile)
                    .or_default()
                    .subscribers = subscribers.to_vec();
                Ok(())
            }
            TilePersistence::LocalKv { pool } | TilePersistence::MigratingBlob { pool, .. } => {
                let mut conn = pool.get().await.context("redis connection")?;
                let json = serde_json::to_string(subscribers)?;
                conn.set::<_, _, ()>(kv_subs_key(tile), json)
                    .await
                    .context("redis subscriber write")?;
                Ok(())
            }
        }
    }
}

async fn init_redis(args: &RedisArgs) -> Result<Pool> {
    tracing::info!(url = %args.url_redacted(), "connecting to Redis");
    let pool = deadpool_redis::Config::from_url(args.url())
        .create_pool(Some(deadpool_redis::Runtime::Tokio1))
        .context("create Redis pool")?;
    pool.get()
        .await
        .context("connect to Redis")?
        .ping::<String>()
        .await
        .context("ping Redis")?;
    Ok(pool)
}

async fn read_kv_snapshot(
    conn: &mut deadpool_redis::Connection,
    tile: TileKey,
) -> Result<Option<TileSnapshot>> {
    let raw: Option<String> = conn
        .get(kv_snapshot_key(tile))
        .await
        .context("redis snapshot read")?;
    raw.map(|s| serde_json::from_str(&s).context("malformed snapshot JSON"))
        .transpose()
}

async fn read_kv_subscribers(
    conn: &mut deadpool_redis::Connection,
    tile: TileKey,
) -> Result<Vec<String>> {
    let raw: Option<String> = conn
        .get(kv_subs_key(tile))
        .await
        .context("redis subscriber read")?;
    Ok(raw
        .map(|s| serde_json::from_str(&s).context("malformed subscriber JSON"))
        .transpose()?
        .unwrap_or_default())
}

async fn read_blob_snapshot(
    s3: &S3Client,
    bucket: &str,
    tile: TileKey,
) -> Result<Option<TileSnapshot>> {
    match s3
        .get_object()
        .bucket(bucket)
        .key(blob_key(tile))
        .send()
        .await
    {
        Ok(out) => {
            let body = out.body.collect().await.context("blob body read")?;
            let snapshot =
                serde_json::from_slice(&body.into_bytes()).context("malformed blob snapshot")?;
            Ok(Some(snapshot))
        }
        Err(err) => {
            let service = err.into_service_error();
            if service.is_no_such_key() {
                Ok(None)
            } else {
                Err(anyhow::Error::new(service).context("blob snapshot read"))
            }
        }
    }
}

async fn put_blob(s3: &S3Client, bucket: &str, tile: TileKey, body: Vec<u8>) -> Result<()> {
    s3.put_object()
        .bucket(bucket)
        .key(blob_key(tile))
        .content_type("application/json")
        .body(ByteStream::from(body))
        .send()
        .await
        .context("blob snapshot write")?;
    Ok(())
}
