use clap::{Parser, Subcommand, ValueEnum};
use gingham_common::args::{BlobStoreArgs, RedisArgs, TokenArgs};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    Server(ServerArgs),
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceKind {
    /// In-memory only; tiles vanish on restart. Dev and tests.
    Memory,
    /// Redis key per tile field.
    Kv,
    /// Blob bucket for snapshots with Redis fallback during migration.
    Blob,
}

#[derive(Parser, Debug, Clone)]
pub struct ServerArgs {
    #[arg(long, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    #[arg(long, env = "PERSISTENCE", value_enum, default_value_t = PersistenceKind::Memory)]
    pub persistence: PersistenceKind,

    /// Comma-separated browser origins allowed on the public surface.
    /// Empty means fully permissive (dev).
    #[arg(long, env = "ALLOWED_ORIGINS", value_delimiter = ',')]
    pub allowed_origins: Vec<String>,

    #[command(flatten)]
    pub redis: RedisArgs,

    #[command(flatten)]
    pub blob: BlobStoreArgs,

    #[command(flatten)]
    pub token: TokenArgs,
}
