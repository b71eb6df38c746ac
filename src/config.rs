//! Command line and environment configuration.

use crate::defaults::*;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "facebank", version, about = "Face identity registry")]
pub struct Cli {
    #[command(flatten)]
    pub config: Config,

    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmd {
    /// Run the HTTP API
    Serve,
    /// Rewrite the gallery log down to the live records and exit
    Compact,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobBackend {
    /// Photos directory on local disk
    Fs,
    /// S3-compatible bucket (needs the `s3` feature)
    S3,
}

#[derive(Args, Debug, Clone)]
pub struct Config {
    /// Address the HTTP API binds to
    #[arg(long, env = "FACEBANK_LISTEN", default_value = DEFAULT_LISTEN, global = true)]
    pub listen: SocketAddr,

    /// Directory holding the gallery log
    #[arg(long, env = "FACEBANK_DATA_DIR", default_value = "./data", global = true)]
    pub data_dir: PathBuf,

    /// Photos directory for the fs backend [default: <data-dir>/photos]
    #[arg(long, env = "FACEBANK_PHOTOS_DIR", global = true)]
    pub photos_dir: Option<PathBuf>,

    #[arg(long, value_enum, env = "FACEBANK_BLOB_BACKEND", default_value = "fs", global = true)]
    pub blob_backend: BlobBackend,

    /// Embedding sidecar endpoint
    #[arg(
        long,
        env = "FACEBANK_EMBEDDER_URL",
        default_value = "http://127.0.0.1:8001/embed",
        global = true
    )]
    pub embedder_url: String,

    #[arg(long, env = "FACEBANK_DIMENSION", default_value_t = DEFAULT_DIMENSION, global = true)]
    pub dimension: usize,

    /// Match when the nearest distance is strictly below this
    #[arg(long, env = "FACEBANK_THRESHOLD", default_value_t = DEFAULT_THRESHOLD, global = true)]
    pub threshold: f32,

    #[arg(
        long,
        env = "FACEBANK_EMBED_TIMEOUT_MS",
        default_value_t = DEFAULT_EMBED_TIMEOUT_MS,
        global = true
    )]
    pub embed_timeout_ms: u64,

    #[arg(
        long,
        env = "FACEBANK_MAX_UPLOAD_BYTES",
        default_value_t = DEFAULT_MAX_UPLOAD_BYTES,
        global = true
    )]
    pub max_upload_bytes: usize,
}

impl Config {
    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join(WAL_FILE_NAME)
    }

    pub fn photos_dir(&self) -> PathBuf {
        self.photos_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("photos"))
    }

    pub fn embed_timeout(&self) -> Duration {
        Duration::from_millis(self.embed_timeout_ms)
    }

    /// Rejects values the registry cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.dimension == 0 {
            anyhow::bail!("dimension must be positive");
        }
        if !(self.threshold.is_finite() && self.threshold > 0.0) {
            anyhow::bail!("threshold must be a positive number, got {}", self.threshold);
        }
        if self.embed_timeout_ms == 0 {
            anyhow::bail!("embed timeout must be positive");
        }
        Ok(())
    }
}
