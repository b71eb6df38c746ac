use anyhow::Context;
use clap::Parser;
use facebank::blob::{BlobStore, FsBlobStore};
use facebank::config::{BlobBackend, Cli, Cmd, Config};
use facebank::embed::HttpEmbedder;
use facebank::gallery::Gallery;
use facebank::matcher::LinearMatcher;
use facebank::registry::{Registry, RegistryConfig};
use facebank::store::WalStore;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    cli.config.validate()?;
    tracing::info!("Facebank {} starting", facebank::VERSION);

    match cli.cmd {
        Cmd::Serve => serve(cli.config).await,
        Cmd::Compact => compact(&cli.config),
    }
}

fn open_gallery(config: &Config) -> anyhow::Result<Arc<Gallery>> {
    let path = config.wal_path();
    let store = WalStore::open(&path)
        .with_context(|| format!("opening gallery log {}", path.display()))?;
    let gallery = Gallery::open(Arc::new(store), config.dimension)
        .with_context(|| format!("loading gallery from {}", path.display()))?;
    Ok(Arc::new(gallery))
}

async fn open_blobs(config: &Config) -> anyhow::Result<Arc<dyn BlobStore>> {
    match config.blob_backend {
        BlobBackend::Fs => {
            let dir = config.photos_dir();
            let store = FsBlobStore::open(&dir)
                .await
                .with_context(|| format!("opening photos directory {}", dir.display()))?;
            tracing::info!("Photos stored in {}", dir.display());
            Ok(Arc::new(store))
        }
        #[cfg(feature = "s3")]
        BlobBackend::S3 => {
            let store = facebank::blob::S3BlobStore::from_env().await?;
            tracing::info!("Photos stored in S3");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "s3"))]
        BlobBackend::S3 => anyhow::bail!("the s3 blob backend needs the `s3` feature"),
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let gallery = open_gallery(&config)?;
    let blobs = open_blobs(&config).await?;
    let embedder = HttpEmbedder::new(&config.embedder_url, config.dimension, config.embed_timeout())
        .context("building embedder client")?;
    tracing::info!(
        "Embedder {} (dim={}, threshold={})",
        config.embedder_url,
        config.dimension,
        config.threshold
    );

    let registry = Registry::new(
        gallery,
        Arc::new(LinearMatcher::new(config.threshold)),
        Arc::new(embedder),
        blobs,
        RegistryConfig {
            embed_timeout: config.embed_timeout(),
        },
    )
    .context("embedder and gallery disagree on the embedding dimension")?;

    facebank::api::run(Arc::new(registry), config.listen, config.max_upload_bytes).await
}

fn compact(config: &Config) -> anyhow::Result<()> {
    let gallery = open_gallery(config)?;
    gallery.compact().context("compacting gallery log")?;
    tracing::info!("Compacted gallery log to {} records", gallery.count());
    Ok(())
}
