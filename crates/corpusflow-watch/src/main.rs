mod config;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use clap::Parser;
use corpusflow_core::{Credentials, DocumentManager, DocumentSource, WatchAction};
use corpusflow_gdrive::{DriveSourceConfig, GoogleDriveSource};
use corpusflow_local::{LocalFileSystemSource, LocalSourceConfig};
use corpusflow_s3::{S3Source, S3SourceConfig};
use serde_json::json;
use tokio::signal;
use tokio::sync::watch as tokio_watch;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use config::Config;

/// A registered source waiting to be connected and watched.
struct Planned {
    name: String,
    credentials: Credentials,
    interval: Option<Duration>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    if !config.has_sources() {
        bail!("No source configured: pass --local-root, a Google credential or --s3-bucket");
    }

    info!("Starting corpusflow-watch");
    let manager = Arc::new(DocumentManager::new());
    let planned = register_sources(&config, &manager).await?;

    let mut intervals = HashMap::new();
    for plan in planned {
        match manager.connect_source(&plan.name, &plan.credentials).await {
            Ok(true) => {
                intervals.insert(plan.name, plan.interval);
            }
            Ok(false) => {
                warn!("Skipping {}: repository not found", plan.name);
                manager.remove_source(&plan.name).await?;
            }
            Err(e) => {
                error!("Skipping {}: {}", plan.name, e);
                manager.remove_source(&plan.name).await?;
            }
        }
    }
    if intervals.is_empty() {
        bail!("No source could be connected");
    }

    let mut listing: Vec<_> = manager.list_all_documents(None).await.into_iter().collect();
    listing.sort_by(|a, b| a.0.cmp(&b.0));
    for (source, docs) in listing {
        info!("{} documents in {}", docs.len(), source);
        for doc in docs {
            debug!("  {} ({})", doc.name, doc.doc_type);
        }
    }

    manager.add_watch_callback("log", |source, action, metadata| {
        info!("{} in {}: {} [{}]", action, source, metadata.name, metadata.doc_id);
    });
    if config.fetch {
        spawn_fetcher(manager.clone());
    }

    if let Err(e) = manager.watch_all_sources(&intervals).await {
        error!("Some watches failed to start: {}", e);
    }
    info!("Watching {} source(s); press Ctrl+C to stop", intervals.len());

    let mut shutdown_rx = create_shutdown_signal();
    let _ = shutdown_rx.wait_for(|&v| v).await;

    manager.stop_watching_all().await;
    for name in manager.source_names() {
        if let Err(e) = manager.remove_source(&name).await {
            warn!("Failed to disconnect {}: {}", name, e);
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Build every configured source and register it with the manager.
async fn register_sources(
    config: &Config,
    manager: &DocumentManager,
) -> anyhow::Result<Vec<Planned>> {
    let mut planned = Vec::new();

    if let Some(root) = &config.local_root {
        let source_config = LocalSourceConfig::new(root)
            .with_cache(config.cache_for(corpusflow_local::DEFAULT_SOURCE_NAME))
            .with_modified_policy(config.modified_policy());
        let source = LocalFileSystemSource::open(source_config).await?;
        planned.push(add(manager, source, Credentials::new(), config.local_interval()));
        info!("  local root: {}", root.display());
    }

    if config.has_gdrive() {
        let source_config = DriveSourceConfig::default()
            .with_cache(config.cache_for(corpusflow_gdrive::DEFAULT_SOURCE_NAME))
            .with_modified_policy(config.modified_policy());
        let source = GoogleDriveSource::open(source_config).await?;

        let mut credentials = Credentials::new();
        if let Some(token) = &config.gdrive_access_token {
            credentials.insert(corpusflow_gdrive::ACCESS_TOKEN_KEY.to_string(), json!(token));
        }
        if let Some(path) = &config.gdrive_credentials_file {
            credentials.insert(
                corpusflow_gdrive::CREDENTIALS_FILE_KEY.to_string(),
                json!(path.to_string_lossy()),
            );
        }
        let interval = Some(Duration::from_secs(config.gdrive_poll_secs));
        planned.push(add(manager, source, credentials, interval));
    }

    if let Some(bucket) = &config.s3_bucket {
        // S3 keeps its ETag-based modification check regardless of --only-changed
        let source_config = S3SourceConfig::new(bucket)
            .with_prefix(&config.s3_prefix)
            .with_cache(config.cache_for(corpusflow_s3::DEFAULT_SOURCE_NAME));
        let source = S3Source::open(source_config).await?;

        let mut credentials = Credentials::new();
        credentials.insert(corpusflow_s3::REGION_KEY.to_string(), json!(config.s3_region));
        let optional = [
            (corpusflow_s3::ENDPOINT_URL_KEY, &config.s3_endpoint_url),
            (corpusflow_s3::ACCESS_KEY_ID_KEY, &config.s3_access_key_id),
            (corpusflow_s3::SECRET_ACCESS_KEY_KEY, &config.s3_secret_access_key),
            (corpusflow_s3::SESSION_TOKEN_KEY, &config.s3_session_token),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                credentials.insert(key.to_string(), json!(value));
            }
        }
        let interval = Some(Duration::from_secs(config.s3_poll_secs));
        planned.push(add(manager, source, credentials, interval));
        info!("  s3 bucket: {}/{}", bucket, config.s3_prefix);
    }

    Ok(planned)
}

fn add<S: DocumentSource + 'static>(
    manager: &DocumentManager,
    source: S,
    credentials: Credentials,
    interval: Option<Duration>,
) -> Planned {
    let name = source.name().to_string();
    manager.add_source(name.clone(), Arc::new(source));
    Planned {
        name,
        credentials,
        interval,
    }
}

/// Fetch created and modified documents as their events arrive.
fn spawn_fetcher(manager: Arc<DocumentManager>) {
    let mut events = manager.subscribe("fetch");
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if event.action == WatchAction::Deleted {
                continue;
            }
            match manager
                .get_document(&event.source, &event.metadata.doc_id)
                .await
            {
                Ok(doc) => info!(
                    "Fetched {} from {} ({} bytes)",
                    doc.metadata.name,
                    event.source,
                    doc.content.len()
                ),
                Err(e) => warn!(
                    "Failed to fetch {} from {}: {}",
                    event.metadata.doc_id, event.source, e
                ),
            }
        }
    });
}

/// Create a shutdown signal that triggers on Ctrl+C or SIGTERM.
fn create_shutdown_signal() -> tokio_watch::Receiver<bool> {
    let (tx, rx) = tokio_watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = async {
            match signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C, initiating shutdown"),
                Err(e) => {
                    error!("Failed to install Ctrl+C handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, initiating shutdown");
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        let _ = tx.send(true);
    });

    rx
}
