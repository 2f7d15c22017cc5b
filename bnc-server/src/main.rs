use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bnc_core::broadcast::Broadcaster;
use bnc_core::config::{ConfigDocument, ConfigStore, FileConfigPersister, LogOptions};
use bnc_core::db::SqliteStore;
use bnc_core::relay::{self, RelaySettings};
use bnc_core::supervisor::NetworkRegistry;
use bnc_server::cli::Args;
use bnc_server::tls::{self, TlsListener};
use bnc_server::upstream::IrcConnector;
use clap::Parser;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "bnc_core=info,bnc_server=info";

fn init_logging(options: &LogOptions) -> Result<()> {
    // RUST_LOG wins over the document's filter.
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(_) => EnvFilter::from_default_env(),
        Err(_) => EnvFilter::try_new(options.filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER))?,
    };
    let json_logs = options.json || std::env::var("BNC_LOG_JSON").unwrap_or_default() == "1";
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

fn load_or_create(path: &std::path::Path) -> Result<(ConfigDocument, bool)> {
    if path.exists() {
        let doc = ConfigDocument::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?;
        return Ok((doc, false));
    }
    let doc = ConfigDocument::default();
    doc.save(path)
        .with_context(|| format!("failed to create config {}", path.display()))?;
    Ok((doc, true))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install the ring crypto provider before any TLS usage.
    let _ = tokio_rustls::rustls::crypto::ring::default_provider().install_default();

    let args = Args::parse();
    let config_path = args.config_path();
    let (doc, created) = load_or_create(&config_path)?;
    init_logging(&doc.log_options)?;
    if created {
        tracing::info!("Wrote default config to {}", config_path.display());
    }

    let acceptor = match (&doc.tls_cert, &doc.tls_key) {
        (Some(cert), Some(key)) => Some(tls::load_acceptor(cert, key)?),
        (None, None) => None,
        _ => anyhow::bail!("tlsCert and tlsKey must be set together"),
    };

    let db_path = args.db_path(&doc, &config_path);
    let store = SqliteStore::open(&db_path)
        .with_context(|| format!("failed to open database {}", db_path.display()))?;
    tracing::info!("Event store at {}", db_path.display());

    let settings = RelaySettings {
        backlog_limit: doc.backlog_limit,
        store_timeout: Duration::from_secs(doc.store_timeout_secs),
        ..RelaySettings::default()
    };
    let config = ConfigStore::new(
        doc.channels.clone(),
        Box::new(FileConfigPersister::new(config_path.clone(), doc.clone())),
    );
    let (networks, streams) = NetworkRegistry::connect_all(&doc.networks, &IrcConnector::default());
    if networks.is_empty() {
        tracing::warn!("No networks configured in {}", config_path.display());
    }

    let broadcaster = Arc::new(Broadcaster::default());
    let (relay, relay_task) =
        relay::start(settings, config, networks, streams, Arc::new(store), broadcaster);

    let listen = args.listen_addr(&doc);
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;

    let app = bnc_server::web::router(relay.clone());
    let served: Pin<Box<dyn Future<Output = std::io::Result<()>> + Send>> = match acceptor {
        Some(acceptor) => {
            tracing::info!("WebSocket sessions on wss://{listen}/ws");
            let listener = TlsListener::new(listener, acceptor);
            Box::pin(axum::serve(listener, app).into_future())
        }
        None => {
            tracing::info!("WebSocket sessions on ws://{listen}/ws");
            Box::pin(axum::serve(listener, app).into_future())
        }
    };
    tokio::select! {
        result = served => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("Shutting down"),
    }

    relay.shutdown().await;
    let _ = relay_task.await;
    Ok(())
}
