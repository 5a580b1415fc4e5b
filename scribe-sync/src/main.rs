use std::sync::Arc;

use env_logger::Env;
use scribe_sync::{
    DocumentService, DocumentStore, MemoryStore, RocksStore, ServerConfig, StoreConfig,
    SyncServer,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env()?;

    let store: Arc<dyn DocumentStore> = match &config.storage_path {
        Some(path) => {
            log::info!("Opening document store at {}", path.display());
            Arc::new(RocksStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?)
        }
        None => {
            log::warn!("SCRIBE_STORAGE_PATH not set, documents will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };
    if config.auth_tokens.is_empty() {
        log::warn!("SCRIBE_TOKENS is empty, every connection will be rejected");
    }

    let service = Arc::new(DocumentService::new(store, config));
    let server = SyncServer::with_static_tokens(service.clone());

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Shutting down");
        }
    }

    let flushed = service.shutdown().await?;
    log::info!("Flushed {flushed} pending snapshots");
    Ok(())
}
