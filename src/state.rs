//! Application state management

use std::sync::Arc;

use crate::config::Config;
use crate::db::{self, SqliteDedupStore, SqliteSessionStore};
use crate::error::Result;
use crate::upload::UploadService;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    uploads: UploadService,
}

impl AppState {
    /// Create application state from configuration.
    ///
    /// Uses SQLite-backed session and dedup stores when a database URL is
    /// configured, process-local ones otherwise. Upload directories are
    /// created here.
    pub async fn new(config: Config) -> Result<Self> {
        let uploads = match &config.database.url {
            Some(url) => {
                let pool = db::create_pool(url).await?;
                tracing::info!("Database initialized at {}", url);
                UploadService::with_stores(
                    config.upload.clone(),
                    Arc::new(SqliteSessionStore::new(pool.clone())),
                    Arc::new(SqliteDedupStore::new(pool)),
                )
            }
            None => {
                tracing::info!("No database configured, upload state is kept in memory");
                UploadService::new(config.upload.clone())
            }
        };

        uploads.init().await?;

        Ok(Self::with_service(config, uploads))
    }

    /// Wrap an already constructed upload service
    pub fn with_service(config: Config, uploads: UploadService) -> Self {
        Self {
            inner: Arc::new(AppStateInner { config, uploads }),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the upload service
    pub fn uploads(&self) -> &UploadService {
        &self.inner.uploads
    }
}
