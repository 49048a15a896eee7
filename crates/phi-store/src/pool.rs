use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use tokio::sync::OnceCell;

use crate::PhiStoreError;

pub const MAX_CONNECTIONS: u32 = 5;
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection settings for the restricted store.
#[derive(Clone, PartialEq, Eq)]
pub struct PhiDbConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    /// `true` requires TLS, `false` still prefers it.
    pub ssl: bool,
}

impl PhiDbConfig {
    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database)
            .username(&self.user)
            .password(&self.password)
            .ssl_mode(if self.ssl {
                PgSslMode::Require
            } else {
                PgSslMode::Prefer
            })
    }
}

impl std::fmt::Debug for PhiDbConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhiDbConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("ssl", &self.ssl)
            .finish()
    }
}

/// Lazily-created process-wide pool. The first caller opens it; a failed
/// open leaves the cell empty so the next request retries.
#[derive(Clone)]
pub struct PhiPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    options: PgConnectOptions,
    pool: OnceCell<PgPool>,
}

impl PhiPool {
    pub fn new(options: PgConnectOptions) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                options,
                pool: OnceCell::new(),
            }),
        }
    }

    pub fn from_config(config: &PhiDbConfig) -> Self {
        Self::new(config.connect_options())
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.pool.initialized()
    }

    pub async fn get(&self) -> Result<&PgPool, PhiStoreError> {
        self.inner
            .pool
            .get_or_try_init(|| async {
                let connect = PgPoolOptions::new()
                    .max_connections(MAX_CONNECTIONS)
                    .idle_timeout(IDLE_TIMEOUT)
                    .acquire_timeout(CONNECT_TIMEOUT)
                    .connect_with(self.inner.options.clone());

                // Driver errors can carry connection strings; log the kind only.
                let pool = match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
                    Ok(Ok(pool)) => pool,
                    Ok(Err(err)) => {
                        let err = PhiStoreError::from(err);
                        tracing::error!(error = %err, "phi_pool.connect_failed");
                        return Err(PhiStoreError::Unavailable);
                    }
                    Err(_) => {
                        tracing::error!("phi_pool.connect_timeout");
                        return Err(PhiStoreError::Unavailable);
                    }
                };

                tracing::info!(max_connections = MAX_CONNECTIONS, "phi_pool.created");
                Ok(pool)
            })
            .await
    }

    pub async fn health_check(&self) -> Result<(), PhiStoreError> {
        let pool = self.get().await?;
        tokio::time::timeout(CONNECT_TIMEOUT, sqlx::query("SELECT 1").execute(pool))
            .await
            .map_err(|_| PhiStoreError::Timeout)??;
        Ok(())
    }

    pub async fn migrate(&self) -> Result<(), PhiStoreError> {
        let pool = self.get().await?;
        tokio::time::timeout(Duration::from_secs(30), crate::migrate(pool))
            .await
            .map_err(|_| PhiStoreError::Timeout)?
    }

    pub async fn close(&self) {
        if let Some(pool) = self.inner.pool.get() {
            pool.close().await;
            tracing::info!("phi_pool.closed");
        }
    }
}

impl std::fmt::Debug for PhiPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhiPool")
            .field("initialized", &self.is_initialized())
            .finish()
    }
}
