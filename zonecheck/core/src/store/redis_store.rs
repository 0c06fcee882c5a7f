//! Redis-backed shared store
//!
//! Connects lazily through a [`ConnectionManager`], which reconnects on its
//! own after the first successful connection. Every command outcome updates
//! the live connection flag, so `is_connected` tracks the most recent
//! round-trip rather than whether a URL was configured.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::RedisResult;
use tokio::sync::OnceCell;

use crate::error::{ZoneError, ZoneResult};

/// Default per-command timeout
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Redis store handle (cheap to clone)
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    manager: Arc<OnceCell<ConnectionManager>>,
    connected: Arc<AtomicBool>,
    command_timeout: Duration,
}

impl RedisStore {
    /// Create a store for `url` without connecting yet
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the URL cannot be parsed.
    pub fn open(url: &str, command_timeout: Duration) -> ZoneResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| ZoneError::Configuration(format!("invalid Redis URL: {e}")))?;
        Ok(Self {
            client,
            manager: Arc::new(OnceCell::new()),
            connected: Arc::new(AtomicBool::new(false)),
            command_timeout,
        })
    }

    /// Whether the last round-trip succeeded
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn mark(&self, connected: bool) {
        let was = self.connected.swap(connected, Ordering::AcqRel);
        if was != connected {
            if connected {
                tracing::info!("Redis connection established");
            } else {
                tracing::warn!("Redis connection lost");
            }
        }
    }

    async fn connection(&self) -> ZoneResult<ConnectionManager> {
        let timeout = self.command_timeout;
        let client = self.client.clone();
        let result = self
            .manager
            .get_or_try_init(|| async move {
                match tokio::time::timeout(timeout, ConnectionManager::new(client)).await {
                    Ok(result) => result.map_err(|e| e.to_string()),
                    Err(_) => Err("connect timed out".to_string()),
                }
            })
            .await;

        match result {
            Ok(manager) => Ok(manager.clone()),
            Err(message) => {
                self.mark(false);
                Err(ZoneError::StoreUnavailable(message))
            }
        }
    }

    async fn run<T, F, Fut>(&self, op: &'static str, f: F) -> ZoneResult<T>
    where
        F: FnOnce(ConnectionManager) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let conn = self.connection().await?;
        match tokio::time::timeout(self.command_timeout, f(conn)).await {
            Ok(Ok(value)) => {
                self.mark(true);
                Ok(value)
            }
            Ok(Err(e)) => {
                self.mark(!e.is_connection_dropped() && !e.is_io_error());
                tracing::debug!(op, error = %e, "Redis command failed");
                Err(ZoneError::StoreUnavailable(format!("{op}: {e}")))
            }
            Err(_) => {
                self.mark(false);
                Err(ZoneError::StoreUnavailable(format!("{op}: timed out")))
            }
        }
    }

    /// `GET key`
    pub async fn get(&self, key: &str) -> ZoneResult<Option<String>> {
        self.run("GET", |mut conn| async move {
            redis::cmd("GET").arg(key).query_async(&mut conn).await
        })
        .await
    }

    /// `SET key value EX ttl`
    pub async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> ZoneResult<()> {
        let secs = ttl.as_secs().max(1);
        self.run("SET", |mut conn| async move {
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("EX")
                .arg(secs)
                .query_async(&mut conn)
                .await
        })
        .await
    }

    /// `DEL key`
    pub async fn del(&self, key: &str) -> ZoneResult<bool> {
        let removed: i64 = self
            .run("DEL", |mut conn| async move {
                redis::cmd("DEL").arg(key).query_async(&mut conn).await
            })
            .await?;
        Ok(removed > 0)
    }

    /// `MULTI; INCR key; EXPIRE key ttl; EXEC`
    pub async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> ZoneResult<u64> {
        let secs = ttl.as_secs().max(1);
        let (count,): (u64,) = self
            .run("INCR", |mut conn| async move {
                redis::pipe()
                    .atomic()
                    .cmd("INCR")
                    .arg(key)
                    .cmd("EXPIRE")
                    .arg(key)
                    .arg(secs)
                    .ignore()
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(count)
    }

    /// `PING`
    pub async fn ping(&self) -> ZoneResult<()> {
        let _: String = self
            .run("PING", |mut conn| async move {
                redis::cmd("PING").query_async(&mut conn).await
            })
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("connected", &self.is_connected())
            .field("command_timeout", &self.command_timeout)
            .finish_non_exhaustive()
    }
}
