//! Connection pool
//!
//! A bounded pool over a [`ServerSet`]. Checkout reuses an idle connection or
//! opens a new one; every operation runs through the one-retry helper, whose
//! retry always opens a fresh connection through the server set.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::future::Future;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, instrument, warn};

use galsync_directory::config::ConnectionSettings;
use galsync_directory::error::{DirectoryError, DirectoryResult};
use galsync_directory::resilience::{execute_with_one_retry, Attempt};

use crate::server_set::{ServerSet, ServerTarget};

/// Opens connections to a server target.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Cheap, cloneable handle to one open connection.
    type Connection: Clone + Send + Sync + 'static;

    async fn connect(&self, target: &ServerTarget) -> DirectoryResult<Self::Connection>;
}

/// A bounded connection pool.
pub struct ConnectionPool<F: ConnectionFactory> {
    factory: F,
    servers: ServerSet,
    idle: Mutex<Vec<F::Connection>>,
    permits: Semaphore,
    settings: ConnectionSettings,
}

impl<F: ConnectionFactory> std::fmt::Debug for ConnectionPool<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("servers", &self.servers)
            .field("idle", &self.idle.lock().len())
            .field("available", &self.permits.available_permits())
            .finish()
    }
}

/// A connection checked out of the pool; returned on drop unless discarded.
pub struct PooledConnection<'p, F: ConnectionFactory> {
    pool: &'p ConnectionPool<F>,
    conn: Option<F::Connection>,
    _permit: SemaphorePermit<'p>,
}

impl<F: ConnectionFactory> PooledConnection<'_, F> {
    /// Handle to the underlying connection.
    pub fn handle(&self) -> Option<F::Connection> {
        self.conn.clone()
    }

    /// Drop the connection instead of returning it to the pool.
    pub fn discard(&mut self) {
        self.conn = None;
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<'_, F> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.idle.lock().push(conn);
        }
    }
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    /// Create a pool and open `pool_min_size` connections.
    ///
    /// Failures while warming up are logged; the pool still serves checkouts
    /// once a server becomes reachable.
    pub async fn new(
        factory: F,
        servers: ServerSet,
        settings: ConnectionSettings,
    ) -> DirectoryResult<Self> {
        settings.validate()?;
        let pool = Self {
            factory,
            servers,
            idle: Mutex::new(Vec::new()),
            permits: Semaphore::new(settings.pool_max_size as usize),
            settings,
        };
        for _ in 0..pool.settings.pool_min_size {
            match pool.open().await {
                Ok(conn) => pool.idle.lock().push(conn),
                Err(e) => {
                    warn!(error = %e, "failed to open initial pooled connection");
                    break;
                }
            }
        }
        Ok(pool)
    }

    pub fn servers(&self) -> &ServerSet {
        &self.servers
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    async fn acquire(&self) -> DirectoryResult<SemaphorePermit<'_>> {
        let timeout = self.settings.checkout_timeout();
        match tokio::time::timeout(timeout, self.permits.acquire()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(DirectoryError::connection_failed("connection pool closed")),
            Err(_) => Err(DirectoryError::CheckoutTimeout {
                timeout_ms: self.settings.checkout_timeout_ms,
            }),
        }
    }

    /// Open a new connection, trying servers in failover order.
    async fn open(&self) -> DirectoryResult<F::Connection> {
        let mut last_error = None;
        for target in self.servers.candidates() {
            match self.factory.connect(&target).await {
                Ok(conn) => {
                    debug!(url = %target.url, "opened LDAP connection");
                    return Ok(conn);
                }
                Err(e) => {
                    warn!(url = %target.url, error = %e, "LDAP server unreachable");
                    if !e.is_transient() {
                        return Err(e);
                    }
                    last_error = Some(e);
                }
            }
        }
        Err(match last_error {
            Some(e) => DirectoryError::connection_failed_with_source(
                "no LDAP server in the server set accepted a connection",
                e,
            ),
            None => DirectoryError::connection_failed("server set is empty"),
        })
    }

    /// Check out an idle connection or open a new one.
    pub async fn checkout(&self) -> DirectoryResult<PooledConnection<'_, F>> {
        let permit = self.acquire().await?;
        let idle = self.idle.lock().pop();
        let conn = match idle {
            Some(conn) => conn,
            None => self.open().await?,
        };
        Ok(PooledConnection {
            pool: self,
            conn: Some(conn),
            _permit: permit,
        })
    }

    /// Check out a newly opened connection, bypassing idle ones.
    pub async fn checkout_fresh(&self) -> DirectoryResult<PooledConnection<'_, F>> {
        let permit = self.acquire().await?;
        let conn = self.open().await?;
        Ok(PooledConnection {
            pool: self,
            conn: Some(conn),
            _permit: permit,
        })
    }

    /// Run `op` on a pooled connection with a single retry on server down.
    #[instrument(skip(self, op))]
    pub async fn execute<T, Op, Fut>(&self, operation: &str, op: Op) -> DirectoryResult<T>
    where
        Op: Fn(F::Connection) -> Fut,
        Fut: Future<Output = DirectoryResult<T>>,
    {
        let op = &op;
        execute_with_one_retry(operation, |attempt| async move {
            let mut pooled = match attempt {
                Attempt::Checkout => self.checkout().await?,
                Attempt::Retry => self.checkout_fresh().await?,
            };
            let handle = pooled
                .handle()
                .ok_or_else(|| DirectoryError::connection_failed("pooled connection missing"))?;
            let result = op(handle).await;
            if matches!(&result, Err(e) if e.is_server_down()) {
                pooled.discard();
            }
            result
        })
        .await
    }
}
