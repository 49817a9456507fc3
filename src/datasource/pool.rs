use crate::config::DataSourceConfigure;
use crate::core::{DalError, Result};
use async_trait::async_trait;
use std::time::Duration;

/// Physical connection pool
///
/// The pooling algorithm itself lives in an external library; this trait is
/// the seam every pooled source delegates to.
#[async_trait]
pub trait PhysicalPool: Send + Sync + 'static {
    /// Connection handle handed out by the pool
    type Connection: Send;

    /// Borrow a connection using the configured credentials
    async fn get_connection(&self) -> Result<Self::Connection>;

    /// Borrow a connection authenticated as a different user
    async fn get_connection_with(
        &self,
        _username: &str,
        _password: &str,
    ) -> Result<Self::Connection> {
        Err(DalError::UnsupportedOperation(
            "per-call credentials are not supported by this pool".into(),
        ))
    }

    /// Maximum time a caller waits for a connection
    fn login_timeout(&self) -> Duration;

    /// Current pool statistics
    fn stats(&self) -> PoolStats;

    /// Check run by the background health task
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    /// Release every physical connection; must be idempotent
    async fn close(&self);
}

/// Builds the physical pool behind a pooled source
#[async_trait]
pub trait PoolBuilder<P: PhysicalPool>: Send + Sync {
    async fn build(&self, name: &str, configure: &DataSourceConfigure) -> Result<P>;
}

/// Connection pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub total_connections: usize,
    pub available_connections: usize,
    pub active_connections: usize,
    pub max_connections: usize,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pool Stats: {}/{} active, {} available, max {}",
            self.active_connections,
            self.total_connections,
            self.available_connections,
            self.max_connections
        )
    }
}
