// ============================================================================
// shardal: routing and pool lifecycle core of a sharded data access layer
// ============================================================================

pub mod cluster;
pub mod config;
pub mod core;
pub mod datasource;

// Re-export main types for convenience
pub use config::{DataSourceConfigure, DataSourceConfigureChangeEvent};
pub use self::core::{DalError, Result};

pub use datasource::{
    AsyncRefreshHandle, AsyncRefreshState, BackgroundRetirer, CachedPoolFactory,
    DataSourceConfigureChangeListener, DataSourceCreatePoolListener, PhysicalPool, PoolBuilder,
    PoolFactory, PoolRetirer, PoolStats, PooledSource, PooledSourceState, RefreshableDataSource,
};

pub use cluster::{
    DbShardContext, Lifecycle, ShardStrategy, ShardStrategyProxy, ShardStrategyProxyBuilder,
    TableShardContext,
};
