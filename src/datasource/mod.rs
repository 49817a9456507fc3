//! Hot-swappable data source front and its pool lifecycle collaborators.

pub mod factory;
pub mod listener;
pub mod pool;
pub mod pooled;
pub mod refreshable;
pub mod retirer;
pub mod scheduler;

pub use factory::{CachedPoolFactory, PoolFactory};
pub use listener::{
    AsyncRefreshHandle, AsyncRefreshState, DataSourceConfigureChangeListener,
    DataSourceCreatePoolListener,
};
pub use pool::{PhysicalPool, PoolBuilder, PoolStats};
pub use pooled::{PooledSource, PooledSourceState};
pub use refreshable::RefreshableDataSource;
pub use retirer::{BackgroundRetirer, PoolRetirer};
pub use scheduler::RefreshScheduler;
