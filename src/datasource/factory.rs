use super::listener::DataSourceCreatePoolListener;
use super::pool::{PhysicalPool, PoolBuilder};
use super::pooled::{PooledSource, PooledSourceState};
use crate::config::DataSourceConfigure;
use crate::core::{DalError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tracing::{debug, warn};

/// Creates or looks up pooled sources for a logical name and configuration.
#[async_trait]
pub trait PoolFactory<P: PhysicalPool>: Send + Sync {
    /// Cached; the physical pool is built before returning.
    async fn get_or_create(
        &self,
        name: &str,
        configure: &DataSourceConfigure,
    ) -> Result<Arc<PooledSource<P>>>;

    /// Cached; the caller must trigger the build explicitly.
    async fn get_or_create_without_pool(
        &self,
        name: &str,
        configure: &DataSourceConfigure,
    ) -> Result<Arc<PooledSource<P>>>;

    /// Cached; the build runs in the background and the handle returns at once.
    ///
    /// The listener hears exactly one outcome. A source retired before its
    /// build starts is not built and reports a failure.
    async fn get_or_async_create_with_pool(
        &self,
        name: &str,
        configure: &DataSourceConfigure,
        listener: Option<Arc<dyn DataSourceCreatePoolListener>>,
    ) -> Result<Arc<PooledSource<P>>>;

    /// Always builds a brand-new source, bypassing the cache.
    async fn force_create(
        &self,
        name: &str,
        configure: &DataSourceConfigure,
        listener: Option<Arc<dyn DataSourceCreatePoolListener>>,
    ) -> Result<Arc<PooledSource<P>>>;
}

type CacheKey = (String, DataSourceConfigure);

/// Pool factory with a dedup cache keyed by name and configuration.
///
/// Retired, closed or failed sources are never handed out again; the next
/// lookup replaces them with a fresh one.
pub struct CachedPoolFactory<P: PhysicalPool> {
    builder: Arc<dyn PoolBuilder<P>>,
    cache: Mutex<HashMap<CacheKey, Arc<PooledSource<P>>>>,
}

impl<P: PhysicalPool> CachedPoolFactory<P> {
    pub fn new(builder: Arc<dyn PoolBuilder<P>>) -> Self {
        Self {
            builder,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Number of cached sources that are still reusable.
    pub fn cached_len(&self) -> Result<usize> {
        let cache = self.cache.lock()?;
        Ok(cache.values().filter(|source| is_reusable(source)).count())
    }

    fn cached_or_insert(
        &self,
        name: &str,
        configure: &DataSourceConfigure,
    ) -> Result<Arc<PooledSource<P>>> {
        let mut cache = self.cache.lock()?;
        let key = (name.to_string(), configure.clone());

        if let Some(existing) = cache.get(&key) {
            if is_reusable(existing) {
                debug!(name, source = %existing.id(), "reusing cached pooled source");
                return Ok(Arc::clone(existing));
            }
        }

        cache.retain(|_, source| !source.is_closed() && !source.is_retired());
        let source = Arc::new(PooledSource::new(
            name,
            configure.clone(),
            Arc::clone(&self.builder),
        ));
        cache.insert(key, Arc::clone(&source));
        Ok(source)
    }

    fn uncached(&self, name: &str, configure: &DataSourceConfigure) -> Arc<PooledSource<P>> {
        Arc::new(PooledSource::new(
            name,
            configure.clone(),
            Arc::clone(&self.builder),
        ))
    }
}

fn is_reusable<P: PhysicalPool>(source: &PooledSource<P>) -> bool {
    !source.is_retired()
        && !matches!(
            source.state(),
            PooledSourceState::Closed | PooledSourceState::Failed
        )
}

#[async_trait]
impl<P: PhysicalPool> PoolFactory<P> for CachedPoolFactory<P> {
    async fn get_or_create(
        &self,
        name: &str,
        configure: &DataSourceConfigure,
    ) -> Result<Arc<PooledSource<P>>> {
        configure.validate()?;
        let source = self.cached_or_insert(name, configure)?;
        source.build().await?;
        Ok(source)
    }

    async fn get_or_create_without_pool(
        &self,
        name: &str,
        configure: &DataSourceConfigure,
    ) -> Result<Arc<PooledSource<P>>> {
        configure.validate()?;
        self.cached_or_insert(name, configure)
    }

    async fn get_or_async_create_with_pool(
        &self,
        name: &str,
        configure: &DataSourceConfigure,
        listener: Option<Arc<dyn DataSourceCreatePoolListener>>,
    ) -> Result<Arc<PooledSource<P>>> {
        configure.validate()?;
        let runtime = Handle::try_current().map_err(|_| {
            DalError::SchedulerUnavailable(
                "background pool creation requires a tokio runtime".to_string(),
            )
        })?;
        let source = self.cached_or_insert(name, configure)?;

        let building = Arc::clone(&source);
        runtime.spawn(async move {
            if building.is_retired() {
                // Displaced before the build started; nobody can install it any more
                debug!(
                    name = %building.name(),
                    source = %building.id(),
                    "skipping build of retired source"
                );
                if let Some(listener) = listener {
                    listener.on_create_pool_failure(&DalError::Uninitialized(format!(
                        "pooled source for '{}' was retired before its build started",
                        building.name()
                    )));
                }
                return;
            }
            match building.build().await {
                Ok(()) => {
                    if let Some(listener) = listener {
                        listener.on_create_pool_success();
                    }
                }
                Err(err) => {
                    warn!(name = %building.name(), error = %err, "background pool build failed");
                    if let Some(listener) = listener {
                        listener.on_create_pool_failure(&err);
                    }
                }
            }
        });

        Ok(source)
    }

    async fn force_create(
        &self,
        name: &str,
        configure: &DataSourceConfigure,
        listener: Option<Arc<dyn DataSourceCreatePoolListener>>,
    ) -> Result<Arc<PooledSource<P>>> {
        configure.validate()?;
        let source = self.uncached(name, configure);
        if let Err(err) = source.build().await {
            if let Some(listener) = &listener {
                listener.on_create_pool_failure(&err);
            }
            return Err(err);
        }
        if let Some(listener) = listener {
            listener.on_create_pool_success();
        }
        Ok(source)
    }
}
