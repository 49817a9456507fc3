//! Test doubles shared by the integration suites.
#![allow(dead_code)]

use async_trait::async_trait;
use shardal::{
    CachedPoolFactory, DalError, DataSourceConfigure, DataSourceCreatePoolListener, PhysicalPool,
    PoolBuilder, PoolFactory, PoolRetirer, PoolStats, PooledSource, Result,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Connection handed out by [`MockPool`], tagged with the configuration the
/// pool was built from.
#[derive(Debug, Clone)]
pub struct MockConnection {
    pub database: String,
    pub max_connections: usize,
}

pub struct MockPool {
    configure: DataSourceConfigure,
    closed: AtomicBool,
    closes: Arc<AtomicUsize>,
    borrowed: AtomicUsize,
}

#[async_trait]
impl PhysicalPool for MockPool {
    type Connection = MockConnection;

    async fn get_connection(&self) -> Result<MockConnection> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DalError::Connection("pool has been closed".into()));
        }
        if self.configure.username == "denied" {
            return Err(DalError::Connection("access denied for user 'denied'".into()));
        }
        self.borrowed.fetch_add(1, Ordering::SeqCst);
        Ok(MockConnection {
            database: self.configure.database.clone(),
            max_connections: self.configure.max_connections,
        })
    }

    fn login_timeout(&self) -> Duration {
        self.configure.connect_timeout_duration()
    }

    fn stats(&self) -> PoolStats {
        let active = self.borrowed.load(Ordering::SeqCst);
        PoolStats {
            total_connections: active,
            available_connections: 0,
            active_connections: active,
            max_connections: self.configure.max_connections,
        }
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Builds [`MockPool`]s; databases can be marked as failing or slow.
#[derive(Default)]
pub struct MockBuilder {
    pub builds: AtomicUsize,
    pub closes: Arc<AtomicUsize>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    failing: Mutex<HashSet<String>>,
    delays: Mutex<HashMap<String, Duration>>,
}

impl MockBuilder {
    pub fn fail_database(&self, database: &str) {
        self.failing.lock().unwrap().insert(database.to_string());
    }

    pub fn delay_database(&self, database: &str, delay: Duration) {
        self.delays
            .lock()
            .unwrap()
            .insert(database.to_string(), delay);
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    /// Highest number of builds that ever ran at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PoolBuilder<MockPool> for MockBuilder {
    async fn build(&self, _name: &str, configure: &DataSourceConfigure) -> Result<MockPool> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);
        let delay = self.delays.lock().unwrap().get(&configure.database).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.failing.lock().unwrap().contains(&configure.database) {
            return Err(DalError::Connection(format!(
                "unknown database '{}'",
                configure.database
            )));
        }
        Ok(MockPool {
            configure: configure.clone(),
            closed: AtomicBool::new(false),
            closes: Arc::clone(&self.closes),
            borrowed: AtomicUsize::new(0),
        })
    }
}

/// Factory wrapper remembering every source it handed out.
pub struct TrackingFactory {
    inner: CachedPoolFactory<MockPool>,
    handed_out: Mutex<Vec<Arc<PooledSource<MockPool>>>>,
}

impl TrackingFactory {
    pub fn new(builder: Arc<MockBuilder>) -> Self {
        Self {
            inner: CachedPoolFactory::new(builder),
            handed_out: Mutex::new(Vec::new()),
        }
    }

    /// Every distinct source handed out so far.
    pub fn sources(&self) -> Vec<Arc<PooledSource<MockPool>>> {
        let mut seen = HashSet::new();
        self.handed_out
            .lock()
            .unwrap()
            .iter()
            .filter(|source| seen.insert(source.id()))
            .cloned()
            .collect()
    }

    fn track(&self, source: Arc<PooledSource<MockPool>>) -> Arc<PooledSource<MockPool>> {
        self.handed_out.lock().unwrap().push(Arc::clone(&source));
        source
    }
}

#[async_trait]
impl PoolFactory<MockPool> for TrackingFactory {
    async fn get_or_create(
        &self,
        name: &str,
        configure: &DataSourceConfigure,
    ) -> Result<Arc<PooledSource<MockPool>>> {
        let source = self.inner.get_or_create(name, configure).await?;
        Ok(self.track(source))
    }

    async fn get_or_create_without_pool(
        &self,
        name: &str,
        configure: &DataSourceConfigure,
    ) -> Result<Arc<PooledSource<MockPool>>> {
        let source = self.inner.get_or_create_without_pool(name, configure).await?;
        Ok(self.track(source))
    }

    async fn get_or_async_create_with_pool(
        &self,
        name: &str,
        configure: &DataSourceConfigure,
        listener: Option<Arc<dyn DataSourceCreatePoolListener>>,
    ) -> Result<Arc<PooledSource<MockPool>>> {
        let source = self
            .inner
            .get_or_async_create_with_pool(name, configure, listener)
            .await?;
        Ok(self.track(source))
    }

    async fn force_create(
        &self,
        name: &str,
        configure: &DataSourceConfigure,
        listener: Option<Arc<dyn DataSourceCreatePoolListener>>,
    ) -> Result<Arc<PooledSource<MockPool>>> {
        let source = self.inner.force_create(name, configure, listener).await?;
        Ok(self.track(source))
    }
}

/// Factory whose first optimistic hand-out is displaced by another owner
/// before the caller can register it.
pub struct DisplacingFactory {
    inner: Arc<TrackingFactory>,
    displaced: AtomicBool,
}

impl DisplacingFactory {
    pub fn new(inner: Arc<TrackingFactory>) -> Self {
        Self {
            inner,
            displaced: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl PoolFactory<MockPool> for DisplacingFactory {
    async fn get_or_create(
        &self,
        name: &str,
        configure: &DataSourceConfigure,
    ) -> Result<Arc<PooledSource<MockPool>>> {
        self.inner.get_or_create(name, configure).await
    }

    async fn get_or_create_without_pool(
        &self,
        name: &str,
        configure: &DataSourceConfigure,
    ) -> Result<Arc<PooledSource<MockPool>>> {
        self.inner.get_or_create_without_pool(name, configure).await
    }

    async fn get_or_async_create_with_pool(
        &self,
        name: &str,
        configure: &DataSourceConfigure,
        listener: Option<Arc<dyn DataSourceCreatePoolListener>>,
    ) -> Result<Arc<PooledSource<MockPool>>> {
        let source = self
            .inner
            .get_or_async_create_with_pool(name, configure, listener)
            .await?;
        if !self.displaced.swap(true, Ordering::SeqCst) {
            source.register();
            source.unregister();
        }
        Ok(source)
    }

    async fn force_create(
        &self,
        name: &str,
        configure: &DataSourceConfigure,
        listener: Option<Arc<dyn DataSourceCreatePoolListener>>,
    ) -> Result<Arc<PooledSource<MockPool>>> {
        self.inner.force_create(name, configure, listener).await
    }
}

/// Retirer that records each retirement before closing the source.
#[derive(Default)]
pub struct RecordingRetirer {
    retired: Mutex<Vec<Uuid>>,
}

impl RecordingRetirer {
    pub fn retired(&self) -> Vec<Uuid> {
        self.retired.lock().unwrap().clone()
    }

    pub fn retire_count(&self, id: Uuid) -> usize {
        self.retired
            .lock()
            .unwrap()
            .iter()
            .filter(|retired| **retired == id)
            .count()
    }
}

impl PoolRetirer<MockPool> for RecordingRetirer {
    fn retire(&self, source: Arc<PooledSource<MockPool>>) {
        self.retired.lock().unwrap().push(source.id());
        tokio::spawn(async move {
            source.close().await;
        });
    }
}

#[derive(Default)]
pub struct CountingListener {
    pub successes: AtomicUsize,
    pub failures: AtomicUsize,
}

impl CountingListener {
    pub fn successes(&self) -> usize {
        self.successes.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }
}

impl DataSourceCreatePoolListener for CountingListener {
    fn on_create_pool_success(&self) {
        self.successes.fetch_add(1, Ordering::SeqCst);
    }

    fn on_create_pool_failure(&self, _error: &DalError) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }
}

/// Listener with only a success hook, the way callers without a failure
/// channel are written.
#[derive(Default)]
pub struct SuccessOnlyListener {
    pub successes: AtomicUsize,
}

impl DataSourceCreatePoolListener for SuccessOnlyListener {
    fn on_create_pool_success(&self) {
        self.successes.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct Harness {
    pub builder: Arc<MockBuilder>,
    pub factory: Arc<TrackingFactory>,
    pub retirer: Arc<RecordingRetirer>,
}

impl Harness {
    pub fn new() -> Self {
        let builder = Arc::new(MockBuilder::default());
        Self {
            factory: Arc::new(TrackingFactory::new(Arc::clone(&builder))),
            builder,
            retirer: Arc::new(RecordingRetirer::default()),
        }
    }

    pub fn factory(&self) -> Arc<dyn PoolFactory<MockPool>> {
        self.factory.clone()
    }

    pub fn retirer(&self) -> Arc<dyn PoolRetirer<MockPool>> {
        self.retirer.clone()
    }
}

pub fn configure(database: &str) -> DataSourceConfigure {
    DataSourceConfigure::new("app", "secret").database(database)
}

/// Polls `condition` until it holds or a generous deadline passes.
pub async fn eventually<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
