use super::factory::PoolFactory;
use super::listener::{
    AsyncRefreshHandle, AsyncRefreshState, DataSourceConfigureChangeListener,
    DataSourceCreatePoolListener,
};
use super::pool::{PhysicalPool, PoolStats};
use super::pooled::PooledSource;
use super::retirer::PoolRetirer;
use super::scheduler::RefreshScheduler;
use crate::config::{DataSourceConfigure, DataSourceConfigureChangeEvent};
use crate::core::{DalError, Result};
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

/// Bound on retries when the factory hands out a source that gets retired
/// before it can be registered.
const MAX_INSTALL_ATTEMPTS: usize = 3;

fn retired_concurrently(name: &str) -> DalError {
    DalError::Uninitialized(format!(
        "pooled source for '{}' was retired while being installed",
        name
    ))
}

enum GateState {
    Undecided(Option<Result<()>>),
    Installed,
    Abandoned,
}

/// Forwards build notifications only for a source that was installed.
///
/// An outcome arriving before the install decision is held back until then.
struct InstallGate {
    listener: Arc<dyn DataSourceCreatePoolListener>,
    state: Mutex<GateState>,
}

impl InstallGate {
    fn new(listener: Arc<dyn DataSourceCreatePoolListener>) -> Self {
        Self {
            listener,
            state: Mutex::new(GateState::Undecided(None)),
        }
    }

    fn decide(&self, installed: bool) {
        let next = if installed {
            GateState::Installed
        } else {
            GateState::Abandoned
        };
        let previous = {
            let mut state = match self.state.lock() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::replace(&mut *state, next)
        };
        if let (true, GateState::Undecided(Some(outcome))) = (installed, previous) {
            self.forward(outcome);
        }
    }

    fn deliver(&self, outcome: Result<()>) {
        let forward = {
            let mut state = match self.state.lock() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            match &mut *state {
                GateState::Undecided(pending) => {
                    pending.get_or_insert(outcome);
                    None
                }
                GateState::Installed => Some(outcome),
                GateState::Abandoned => None,
            }
        };
        if let Some(outcome) = forward {
            self.forward(outcome);
        }
    }

    fn forward(&self, outcome: Result<()>) {
        match outcome {
            Ok(()) => self.listener.on_create_pool_success(),
            Err(err) => self.listener.on_create_pool_failure(&err),
        }
    }
}

impl DataSourceCreatePoolListener for InstallGate {
    fn on_create_pool_success(&self) {
        self.deliver(Ok(()));
    }

    fn on_create_pool_failure(&self, error: &DalError) {
        self.deliver(Err(error.clone()));
    }
}

/// Active slot plus the collaborators needed to refill it.
///
/// Shared with jobs on the refresh scheduler.
struct ActiveSlot<P: PhysicalPool> {
    name: String,
    current: ArcSwapOption<PooledSource<P>>,
    factory: Arc<dyn PoolFactory<P>>,
    retirer: Arc<dyn PoolRetirer<P>>,
}

impl<P: PhysicalPool> ActiveSlot<P> {
    /// Registers `source`, swaps it in and releases the previous occupant.
    ///
    /// Returns `false`, leaving the slot untouched, when `source` was retired
    /// by another owner before it could be registered.
    fn install(&self, source: Arc<PooledSource<P>>) -> bool {
        if source.register().is_none() {
            return false;
        }
        let previous = self.current.swap(Some(Arc::clone(&source)));
        info!(
            name = %self.name,
            source = %source.id(),
            previous = ?previous.as_ref().map(|p| p.id()),
            "pooled source installed"
        );

        if let Some(previous) = previous {
            self.release(previous);
        }
        true
    }

    fn release(&self, previous: Arc<PooledSource<P>>) {
        if previous.unregister() == 0 {
            info!(name = %self.name, source = %previous.id(), "retiring pooled source");
            previous.cancel_background_task();
            self.retirer.retire(previous);
        }
    }

    async fn build_and_install(&self, name: &str, configure: &DataSourceConfigure) -> Result<()> {
        for _ in 0..MAX_INSTALL_ATTEMPTS {
            let source = self
                .factory
                .get_or_create_without_pool(name, configure)
                .await?;
            source.build().await?;
            if self.install(source) {
                return Ok(());
            }
        }
        Err(retired_concurrently(name))
    }
}

/// Stable data source handle whose physical pool can be replaced at runtime
///
/// Reads of the active pool are lock-free; refreshes swap a new pooled source
/// in and retire the old one once no slot references it.
///
/// # Examples
///
/// ```ignore
/// let factory = Arc::new(CachedPoolFactory::new(Arc::new(MyPoolBuilder)));
/// let ds = RefreshableDataSource::new("orders", configure, factory, Arc::new(BackgroundRetirer::new())).await?;
/// let conn = ds.get_connection().await?;
///
/// ds.refresh_data_source("orders", &new_configure, None).await?;
/// ```
pub struct RefreshableDataSource<P: PhysicalPool> {
    slot: Arc<ActiveSlot<P>>,
    change_lock: AsyncMutex<()>,
    scheduler: OnceLock<RefreshScheduler>,
}

impl<P: PhysicalPool> RefreshableDataSource<P> {
    /// Builds the initial pool synchronously and installs it.
    ///
    /// Fails when the physical pool cannot be built.
    pub async fn new(
        name: impl Into<String>,
        configure: DataSourceConfigure,
        factory: Arc<dyn PoolFactory<P>>,
        retirer: Arc<dyn PoolRetirer<P>>,
    ) -> Result<Self> {
        let name = name.into();
        let mut initial = None;
        for _ in 0..MAX_INSTALL_ATTEMPTS {
            let source = factory.get_or_create(&name, &configure).await?;
            if source.register().is_some() {
                initial = Some(source);
                break;
            }
        }
        let source = initial.ok_or_else(|| retired_concurrently(&name))?;
        info!(name = %name, source = %source.id(), "refreshable data source initialized");

        Ok(Self {
            slot: Arc::new(ActiveSlot {
                name,
                current: ArcSwapOption::new(Some(source)),
                factory,
                retirer,
            }),
            change_lock: AsyncMutex::new(()),
            scheduler: OnceLock::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.slot.name
    }

    /// The currently active pooled source.
    pub fn single_data_source(&self) -> Option<Arc<PooledSource<P>>> {
        self.slot.current.load_full()
    }

    fn data_source(&self) -> Result<Arc<P>> {
        let source = self.single_data_source().ok_or_else(|| {
            DalError::Uninitialized(format!("pooled source of '{}' is empty", self.slot.name))
        })?;
        source.live_pool().ok_or_else(|| {
            DalError::Uninitialized(format!(
                "physical pool of '{}' is not available",
                self.slot.name
            ))
        })
    }

    /// Borrow a connection from the active pool
    pub async fn get_connection(&self) -> Result<P::Connection> {
        self.data_source()?.get_connection().await
    }

    /// Borrow a connection from the active pool as another user
    pub async fn get_connection_with(
        &self,
        username: &str,
        password: &str,
    ) -> Result<P::Connection> {
        self.data_source()?
            .get_connection_with(username, password)
            .await
    }

    pub fn login_timeout(&self) -> Result<Duration> {
        Ok(self.data_source()?.login_timeout())
    }

    pub fn stats(&self) -> Result<PoolStats> {
        Ok(self.data_source()?.stats())
    }

    /// Applies a configuration change. Concurrent notifications queue up and
    /// are applied one at a time.
    pub async fn config_changed(&self, event: DataSourceConfigureChangeEvent) -> Result<()> {
        let _guard = self.change_lock.lock().await;
        self.refresh_data_source(&event.name, &event.new_configure, None)
            .await
    }

    /// Installs a pool whose build may still be running in the background.
    ///
    /// Until that build completes, delegate calls fail with
    /// [`DalError::Uninitialized`]. The listener hears the build outcome of
    /// the installed source only, exactly once.
    pub async fn refresh_data_source(
        &self,
        name: &str,
        configure: &DataSourceConfigure,
        listener: Option<Arc<dyn DataSourceCreatePoolListener>>,
    ) -> Result<()> {
        for _ in 0..MAX_INSTALL_ATTEMPTS {
            // One gate per attempt so a displaced source never reaches the listener
            let gate = listener
                .as_ref()
                .map(|listener| Arc::new(InstallGate::new(Arc::clone(listener))));
            let source = self
                .slot
                .factory
                .get_or_async_create_with_pool(
                    name,
                    configure,
                    gate.clone()
                        .map(|gate| gate as Arc<dyn DataSourceCreatePoolListener>),
                )
                .await?;
            let installed = self.slot.install(source);
            if let Some(gate) = gate {
                gate.decide(installed);
            }
            if installed {
                return Ok(());
            }
        }
        Err(retired_concurrently(name))
    }

    /// Builds a brand-new pool, bypassing the creation cache, and installs it.
    pub async fn force_refresh_data_source(
        &self,
        name: &str,
        configure: &DataSourceConfigure,
        listener: Option<Arc<dyn DataSourceCreatePoolListener>>,
    ) -> Result<()> {
        let source = self
            .slot
            .factory
            .force_create(name, configure, listener)
            .await?;
        // A forced source is uncached, so nobody else can have retired it.
        if self.slot.install(source) {
            Ok(())
        } else {
            Err(retired_concurrently(name))
        }
    }

    /// Schedules a refresh that installs the new pool only after it was built.
    ///
    /// On failure the active pool stays in place. The listener's failure hook
    /// is invoked, which does nothing unless the listener overrides it.
    /// A build that finishes after a newer refresh still installs itself.
    pub fn async_refresh_data_source(
        &self,
        name: &str,
        configure: &DataSourceConfigure,
        listener: Arc<dyn DataSourceCreatePoolListener>,
    ) -> Result<AsyncRefreshHandle> {
        let scheduler = self.scheduler()?;
        let (state, handle) = AsyncRefreshHandle::channel();
        let slot = Arc::clone(&self.slot);
        let name = name.to_string();
        let configure = configure.clone();

        scheduler.schedule(async move {
            match slot.build_and_install(&name, &configure).await {
                Ok(()) => {
                    listener.on_create_pool_success();
                    state.send_replace(AsyncRefreshState::Installed);
                }
                Err(err) => {
                    warn!(name = %name, error = %err, "asynchronous refresh abandoned");
                    listener.on_create_pool_failure(&err);
                    state.send_replace(AsyncRefreshState::Abandoned);
                }
            }
        })?;

        Ok(handle)
    }

    /// Whether the asynchronous refresh scheduler has been created yet.
    pub fn scheduler_started(&self) -> bool {
        self.scheduler.get().is_some()
    }

    fn scheduler(&self) -> Result<&RefreshScheduler> {
        if let Some(scheduler) = self.scheduler.get() {
            return Ok(scheduler);
        }
        let runtime = Handle::try_current().map_err(|_| {
            DalError::SchedulerUnavailable(
                "asynchronous refresh requires a tokio runtime".to_string(),
            )
        })?;
        Ok(self.scheduler.get_or_init(|| {
            RefreshScheduler::start(format!("DataSourceRefresher-{}", self.slot.name), &runtime)
        }))
    }
}

#[async_trait]
impl<P: PhysicalPool> DataSourceConfigureChangeListener for RefreshableDataSource<P> {
    async fn config_changed(&self, event: DataSourceConfigureChangeEvent) -> Result<()> {
        RefreshableDataSource::config_changed(self, event).await
    }
}

impl<P: PhysicalPool> std::fmt::Debug for RefreshableDataSource<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshableDataSource")
            .field("name", &self.slot.name)
            .field("current", &self.single_data_source())
            .field("scheduler_started", &self.scheduler_started())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        successes: AtomicUsize,
        failures: AtomicUsize,
    }

    impl DataSourceCreatePoolListener for Counting {
        fn on_create_pool_success(&self) {
            self.successes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_create_pool_failure(&self, _error: &DalError) {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn gate() -> (Arc<Counting>, InstallGate) {
        let counting = Arc::new(Counting::default());
        let gate = InstallGate::new(counting.clone());
        (counting, gate)
    }

    #[test]
    fn test_gate_holds_early_outcome_until_installed() {
        let (counting, gate) = gate();
        gate.on_create_pool_success();
        assert_eq!(counting.successes.load(Ordering::SeqCst), 0);

        gate.decide(true);
        assert_eq!(counting.successes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_gate_forwards_late_outcome_after_install() {
        let (counting, gate) = gate();
        gate.decide(true);
        gate.on_create_pool_failure(&DalError::Connection("refused".into()));
        assert_eq!(counting.failures.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_gate_drops_outcomes_of_abandoned_attempt() {
        let (counting, gate) = gate();
        gate.on_create_pool_failure(&DalError::Connection("refused".into()));
        gate.decide(false);
        gate.on_create_pool_success();

        assert_eq!(counting.successes.load(Ordering::SeqCst), 0);
        assert_eq!(counting.failures.load(Ordering::SeqCst), 0);
    }
}
