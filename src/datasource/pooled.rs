use super::pool::{PhysicalPool, PoolBuilder};
use crate::config::DataSourceConfigure;
use crate::core::{DalError, Result};
use arc_swap::ArcSwapOption;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Marks a reference count that reached zero.
const RETIRED: usize = 1 << (usize::BITS - 1);

/// Build lifecycle of a pooled source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PooledSourceState {
    /// Created without a physical pool
    Pending = 0,
    Building = 1,
    Ready = 2,
    /// Last build attempt failed; a later trigger may retry
    Failed = 3,
    /// Physically closed, never reused
    Closed = 4,
}

impl PooledSourceState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Pending,
            1 => Self::Building,
            2 => Self::Ready,
            3 => Self::Failed,
            _ => Self::Closed,
        }
    }
}

/// Wrapper around exactly one physical pool
///
/// The reference count tracks how many refreshable data source slots point at
/// this source. It must not be closed while that count is above zero.
pub struct PooledSource<P: PhysicalPool> {
    id: Uuid,
    name: String,
    configure: DataSourceConfigure,
    builder: Arc<dyn PoolBuilder<P>>,
    live: ArcSwapOption<P>,
    ref_count: AtomicUsize,
    state: AtomicU8,
    build_lock: AsyncMutex<()>,
    background_task: Mutex<Option<JoinHandle<()>>>,
}

impl<P: PhysicalPool> PooledSource<P> {
    /// Creates an unbuilt source; call [`PooledSource::build`] to create the pool.
    pub fn new(
        name: impl Into<String>,
        configure: DataSourceConfigure,
        builder: Arc<dyn PoolBuilder<P>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            configure,
            builder,
            live: ArcSwapOption::empty(),
            ref_count: AtomicUsize::new(0),
            state: AtomicU8::new(PooledSourceState::Pending as u8),
            build_lock: AsyncMutex::new(()),
            background_task: Mutex::new(None),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn configure(&self) -> &DataSourceConfigure {
        &self.configure
    }

    pub fn state(&self) -> PooledSourceState {
        PooledSourceState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.state() == PooledSourceState::Closed
    }

    /// Number of slots currently registered.
    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire) & !RETIRED
    }

    /// Whether the count has dropped to zero after being registered.
    ///
    /// A retired source can no longer be registered.
    pub fn is_retired(&self) -> bool {
        self.ref_count.load(Ordering::Acquire) & RETIRED != 0
    }

    /// Records one more owner and returns the new count, or `None` when the
    /// source was already retired.
    pub fn register(&self) -> Option<usize> {
        let registered = self
            .ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                if count & RETIRED != 0 {
                    None
                } else {
                    Some(count + 1)
                }
            });
        match registered {
            Ok(previous) => {
                let count = previous + 1;
                debug!(name = %self.name, source = %self.id, count, "pooled source registered");
                Some(count)
            }
            Err(_) => {
                debug!(name = %self.name, source = %self.id, "register refused, source retired");
                None
            }
        }
    }

    /// Drops one owner and returns the remaining count.
    ///
    /// Reaching zero retires the source in the same atomic step, so a
    /// concurrent [`PooledSource::register`] cannot revive it.
    pub fn unregister(&self) -> usize {
        let previous = self
            .ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                if count & RETIRED != 0 {
                    return None;
                }
                match count.saturating_sub(1) {
                    0 => Some(RETIRED),
                    remaining => Some(remaining),
                }
            })
            .unwrap_or(RETIRED);
        let remaining = (previous & !RETIRED).saturating_sub(1);
        debug!(name = %self.name, source = %self.id, remaining, "pooled source unregistered");
        remaining
    }

    /// The live physical pool, absent until a build succeeds and after close.
    pub fn live_pool(&self) -> Option<Arc<P>> {
        if self.is_closed() {
            return None;
        }
        self.live.load_full()
    }

    /// Builds the physical pool, propagating the failure to the caller.
    ///
    /// Concurrent calls are serialized; a source that is already ready returns
    /// immediately.
    pub async fn build(&self) -> Result<()> {
        let _guard = self.build_lock.lock().await;

        let current = self.state();
        match current {
            PooledSourceState::Ready => return Ok(()),
            PooledSourceState::Closed => {
                return Err(DalError::PoolBuildFailure {
                    name: self.name.clone(),
                    reason: "pooled source is already closed".into(),
                });
            }
            _ => {}
        }
        if !self.transition(current, PooledSourceState::Building) {
            // Only close can move the state while the build lock is held
            return Err(DalError::PoolBuildFailure {
                name: self.name.clone(),
                reason: "pooled source was closed before build".into(),
            });
        }

        match self.builder.build(&self.name, &self.configure).await {
            Ok(pool) => {
                let pool = Arc::new(pool);
                self.live.store(Some(Arc::clone(&pool)));

                if !self.transition(PooledSourceState::Building, PooledSourceState::Ready) {
                    // Closed while building
                    self.live.store(None);
                    pool.close().await;
                    return Err(DalError::PoolBuildFailure {
                        name: self.name.clone(),
                        reason: "pooled source was closed during build".into(),
                    });
                }

                self.spawn_health_check(&pool);
                info!(name = %self.name, source = %self.id, "physical pool ready");
                Ok(())
            }
            Err(err) => {
                self.transition(PooledSourceState::Building, PooledSourceState::Failed);
                let err = DalError::pool_build(&self.name, err);
                warn!(name = %self.name, source = %self.id, error = %err, "physical pool build failed");
                Err(err)
            }
        }
    }

    /// Builds the pool and reports only whether it succeeded.
    pub async fn trigger_build(&self) -> bool {
        self.build().await.is_ok()
    }

    /// Stops the background health task, if one is running.
    pub fn cancel_background_task(&self) {
        let task = match self.background_task.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task {
            task.abort();
            debug!(name = %self.name, source = %self.id, "background task cancelled");
        }
    }

    pub fn has_background_task(&self) -> bool {
        match self.background_task.lock() {
            Ok(slot) => slot.as_ref().is_some_and(|task| !task.is_finished()),
            Err(_) => false,
        }
    }

    /// Physically closes the source. Later calls are no-ops.
    pub async fn close(&self) {
        let previous = self
            .state
            .swap(PooledSourceState::Closed as u8, Ordering::AcqRel);
        if PooledSourceState::from_u8(previous) == PooledSourceState::Closed {
            return;
        }

        self.cancel_background_task();
        if let Some(pool) = self.live.swap(None) {
            pool.close().await;
        }
        info!(name = %self.name, source = %self.id, "pooled source closed");
    }

    fn transition(&self, from: PooledSourceState, to: PooledSourceState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn spawn_health_check(&self, pool: &Arc<P>) {
        let Some(interval) = self.configure.health_check_interval_duration() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let pool: Weak<P> = Arc::downgrade(pool);
        let name = self.name.clone();
        let id = self.id;
        let task = runtime.spawn(async move {
            loop {
                sleep(interval).await;
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                if let Err(err) = pool.health_check().await {
                    warn!(name = %name, source = %id, error = %err, "health check failed");
                }
            }
        });

        let previous = match self.background_task.lock() {
            Ok(mut slot) => slot.replace(task),
            Err(poisoned) => poisoned.into_inner().replace(task),
        };
        if let Some(previous) = previous {
            previous.abort();
        }
    }
}

impl<P: PhysicalPool> Drop for PooledSource<P> {
    fn drop(&mut self) {
        self.cancel_background_task();
    }
}

impl<P: PhysicalPool> std::fmt::Debug for PooledSource<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSource")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}
