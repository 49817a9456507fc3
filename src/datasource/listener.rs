use crate::config::DataSourceConfigureChangeEvent;
use crate::core::{DalError, Result};
use async_trait::async_trait;
use tokio::sync::watch;

/// Callback for pool creation that completes in the background.
///
/// Exactly one of the two hooks fires per creation request.
pub trait DataSourceCreatePoolListener: Send + Sync {
    /// Called once the physical pool was built.
    ///
    /// Factory creation calls it right after the build. Refreshes forward it
    /// only for the source they installed; asynchronous refresh calls it after
    /// the install.
    fn on_create_pool_success(&self);

    /// Called when a background build fails. Ignored unless overridden.
    fn on_create_pool_failure(&self, _error: &DalError) {}
}

/// Receiver of configuration change notifications from an external event bus.
#[async_trait]
pub trait DataSourceConfigureChangeListener: Send + Sync {
    async fn config_changed(&self, event: DataSourceConfigureChangeEvent) -> Result<()>;
}

/// Progress of one asynchronous refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncRefreshState {
    Building,
    /// The new pool was built and swapped into the active slot
    Installed,
    /// The build failed; the active slot was left untouched
    Abandoned,
}

impl AsyncRefreshState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, AsyncRefreshState::Building)
    }
}

/// Observer returned by `RefreshableDataSource::async_refresh_data_source`.
#[derive(Debug, Clone)]
pub struct AsyncRefreshHandle {
    state: watch::Receiver<AsyncRefreshState>,
}

impl AsyncRefreshHandle {
    pub(crate) fn channel() -> (watch::Sender<AsyncRefreshState>, Self) {
        let (tx, rx) = watch::channel(AsyncRefreshState::Building);
        (tx, Self { state: rx })
    }

    /// Latest observed state.
    pub fn state(&self) -> AsyncRefreshState {
        *self.state.borrow()
    }

    /// Waits until the refresh was either installed or abandoned.
    ///
    /// A job dropped before finishing (scheduler shut down) counts as abandoned.
    pub async fn outcome(&mut self) -> AsyncRefreshState {
        let reached = match self.state.wait_for(|state| state.is_terminal()).await {
            Ok(state) => Some(*state),
            Err(_) => None,
        };
        reached.unwrap_or_else(|| {
            let last = *self.state.borrow();
            if last.is_terminal() {
                last
            } else {
                AsyncRefreshState::Abandoned
            }
        })
    }
}
