use super::pool::PhysicalPool;
use super::pooled::PooledSource;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Physically closes pooled sources nobody references any more.
///
/// Implementations must tolerate the same source being retired twice.
pub trait PoolRetirer<P: PhysicalPool>: Send + Sync {
    fn retire(&self, source: Arc<PooledSource<P>>);
}

/// Closes retired sources on a tokio task, optionally after a drain delay
/// that lets in-flight borrowers finish.
#[derive(Debug, Clone, Default)]
pub struct BackgroundRetirer {
    drain_delay: Duration,
}

impl BackgroundRetirer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_drain_delay(drain_delay: Duration) -> Self {
        Self { drain_delay }
    }

    pub fn drain_delay(&self) -> Duration {
        self.drain_delay
    }
}

impl<P: PhysicalPool> PoolRetirer<P> for BackgroundRetirer {
    fn retire(&self, source: Arc<PooledSource<P>>) {
        source.cancel_background_task();
        if source.is_closed() {
            debug!(name = %source.name(), source = %source.id(), "pooled source already closed");
            return;
        }

        let delay = self.drain_delay;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    source.close().await;
                });
            }
            Err(_) => {
                warn!(
                    name = %source.name(),
                    source = %source.id(),
                    "no tokio runtime available, closing pooled source inline"
                );
                futures::executor::block_on(source.close());
            }
        }
    }
}
