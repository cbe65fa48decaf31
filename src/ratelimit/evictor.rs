//! Background sweeper for idle buckets.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use super::classes::LimiterSet;
use super::clock::Clock;
use super::limiter::TokenBucketLimiter;
use crate::config::EvictionConfig;

/// Anything that can drop its idle buckets.
///
/// Implemented by both a single [`TokenBucketLimiter`] and a [`LimiterSet`]
/// so the sweeper can run over either.
pub trait IdleEviction: Send + Sync {
    /// Remove buckets idle for at least `max_idle`, returning how many were removed.
    fn evict_idle(&self, max_idle: Duration) -> usize;
}

impl<C: Clock> IdleEviction for TokenBucketLimiter<C> {
    fn evict_idle(&self, max_idle: Duration) -> usize {
        TokenBucketLimiter::evict_idle(self, max_idle)
    }
}

impl<C: Clock + Clone> IdleEviction for LimiterSet<C> {
    fn evict_idle(&self, max_idle: Duration) -> usize {
        LimiterSet::evict_idle(self, max_idle)
    }
}

/// Spawn a task that evicts idle buckets every `settings.interval()` until `shutdown` resolves.
///
/// Must be called from within a tokio runtime.
pub fn spawn_evictor<T, F>(target: Arc<T>, settings: EvictionConfig, shutdown: F) -> JoinHandle<()>
where
    T: IdleEviction + ?Sized + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    let period = settings.interval().max(Duration::from_millis(1));
    let max_idle = settings.max_idle();

    tokio::spawn(async move {
        info!(
            interval_secs = period.as_secs_f64(),
            max_idle_secs = max_idle.as_secs(),
            "Starting idle bucket sweeper"
        );

        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    let evicted = target.evict_idle(max_idle);
                    if evicted > 0 {
                        info!(evicted = evicted, "Evicted idle buckets");
                    } else {
                        debug!("No idle buckets to evict");
                    }
                }
            }
        }

        info!("Idle bucket sweeper stopped");
    })
}
