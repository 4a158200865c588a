//! Recurring background work with explicit cancellation.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Run `f` every `period` until `shutdown` turns true.
///
/// The first run happens one period after spawning. Runs never overlap: a
/// tick that arrives while `f` is still running is dropped rather than
/// queued.
pub fn spawn_recurring<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut f: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if *shutdown.borrow() {
            return;
        }

        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(timer = name, period_ms = period.as_millis() as u64, "Timer armed");

        loop {
            tokio::select! {
                _ = ticker.tick() => f().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(timer = name, "Timer stopped");
                        return;
                    }
                }
            }
        }
    })
}
