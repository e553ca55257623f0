//! Fixed-interval background job.
//!
//! [`PeriodicTask`] calls [`Periodic::tick`] once per interval on its own
//! tokio task until stopped, then runs [`Periodic::finish`]. A slow tick
//! pushes the next one back instead of firing a burst to catch up.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::warn;

#[async_trait]
pub trait Periodic: Send + 'static {
    async fn tick(&mut self);

    /// Runs once after the last tick.
    async fn finish(&mut self) {}
}

/// Handle on a spawned [`Periodic`] job.
pub struct PeriodicTask {
    stop: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    /// Spawns `job`. The first tick fires one `every` after the call.
    #[must_use]
    pub fn spawn<P: Periodic>(mut job: P, every: Duration) -> Self {
        let (stop, mut stopped) = oneshot::channel::<()>();
        let join = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + every;
            let mut ticks = tokio::time::interval_at(start, every);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = ticks.tick() => job.tick().await,
                }
            }
            job.finish().await;
        });
        Self {
            stop: Some(stop),
            join: Some(join),
        }
    }

    /// Stops the job and waits for `finish` to return. A tick already
    /// running completes first.
    pub async fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            // The job may have ended on its own.
            let _ = stop.send(());
        }
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                warn!(error = %err, "periodic task ended abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[derive(Default)]
    struct Counts {
        ticks: AtomicU32,
        finished: AtomicU32,
    }

    struct Counting(Arc<Counts>);

    #[async_trait]
    impl Periodic for Counting {
        async fn tick(&mut self) {
            self.0.ticks.fetch_add(1, Ordering::SeqCst);
        }

        async fn finish(&mut self) {
            self.0.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_each_interval_then_finishes_once() {
        let counts = Arc::new(Counts::default());
        let mut task = PeriodicTask::spawn(Counting(counts.clone()), Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(counts.ticks.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(62)).await;
        assert_eq!(counts.ticks.load(Ordering::SeqCst), 2);

        task.stop().await;
        task.stop().await;
        assert_eq!(counts.finished.load(Ordering::SeqCst), 1);
    }
}
