//! Cancellable scheduled tasks
//!
//! Heartbeats, discovery polls and retry backoffs all run as a
//! `ScheduledTask`. Cancelling (or dropping) the task stops it synchronously,
//! so nothing it schedules can fire after teardown.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// When the first tick of a repeating task fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirstTick {
    Immediately,
    AfterPeriod,
}

#[derive(Debug)]
pub struct ScheduledTask {
    name: String,
    handle: Option<JoinHandle<()>>,
}

impl ScheduledTask {
    /// Run `tick` every `period` until cancelled.
    pub fn every<F, Fut>(name: &str, period: Duration, first: FirstTick, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task_name = name.to_string();
        let handle = tokio::spawn(async move {
            let start = match first {
                FirstTick::Immediately => tokio::time::Instant::now(),
                FirstTick::AfterPeriod => tokio::time::Instant::now() + period,
            };
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                log::trace!("scheduled task '{}' tick", task_name);
                tick().await;
            }
        });

        Self {
            name: name.to_string(),
            handle: Some(handle),
        }
    }

    /// Run `work` once after `delay` unless cancelled first.
    pub fn after<Fut>(name: &str, delay: Duration, work: Fut) -> Self
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            work.await;
        });

        Self {
            name: name.to_string(),
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the task is still scheduled (a one-shot task that has run
    /// reports false).
    pub fn is_active(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            log::debug!("scheduled task '{}' cancelled", self.name);
        }
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_every_fires_immediately_then_periodically() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let _task = ScheduledTask::every("test", Duration::from_secs(30), FirstTick::Immediately, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_ticks() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let mut task = ScheduledTask::every("test", Duration::from_secs(1), FirstTick::AfterPeriod, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert!(task.is_active());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        task.cancel();
        assert!(!task.is_active());
        let seen = count.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen);
        assert_eq!(seen, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_after_runs_once_unless_dropped() {
        let count = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&count);
        let task = ScheduledTask::after("fires", Duration::from_secs(5), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = Arc::clone(&count);
        let dropped = ScheduledTask::after("dropped", Duration::from_secs(5), async move {
            counter.fetch_add(10, Ordering::SeqCst);
        });
        drop(dropped);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!task.is_active());
    }
}
