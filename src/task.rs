use std::future::Future;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Runs a job on a fixed period until cancelled. Ticks never overlap: the
/// next one waits for the previous job to finish.
pub struct ScheduledTask {
    name: String,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    pub fn spawn<F, Fut>(
        name: &str,
        period: Duration,
        parent: &CancellationToken,
        mut job: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = parent.child_token();
        let stop = token.clone();
        let label = name.to_string();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => job().await,
                }
            }
            debug!(task = label, "scheduled task bailing out");
        });

        Self {
            name: name.to_string(),
            token,
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::ScheduledTask;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{Duration, sleep};
    use tokio_util::sync::CancellationToken;

    fn counting(parent: &CancellationToken) -> (ScheduledTask, Arc<AtomicUsize>) {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let task = ScheduledTask::spawn("pods", Duration::from_millis(20), parent, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        (task, ticks)
    }

    #[tokio::test]
    async fn ticks_until_cancelled() {
        let parent = CancellationToken::new();
        let (task, ticks) = counting(&parent);
        assert_eq!(task.name(), "pods");

        sleep(Duration::from_millis(150)).await;
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 3, "saw {seen} ticks");

        task.cancel();
        sleep(Duration::from_millis(30)).await;
        assert!(task.is_finished());
        let after = ticks.load(Ordering::SeqCst);
        sleep(Duration::from_millis(100)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), after);
    }

    #[tokio::test]
    async fn parent_cancellation_and_drop_stop_the_task() {
        let parent = CancellationToken::new();
        let (task, _) = counting(&parent);
        parent.cancel();
        sleep(Duration::from_millis(30)).await;
        assert!(task.is_finished());

        let other = CancellationToken::new();
        let (task, ticks) = counting(&other);
        sleep(Duration::from_millis(50)).await;
        drop(task);
        sleep(Duration::from_millis(30)).await;
        let after = ticks.load(Ordering::SeqCst);
        sleep(Duration::from_millis(100)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), after);
        assert!(!other.is_cancelled());
    }
}
