use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Every deferred action and helper task the session spawned, so teardown
/// can cancel all of them.
#[derive(Default)]
pub(crate) struct Timers {
    handles: Vec<JoinHandle<()>>,
}

impl Timers {
    /// Delivers `message` on `tx` after `delay`.
    pub fn schedule<T: Send + 'static>(&mut self, delay: Duration, tx: &mpsc::UnboundedSender<T>, message: T) {
        let tx = tx.clone();
        self.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(message);
        });
    }

    pub fn spawn<F>(&mut self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.track(tokio::spawn(future));
    }

    pub fn track(&mut self, handle: JoinHandle<()>) {
        self.handles.retain(|handle| !handle.is_finished());
        self.handles.push(handle);
    }

    pub fn active(&self) -> usize {
        self.handles.iter().filter(|handle| !handle.is_finished()).count()
    }

    pub fn cancel_all(&mut self) -> usize {
        let cancelled = self.handles.len();
        for handle in self.handles.drain(..) {
            handle.abort();
        }
        cancelled
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn cancelled_timers_never_fire() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::default();
        timers.schedule(Duration::from_secs(1), &tx, 1u32);
        timers.schedule(Duration::from_secs(3), &tx, 3u32);
        assert_eq!(rx.recv().await, Some(1));
        timers.cancel_all();
        drop(tx);
        assert_eq!(rx.recv().await, None);
        assert_eq!(timers.active(), 0);
    }
}
