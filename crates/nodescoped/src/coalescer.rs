//! Sync Coalescer - debounces graph-change notifications
//!
//! Every notification carries the latest snapshot and restarts the quiet
//! period. When the period runs out with no newer notification, the sink gets
//! the latest snapshot once. The timer lives inside a single task that also
//! receives the notifications, so re-arming never races with expiry.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// Receives coalesced snapshots.
pub trait SnapshotSink<T>: Send + Sync + 'static {
    fn push(&self, snapshot: T);
}

impl<T, F> SnapshotSink<T> for F
where
    F: Fn(T) + Send + Sync + 'static,
{
    fn push(&self, snapshot: T) {
        self(snapshot)
    }
}

pub struct SyncCoalescer<T> {
    tx: mpsc::UnboundedSender<T>,
    task: JoinHandle<()>,
}

impl<T: Send + 'static> SyncCoalescer<T> {
    pub fn spawn(quiet: Duration, sink: impl SnapshotSink<T>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(rx, quiet, sink));
        Self { tx, task }
    }

    /// Queue a snapshot. False once the coalescer has stopped.
    pub fn notify(&self, snapshot: T) -> bool {
        self.tx.send(snapshot).is_ok()
    }

    /// Stop the task. A snapshot still waiting out its quiet period is dropped.
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(e) = self.task.await {
            warn!("Sync coalescer task failed: {}", e);
        }
    }
}

async fn run<T>(mut rx: mpsc::UnboundedReceiver<T>, quiet: Duration, sink: impl SnapshotSink<T>) {
    while let Some(first) = rx.recv().await {
        let mut latest = first;
        let mut coalesced = 1usize;
        let timer = sleep(quiet);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                biased;
                next = rx.recv() => match next {
                    Some(snapshot) => {
                        latest = snapshot;
                        coalesced += 1;
                        timer.as_mut().reset(Instant::now() + quiet);
                    }
                    None => return,
                },
                _ = &mut timer => {
                    debug!("Pushing snapshot after {} notifications", coalesced);
                    sink.push(latest);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    type Pushes = Arc<Mutex<Vec<(Instant, u32)>>>;

    fn recorder() -> (Pushes, impl SnapshotSink<u32>) {
        let pushes: Pushes = Arc::default();
        let sink = {
            let pushes = Arc::clone(&pushes);
            move |n: u32| pushes.lock().unwrap().push((Instant::now(), n))
        };
        (pushes, sink)
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_collapses_to_one_push() {
        let (pushes, sink) = recorder();
        let coalescer = SyncCoalescer::spawn(Duration::from_millis(500), sink);

        let mut last_event = Instant::now();
        for n in 1..=10 {
            assert!(coalescer.notify(n));
            last_event = Instant::now();
            sleep(Duration::from_millis(40)).await;
        }

        // Not yet: the quiet period restarted at the tenth event
        sleep(Duration::from_millis(400)).await;
        assert!(pushes.lock().unwrap().is_empty());

        sleep(Duration::from_millis(200)).await;
        let pushes = pushes.lock().unwrap().clone();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].1, 10);
        assert!(pushes[0].0 - last_event >= Duration::from_millis(500));

        coalescer.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_separate_bursts_push_separately() {
        let (pushes, sink) = recorder();
        let coalescer = SyncCoalescer::spawn(Duration::from_millis(500), sink);

        coalescer.notify(1);
        coalescer.notify(2);
        sleep(Duration::from_secs(1)).await;
        coalescer.notify(3);
        sleep(Duration::from_secs(1)).await;

        let values: Vec<u32> = pushes.lock().unwrap().iter().map(|(_, n)| *n).collect();
        assert_eq!(values, vec![2, 3]);
        coalescer.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drops_pending() {
        let (pushes, sink) = recorder();
        let coalescer = SyncCoalescer::spawn(Duration::from_millis(500), sink);
        coalescer.notify(7);
        coalescer.shutdown().await;
        sleep(Duration::from_secs(1)).await;
        assert!(pushes.lock().unwrap().is_empty());
    }
}
