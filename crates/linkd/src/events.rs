//! Rate-limited wake signal for the reconcile loop.
//!
//! Several sources (kernel link notifications, declaration changes) feed one
//! capacity-1 channel: while a wake is pending further notifications are
//! coalesced into it. The receiving [`Wake`] enforces a minimum interval
//! between consecutive wakes.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::WatchStream;

use crate::netlink::LinkMonitor;

/// Handle for requesting a reconcile.
#[derive(Debug, Clone)]
pub struct Waker {
    tx: mpsc::Sender<()>,
}

impl Waker {
    /// Request a wake; a no-op if one is already pending.
    pub fn wake(&self) {
        // Full means a wake is already queued; Closed means nobody listens.
        let _ = self.tx.try_send(());
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving side of the wake channel.
#[derive(Debug)]
pub struct Wake {
    rx: mpsc::Receiver<()>,
    min_interval: Duration,
    last: Option<Instant>,
}

impl Wake {
    /// Wait for the next wake.
    ///
    /// Returns `None` once every source has gone away.
    pub async fn recv(&mut self) -> Option<()> {
        self.rx.recv().await?;
        if let Some(last) = self.last {
            tokio::time::sleep_until(last + self.min_interval).await;
            // fold in whatever arrived while we were holding back
            let _ = self.rx.try_recv();
        }
        self.last = Some(Instant::now());
        Some(())
    }
}

/// Builder wiring notification sources to a [`Wake`].
pub struct WakeSource {
    waker: Waker,
    wake: Wake,
    tasks: Vec<JoinHandle<()>>,
}

impl WakeSource {
    /// Create a source with one wake already queued, so the first cycle runs
    /// without waiting for an event.
    pub fn new(min_interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let waker = Waker { tx };
        waker.wake();
        Self {
            waker,
            wake: Wake {
                rx,
                min_interval,
                last: None,
            },
            tasks: Vec::new(),
        }
    }

    /// A handle for ad-hoc wakes (e.g. after a reload).
    pub fn waker(&self) -> Waker {
        self.waker.clone()
    }

    /// Wake on every kernel link notification.
    pub fn watch_links(&mut self, mut monitor: LinkMonitor) -> &mut Self {
        let waker = self.waker();
        self.tasks.push(tokio::spawn(async move {
            loop {
                match monitor.recv().await {
                    Ok(Some(events)) => {
                        tracing::trace!(
                            links = ?events.iter().map(|e| e.name()).collect::<Vec<_>>(),
                            "link notification"
                        );
                        waker.wake();
                    }
                    Ok(None) => break,
                    Err(e) => {
                        // ENOBUFS: notifications were dropped, resync anyway
                        tracing::warn!(error = %e, "link monitor error");
                        waker.wake();
                    }
                }
                if waker.is_closed() {
                    break;
                }
            }
        }));
        self
    }

    /// Wake whenever the watched declaration revision changes.
    pub fn watch_store(&mut self, revisions: watch::Receiver<u64>) -> &mut Self {
        let waker = self.waker();
        self.tasks.push(tokio::spawn(async move {
            let mut changes = WatchStream::new(revisions);
            while let Some(revision) = changes.next().await {
                tracing::trace!(revision, "declaration changed");
                waker.wake();
                if waker.is_closed() {
                    break;
                }
            }
        }));
        self
    }

    /// Finish wiring. The returned [`Wake`] ends once the background sources
    /// and every [`Waker`] handed out have been dropped.
    pub fn build(self) -> (Wake, WakeTasks) {
        (self.wake, WakeTasks { tasks: self.tasks })
    }
}

/// Background source tasks; aborted on drop.
#[derive(Debug)]
pub struct WakeTasks {
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for WakeTasks {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn first_wake_is_immediate() {
        let (mut wake, _tasks) = WakeSource::new(Duration::from_secs(5)).build();
        let start = Instant::now();
        assert_eq!(wake.recv().await, Some(()));
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn wakes_are_coalesced_and_spaced() {
        let source = WakeSource::new(Duration::from_secs(1));
        let waker = source.waker();
        let (mut wake, _tasks) = source.build();

        let start = Instant::now();
        wake.recv().await.unwrap();

        for _ in 0..10 {
            waker.wake();
        }
        wake.recv().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(1));

        // the burst produced a single wake
        drop(waker);
        assert_eq!(wake.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn store_changes_wake() {
        let (tx, rx) = watch::channel(0u64);
        let mut source = WakeSource::new(Duration::from_millis(10));
        source.watch_store(rx);
        let (mut wake, tasks) = source.build();

        // initial wake, plus the stream's first value coalesced into it
        wake.recv().await.unwrap();
        tokio::task::yield_now().await;

        tx.send(1).unwrap();
        wake.recv().await.unwrap();

        drop(tasks);
        drop(tx);
    }
}
