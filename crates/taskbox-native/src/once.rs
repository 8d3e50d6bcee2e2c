//! One-shot resolution gate.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;

/// Admits exactly one executor and releases every waiter once it finishes.
///
/// The first caller of [`ResolveOnce::run`] claims the gate and runs its
/// body; every other caller (and every caller of [`ResolveOnce::wait`])
/// blocks until that body has returned. Losers never run their body.
///
/// The gate is marked done when the winning body returns, panics or is
/// dropped. Only a completed body leaves a usable outcome behind, so callers
/// that may be cancelled should run the body on a spawned task.
#[derive(Debug)]
pub struct ResolveOnce {
    claimed: AtomicBool,
    done: watch::Sender<bool>,
}

impl ResolveOnce {
    pub fn new() -> Self {
        Self {
            claimed: AtomicBool::new(false),
            done: watch::Sender::new(false),
        }
    }

    /// Run `body` if nobody else has, then wait for the gate to be done.
    ///
    /// Returns `true` if this call executed the body.
    pub async fn run<F, Fut>(&self, body: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        if self
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.wait().await;
            return false;
        }

        let _done = MarkDone(&self.done);
        body().await;
        true
    }

    /// Wait until the winning body has finished.
    pub async fn wait(&self) {
        let mut rx = self.done.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Whether some caller has claimed the gate.
    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    /// Whether the winning body has finished.
    pub fn is_done(&self) -> bool {
        *self.done.borrow()
    }
}

/// Releases waiters however the winning body ends.
struct MarkDone<'a>(&'a watch::Sender<bool>);

impl Drop for MarkDone<'_> {
    fn drop(&mut self) {
        self.0.send_replace(true);
    }
}

impl Default for ResolveOnce {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_body_runs_once() {
        let once = ResolveOnce::new();
        let runs = AtomicUsize::new(0);

        assert!(once.run(|| async { runs.fetch_add(1, Ordering::SeqCst); }).await);
        assert!(!once.run(|| async { runs.fetch_add(1, Ordering::SeqCst); }).await);

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(once.is_done());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_losers_wait_for_winner() {
        let once = Arc::new(ResolveOnce::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let once = once.clone();
            let runs = runs.clone();
            let finished = finished.clone();
            handles.push(tokio::spawn(async move {
                once.run(|| async {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    finished.store(true, Ordering::SeqCst);
                })
                .await;
                // Whoever won, the body has completed by the time we return.
                assert!(finished.load(Ordering::SeqCst));
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wait_blocks_until_done() {
        let once = Arc::new(ResolveOnce::new());

        let waiter = {
            let once = once.clone();
            tokio::spawn(async move { once.wait().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        once.run(|| async {}).await;
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    async fn failing_teardown() {
        panic!("teardown failed")
    }

    #[tokio::test]
    async fn test_panicking_body_releases_waiters() {
        let once = Arc::new(ResolveOnce::new());

        let winner = {
            let once = once.clone();
            tokio::spawn(async move {
                once.run(failing_teardown).await;
            })
        };
        assert!(winner.await.unwrap_err().is_panic());

        assert!(once.is_done());
        tokio::time::timeout(Duration::from_secs(1), once.wait())
            .await
            .unwrap();
        assert!(!once.run(|| async {}).await);
    }
}
