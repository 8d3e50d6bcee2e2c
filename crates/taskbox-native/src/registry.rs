//! Counted, drainable gate for live sessions.

use tokio::sync::watch;

/// Error returned by [`SessionRegistry::add`] once draining has begun.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("session registry is draining")]
pub struct Draining;

/// Lifecycle of the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryState {
    /// New sessions may be added.
    Accepting,
    /// No new sessions; some are still running.
    Draining,
    /// Draining began and every session has finished.
    Drained,
}

#[derive(Debug, Clone, Copy, Default)]
struct Counter {
    active: usize,
    draining: bool,
}

/// Tracks the number of live sessions of a sandbox.
///
/// The count and the "closed for new entries" flag live behind a single
/// lock, so a late [`add`](Self::add) can never slip in between a waiter
/// observing zero and the registry being closed.
#[derive(Debug)]
pub struct SessionRegistry {
    state: watch::Sender<Counter>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            state: watch::Sender::new(Counter::default()),
        }
    }

    /// Count a new session, unless draining has started.
    pub fn add(&self) -> Result<(), Draining> {
        let mut accepted = false;
        self.state.send_if_modified(|c| {
            if c.draining {
                return false;
            }
            c.active += 1;
            accepted = true;
            true
        });
        if accepted { Ok(()) } else { Err(Draining) }
    }

    /// Mark one session as finished.
    pub fn done(&self) {
        self.state.send_modify(|c| {
            debug_assert!(c.active > 0, "SessionRegistry::done without add");
            c.active = c.active.saturating_sub(1);
        });
    }

    /// Stop accepting new sessions. Does not block.
    pub fn drain(&self) {
        self.state.send_if_modified(|c| {
            let changed = !c.draining;
            c.draining = true;
            changed
        });
    }

    /// Wait until no sessions are active.
    pub async fn wait(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|c| c.active == 0).await;
    }

    /// Wait until no sessions are active and, in the same step, stop
    /// accepting new ones.
    pub async fn wait_and_drain(&self) {
        let mut rx = self.state.subscribe();
        loop {
            let _ = rx.wait_for(|c| c.active == 0).await;
            let mut closed = false;
            self.state.send_if_modified(|c| {
                if c.active != 0 {
                    return false;
                }
                closed = true;
                let changed = !c.draining;
                c.draining = true;
                changed
            });
            if closed {
                return;
            }
        }
    }

    /// Number of active sessions.
    pub fn active(&self) -> usize {
        self.state.borrow().active
    }

    pub fn state(&self) -> RegistryState {
        let c = *self.state.borrow();
        match (c.draining, c.active) {
            (false, _) => RegistryState::Accepting,
            (true, 0) => RegistryState::Drained,
            (true, _) => RegistryState::Draining,
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
