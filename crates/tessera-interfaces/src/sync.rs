//! Synchronization points for asynchronously issued device work
//!
//! A dispatch hands back a [`CompletionFence`]. Anything that would reuse
//! the blocks read by that dispatch must wait on the fence first.

use parking_lot::{Condvar, Mutex};
use std::fmt::Debug;
use std::time::Duration;
use tessera_types::{Result, TesseraError};
use tracing::trace;

/// Handle the host can wait on until a dispatch has finished
pub trait CompletionFence: Send + Sync + Debug {
    /// Non-blocking completion check
    fn is_complete(&self) -> bool;

    /// Block until the dispatch finished. A failed dispatch reports its
    /// kernel error here.
    fn wait(&self) -> Result<()>;
}

/// Fence for work that completed before it was returned
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadyFence;

impl CompletionFence for ReadyFence {
    fn is_complete(&self) -> bool {
        true
    }

    fn wait(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
enum EventState {
    Pending,
    Signaled,
    Failed(TesseraError),
}

/// Host-side event completed by whoever runs the work
#[derive(Debug)]
pub struct HostEvent {
    state: Mutex<EventState>,
    cond: Condvar,
}

impl HostEvent {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EventState::Pending),
            cond: Condvar::new(),
        }
    }

    /// Mark the work as finished successfully
    pub fn signal(&self) {
        self.complete(EventState::Signaled);
    }

    /// Mark the work as failed; waiters receive `err`
    pub fn fail(&self, err: TesseraError) {
        self.complete(EventState::Failed(err));
    }

    fn complete(&self, next: EventState) {
        let mut state = self.state.lock();
        if !matches!(*state, EventState::Pending) {
            trace!("HostEvent completed twice, keeping first outcome");
            return;
        }
        *state = next;
        self.cond.notify_all();
    }

    /// Wait at most `timeout`; returns `None` if still pending
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<()>> {
        let mut state = self.state.lock();
        if matches!(*state, EventState::Pending) {
            let _ = self.cond.wait_for(&mut state, timeout);
        }
        match &*state {
            EventState::Pending => None,
            EventState::Signaled => Some(Ok(())),
            EventState::Failed(err) => Some(Err(err.clone())),
        }
    }
}

impl Default for HostEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionFence for HostEvent {
    fn is_complete(&self) -> bool {
        !matches!(*self.state.lock(), EventState::Pending)
    }

    fn wait(&self) -> Result<()> {
        let mut state = self.state.lock();
        while matches!(*state, EventState::Pending) {
            self.cond.wait(&mut state);
        }
        match &*state {
            EventState::Failed(err) => Err(err.clone()),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_ready_fence() {
        let fence = ReadyFence;
        assert!(fence.is_complete());
        assert!(fence.wait().is_ok());
    }

    #[test]
    fn test_host_event_signal_from_other_thread() {
        let event = Arc::new(HostEvent::new());
        assert!(!event.is_complete());

        let signaller = {
            let event = event.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                event.signal();
            })
        };

        event.wait().unwrap();
        assert!(event.is_complete());
        signaller.join().unwrap();
    }

    #[test]
    fn test_host_event_failure_is_reported() {
        let event = HostEvent::new();
        event.fail(TesseraError::kernel("out of shared memory"));
        let err = event.wait().unwrap_err();
        assert_eq!(err, TesseraError::kernel("out of shared memory"));

        // A later signal does not overwrite the failure
        event.signal();
        assert!(event.wait().is_err());
    }

    #[test]
    fn test_wait_timeout_pending() {
        let event = HostEvent::new();
        assert!(event.wait_timeout(Duration::from_millis(5)).is_none());
        event.signal();
        assert!(matches!(
            event.wait_timeout(Duration::from_millis(5)),
            Some(Ok(()))
        ));
    }
}
