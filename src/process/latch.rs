//! One-shot completion latch shared by a waiting step and a response handler.
//!
//! The latch moves `Open -> Claimed -> Released` when a response handler
//! takes it, or `Open -> Released` when the waiter's deadline passes first.
//! Only the first transition out of `Open` has any effect, so the waiter is
//! released exactly once per request attempt and a late response can never
//! be applied after the waiter gave up.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;

const OPEN: u8 = 0;
const CLAIMED: u8 = 1;
const RELEASED: u8 = 2;

/// Outcome observed by the waiting side
#[derive(Debug, PartialEq, Eq)]
pub enum WaitOutcome<T> {
    /// A handler claimed the latch and completed it with a value
    Released(T),
    /// The deadline passed before any handler claimed the latch
    TimedOut,
    /// A handler claimed the latch but dropped it without a value
    Abandoned,
}

pub struct CompletionLatch<T> {
    state: AtomicU8,
    releases: AtomicUsize,
    sender: Mutex<Option<oneshot::Sender<T>>>,
}

impl<T: Send + 'static> CompletionLatch<T> {
    /// Create a latch and the waiter that observes it
    pub fn new() -> (Arc<Self>, LatchWaiter<T>) {
        let (sender, receiver) = oneshot::channel();
        let latch = Arc::new(Self {
            state: AtomicU8::new(OPEN),
            releases: AtomicUsize::new(0),
            sender: Mutex::new(Some(sender)),
        });
        let waiter = LatchWaiter {
            latch: Arc::clone(&latch),
            receiver,
        };
        (latch, waiter)
    }

    /// Take exclusive right to release the latch.
    ///
    /// Returns `None` if another handler claimed it or the waiter already
    /// timed out.
    pub fn try_claim(self: &Arc<Self>) -> Option<LatchClaim<T>> {
        self.state
            .compare_exchange(OPEN, CLAIMED, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| LatchClaim {
                latch: Arc::clone(self),
                completed: false,
            })
    }

    /// Claim and complete in one go; false if the latch was not open
    pub fn release(self: &Arc<Self>, value: T) -> bool {
        match self.try_claim() {
            Some(claim) => {
                claim.complete(value);
                true
            }
            None => false,
        }
    }

    pub fn is_released(&self) -> bool {
        self.state.load(Ordering::Acquire) == RELEASED
    }

    /// Number of effective releases; never exceeds one
    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::Acquire)
    }

    fn expire(&self) -> bool {
        let expired = self
            .state
            .compare_exchange(OPEN, RELEASED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if expired {
            self.fire(None);
        }
        expired
    }

    fn fire(&self, value: Option<T>) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        self.state.store(RELEASED, Ordering::Release);
        self.releases.fetch_add(1, Ordering::AcqRel);
        if let (Some(sender), Some(value)) = (sender, value) {
            // receiver gone means the waiter was dropped; nothing to wake
            let _ = sender.send(value);
        }
    }
}

/// Exclusive right to release a latch, obtained by [`CompletionLatch::try_claim`].
///
/// Dropping an uncompleted claim still releases the waiter, as `Abandoned`.
pub struct LatchClaim<T: Send + 'static> {
    latch: Arc<CompletionLatch<T>>,
    completed: bool,
}

impl<T: Send + 'static> LatchClaim<T> {
    pub fn complete(mut self, value: T) {
        self.completed = true;
        self.latch.fire(Some(value));
    }
}

impl<T: Send + 'static> Drop for LatchClaim<T> {
    fn drop(&mut self) {
        if !self.completed {
            self.latch.fire(None);
        }
    }
}

/// Waiting side of a [`CompletionLatch`]
pub struct LatchWaiter<T> {
    latch: Arc<CompletionLatch<T>>,
    receiver: oneshot::Receiver<T>,
}

impl<T: Send + 'static> LatchWaiter<T> {
    /// Wait for a release, bounded by `timeout`.
    ///
    /// If a handler has claimed the latch when the deadline passes, the
    /// waiter keeps waiting for that handler to finish.
    pub async fn wait(self, timeout: Duration) -> WaitOutcome<T> {
        let LatchWaiter {
            latch,
            mut receiver,
        } = self;

        match tokio::time::timeout(timeout, &mut receiver).await {
            Ok(Ok(value)) => WaitOutcome::Released(value),
            Ok(Err(_)) => WaitOutcome::Abandoned,
            Err(_) if latch.expire() => WaitOutcome::TimedOut,
            Err(_) => match receiver.await {
                Ok(value) => WaitOutcome::Released(value),
                Err(_) => WaitOutcome::Abandoned,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_release_wakes_waiter() {
        let (latch, waiter) = CompletionLatch::new();
        let handler = Arc::clone(&latch);
        tokio::spawn(async move {
            assert!(handler.release(7u32));
        });

        assert_eq!(
            waiter.wait(Duration::from_secs(5)).await,
            WaitOutcome::Released(7)
        );
        assert!(latch.is_released());
        assert_eq!(latch.release_count(), 1);
    }

    #[tokio::test]
    async fn test_only_first_release_counts() {
        let (latch, waiter) = CompletionLatch::new();
        assert!(latch.release(1u32));
        assert!(!latch.release(2));
        assert!(latch.try_claim().is_none());

        assert_eq!(
            waiter.wait(Duration::from_millis(10)).await,
            WaitOutcome::Released(1)
        );
        assert_eq!(latch.release_count(), 1);
    }

    #[tokio::test]
    async fn test_late_release_after_timeout_is_discarded() {
        let (latch, waiter) = CompletionLatch::<u32>::new();

        assert_eq!(
            waiter.wait(Duration::from_millis(20)).await,
            WaitOutcome::TimedOut
        );
        assert!(!latch.release(9));
        assert!(latch.try_claim().is_none());
        assert_eq!(latch.release_count(), 1);
    }

    #[tokio::test]
    async fn test_claimed_latch_outlives_deadline() {
        let (latch, waiter) = CompletionLatch::new();
        let claim = latch.try_claim().unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            claim.complete("verified");
        });

        assert_eq!(
            waiter.wait(Duration::from_millis(5)).await,
            WaitOutcome::Released("verified")
        );
        assert_eq!(latch.release_count(), 1);
    }

    #[tokio::test]
    async fn test_dropped_claim_abandons() {
        let (latch, waiter) = CompletionLatch::<u32>::new();
        drop(latch.try_claim().unwrap());

        assert_eq!(
            waiter.wait(Duration::from_secs(1)).await,
            WaitOutcome::Abandoned
        );
        assert_eq!(latch.release_count(), 1);
    }
}
