//! Cooperative cancellation.
//!
//! The stop flag lives in a `tokio::sync::watch` channel so async code can
//! `select!` on [`CancelToken::cancelled`]. Blocking sleepers on the worker
//! thread wait on a condition variable that `cancel` rings.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;

use super::lock;

/// Shared stop flag with an interruptible sleep.
///
/// Cloning yields a handle to the same flag.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

struct Inner {
    flag: watch::Sender<bool>,
    bell: Mutex<()>,
    rung: Condvar,
}

impl CancelToken {
    pub fn new() -> Self {
        let (flag, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                flag,
                bell: Mutex::new(()),
                rung: Condvar::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        let _bell = lock(&self.inner.bell);
        self.inner.flag.send_replace(true);
        self.inner.rung.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.flag.borrow()
    }

    pub(crate) fn reset(&self) {
        let _bell = lock(&self.inner.bell);
        self.inner.flag.send_replace(false);
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.inner.flag.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Sleep for `duration` unless cancelled first.
    ///
    /// Returns `false` if the token was (or became) cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut bell = lock(&self.inner.bell);
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            bell = match self.inner.rung.wait_timeout(bell, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_completes_when_not_cancelled() {
        let token = CancelToken::new();
        assert!(token.sleep(Duration::from_millis(10)));
    }

    #[test]
    fn cancel_interrupts_sleep() {
        let token = CancelToken::new();
        let remote = token.clone();
        let start = Instant::now();
        let sleeper = std::thread::spawn(move || remote.sleep(Duration::from_secs(30)));

        std::thread::sleep(Duration::from_millis(50));
        token.cancel();

        assert!(!sleeper.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn reset_clears_the_flag() {
        let token = CancelToken::new();
        token.cancel();
        assert!(token.is_cancelled());
        token.reset();
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_resolves_for_async_waiters() {
        let token = CancelToken::new();
        let remote = token.clone();
        let waiter = tokio::spawn(async move { remote.cancelled().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        token.cancel();

        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn cancelled_returns_at_once_when_already_set() {
        let token = CancelToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .unwrap();
    }
}
