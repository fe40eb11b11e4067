use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// Cooperative stop signal shared by the device loops and the farm.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownState>,
}

#[derive(Debug)]
struct ShutdownState {
    triggered: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownState {
                triggered: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Ask every holder of the token to stop.
    pub fn trigger(&self) {
        self.inner.triggered.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Resolve once [`trigger`](Self::trigger) has been called.
    pub async fn triggered(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // register before checking the flag so a concurrent trigger is not lost
        notified.as_mut().enable();
        if self.is_triggered() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_waiters_wake_on_trigger() {
        let token = ShutdownToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.triggered().await })
        };

        tokio::task::yield_now().await;
        token.trigger();

        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .expect("waiter task");
        assert!(token.is_triggered());
    }

    #[tokio::test]
    async fn test_already_triggered_token_resolves_immediately() {
        let token = ShutdownToken::new();
        token.trigger();

        timeout(Duration::from_millis(100), token.triggered())
            .await
            .expect("resolved without waiting");
    }
}
