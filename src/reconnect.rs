use crate::config::ReconnectConfig;
use crate::error::ConnectionError;
use log::debug;
use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;

struct PendingReconnect {
    token: u64,
    handle: JoinHandle<()>,
}

/// Retry bookkeeping for one connection manager: an attempt counter and at
/// most one pending reconnect timer.
pub struct ReconnectScheduler {
    config: ReconnectConfig,
    attempts: AtomicU32,
    next_token: AtomicU64,
    pending: Mutex<Option<PendingReconnect>>,
}

impl ReconnectScheduler {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempts: AtomicU32::new(0),
            next_token: AtomicU64::new(1),
            pending: Mutex::new(None),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn delay(&self) -> Duration {
        self.config.delay
    }

    /// Counts a new retry. Fails once the counter passes the configured maximum.
    pub fn next_attempt(&self) -> Result<u32, ConnectionError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        match self.config.max_attempts {
            Some(max) if attempt > max => Err(ConnectionError::ReconnectExhausted { attempts: max }),
            _ => Ok(attempt),
        }
    }

    pub fn reset(&self) {
        self.attempts.store(0, Ordering::SeqCst);
    }

    /// Runs `fire` after `delay`, replacing any timer already pending.
    ///
    /// `fire` receives the timer's token and must call [`disarm`](Self::disarm)
    /// with it before doing anything that could cancel timers, so the task
    /// never aborts itself.
    pub fn arm<F, Fut>(&self, delay: Duration, fire: F) -> u64
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        // Spawn under the lock so `disarm` from the task cannot run before
        // the handle is stored.
        let mut pending = self.lock_pending();
        if let Some(previous) = pending.take() {
            previous.handle.abort();
        }
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fire(token).await;
        });
        *pending = Some(PendingReconnect { token, handle });
        token
    }

    /// Forgets the timer identified by `token` without aborting it.
    pub fn disarm(&self, token: u64) -> bool {
        let mut pending = self.lock_pending();
        if pending.as_ref().is_some_and(|p| p.token == token) {
            *pending = None;
            true
        } else {
            false
        }
    }

    /// Aborts the pending timer, if any.
    pub fn cancel(&self) -> bool {
        let cancelled = self.lock_pending().take();
        match cancelled {
            Some(pending) => {
                pending.handle.abort();
                debug!(target: "Instance/Reconnect", "Cancelled pending reconnect");
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.lock_pending().is_some()
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Option<PendingReconnect>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for ReconnectScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    fn scheduler(max_attempts: Option<u32>) -> Arc<ReconnectScheduler> {
        Arc::new(ReconnectScheduler::new(ReconnectConfig {
            delay: Duration::from_millis(100),
            max_attempts,
        }))
    }

    #[test]
    fn test_attempts_count_up_and_reset() {
        let scheduler = scheduler(None);
        assert_eq!(scheduler.next_attempt().unwrap(), 1);
        assert_eq!(scheduler.next_attempt().unwrap(), 2);
        assert_eq!(scheduler.attempts(), 2);
        scheduler.reset();
        assert_eq!(scheduler.attempts(), 0);
        assert_eq!(scheduler.next_attempt().unwrap(), 1);
    }

    #[test]
    fn test_max_attempts() {
        let scheduler = scheduler(Some(2));
        assert!(scheduler.next_attempt().is_ok());
        assert!(scheduler.next_attempt().is_ok());
        assert!(matches!(
            scheduler.next_attempt(),
            Err(ConnectionError::ReconnectExhausted { attempts: 2 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_delay() {
        let scheduler = scheduler(None);
        let fired = Arc::new(AtomicBool::new(false));

        let flag = fired.clone();
        let sched = scheduler.clone();
        scheduler.arm(Duration::from_millis(100), move |token| async move {
            assert!(sched.disarm(token));
            flag.store(true, Ordering::SeqCst);
        });
        assert!(scheduler.is_pending());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!fired.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(fired.load(Ordering::SeqCst));
        assert!(!scheduler.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_firing() {
        let scheduler = scheduler(None);
        let fired = Arc::new(AtomicBool::new(false));

        let flag = fired.clone();
        scheduler.arm(Duration::from_millis(100), move |_| async move {
            flag.store(true, Ordering::SeqCst);
        });
        assert!(scheduler.cancel());
        assert!(!scheduler.cancel());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearming_replaces_the_pending_timer() {
        let scheduler = scheduler(None);
        let fired = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let count = fired.clone();
            scheduler.arm(Duration::from_millis(100), move |_| async move {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
