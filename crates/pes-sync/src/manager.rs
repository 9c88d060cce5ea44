use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use pes_types::SyncToken;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use crate::config::SyncConfig;

/// Tracks sync tokens from registration until their marker is replayed.
///
/// A token is `pending` from [`start_sync`](Self::start_sync) until either
/// [`process_sync`](Self::process_sync) finishes it or its waiter gives up.
/// Finished tokens stay answerable through
/// [`has_finish_sync`](Self::has_finish_sync) until they go unqueried for the
/// configured retention window.
#[derive(Debug)]
pub struct SyncManager {
    config: SyncConfig,
    pending: Mutex<HashMap<SyncToken, watch::Sender<bool>>>,
    /// Token -> last time it was looked up.
    finished: Mutex<HashMap<SyncToken, Instant>>,
}

impl Default for SyncManager {
    fn default() -> Self {
        Self::new(SyncConfig::default())
    }
}

impl SyncManager {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            pending: Mutex::new(HashMap::new()),
            finished: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Register a fresh random token as pending.
    pub fn start_sync(&self) -> SyncToken {
        let token = SyncToken::random();
        self.start_sync_with(token);
        token
    }

    /// Register a caller-chosen token as pending. Re-registering a pending
    /// token keeps the existing waiters.
    pub fn start_sync_with(&self, token: SyncToken) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending
            .entry(token)
            .or_insert_with(|| watch::channel(false).0);
    }

    /// Drop a pending registration without finishing it.
    pub fn cancel_sync(&self, token: &SyncToken) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(token)
            .is_some()
    }

    /// Wait up to `timeout` for `token` to be finished.
    ///
    /// Returns `true` if it finished in time, or if it was never pending.
    /// Returns `false` on timeout. The token is removed from the pending set
    /// on every exit path, including when this future is dropped.
    pub async fn finish_sync(&self, token: &SyncToken, timeout: Duration) -> bool {
        let mut rx = {
            let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            match pending.get(token) {
                Some(tx) => tx.subscribe(),
                None => return true,
            }
        };
        let _guard = PendingGuard {
            manager: self,
            token: *token,
        };

        let outcome = tokio::time::timeout(timeout, rx.wait_for(|done| *done))
            .await
            .map(|waited| waited.map(drop));
        match outcome {
            Ok(Ok(())) => true,
            // Sender dropped: finished or cancelled concurrently.
            Ok(Err(_)) => self.has_finish_sync(Some(token)),
            Err(_) => {
                debug!(token = %token, timeout_ms = timeout.as_millis() as u64, "sync wait timed out");
                false
            }
        }
    }

    /// [`finish_sync`](Self::finish_sync) with the configured default timeout.
    pub async fn finish_sync_default(&self, token: &SyncToken) -> bool {
        self.finish_sync(token, self.config.default_timeout()).await
    }

    /// Mark a replayed marker's token as finished and wake its waiters.
    ///
    /// Tokens that are not pending are misses: nobody is waiting, so they
    /// are not recorded. Returns whether the token was pending.
    pub fn process_sync(&self, token: &SyncToken) -> bool {
        let sender = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(token);
        let Some(sender) = sender else {
            debug!(token = %token, "sync marker without pending token");
            return false;
        };

        {
            let mut finished = self.finished.lock().unwrap_or_else(|e| e.into_inner());
            self.evict_expired(&mut finished);
            finished.insert(*token, Instant::now());
        }
        sender.send_replace(true);
        debug!(token = %token, "sync finished");
        true
    }

    /// Non-blocking check against the finished set. `None` has nothing to
    /// wait for and is always finished.
    pub fn has_finish_sync(&self, token: Option<&SyncToken>) -> bool {
        let Some(token) = token else {
            return true;
        };
        let mut finished = self.finished.lock().unwrap_or_else(|e| e.into_inner());
        self.evict_expired(&mut finished);
        match finished.get_mut(token) {
            Some(last_access) => {
                *last_access = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Register a token, hand it to `publish` (which appends the marker),
    /// then wait for it.
    pub async fn sync<F, Fut, E>(&self, timeout: Duration, publish: F) -> Result<bool, E>
    where
        F: FnOnce(SyncToken) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        let token = self.start_sync();
        if let Err(e) = publish(token).await {
            self.cancel_sync(&token);
            return Err(e);
        }
        Ok(self.finish_sync(&token, timeout).await)
    }

    pub fn is_pending(&self, token: &SyncToken) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(token)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn finished_count(&self) -> usize {
        let mut finished = self.finished.lock().unwrap_or_else(|e| e.into_inner());
        self.evict_expired(&mut finished);
        finished.len()
    }

    fn evict_expired(&self, finished: &mut HashMap<SyncToken, Instant>) {
        let retention = self.config.finished_retention();
        let now = Instant::now();
        finished.retain(|_, last_access| now.duration_since(*last_access) < retention);
    }
}

struct PendingGuard<'a> {
    manager: &'a SyncManager,
    token: SyncToken,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.manager.cancel_sync(&self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn manager(retention_ms: u64) -> SyncManager {
        SyncManager::new(SyncConfig {
            default_timeout_ms: 1_000,
            finished_retention_ms: retention_ms,
        })
    }

    #[test]
    fn fresh_token_is_not_finished() {
        let m = SyncManager::default();
        let token = m.start_sync();
        assert!(m.is_pending(&token));
        assert!(!m.has_finish_sync(Some(&token)));
    }

    #[test]
    fn processed_token_is_finished_repeatedly() {
        let m = SyncManager::default();
        let token = m.start_sync();
        assert!(m.process_sync(&token));
        assert!(!m.is_pending(&token));
        for _ in 0..3 {
            assert!(m.has_finish_sync(Some(&token)));
        }
    }

    #[test]
    fn unknown_marker_is_a_miss() {
        let m = SyncManager::default();
        let stray = SyncToken::new(4, 2);
        assert!(!m.process_sync(&stray));
        assert!(!m.has_finish_sync(Some(&stray)));
        assert!(m.has_finish_sync(None));
    }

    #[tokio::test]
    async fn waiter_wakes_on_process() {
        let m = Arc::new(SyncManager::default());
        let token = m.start_sync();

        let waiter = {
            let m = Arc::clone(&m);
            tokio::spawn(async move { m.finish_sync(&token, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(m.process_sync(&token));

        assert!(waiter.await.unwrap());
        assert!(m.has_finish_sync(Some(&token)));
        assert_eq!(m.pending_count(), 0);
    }

    #[tokio::test]
    async fn marker_replayed_before_wait_still_counts() {
        let m = SyncManager::default();
        let token = m.start_sync();
        m.process_sync(&token);
        assert!(m.finish_sync(&token, Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn timeout_returns_false_and_deregisters() {
        let m = SyncManager::default();
        let token = m.start_sync();

        let started = std::time::Instant::now();
        assert!(!m.finish_sync(&token, Duration::from_millis(100)).await);
        assert!(started.elapsed() >= Duration::from_millis(100));

        assert!(!m.is_pending(&token));
        assert!(!m.has_finish_sync(Some(&token)));
        // Late marker after the waiter gave up is a miss.
        assert!(!m.process_sync(&token));
    }

    #[tokio::test]
    async fn dropped_waiter_deregisters() {
        let m = SyncManager::default();
        let token = m.start_sync();
        {
            let wait = m.finish_sync(&token, Duration::from_secs(5));
            let _ = tokio::time::timeout(Duration::from_millis(10), wait).await;
        }
        assert!(!m.is_pending(&token));
    }

    #[tokio::test]
    async fn not_pending_token_finishes_immediately() {
        let m = SyncManager::default();
        assert!(m.finish_sync(&SyncToken::new(1, 1), Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn finished_tokens_expire_after_idle_window() {
        let m = manager(50);
        let token = m.start_sync();
        m.process_sync(&token);
        assert_eq!(m.finished_count(), 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!m.has_finish_sync(Some(&token)));
        assert_eq!(m.finished_count(), 0);
    }

    #[tokio::test]
    async fn sync_publishes_then_waits() {
        let m = Arc::new(SyncManager::default());
        let feeder = Arc::clone(&m);
        let ok: Result<bool, String> = m
            .sync(Duration::from_secs(1), |token| async move {
                tokio::spawn(async move {
                    feeder.process_sync(&token);
                });
                Ok(())
            })
            .await;
        assert_eq!(ok, Ok(true));

        let failed: Result<bool, String> = m
            .sync(Duration::from_secs(1), |_| async { Err("append failed".to_string()) })
            .await;
        assert_eq!(failed, Err("append failed".to_string()));
        assert_eq!(m.pending_count(), 0);
    }
}
