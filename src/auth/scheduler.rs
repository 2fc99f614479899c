// Refresh loop: priming, steady-state refresh and wake scheduling

use std::time::Duration;

use super::credentials::CredentialStore;
use super::refresh::{acquire_token, RetryPolicy};
use super::types::Scope;
use crate::error::Result;
use crate::metadata::MetadataSource;

/// Lifecycle of the refresh loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Nothing written yet; the first acquisition must not retry
    Priming,

    /// Cookie file is live and refreshed forever
    Steady,
}

/// Wake time for the next refresh (Unix seconds)
///
/// `margin` before expiry, but never sooner than `retry_interval` from `now`.
pub fn next_wake(expires_at: i64, now: i64, margin: Duration, retry_interval: Duration) -> i64 {
    let early = expires_at.saturating_sub(secs(margin));
    early.max(now.saturating_add(secs(retry_interval)))
}

fn secs(duration: Duration) -> i64 {
    i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Keeps the cookie file populated with a token that has not expired
pub struct RefreshScheduler<M> {
    /// Token source
    metadata: M,

    /// Scope chosen at startup
    scope: Scope,

    /// Where the cookie lands
    store: CredentialStore,

    /// Cookie domains written on every cycle
    domains: Vec<String>,

    /// How long before expiry to refresh
    refresh_margin: Duration,

    /// Pause between failed attempts; also the minimum sleep
    retry_interval: Duration,

    state: SchedulerState,

    /// Expiry of the token currently on disk
    expires_at: Option<i64>,

    clock: fn() -> i64,
}

impl<M: MetadataSource> RefreshScheduler<M> {
    pub fn new(
        metadata: M,
        scope: Scope,
        store: CredentialStore,
        domains: Vec<String>,
        refresh_margin: Duration,
        retry_interval: Duration,
    ) -> Self {
        Self {
            metadata,
            scope,
            store,
            domains,
            refresh_margin,
            retry_interval,
            state: SchedulerState::Priming,
            expires_at: None,
            clock: unix_now,
        }
    }

    /// Start in Steady with a cookie already written by another process
    ///
    /// Used by the detached child, which inherits a primed cookie from its
    /// parent and must never run the fail-fast acquisition again.
    pub fn resume_at(mut self, expires_at: i64) -> Self {
        self.state = SchedulerState::Steady;
        self.expires_at = Some(expires_at);
        self
    }

    /// Replace the wall clock (Unix seconds)
    pub fn with_clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn expires_at(&self) -> Option<i64> {
        self.expires_at
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    /// First acquisition and write; any failure is fatal to the caller
    pub async fn prime(&mut self) -> Result<i64> {
        if self.state == SchedulerState::Steady {
            if let Some(expires_at) = self.expires_at {
                return Ok(expires_at);
            }
        }

        let token = acquire_token(&self.metadata, &self.scope, RetryPolicy::FailFast).await?;
        let expires_at = self.store.write(&token, &self.domains, (self.clock)())?;
        self.record(expires_at);
        self.state = SchedulerState::Steady;
        Ok(expires_at)
    }

    /// One steady-state cycle: acquire with retry, then persist
    ///
    /// Write failures are retried after the retry interval like network errors.
    pub async fn refresh(&mut self) -> i64 {
        loop {
            match self.acquire_and_write().await {
                Ok(expires_at) => {
                    self.record(expires_at);
                    return expires_at;
                }
                Err(e) => {
                    tracing::debug!("Cookie refresh failed, retrying: {}", e);
                    tokio::time::sleep(self.retry_interval).await;
                }
            }
        }
    }

    async fn acquire_and_write(&self) -> Result<i64> {
        let retry = RetryPolicy::Forever {
            interval: self.retry_interval,
        };
        let token = acquire_token(&self.metadata, &self.scope, retry).await?;
        self.store.write(&token, &self.domains, (self.clock)())
    }

    /// Run forever; only returns if priming fails
    pub async fn run(&mut self) -> Result<()> {
        if self.state == SchedulerState::Priming {
            self.prime().await?;
        }

        loop {
            let now = (self.clock)();
            let expires_at = self.expires_at.unwrap_or(now);
            let wake = next_wake(expires_at, now, self.refresh_margin, self.retry_interval);
            let delay = Duration::from_secs(wake.saturating_sub(now).max(0) as u64);

            tracing::debug!("Next refresh in {}s (at {})", delay.as_secs(), wake);
            tokio::time::sleep(delay).await;

            self.refresh().await;
        }
    }

    fn record(&mut self, expires_at: i64) {
        self.expires_at = Some(expires_at);
        tracing::info!(
            "Cookie refreshed, expires: {}",
            chrono::DateTime::from_timestamp(expires_at, 0)
                .map(|dt| dt.to_rfc3339())
                .unwrap_or_else(|| expires_at.to_string())
        );
        tracing::debug!(
            "Cookie file: {}, expires at {}",
            self.store.path().display(),
            expires_at
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DaemonError;
    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    /// Serves scripted token responses in order, then repeats the last one
    #[derive(Clone)]
    struct Scripted {
        responses: Arc<Mutex<VecDeque<Result<String>>>>,
        last: Arc<Mutex<String>>,
        calls: Arc<Mutex<usize>>,
    }

    impl Scripted {
        fn new(responses: Vec<Result<String>>) -> Self {
            Self {
                responses: Arc::new(Mutex::new(responses.into())),
                last: Arc::new(Mutex::new(String::new())),
                calls: Arc::new(Mutex::new(0)),
            }
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl MetadataSource for Scripted {
        async fn get_with_query(&self, _path: &str, _query: &[(&str, &str)]) -> Result<String> {
            *self.calls.lock().unwrap() += 1;
            match self.responses.lock().unwrap().pop_front() {
                Some(Ok(body)) => {
                    *self.last.lock().unwrap() = body.clone();
                    Ok(body)
                }
                Some(Err(e)) => Err(e),
                None => Ok(self.last.lock().unwrap().clone()),
            }
        }
    }

    fn token_body(value: &str, expires_in: i64) -> Result<String> {
        Ok(format!(
            r#"{{"access_token":"{}","expires_in":{}}}"#,
            value, expires_in
        ))
    }

    fn down() -> Result<String> {
        Err(DaemonError::TransientNetwork("metadata down".into()))
    }

    fn fixed_clock() -> i64 {
        1000
    }

    fn scheduler(source: Scripted, store: CredentialStore) -> RefreshScheduler<Scripted> {
        RefreshScheduler::new(
            source,
            Scope::new("https://www.googleapis.com/auth/source.read_only"),
            store,
            vec![".googlesource.com".to_string()],
            Duration::from_secs(25),
            Duration::from_secs(5),
        )
        .with_clock(fixed_clock)
    }

    #[test]
    fn test_next_wake_example() {
        let wake = next_wake(1000 + 3600, 1000, Duration::from_secs(25), Duration::from_secs(5));
        assert_eq!(wake, 4575);
    }

    #[test]
    fn test_next_wake_clamps_short_tokens() {
        let wake = next_wake(1010, 1000, Duration::from_secs(25), Duration::from_secs(5));
        assert_eq!(wake, 1005);
    }

    #[test]
    fn test_next_wake_extreme_expiry_does_not_overflow() {
        let wake = next_wake(i64::MAX, 1000, Duration::from_secs(25), Duration::from_secs(5));
        assert_eq!(wake, i64::MAX - 25);

        let wake = next_wake(i64::MIN, i64::MAX, Duration::from_secs(25), Duration::from_secs(5));
        assert_eq!(wake, i64::MAX);

        let wake = next_wake(1000, 1000, Duration::from_secs(u64::MAX), Duration::from_secs(5));
        assert_eq!(wake, 1005);
    }

    proptest! {
        #[test]
        fn prop_next_wake(
            acquired_at in 0i64..4_000_000_000,
            expires_in in 1i64..100_000,
            margin in 0u64..600,
            retry in 1u64..120,
        ) {
            let wake = next_wake(
                acquired_at + expires_in,
                acquired_at,
                Duration::from_secs(margin),
                Duration::from_secs(retry),
            );
            let expected = (acquired_at + expires_in - margin as i64).max(acquired_at + retry as i64);
            prop_assert_eq!(wake, expected);
            prop_assert!(wake >= acquired_at + retry as i64);
        }
    }

    #[tokio::test]
    async fn test_prime_writes_and_enters_steady() {
        let dir = tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("cookie"));
        let mut scheduler = scheduler(Scripted::new(vec![token_body("abc", 3600)]), store);

        assert_eq!(scheduler.state(), SchedulerState::Priming);
        let expires_at = scheduler.prime().await.unwrap();

        assert_eq!(expires_at, 4600);
        assert_eq!(scheduler.state(), SchedulerState::Steady);
        assert_eq!(scheduler.expires_at(), Some(4600));
        let contents = std::fs::read_to_string(scheduler.store().path()).unwrap();
        assert!(contents.contains("\t4600\to\tabc\n"));
    }

    #[tokio::test]
    async fn test_prime_does_not_retry() {
        let dir = tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("cookie"));
        let source = Scripted::new(vec![down(), token_body("abc", 3600)]);
        let mut scheduler = scheduler(source.clone(), store);

        let err = scheduler.prime().await.unwrap_err();

        assert!(err.is_transient());
        assert_eq!(source.calls(), 1);
        assert_eq!(scheduler.state(), SchedulerState::Priming);
        assert!(!scheduler.store().path().exists());
    }

    #[tokio::test]
    async fn test_run_propagates_priming_failure() {
        let dir = tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("cookie"));
        let mut scheduler = scheduler(Scripted::new(vec![down()]), store);

        assert!(scheduler.run().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_retries_through_outage() {
        let dir = tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("cookie"));
        let source = Scripted::new(vec![
            token_body("first", 3600),
            down(),
            down(),
            token_body("second", 3600),
        ]);
        let mut scheduler = scheduler(source.clone(), store);
        scheduler.prime().await.unwrap();

        let started = tokio::time::Instant::now();
        let expires_at = scheduler.refresh().await;

        assert_eq!(expires_at, 4600);
        assert_eq!(source.calls(), 4);
        assert!(started.elapsed() >= Duration::from_secs(10));
        let contents = std::fs::read_to_string(scheduler.store().path()).unwrap();
        assert!(contents.contains("second"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_sleeps_until_margin_before_expiry() {
        let dir = tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("cookie"));
        let source = Scripted::new(vec![token_body("first", 60), token_body("second", 60)]);
        let mut scheduler = scheduler(source.clone(), store);
        scheduler.prime().await.unwrap();

        // Wake is 60 - 25 = 35s out; nothing happens before that
        let early = tokio::time::timeout(Duration::from_secs(34), scheduler.run()).await;
        assert!(early.is_err());
        assert_eq!(source.calls(), 1);

        let late = tokio::time::timeout(Duration::from_secs(36), scheduler.run()).await;
        assert!(late.is_err());
        assert_eq!(source.calls(), 2);
        let contents = std::fs::read_to_string(scheduler.store().path()).unwrap();
        assert!(contents.contains("second"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_lived_token_does_not_spin() {
        let dir = tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("cookie"));
        let source = Scripted::new(vec![token_body("tiny", 1)]);
        let mut scheduler = scheduler(source.clone(), store);
        scheduler.prime().await.unwrap();

        let _ = tokio::time::timeout(Duration::from_secs(50), scheduler.run()).await;

        // One refresh every retry interval at most
        assert!(source.calls() <= 1 + 10);
        assert!(source.calls() >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_retries_failed_write() {
        let dir = tempdir().unwrap();
        // A file where the cookie directory should be makes every write fail
        let blocker = dir.path().join("cache");
        std::fs::write(&blocker, "not a directory").unwrap();
        let store = CredentialStore::new(blocker.join("cookie"));
        let source = Scripted::new(vec![token_body("abc", 3600)]);
        let mut scheduler = scheduler(source.clone(), store);

        let (expires_at, _) = tokio::join!(scheduler.refresh(), async {
            tokio::time::sleep(Duration::from_secs(7)).await;
            std::fs::remove_file(&blocker).unwrap();
        });

        assert_eq!(expires_at, 4600);
        assert_eq!(source.calls(), 3);
        assert!(scheduler.store().path().exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resumed_scheduler_skips_priming() {
        let dir = tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("cookie"));
        let source = Scripted::new(vec![down(), down(), token_body("fresh", 3600)]);
        let mut scheduler = scheduler(source.clone(), store).resume_at(1060);

        assert_eq!(scheduler.state(), SchedulerState::Steady);
        assert_eq!(scheduler.prime().await.unwrap(), 1060);
        assert_eq!(source.calls(), 0);

        // Wake at 1060 - 25; failures in the first cycle are retried, never fatal
        let _ = tokio::time::timeout(Duration::from_secs(34), scheduler.run()).await;
        assert_eq!(source.calls(), 0);

        let _ = tokio::time::timeout(Duration::from_secs(50), scheduler.run()).await;
        assert_eq!(source.calls(), 3);
        let contents = std::fs::read_to_string(scheduler.store().path()).unwrap();
        assert!(contents.contains("fresh"));
    }
}
