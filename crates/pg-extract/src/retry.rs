//! Bounded exponential-backoff retry around database calls.
//!
//! Every failed attempt discards the session it ran on, so the next attempt
//! reconnects from scratch. A heartbeat task reports liveness while an
//! attempt is in flight.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Result;
use crate::host::ExtractionHost;
use crate::source::{SourceConnector, SourceSession};

/// Progress message sent while a call is still running.
pub const HEARTBEAT_MESSAGE: &str = "Waiting for query to execute";

/// Attempt limit and backoff schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_tries: u32,
    /// Wait after the first failure.
    pub base_delay: Duration,
    /// Growth of the wait per further failure.
    pub factor: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_tries: 5,
            base_delay: Duration::from_secs(2),
            factor: 2.0,
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Wait after failed attempt number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.min(30) as i32 - 1;
        let millis = self.base_delay.as_millis() as f64 * self.factor.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

/// An open session plus whether the table cursor is declared on it.
pub struct ActiveSession {
    pub conn: Box<dyn SourceSession>,
    pub cursor_open: bool,
}

impl ActiveSession {
    pub fn new(conn: Box<dyn SourceSession>) -> Self {
        Self {
            conn,
            cursor_open: false,
        }
    }
}

/// Close and drop whatever session `slot` holds.
pub async fn release(slot: &mut Option<ActiveSession>) {
    if let Some(mut session) = slot.take() {
        session.conn.close().await;
    }
}

struct Heartbeat {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    fn start(host: Arc<dyn ExtractionHost>, period: Duration) -> Self {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => host.report_progress(None, None, HEARTBEAT_MESSAGE),
                }
            }
        });
        Self { token, handle }
    }

    async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            debug!("heartbeat task ended abnormally: {}", e);
        }
    }
}

/// Runs database calls with reconnect-and-retry semantics.
pub struct RetryableExecutor {
    policy: RetryPolicy,
    heartbeat_interval: Option<Duration>,
    connector: Arc<dyn SourceConnector>,
    host: Arc<dyn ExtractionHost>,
}

impl RetryableExecutor {
    pub fn new(
        policy: RetryPolicy,
        connector: Arc<dyn SourceConnector>,
        host: Arc<dyn ExtractionHost>,
    ) -> Self {
        Self {
            policy,
            heartbeat_interval: None,
            connector,
            host,
        }
    }

    /// Report [`HEARTBEAT_MESSAGE`] every `interval` while a call runs.
    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval).filter(|d| !d.is_zero());
        self
    }

    /// Run `call` on the session in `slot`, connecting first if it is empty.
    ///
    /// On failure the session is closed and `slot` emptied. Retryable errors
    /// are attempted again after the policy's delay; anything else, or the
    /// last failure once attempts run out, is returned unchanged.
    pub async fn run<T, F>(&self, op: &str, slot: &mut Option<ActiveSession>, mut call: F) -> Result<T>
    where
        F: for<'a> FnMut(&'a mut ActiveSession) -> BoxFuture<'a, Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let heartbeat = self
                .heartbeat_interval
                .map(|period| Heartbeat::start(Arc::clone(&self.host), period));
            let result = self.attempt(slot, &mut call).await;
            if let Some(heartbeat) = heartbeat {
                heartbeat.stop().await;
            }

            let err = match result {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            release(slot).await;

            if !err.is_retryable() || attempt >= self.policy.max_tries {
                return Err(err);
            }

            let delay = self.policy.delay_for_attempt(attempt);
            warn!(
                "{} failed (attempt {}/{}): {}. Retrying in {:?}",
                op, attempt, self.policy.max_tries, err, delay
            );
            self.host
                .log(&format!("{} failed, reconnecting: {}", op, err));
            tokio::time::sleep(delay).await;
        }
    }

    async fn attempt<T, F>(&self, slot: &mut Option<ActiveSession>, call: &mut F) -> Result<T>
    where
        F: for<'a> FnMut(&'a mut ActiveSession) -> BoxFuture<'a, Result<T>>,
    {
        let mut session = match slot.take() {
            Some(session) => session,
            None => {
                debug!("opening source session");
                ActiveSession::new(self.connector.connect().await?)
            }
        };
        let result = call(&mut session).await;
        *slot = Some(session);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{BatchId, Checkpoint};
    use crate::core::{SqlValue, TableRef};
    use crate::error::{DbErrorKind, ExtractError};
    use crate::key_strategy::IndexColumn;
    use crate::source::FetchedBatch;
    use async_trait::async_trait;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Counters {
        connects: AtomicUsize,
        closes: AtomicUsize,
        fail_connects: AtomicUsize,
    }

    struct TestConnector(Arc<Counters>);

    struct TestSession(Arc<Counters>);

    #[async_trait]
    impl SourceConnector for TestConnector {
        async fn connect(&self) -> Result<Box<dyn SourceSession>> {
            self.0.connects.fetch_add(1, Ordering::SeqCst);
            if self.0.fail_connects.load(Ordering::SeqCst) > 0 {
                self.0.fail_connects.fetch_sub(1, Ordering::SeqCst);
                return Err(ExtractError::db(DbErrorKind::Connection, "connection refused"));
            }
            Ok(Box::new(TestSession(Arc::clone(&self.0))))
        }

        fn database_name(&self) -> &str {
            "test"
        }

        fn user(&self) -> &str {
            "tester"
        }
    }

    #[async_trait]
    impl SourceSession for TestSession {
        async fn index_columns(&mut self, _table: &TableRef) -> Result<Vec<IndexColumn>> {
            Ok(Vec::new())
        }

        async fn first_column(&mut self, _table: &TableRef) -> Result<Option<String>> {
            Ok(None)
        }

        async fn query_scalar(&mut self, _sql: &str) -> Result<Option<SqlValue>> {
            Ok(None)
        }

        async fn execute(&mut self, _sql: &str) -> Result<()> {
            Ok(())
        }

        async fn fetch(&mut self, _sql: &str) -> Result<FetchedBatch> {
            Ok(FetchedBatch::default())
        }

        async fn close(&mut self) {
            self.0.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct CountingHost {
        progress: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ExtractionHost for CountingHost {
        fn log(&self, _message: &str) {}

        fn report_progress(&self, _current: Option<usize>, _total: Option<usize>, message: &str) {
            self.progress.lock().unwrap().push(message.to_string());
        }

        async fn persist_checkpoint(&self, _batch_id: BatchId, _checkpoint: &Checkpoint) -> Result<()> {
            Ok(())
        }
    }

    fn executor(counters: &Arc<Counters>, host: &Arc<CountingHost>) -> RetryableExecutor {
        RetryableExecutor::new(
            RetryPolicy::default(),
            Arc::new(TestConnector(Arc::clone(counters))),
            Arc::clone(host) as Arc<dyn ExtractionHost>,
        )
    }

    #[test]
    fn test_delay_grows_geometrically_and_caps() {
        let policy = RetryPolicy {
            max_tries: 10,
            base_delay: Duration::from_secs(2),
            factor: 2.0,
            max_delay: Duration::from_secs(10),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(50), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_reconnects_and_retries() {
        let counters = Arc::new(Counters::default());
        let host = Arc::new(CountingHost::default());
        let exec = executor(&counters, &host);
        let mut slot = None;
        let calls = AtomicUsize::new(0);

        let value = exec
            .run("fetch", &mut slot, |_session| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(ExtractError::db(DbErrorKind::Other, "server closed the connection"))
                    } else {
                        Ok(42)
                    }
                }
                .boxed()
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(counters.connects.load(Ordering::SeqCst), 2);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
        assert!(slot.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_return_original_error() {
        let counters = Arc::new(Counters::default());
        counters.fail_connects.store(100, Ordering::SeqCst);
        let host = Arc::new(CountingHost::default());
        let exec = executor(&counters, &host);
        let mut slot = None;

        let start = Instant::now();
        let err = exec
            .run("connect", &mut slot, |_session| async { Ok(()) }.boxed())
            .await
            .unwrap_err();

        assert_eq!(err.db_kind(), Some(DbErrorKind::Connection));
        assert!(err.to_string().contains("connection refused"));
        assert_eq!(counters.connects.load(Ordering::SeqCst), 5);
        assert!(slot.is_none());
        // 2 + 4 + 8 + 16 seconds of backoff between the five attempts.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(30));
        assert!(elapsed < Duration::from_secs(31));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_is_not_retried() {
        let counters = Arc::new(Counters::default());
        let host = Arc::new(CountingHost::default());
        let exec = executor(&counters, &host);
        let mut slot = None;

        let err = exec
            .run("metadata", &mut slot, |_session| {
                async { Err::<(), _>(ExtractError::db(DbErrorKind::UndefinedTable, "relation does not exist")) }
                    .boxed()
            })
            .await
            .unwrap_err();

        assert_eq!(err.db_kind(), Some(DbErrorKind::UndefinedTable));
        assert_eq!(counters.connects.load(Ordering::SeqCst), 1);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
        assert!(slot.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_reports_while_call_runs() {
        let counters = Arc::new(Counters::default());
        let host = Arc::new(CountingHost::default());
        let exec = executor(&counters, &host).with_heartbeat(Duration::from_secs(180));
        let mut slot = None;

        exec.run("fetch", &mut slot, |_session| {
            async {
                tokio::time::sleep(Duration::from_secs(400)).await;
                Ok(())
            }
            .boxed()
        })
        .await
        .unwrap();

        let progress = host.progress.lock().unwrap();
        assert_eq!(progress.len(), 2);
        assert!(progress.iter().all(|m| m == HEARTBEAT_MESSAGE));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_call_sends_no_heartbeat() {
        let counters = Arc::new(Counters::default());
        let host = Arc::new(CountingHost::default());
        let exec = executor(&counters, &host).with_heartbeat(Duration::from_secs(180));
        let mut slot = None;

        exec.run("fetch", &mut slot, |_session| async { Ok(()) }.boxed())
            .await
            .unwrap();

        assert!(host.progress.lock().unwrap().is_empty());
    }
}
