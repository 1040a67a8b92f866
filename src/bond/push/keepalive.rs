//! Keepalive scheduler for BPUP sessions.
//!
//! The bridge drops a push subscription after a period of silence from the
//! client, so an active session sends a one-byte probe on a fixed period.
//! A failed probe is retried with a doubling delay until a total retry
//! budget is spent, at which point the session is shut down.

use super::PROBE;
use super::observer::SessionObserver;
use super::signal::{ShutdownReason, ShutdownSignal};
use async_trait::async_trait;
use log::{debug, error, info, trace, warn};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

/// Timing of keepalive probes and their retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepalivePolicy {
    /// Time between the end of one probe and the start of the next.
    pub period: Duration,
    /// Delay before the first retry; doubles after every failure.
    pub initial_backoff: Duration,
    /// Total time a retry sequence may spend waiting before giving up.
    pub retry_budget: Duration,
}

impl Default for KeepalivePolicy {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(60),
            initial_backoff: Duration::from_secs(1),
            retry_budget: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Error)]
pub enum KeepaliveError {
    #[error(
        "keepalive failed {attempts} times in {elapsed:?} (retry budget {budget:?}): {last_error}"
    )]
    RetryBudgetExhausted {
        budget: Duration,
        elapsed: Duration,
        attempts: u32,
        #[source]
        last_error: io::Error,
    },
}

/// Something a keepalive probe can be written to.
#[async_trait]
pub trait ProbeTransport: Send + Sync {
    async fn send_probe(&self) -> io::Result<()>;
}

#[async_trait]
impl ProbeTransport for UdpSocket {
    async fn send_probe(&self) -> io::Result<()> {
        let sent = self.send(PROBE).await?;
        if sent != PROBE.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "keepalive probe was not fully sent",
            ));
        }
        Ok(())
    }
}

/// Delay bookkeeping for one retry sequence.
#[derive(Debug, Clone)]
pub struct Backoff {
    delay: Duration,
    elapsed: Duration,
    budget: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(policy: &KeepalivePolicy) -> Self {
        Self {
            // A zero delay would never use up the budget.
            delay: policy.initial_backoff.max(Duration::from_millis(1)),
            elapsed: Duration::ZERO,
            budget: policy.retry_budget,
            failures: 0,
        }
    }

    /// Record a failed attempt and return how long to wait before the next
    /// one, or `None` if that wait would take the sequence past its budget.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.failures += 1;
        let delay = self.delay;
        let elapsed = self.elapsed.checked_add(delay)?;
        if elapsed > self.budget {
            return None;
        }
        self.elapsed = elapsed;
        self.delay = delay.saturating_mul(2);
        Some(delay)
    }

    /// Failed attempts recorded so far.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Time spent waiting between attempts so far.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }
}

enum Probe {
    Delivered,
    Cancelled,
}

/// Run the keepalive loop until the signal is raised (`Ok`) or a retry
/// sequence exhausts its budget (`Err`).
pub async fn run<T>(
    transport: &T,
    policy: &KeepalivePolicy,
    signal: &ShutdownSignal,
    observer: &dyn SessionObserver,
) -> Result<(), KeepaliveError>
where
    T: ProbeTransport + ?Sized,
{
    loop {
        tokio::select! {
            biased;
            _ = signal.cancelled() => return Ok(()),
            _ = tokio::time::sleep(policy.period) => {}
        }

        match probe_with_retry(transport, policy, signal, observer).await? {
            Probe::Delivered => trace!("[BPUP] Keepalive sent"),
            Probe::Cancelled => return Ok(()),
        }
    }
}

async fn probe_with_retry<T>(
    transport: &T,
    policy: &KeepalivePolicy,
    signal: &ShutdownSignal,
    observer: &dyn SessionObserver,
) -> Result<Probe, KeepaliveError>
where
    T: ProbeTransport + ?Sized,
{
    let mut backoff = Backoff::new(policy);

    loop {
        if signal.is_raised() {
            return Ok(Probe::Cancelled);
        }

        let error = match transport.send_probe().await {
            Ok(()) => {
                if backoff.failures() > 0 {
                    info!(
                        "[BPUP] Keepalive recovered after {} failed attempts",
                        backoff.failures()
                    );
                    observer.keepalive_recovered(backoff.failures());
                }
                return Ok(Probe::Delivered);
            }
            Err(e) => e,
        };

        let Some(delay) = backoff.next_delay() else {
            warn!(
                "[BPUP] Not retrying failed keepalive since {:?} have elapsed",
                backoff.elapsed()
            );
            return Err(KeepaliveError::RetryBudgetExhausted {
                budget: policy.retry_budget,
                elapsed: backoff.elapsed(),
                attempts: backoff.failures(),
                last_error: error,
            });
        };

        warn!(
            "[BPUP] Retrying failed keepalive after {:?}; failure was: {}",
            delay, error
        );
        observer.keepalive_retry(backoff.failures(), delay, &error);

        tokio::select! {
            biased;
            _ = signal.cancelled() => {
                warn!("[BPUP] Canceling keepalive retry loop");
                return Ok(Probe::Cancelled);
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Spawn the keepalive loop as a background task.
///
/// When the retry budget runs out the task raises `signal` with
/// [`ShutdownReason::KeepaliveFailed`]; a normal stop leaves the signal alone.
pub fn spawn<T>(
    transport: Arc<T>,
    policy: KeepalivePolicy,
    signal: ShutdownSignal,
    observer: Arc<dyn SessionObserver>,
) -> JoinHandle<()>
where
    T: ProbeTransport + ?Sized + 'static,
{
    tokio::spawn(async move {
        match run(transport.as_ref(), &policy, &signal, observer.as_ref()).await {
            Ok(()) => debug!("[BPUP] Keepalive task stopped"),
            Err(err) => {
                error!("[BPUP] Keepalive failed, closing push session: {}", err);
                observer.keepalive_failed(&err);
                signal.raise(ShutdownReason::KeepaliveFailed(Arc::new(err)));
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bond::push::observer::NoopObserver;
    use parking_lot::Mutex;
    use tokio::time::Instant;

    /// Transport that fails a fixed number of times, then succeeds.
    struct FlakyTransport {
        failures_left: Mutex<u32>,
        attempts: Mutex<Vec<Instant>>,
    }

    impl FlakyTransport {
        fn failing(times: u32) -> Self {
            Self {
                failures_left: Mutex::new(times),
                attempts: Mutex::new(Vec::new()),
            }
        }

        fn always_failing() -> Self {
            Self::failing(u32::MAX)
        }

        /// Whole seconds from `start` to each attempt.
        fn attempt_offsets(&self, start: Instant) -> Vec<u64> {
            self.attempts
                .lock()
                .iter()
                .map(|at| (*at - start).as_secs())
                .collect()
        }
    }

    #[async_trait]
    impl ProbeTransport for FlakyTransport {
        async fn send_probe(&self) -> io::Result<()> {
            self.attempts.lock().push(Instant::now());
            let mut left = self.failures_left.lock();
            if *left > 0 {
                *left = left.saturating_sub(1);
                return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        retries: Mutex<Vec<(u32, Duration)>>,
        recovered: Mutex<Vec<u32>>,
        failed: Mutex<u32>,
    }

    impl SessionObserver for RecordingObserver {
        fn keepalive_retry(&self, attempt: u32, delay: Duration, _error: &io::Error) {
            self.retries.lock().push((attempt, delay));
        }

        fn keepalive_recovered(&self, failures: u32) {
            self.recovered.lock().push(failures);
        }

        fn keepalive_failed(&self, _error: &KeepaliveError) {
            *self.failed.lock() += 1;
        }
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    /// Log records tagged with the thread that emitted them, so a test on a
    /// current-thread runtime only counts its own records.
    static CAPTURED: Mutex<Vec<(std::thread::ThreadId, log::Level, String)>> =
        Mutex::new(Vec::new());

    struct CaptureLogger;

    impl log::Log for CaptureLogger {
        fn enabled(&self, metadata: &log::Metadata) -> bool {
            metadata.level() <= log::Level::Warn
        }

        fn log(&self, record: &log::Record) {
            if self.enabled(record.metadata()) {
                CAPTURED.lock().push((
                    std::thread::current().id(),
                    record.level(),
                    record.args().to_string(),
                ));
            }
        }

        fn flush(&self) {}
    }

    fn capture_logs() {
        static LOGGER: CaptureLogger = CaptureLogger;
        if log::set_logger(&LOGGER).is_ok() {
            log::set_max_level(log::LevelFilter::Warn);
        }
        let me = std::thread::current().id();
        CAPTURED.lock().retain(|(thread, _, _)| *thread != me);
    }

    fn logged_here(level: log::Level) -> Vec<String> {
        let me = std::thread::current().id();
        CAPTURED
            .lock()
            .iter()
            .filter(|(thread, lvl, _)| *thread == me && *lvl == level)
            .map(|(_, _, message)| message.clone())
            .collect()
    }

    #[test]
    fn test_backoff_doubles_until_budget() {
        let mut backoff = Backoff::new(&KeepalivePolicy::default());
        let mut delays = Vec::new();
        while let Some(delay) = backoff.next_delay() {
            delays.push(delay);
        }

        assert_eq!(delays, [1, 2, 4, 8, 16, 32].map(secs));
        assert_eq!(backoff.elapsed(), secs(63));
        assert_eq!(backoff.failures(), 7);
    }

    #[test]
    fn test_backoff_allows_delay_that_exactly_meets_budget() {
        let policy = KeepalivePolicy {
            retry_budget: secs(63),
            ..Default::default()
        };
        let mut backoff = Backoff::new(&policy);
        let count = std::iter::from_fn(|| backoff.next_delay()).count();
        assert_eq!(count, 6);

        let policy = KeepalivePolicy {
            retry_budget: secs(62),
            ..Default::default()
        };
        let mut backoff = Backoff::new(&policy);
        let count = std::iter::from_fn(|| backoff.next_delay()).count();
        assert_eq!(count, 5);
    }

    #[test]
    fn test_backoff_zero_initial_delay_still_terminates() {
        let policy = KeepalivePolicy {
            initial_backoff: Duration::ZERO,
            retry_budget: Duration::from_millis(100),
            ..Default::default()
        };
        let mut backoff = Backoff::new(&policy);
        let count = std::iter::from_fn(|| backoff.next_delay()).count();
        assert_eq!(count, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_budget_is_fatal() {
        let transport = FlakyTransport::always_failing();
        let signal = ShutdownSignal::new();
        let start = Instant::now();

        let result = run(
            &transport,
            &KeepalivePolicy::default(),
            &signal,
            &NoopObserver,
        )
        .await;

        match result {
            Err(KeepaliveError::RetryBudgetExhausted {
                attempts, elapsed, ..
            }) => {
                assert_eq!(attempts, 7);
                assert_eq!(elapsed, secs(63));
            }
            Ok(()) => panic!("expected keepalive to fail"),
        }
        assert_eq!(
            transport.attempt_offsets(start),
            vec![60, 61, 63, 67, 75, 91, 123]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_resets_backoff() {
        let transport = Arc::new(FlakyTransport::failing(3));
        let observer = Arc::new(RecordingObserver::default());
        let signal = ShutdownSignal::new();
        let start = Instant::now();

        let handle = spawn(
            transport.clone(),
            KeepalivePolicy::default(),
            signal.clone(),
            observer.clone(),
        );

        tokio::time::sleep(secs(130)).await;
        signal.raise(ShutdownReason::Stopped);
        handle.await.unwrap();

        assert_eq!(transport.attempt_offsets(start), vec![60, 61, 63, 67, 127]);
        assert_eq!(
            *observer.retries.lock(),
            vec![(1, secs(1)), (2, secs(2)), (3, secs(4))]
        );
        assert_eq!(*observer.recovered.lock(), vec![3]);
        assert_eq!(*observer.failed.lock(), 0);
        assert!(!signal.reason().unwrap().is_failure());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_retry_wait_is_not_fatal() {
        let transport = Arc::new(FlakyTransport::always_failing());
        let observer = Arc::new(RecordingObserver::default());
        let signal = ShutdownSignal::new();

        let handle = spawn(
            transport.clone(),
            KeepalivePolicy::default(),
            signal.clone(),
            observer.clone(),
        );

        // First probe fails at 60s, the retry at 61s; the next wait ends at 63s.
        tokio::time::sleep(secs(62)).await;
        assert_eq!(transport.attempts.lock().len(), 2);

        signal.raise(ShutdownReason::Stopped);
        tokio::time::timeout(Duration::from_millis(10), handle)
            .await
            .expect("keepalive task did not stop")
            .unwrap();

        assert_eq!(transport.attempts.lock().len(), 2);
        assert_eq!(*observer.failed.lock(), 0);
        assert!(!signal.reason().unwrap().is_failure());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_failure_raises_signal() {
        let observer = Arc::new(RecordingObserver::default());
        let signal = ShutdownSignal::new();

        let handle = spawn(
            Arc::new(FlakyTransport::always_failing()),
            KeepalivePolicy::default(),
            signal.clone(),
            observer.clone(),
        );

        let reason = signal.raised().await;
        handle.await.unwrap();

        match reason {
            ShutdownReason::KeepaliveFailed(err) => {
                assert!(err.to_string().contains("7 times"));
            }
            ShutdownReason::Stopped => panic!("expected a keepalive failure"),
        }
        assert_eq!(*observer.failed.lock(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_is_logged_as_error_once() {
        capture_logs();
        let signal = ShutdownSignal::new();

        spawn(
            Arc::new(FlakyTransport::always_failing()),
            KeepalivePolicy::default(),
            signal.clone(),
            Arc::new(NoopObserver),
        )
        .await
        .unwrap();

        assert!(signal.reason().unwrap().is_failure());
        let errors = logged_here(log::Level::Error);
        assert_eq!(errors.len(), 1, "errors logged: {:?}", errors);
        assert!(errors[0].contains("Keepalive failed"));
        // Six retries plus the give-up notice.
        assert_eq!(logged_here(log::Level::Warn).len(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_first_tick_sends_nothing() {
        let transport = FlakyTransport::failing(0);
        let signal = ShutdownSignal::new();
        signal.raise(ShutdownReason::Stopped);

        tokio_test::assert_ok!(
            run(
                &transport,
                &KeepalivePolicy::default(),
                &signal,
                &NoopObserver,
            )
            .await
        );
        assert!(transport.attempts.lock().is_empty());
    }
}
