//! Bounded and deadline retry strategies.
//!
//! Both strategies wrap an operation returning `(ok, value)` and hand back the last
//! attempt's pair. Invocations never overlap: the next attempt starts only after the
//! previous one resolved and the backoff elapsed.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use log::warn;

/// How often, or for how long, an operation is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Run `1 + retries` attempts at most.
    Attempts { retries: u32, backoff: Duration },
    /// Keep trying until `timeout` has elapsed since the first attempt.
    Deadline { timeout: Duration, backoff: Duration },
}

impl RetryPolicy {
    pub fn attempts(retries: u32, backoff: Duration) -> Self {
        RetryPolicy::Attempts { retries, backoff }
    }

    pub fn deadline(timeout: Duration, backoff: Duration) -> Self {
        RetryPolicy::Deadline { timeout, backoff }
    }

    fn backoff(&self) -> Duration {
        match self {
            RetryPolicy::Attempts { backoff, .. } | RetryPolicy::Deadline { backoff, .. } => {
                *backoff
            }
        }
    }
}

impl Default for RetryPolicy {
    /// Two retries, 100 ms apart (SSH pre/post commands).
    fn default() -> Self {
        RetryPolicy::Attempts {
            retries: 2,
            backoff: Duration::from_millis(100),
        }
    }
}

/// Tracks whether another attempt is allowed.
struct Budget {
    policy: RetryPolicy,
    attempt: u32,
    started: std::time::Instant,
}

impl Budget {
    fn new(policy: RetryPolicy, started: std::time::Instant) -> Self {
        Self {
            policy,
            attempt: 0,
            started,
        }
    }

    /// Settles one attempt. Returns the pause before the next one, or `None` when the
    /// attempt succeeded or the policy is exhausted.
    fn retry_after(
        &mut self,
        ok: bool,
        now: std::time::Instant,
        description: &str,
    ) -> Option<Duration> {
        if ok {
            return None;
        }
        let attempt = self.attempt;
        self.attempt += 1;
        let again = match self.policy {
            RetryPolicy::Attempts { retries, .. } => attempt < retries,
            RetryPolicy::Deadline { timeout, .. } => {
                now.duration_since(self.started) + self.policy.backoff() < timeout
            }
        };
        if !again {
            return None;
        }
        warn!("retry function {attempt}: {description}");
        Some(self.policy.backoff())
    }
}

fn tokio_now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

/// Retries an async operation on the current task.
pub async fn retry<F, Fut, T>(policy: RetryPolicy, description: &str, mut op: F) -> (bool, T)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = (bool, T)>,
{
    let mut budget = Budget::new(policy, tokio_now());
    loop {
        let (ok, out) = op().await;
        match budget.retry_after(ok, tokio_now(), description) {
            Some(backoff) => tokio::time::sleep(backoff).await,
            None => return (ok, out),
        }
    }
}

/// Future returned by an operation that borrows retry state for one attempt.
pub type Attempt<'a, T> = Pin<Box<dyn Future<Output = (bool, T)> + Send + 'a>>;

/// Like [`retry`], lending `state` mutably to each attempt in turn.
pub async fn retry_with<S, F, T>(
    policy: RetryPolicy,
    description: &str,
    state: &mut S,
    mut op: F,
) -> (bool, T)
where
    S: ?Sized,
    F: for<'a> FnMut(&'a mut S) -> Attempt<'a, T>,
{
    let mut budget = Budget::new(policy, tokio_now());
    loop {
        let (ok, out) = op(state).await;
        match budget.retry_after(ok, tokio_now(), description) {
            Some(backoff) => tokio::time::sleep(backoff).await,
            None => return (ok, out),
        }
    }
}

/// Retries a blocking operation on the calling thread.
pub fn retry_blocking<F, T>(policy: RetryPolicy, description: &str, mut op: F) -> (bool, T)
where
    F: FnMut() -> (bool, T),
{
    let mut budget = Budget::new(policy, std::time::Instant::now());
    loop {
        let (ok, out) = op();
        match budget.retry_after(ok, std::time::Instant::now(), description) {
            Some(backoff) => std::thread::sleep(backoff),
            None => return (ok, out),
        }
    }
}
