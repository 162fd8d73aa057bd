use super::*;

use crate::retry::{RetryPolicy, retry};
use crate::transport::CommandRunner;

const STEP_BACKOFF: Duration = Duration::from_millis(100);

fn default_retry() -> u32 {
    2
}

fn default_timeout_sec() -> f64 {
    10.0
}

/// A pre- or post-transfer shell command as written in the transfer config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ShellStep {
    pub cmd: String,
    /// Extra attempts after the first failure.
    #[serde(default = "default_retry")]
    pub retry: u32,
    #[serde(default = "default_timeout_sec")]
    pub timeout_sec: f64,
    /// Read the command output only up to this separator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readuntil: Option<String>,
    /// Pause after the command completes.
    #[serde(default)]
    pub waiting_sec: f64,
}

impl ShellStep {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            retry: default_retry(),
            timeout_sec: default_timeout_sec(),
            readuntil: None,
            waiting_sec: 0.0,
        }
    }

    pub fn timeout(&self) -> Duration {
        seconds(self.timeout_sec, Duration::from_secs(10))
    }

    pub fn waiting(&self) -> Duration {
        seconds(self.waiting_sec, Duration::ZERO)
    }
}

/// Negative or non-finite values fall back to `default`.
fn seconds(value: f64, default: Duration) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(default)
}

/// Runs `steps` in order, retrying each one on its own budget.
///
/// A failed step does not stop the list. Returns whether every step succeeded and
/// the commands that did not.
pub async fn run_steps<R>(runner: &R, steps: &[ShellStep]) -> (bool, Vec<String>)
where
    R: CommandRunner + ?Sized,
{
    let mut failed = Vec::new();
    for step in steps {
        let policy = RetryPolicy::attempts(step.retry, STEP_BACKOFF);
        let description = format!("{step:?}");
        let timeout = step.timeout();
        let waiting = step.waiting();
        let (ok, out) = retry(policy, &description, || {
            runner.run_cmd(&step.cmd, timeout, step.readuntil.as_deref(), waiting)
        })
        .await;

        if ok {
            info!("run cmd ({}): {ok}", step.cmd);
        } else {
            warn!("run cmd ({}): {ok}, out: {out}", step.cmd);
            failed.push(step.cmd.clone());
        }
    }
    (failed.is_empty(), failed)
}
