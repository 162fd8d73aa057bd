//! Concurrent command fan-out across many hosts.
//!
//! Every host gets its own task and its own connection. Commands for one host run
//! strictly in order on that connection; hosts never wait on each other. The call
//! returns once every host has finished, with exactly one entry per input host.
//!
//! # Main Components
//!
//! - [`run_fleet_commands`] - generic fan-out over telnet or SSH shell links
//! - [`send_shell_commands`] / [`send_lgw_commands`] - presets for ports 23 and 9528
//! - [`send_ssh_commands`] - fan-out over SSH exec channels
//! - [`run_steps`] - pre/post command lists of the transfer pipeline

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use log::{debug, info, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{self, ProtocolSettings};
use crate::error::EngineError;
use crate::lgw::{self, CommandFrame};
use crate::session::{ErrorCode, Payload, ResponseCodec, ResponseEnvelope, Session};
use crate::transport::{Link, SshExec, SshOptions};

pub use steps::{ShellStep, run_steps};

/// A device as handed over by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Host {
    pub ip: String,
    /// Used for LGW addressing.
    #[serde(default)]
    pub mac: String,
    #[serde(
        default,
        alias = "model-id",
        alias = "modelId",
        skip_serializing_if = "Option::is_none"
    )]
    pub model_id: Option<String>,
}

impl Host {
    pub fn new(ip: impl Into<String>, mac: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            mac: mac.into(),
            model_id: None,
        }
    }
}

/// One issued command and what came back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CommandResult {
    pub cmd: String,
    pub result: ResponseEnvelope,
}

/// Results of one host, in submission order.
pub type HostCommandResult = Vec<CommandResult>;

/// Results of a whole batch keyed by host ip.
pub type FleetResult = BTreeMap<String, HostCommandResult>;

/// Options applied uniformly to every host of a batch.
#[derive(Debug, Clone)]
pub struct FleetOptions {
    pub settings: ProtocolSettings,
    /// Per-command response window.
    pub timeout: Duration,
    /// Logical channels addressed by LGW templates carrying `target-id`.
    pub channels: Vec<u32>,
    /// Overrides the terminator from `settings`.
    pub expect: Option<String>,
    /// Commands not started within this bound, connection setup included, fail with
    /// [`ErrorCode::DeadlineExceeded`].
    pub deadline: Option<Duration>,
}

impl FleetOptions {
    pub fn shell() -> Self {
        Self::default()
    }

    pub fn lgw() -> Self {
        Self {
            settings: ProtocolSettings::lgw(),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_channels(mut self, channels: Vec<u32>) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Effective settings with the terminator override applied.
    fn effective_settings(&self) -> ProtocolSettings {
        match &self.expect {
            Some(expect) => self.settings.clone().with_expect(expect.clone()),
            None => self.settings.clone(),
        }
    }
}

impl Default for FleetOptions {
    fn default() -> Self {
        Self {
            settings: ProtocolSettings::os_shell(),
            timeout: Duration::from_secs(3),
            channels: vec![1],
            expect: None,
            deadline: None,
        }
    }
}

/// Runs `commands` on every host concurrently.
///
/// Under the LGW codec, templates are expanded per host and channel and every reply is
/// checked against its request.
pub async fn run_fleet_commands(
    hosts: &[Host],
    commands: &[String],
    port: u16,
    link: &Link,
    options: &FleetOptions,
) -> FleetResult {
    let settings = options.effective_settings();
    let deadline = options.deadline.map(|deadline| Instant::now() + deadline);
    info!(
        "fan-out of {} command(s) to {} host(s) on port {port}",
        commands.len(),
        hosts.len()
    );

    let tasks: Vec<_> = unique_hosts(hosts)
        .into_iter()
        .map(|host| {
            let (plan, handle) = match plan_commands(host, commands, &settings, &options.channels)
            {
                Ok(plan) => {
                    let job = HostJob {
                        ip: host.ip.clone(),
                        port,
                        link: link.clone(),
                        settings: settings.clone(),
                        timeout: options.timeout,
                        deadline,
                    };
                    (plan.clone(), tokio::spawn(job.run(plan)))
                }
                Err(err) => {
                    warn!("host ({}) not addressable: {err}", host.ip);
                    let plan = commands.to_vec();
                    let envelope = ResponseEnvelope::failure(
                        ErrorCode::ExpectMissing,
                        err.to_string(),
                        Payload::None,
                    );
                    let failed = fail_all(plan.clone(), envelope);
                    (plan, tokio::spawn(async move { failed }))
                }
            };
            (host.ip.clone(), plan, handle)
        })
        .collect();

    collect(tasks).await
}

/// Shell batch on port 23.
pub async fn send_shell_commands(
    hosts: &[Host],
    commands: &[String],
    timeout: Duration,
) -> FleetResult {
    let options = FleetOptions::shell().with_timeout(timeout);
    run_fleet_commands(hosts, commands, config::OS_SHELL_PORT, &Link::Telnet, &options).await
}

/// LGW batch on port 9528, one command per template and channel.
pub async fn send_lgw_commands(
    hosts: &[Host],
    templates: &[String],
    channels: &[u32],
    timeout: Duration,
) -> FleetResult {
    let options = FleetOptions::lgw()
        .with_timeout(timeout)
        .with_channels(channels.to_vec());
    run_fleet_commands(hosts, templates, config::LGW_PORT, &Link::Telnet, &options).await
}

/// Runs `commands` over SSH exec channels on every host concurrently.
pub async fn send_ssh_commands(
    hosts: &[Host],
    ssh: &SshOptions,
    commands: &[String],
    port: u16,
    timeout: Duration,
) -> FleetResult {
    let tasks: Vec<_> = unique_hosts(hosts)
        .into_iter()
        .map(|host| {
            let ip = host.ip.clone();
            let ssh = ssh.clone();
            let plan = commands.to_vec();
            let handle = tokio::spawn(ssh_host_commands(ip, ssh, port, timeout, plan.clone()));
            (host.ip.clone(), plan, handle)
        })
        .collect();

    collect(tasks).await
}

/// Hosts with at least one failed command.
pub fn failed_hosts(results: &FleetResult) -> Vec<String> {
    results
        .iter()
        .filter(|(_, commands)| commands.iter().any(|c| !c.result.ok))
        .map(|(ip, _)| ip.clone())
        .collect()
}

/// Hosts in input order, keeping the first occurrence of every ip.
fn unique_hosts(hosts: &[Host]) -> Vec<&Host> {
    let mut seen = BTreeSet::new();
    hosts
        .iter()
        .filter(|host| {
            let first = seen.insert(host.ip.as_str());
            if !first {
                warn!("host ({}) listed more than once, extra entry ignored", host.ip);
            }
            first
        })
        .collect()
}

fn plan_commands(
    host: &Host,
    commands: &[String],
    settings: &ProtocolSettings,
    channels: &[u32],
) -> Result<Vec<String>, EngineError> {
    if settings.codec == ResponseCodec::Lgw {
        lgw::expand_for_host(commands, &host.mac, channels)
    } else {
        Ok(commands.to_vec())
    }
}

fn fail_all(plan: Vec<String>, envelope: ResponseEnvelope) -> HostCommandResult {
    plan.into_iter()
        .map(|cmd| CommandResult {
            cmd,
            result: envelope.clone(),
        })
        .collect()
}

async fn collect(tasks: Vec<(String, Vec<String>, JoinHandle<HostCommandResult>)>) -> FleetResult {
    let mut fleet = FleetResult::new();
    for (ip, plan, handle) in tasks {
        let results = match handle.await {
            Ok(results) => results,
            Err(err) => {
                warn!("host ({ip}) task failed: {err}");
                let envelope = ResponseEnvelope::failure(
                    ErrorCode::Unexpected,
                    format!("host task failed: {err}"),
                    Payload::None,
                );
                fail_all(plan, envelope)
            }
        };
        fleet.insert(ip, results);
    }
    let failed = failed_hosts(&fleet);
    if !failed.is_empty() {
        info!("failed_hosts: {failed:?}");
    }
    fleet
}

/// Everything one host task needs, owned.
struct HostJob {
    ip: String,
    port: u16,
    link: Link,
    settings: ProtocolSettings,
    timeout: Duration,
    deadline: Option<Instant>,
}

impl HostJob {
    async fn run(self, plan: Vec<String>) -> HostCommandResult {
        let opening = Session::open(&self.link, &self.ip, self.port, self.settings);
        let opened = match self.deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, opening).await {
                Ok(opened) => opened,
                Err(_) => {
                    warn!("host ({}) batch deadline passed while connecting", self.ip);
                    return fail_all(plan, deadline_exceeded());
                }
            },
            None => opening.await,
        };
        let mut session = match opened {
            Ok(session) => session,
            Err(err) => {
                warn!("host ({}) {err}", self.ip);
                return fail_all(plan, ResponseEnvelope::cannot_connect(&self.ip));
            }
        };
        let lgw_codec = session.settings().codec == ResponseCodec::Lgw;

        let mut results = Vec::with_capacity(plan.len());
        for cmd in plan {
            let result = if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                deadline_exceeded()
            } else if lgw_codec {
                send_lgw(&mut session, &cmd, self.timeout).await
            } else {
                session.send(&cmd, self.timeout).await
            };
            info!("host ({}) run cmd ({cmd}): {}", self.ip, result.ok);
            results.push(CommandResult { cmd, result });
        }

        session.close().await;
        debug!("host ({}) sequence done", self.ip);
        results
    }
}

fn deadline_exceeded() -> ResponseEnvelope {
    ResponseEnvelope::failure(
        ErrorCode::DeadlineExceeded,
        "batch deadline passed before the command started",
        Payload::None,
    )
}

/// Sends one LGW command and correlates the reply with it.
async fn send_lgw(session: &mut Session, cmd: &str, timeout: Duration) -> ResponseEnvelope {
    match CommandFrame::parse(cmd) {
        Ok(frame) => {
            let envelope = session.send(cmd, timeout).await;
            lgw::check_response(&frame, envelope)
        }
        Err(err) => {
            warn!("refusing to send malformed lgw command {cmd:?}: {err}");
            ResponseEnvelope::failure(
                ErrorCode::ExpectMissing,
                format!("malformed lgw command: {err}"),
                Payload::None,
            )
        }
    }
}

async fn ssh_host_commands(
    ip: String,
    ssh: SshOptions,
    port: u16,
    timeout: Duration,
    plan: Vec<String>,
) -> HostCommandResult {
    let mut exec = SshExec::new(ssh);
    if let Err(err) = exec.connect(&ip, port, Duration::from_secs(10)).await {
        warn!("host ({ip}) {err}");
        return fail_all(plan, ResponseEnvelope::cannot_connect(&ip));
    }
    let mut results = Vec::with_capacity(plan.len());
    for cmd in plan {
        let result = exec.execute(&cmd, timeout).await;
        info!("host ({ip}) run cmd ({cmd}): {}", result.ok);
        results.push(CommandResult { cmd, result });
    }
    exec.close().await;
    results
}

mod steps;
