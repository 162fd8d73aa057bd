//! Byte-stream transports.
//!
//! Every transport honours the same contract: one connection handle at a time, reads
//! bounded by a timeout, best-effort writes whose failures surface on the next read, and
//! an idempotent close that leaves [`Transport::is_connected`] false.
//!
//! # Main Components
//!
//! - [`Transport`] - the contract shared by all stream flavors
//! - [`TelnetTransport`] - raw TCP with telnet option refusal (ports 23 and 9528)
//! - [`SshShellTransport`] - interactive PTY shell multiplexed over an SSH session
//! - [`SshExec`] - exec-channel command runner used by the transfer pipeline
//! - [`Link`] - picks and instantiates a stream flavor

use std::fmt;
use std::time::Duration;

use async_ssh2_tokio::ServerCheckMethod;
use async_ssh2_tokio::client::{AuthMethod, Client};
use async_trait::async_trait;
use log::{debug, trace};
use russh::Preferred;
use std::borrow::Cow;

use crate::config;
use crate::error::EngineError;

pub use ssh::{CommandRunner, SshExec, SshShellTransport};
pub use telnet::TelnetTransport;

/// A connection to a single `host:port`.
#[async_trait]
pub trait Transport: Send {
    /// Opens the connection, closing any previous one first.
    ///
    /// On failure no handle is kept.
    async fn connect(&mut self, host: &str, port: u16, timeout: Duration)
    -> Result<(), EngineError>;

    /// True while a connection handle is held. Does not probe the peer.
    fn is_connected(&self) -> bool;

    /// Queues bytes for the peer, waiting no longer than the connect timeout.
    ///
    /// Errors, a stalled peer included, are reported by the next read.
    async fn write(&mut self, data: &[u8]);

    /// Reads through `delimiter` (inclusive).
    ///
    /// An empty delimiter returns the first non-empty chunk. When the window closes,
    /// fails with [`EngineError::Timeout`] carrying the bytes received so far.
    async fn read_until(
        &mut self,
        delimiter: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, EngineError>;

    /// Drops buffered bytes and anything readable without waiting. Returns the count.
    fn discard_pending(&mut self) -> usize;

    /// Releases the connection handle. Safe to call repeatedly.
    async fn close(&mut self);
}

/// Accumulates received bytes until a delimiter shows up.
#[derive(Debug, Default)]
pub struct ReadBuffer {
    data: Vec<u8>,
}

impl ReadBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Removes and returns everything up to and including `delimiter`.
    pub fn take_through(&mut self, delimiter: &[u8]) -> Option<Vec<u8>> {
        if delimiter.is_empty() {
            return (!self.data.is_empty()).then(|| self.take_all());
        }
        let end = find(&self.data, delimiter)? + delimiter.len();
        Some(self.data.drain(..end).collect())
    }

    pub fn take_all(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }

    /// Empties the buffer, returning how many bytes were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.data.len();
        self.data.clear();
        dropped
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Credentials and policy for SSH-backed transports.
#[derive(Clone)]
pub struct SshOptions {
    pub user: String,
    pub password: String,
    /// Host key verification. Gateways rotate keys on reflash, so fleets usually run
    /// with [`ServerCheckMethod::NoCheck`].
    pub server_check: ServerCheckMethod,
    pub inactivity_timeout: Option<Duration>,
}

impl SshOptions {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
            server_check: ServerCheckMethod::NoCheck,
            inactivity_timeout: Some(Duration::from_secs(60)),
        }
    }

    /// Algorithm preference accepted by the gateway sshd builds.
    pub fn preferred(&self) -> Preferred {
        Preferred {
            kex: Cow::Borrowed(config::EMBEDDED_KEX_ORDER),
            key: Cow::Borrowed(config::EMBEDDED_KEY_TYPES),
            cipher: Cow::Borrowed(config::EMBEDDED_CIPHERS),
            mac: Cow::Borrowed(config::EMBEDDED_MAC_ALGORITHMS),
            compression: Cow::Borrowed(config::EMBEDDED_COMPRESSION_ALGORITHMS),
        }
    }

    pub(crate) async fn client(&self, host: &str, port: u16) -> Result<Client, EngineError> {
        let config = async_ssh2_tokio::Config {
            preferred: self.preferred(),
            inactivity_timeout: self.inactivity_timeout,
            ..Default::default()
        };
        let client = Client::connect_with_config(
            (host.to_string(), port),
            &self.user,
            AuthMethod::with_password(&self.password),
            self.server_check.clone(),
            config,
        )
        .await?;
        debug!("{}@{host}:{port} SSH session established", self.user);
        Ok(client)
    }
}

impl fmt::Debug for SshOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshOptions")
            .field("user", &self.user)
            .field("password", &"***")
            .field("server_check", &self.server_check)
            .field("inactivity_timeout", &self.inactivity_timeout)
            .finish()
    }
}

/// Stream flavor used to reach a device.
#[derive(Debug, Clone)]
pub enum Link {
    /// Raw TCP stream with telnet negotiation refused.
    Telnet,
    /// Interactive shell over SSH.
    SshShell(SshOptions),
}

impl Link {
    /// Creates an unconnected transport of this flavor.
    pub fn open(&self) -> Box<dyn Transport> {
        trace!("new {:?} transport", self.kind());
        match self {
            Link::Telnet => Box::new(TelnetTransport::new()),
            Link::SshShell(options) => Box::new(SshShellTransport::new(options.clone())),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Link::Telnet => "telnet",
            Link::SshShell(_) => "ssh-shell",
        }
    }
}

mod ssh;
mod telnet;
