//! Command/response conversations over a single transport.
//!
//! A [`Session`] owns one connection and the [`ProtocolSettings`] it was opened with.
//! Every exchange produces a [`ResponseEnvelope`]; failures are values, never errors.
//!
//! # Main Components
//!
//! - [`Session`] - connect, send with retry, raw response reads
//! - [`ResponseEnvelope`] - outcome of one command
//! - [`ResponseCodec`] - turns a framed response into a [`Payload`]
//! - [`BlockingSession`] - synchronous facade for thread-based callers

use std::fmt;
use std::time::Duration;

use log::{debug, info, trace, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::config::ProtocolSettings;
use crate::error::EngineError;
use crate::lgw::LgwResponse;
use crate::retry::{RetryPolicy, retry_with};
use crate::transport::{Link, Transport};

pub use blocking::BlockingSession;
pub use codec::{ResponseCodec, strip_shell_echo};

/// Why a command failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Nothing arrived before the window closed.
    NoData,
    /// Data arrived without the terminator, or could not be decoded.
    ExpectMissing,
    /// Any other fault while talking to the device.
    Unexpected,
    /// The host never accepted a connection.
    CannotConnect,
    /// The LGW reply answered a different request.
    OutOfSync,
    /// The device answered with a failure status.
    Rejected,
    /// The batch deadline passed before the command was issued.
    DeadlineExceeded,
}

impl ErrorCode {
    pub fn code(self) -> i32 {
        match self {
            ErrorCode::NoData => 1,
            ErrorCode::ExpectMissing => 2,
            ErrorCode::Unexpected => -2,
            ErrorCode::CannotConnect => -1,
            ErrorCode::OutOfSync => 3,
            ErrorCode::Rejected => 4,
            ErrorCode::DeadlineExceeded => 5,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(ErrorCode::NoData),
            2 => Some(ErrorCode::ExpectMissing),
            -2 => Some(ErrorCode::Unexpected),
            -1 => Some(ErrorCode::CannotConnect),
            3 => Some(ErrorCode::OutOfSync),
            4 => Some(ErrorCode::Rejected),
            5 => Some(ErrorCode::DeadlineExceeded),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i32(self.code())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = i32::deserialize(deserializer)?;
        ErrorCode::from_code(code)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown error code {code}")))
    }
}

/// Data carried by a response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum Payload {
    #[default]
    None,
    /// Decoded LGW reply.
    Lgw(LgwResponse),
    /// Shell or raw text.
    Text(String),
}

/// Outcome of one command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ResponseEnvelope {
    pub ok: bool,
    #[serde(default)]
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<i32>")]
    pub error_code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ResponseEnvelope {
    pub fn success(payload: Payload) -> Self {
        Self {
            ok: true,
            payload,
            error_code: None,
            reason: None,
        }
    }

    pub fn failure(code: ErrorCode, reason: impl Into<String>, payload: Payload) -> Self {
        Self {
            ok: false,
            payload,
            error_code: Some(code),
            reason: Some(reason.into()),
        }
    }

    /// Failure reported for every command of a host that never connected.
    pub fn cannot_connect(host: &str) -> Self {
        Self::failure(
            ErrorCode::CannotConnect,
            format!("host ({host}): Cannot connect!"),
            Payload::None,
        )
    }

    pub fn from_error(err: &EngineError) -> Self {
        Self::failure(err.error_code(), err.to_string(), Payload::None)
    }

    /// Turns this envelope into a failure, keeping the payload for inspection.
    pub fn into_failure(self, code: ErrorCode, reason: impl Into<String>) -> Self {
        Self::failure(code, reason, self.payload)
    }

    pub fn text(&self) -> Option<&str> {
        match &self.payload {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn lgw(&self) -> Option<&LgwResponse> {
        match &self.payload {
            Payload::Lgw(response) => Some(response),
            _ => None,
        }
    }
}

/// One connection plus the protocol settings it speaks.
pub struct Session {
    transport: Box<dyn Transport>,
    settings: ProtocolSettings,
    addr: String,
}

impl Session {
    pub fn new(transport: Box<dyn Transport>, settings: ProtocolSettings) -> Self {
        Self {
            transport,
            settings,
            addr: String::new(),
        }
    }

    /// Connects with retries inside the connect window, then drains the banner.
    pub async fn open(
        link: &Link,
        host: &str,
        port: u16,
        settings: ProtocolSettings,
    ) -> Result<Self, EngineError> {
        let mut session = Self::new(link.open(), settings);
        session.wait_until_connect(host, port).await?;
        Ok(session)
    }

    pub fn settings(&self) -> &ProtocolSettings {
        &self.settings
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Single connection attempt bounded by the connect timeout.
    pub async fn connect(&mut self, host: &str, port: u16) -> Result<(), EngineError> {
        self.addr = format!("{host}:{port}");
        info!("host ({}) start to connect...", self.addr);
        self.transport
            .connect(host, port, self.settings.connect_timeout)
            .await?;
        info!("host ({}) successfully connected", self.addr);
        Ok(())
    }

    /// Keeps trying to connect until the connect window closes.
    ///
    /// Sessions configured with a banner timeout read and discard the login banner
    /// once connected.
    pub async fn wait_until_connect(&mut self, host: &str, port: u16) -> Result<(), EngineError> {
        self.addr = format!("{host}:{port}");
        let policy = RetryPolicy::deadline(
            self.settings.connect_window,
            self.settings.connect_backoff,
        );
        let timeout = self.settings.connect_timeout;
        let owned_host = host.to_string();
        let description = format!("connect {}", self.addr);
        let started = tokio::time::Instant::now();

        let (connected, outcome) =
            retry_with(policy, &description, &mut self.transport, |transport| {
                let host = owned_host.clone();
                Box::pin(async move {
                    let outcome = transport.connect(&host, port, timeout).await;
                    (outcome.is_ok(), outcome)
                })
            })
            .await;
        if !connected {
            debug!("host ({}) gave up connecting", self.addr);
            return outcome;
        }
        debug!(
            "successfully connected to {}, takes {:?}",
            self.addr,
            started.elapsed()
        );

        if let Some(banner_timeout) = self.settings.banner_timeout {
            let banner = self.response(None, banner_timeout).await;
            trace!("{} banner drained: ok={}", self.addr, banner.ok);
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub async fn close(&mut self) {
        if self.transport.is_connected() {
            debug!("host ({}) closing", self.addr);
        }
        self.transport.close().await;
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("addr", &self.addr)
            .field("connected", &self.transport.is_connected())
            .field("settings", &self.settings)
            .finish()
    }
}

mod blocking;
mod codec;
mod framing;
