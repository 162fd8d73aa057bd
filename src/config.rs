//! Protocol settings and connection constants.
//!
//! Every session and fan-out call receives its own [`ProtocolSettings`] value, so
//! batches with different terminators can run side by side. The SSH algorithm lists
//! target the legacy sshd builds found on the gateway boards, which still offer
//! `ssh-rsa` host keys and SHA-1 key exchange.

use std::time::Duration;

use russh::keys::{Algorithm, EcdsaCurve, HashAlg};
use russh::{cipher, compression, kex, mac};

use crate::session::ResponseCodec;

/// Telnet port of the gateway OS shell.
pub const OS_SHELL_PORT: u16 = 23;

/// Port of the LGW application channel.
pub const LGW_PORT: u16 = 9528;

/// Default SSH port.
pub const SSH_PORT: u16 = 22;

/// Terminator printed by the gateway OS shell prompt.
pub const SHELL_EXPECT: &str = "#";

/// Closing token of an LGW frame.
pub const LGW_EXPECT: &str = ":#";

/// Prompt prefix stripped from the last line of shell output.
pub const DEFAULT_PROMPT_MARKER: &str = "root@rtl8196e:";

/// Per-call protocol configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolSettings {
    /// Terminator a response must contain.
    pub expect: String,
    /// Appended to every command before writing.
    pub line_ending: String,
    /// Parser applied to successful responses.
    pub codec: ResponseCodec,
    /// Bound on a single connection attempt.
    pub connect_timeout: Duration,
    /// Total window for repeated connection attempts.
    pub connect_window: Duration,
    /// Pause between connection attempts.
    pub connect_backoff: Duration,
    /// Pause between two send attempts that produced no data.
    pub retry_interval: Duration,
    /// Time spent draining the login banner after connecting, if any.
    pub banner_timeout: Option<Duration>,
    /// Shell prompt prefix cut from the final output line.
    pub prompt_marker: String,
}

impl ProtocolSettings {
    /// Settings for the telnet OS shell (port 23).
    pub fn os_shell() -> Self {
        Self {
            expect: SHELL_EXPECT.to_string(),
            line_ending: "\r\n".to_string(),
            codec: ResponseCodec::Shell,
            connect_timeout: Duration::from_secs(3),
            connect_window: Duration::from_secs(5),
            connect_backoff: Duration::from_millis(500),
            retry_interval: Duration::from_millis(50),
            banner_timeout: Some(Duration::from_secs(2)),
            prompt_marker: DEFAULT_PROMPT_MARKER.to_string(),
        }
    }

    /// Settings for the LGW application channel (port 9528).
    pub fn lgw() -> Self {
        Self {
            expect: LGW_EXPECT.to_string(),
            codec: ResponseCodec::Lgw,
            banner_timeout: None,
            ..Self::os_shell()
        }
    }

    /// Settings that hand the decoded text back untouched.
    pub fn raw() -> Self {
        Self {
            codec: ResponseCodec::Raw,
            banner_timeout: None,
            ..Self::os_shell()
        }
    }

    /// Picks the preset matching a well-known port.
    pub fn for_port(port: u16) -> Self {
        match port {
            OS_SHELL_PORT => Self::os_shell(),
            LGW_PORT => Self::lgw(),
            _ => Self::raw(),
        }
    }

    /// Returns a copy using another terminator.
    pub fn with_expect(mut self, expect: impl Into<String>) -> Self {
        self.expect = expect.into();
        self
    }
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self::os_shell()
    }
}

/// Key exchange algorithms offered to embedded sshd, modern first.
pub const EMBEDDED_KEX_ORDER: &[kex::Name] = &[
    kex::CURVE25519,
    kex::CURVE25519_PRE_RFC_8731,
    kex::ECDH_SHA2_NISTP256,
    kex::DH_G14_SHA256,
    kex::DH_GEX_SHA256,
    kex::DH_G14_SHA1,
    kex::DH_GEX_SHA1,
    kex::DH_G1_SHA1,
];

pub const EMBEDDED_CIPHERS: &[cipher::Name] = &[
    cipher::CHACHA20_POLY1305,
    cipher::AES_256_GCM,
    cipher::AES_256_CTR,
    cipher::AES_128_CTR,
    cipher::AES_256_CBC,
    cipher::AES_128_CBC,
];

pub const EMBEDDED_MAC_ALGORITHMS: &[mac::Name] = &[
    mac::HMAC_SHA256_ETM,
    mac::HMAC_SHA512_ETM,
    mac::HMAC_SHA256,
    mac::HMAC_SHA512,
    mac::HMAC_SHA1,
];

pub const EMBEDDED_COMPRESSION_ALGORITHMS: &[compression::Name] = &[compression::NONE];

/// Host key types, keeping `ssh-rsa` (SHA-1) for older dropbear builds.
pub const EMBEDDED_KEY_TYPES: &[Algorithm] = &[
    Algorithm::Ed25519,
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP256,
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha256),
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha512),
    },
    Algorithm::Rsa { hash: None },
];
