//! # lgwire - Command Protocol Engine for Embedded Gateway Fleets
//!
//! `lgwire` talks to fleets of small embedded gateways over three channels: the telnet
//! OS shell on port 23, the vendor LGW command channel on port 9528, and SSH. It sends
//! commands, frames the replies on a terminator, decodes LGW frames, retries transient
//! failures and fans a command list out to many hosts at once.
//!
//! ## Features
//!
//! - **Explicit Settings**: terminator, line ending and codec travel with each call
//! - **Expect Framing**: replies are cut at a terminator with a bounded no-data retry loop
//! - **LGW Codec**: `#:{json}:#` frames, target-id addressing and reply correlation
//! - **Fan-out**: one task per host, commands in order per host, one result per host
//! - **Legacy SSH**: algorithm lists accepted by old dropbear builds
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use lgwire::fleet::{Host, send_lgw_commands};
//!
//! #[tokio::main]
//! async fn main() {
//!     let hosts = vec![Host::new("192.168.2.10", "D0:14:11:B0:02:19")];
//!     let templates = vec![
//!         r#"#:{"cmd": "read-attr", "target-id": "", "attr": "model-id"}:#"#.to_string(),
//!     ];
//!
//!     let results = send_lgw_commands(&hosts, &templates, &[1, 2], Duration::from_secs(3)).await;
//!     for (ip, commands) in &results {
//!         for entry in commands {
//!             println!("{ip} {} -> ok={}", entry.cmd, entry.result.ok);
//!         }
//!     }
//! }
//! ```
//!
//! ## Main Components
//!
//! - [`session::Session`] - one connection, send/receive with retry
//! - [`fleet::run_fleet_commands`] - concurrent fan-out across hosts
//! - [`lgw`] - LGW frame encoding, decoding and addressing
//! - [`transport::Transport`] - telnet and SSH byte streams
//! - [`retry`] - bounded and deadline retry strategies
//! - [`error::EngineError`] - error types for transports and codecs
//! - [`config`] - protocol presets and SSH algorithm lists

pub mod config;
pub mod error;
pub mod fleet;
pub mod lgw;
pub mod retry;
pub mod session;
pub mod transport;
