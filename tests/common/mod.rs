//! Loopback stand-ins for gateway devices.

#![allow(dead_code)]

use std::io;
use std::time::Duration;

use lgwire::config::ProtocolSettings;
use lgwire::fleet::Host;
use lgwire::lgw::CommandFrame;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const PROMPT: &str = "root@rtl8196e:~# ";
pub const BANNER: &str = "\r\nBusyBox v1.13.4 (2019-03-26) built-in shell (ash)\r\nroot@rtl8196e:~# ";
pub const DEVICE_MAC: &str = "D0:14:11:B0:02:19";

const IAC: u8 = 255;
const DO: u8 = 253;
const ECHO: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Personality {
    /// Telnet shell: negotiates echo, prints a banner, echoes every line.
    Shell,
    /// LGW channel answering every frame with `code` 0 and `value` "POC".
    Lgw,
    /// LGW channel that pushes a telemetry frame ahead of every reply.
    LgwTelemetryFirst,
}

#[derive(Debug, Clone)]
pub struct FakeDevice {
    pub personality: Personality,
    pub mac: String,
}

impl FakeDevice {
    pub fn shell() -> Self {
        Self {
            personality: Personality::Shell,
            mac: DEVICE_MAC.to_string(),
        }
    }

    pub fn lgw(mac: &str) -> Self {
        Self {
            personality: Personality::Lgw,
            mac: mac.to_string(),
        }
    }

    pub fn telemetry_first(mac: &str) -> Self {
        Self {
            personality: Personality::LgwTelemetryFirst,
            mac: mac.to_string(),
        }
    }

    /// Listens on `127.0.0.1` with a kernel-chosen port and returns the port.
    pub async fn spawn(self) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind device");
        let port = listener.local_addr().expect("local addr").port();
        tokio::spawn(self.serve(listener));
        port
    }

    /// Listens on `ip:port`, for fleets whose hosts share one port.
    pub async fn spawn_on(self, ip: &str, port: u16) -> io::Result<()> {
        let listener = TcpListener::bind((ip, port)).await?;
        tokio::spawn(self.serve(listener));
        Ok(())
    }

    async fn serve(self, listener: TcpListener) {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(self.clone().handle(stream));
        }
    }

    async fn handle(self, mut stream: TcpStream) {
        if self.personality == Personality::Shell {
            let mut hello = vec![IAC, DO, ECHO];
            hello.extend_from_slice(BANNER.as_bytes());
            if stream.write_all(&hello).await.is_err() {
                return;
            }
        }

        let mut pending = Vec::new();
        let mut skip = 0usize;
        let mut chunk = [0u8; 1024];
        loop {
            let n = match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            for &byte in &chunk[..n] {
                if skip > 0 {
                    skip -= 1;
                } else if byte == IAC {
                    // client answers are always three-byte negotiations
                    skip = 2;
                } else {
                    pending.push(byte);
                }
            }
            while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = pending.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line).trim().to_string();
                let reply = self.reply(&line);
                if !reply.is_empty() && stream.write_all(reply.as_bytes()).await.is_err() {
                    return;
                }
            }
        }
    }

    fn reply(&self, line: &str) -> String {
        match self.personality {
            Personality::Shell => shell_reply(line),
            Personality::Lgw => self.lgw_reply(line),
            Personality::LgwTelemetryFirst => {
                let reply = self.lgw_reply(line);
                if reply.is_empty() {
                    reply
                } else {
                    format!(r#"#:{{"cmd": "telemetry", "temp": 42}}:#{reply}"#)
                }
            }
        }
    }

    fn lgw_reply(&self, line: &str) -> String {
        let Ok(frame) = CommandFrame::parse(line) else {
            return String::new();
        };
        let own_prefix = format!("0000{}:", self.mac.replace(':', "").to_lowercase());
        match frame.target_id() {
            Some(target) if !target.starts_with(&own_prefix) => frame
                .attr("code", -1)
                .attr("reason", "no such target")
                .encode(),
            _ => frame.attr("code", 0).attr("value", "POC").encode(),
        }
    }
}

fn shell_reply(line: &str) -> String {
    let output = match line {
        // swallowed without echo
        "silent" | "exit" => return String::new(),
        "" => String::new(),
        "uname" => "Linux\r\n".to_string(),
        _ => match line.strip_prefix("echo ") {
            Some(text) => format!("{text}\r\n"),
            None => format!("sh: {line}: not found\r\n"),
        },
    };
    format!("{line}\r\n{output}{PROMPT}")
}

/// Shell settings tuned for loopback tests.
pub fn fast_shell() -> ProtocolSettings {
    let mut settings = ProtocolSettings::os_shell();
    settings.connect_timeout = Duration::from_millis(500);
    settings.connect_window = Duration::from_millis(300);
    settings.connect_backoff = Duration::from_millis(50);
    settings.banner_timeout = Some(Duration::from_millis(500));
    settings
}

/// LGW settings tuned for loopback tests.
pub fn fast_lgw() -> ProtocolSettings {
    let mut settings = ProtocolSettings::lgw();
    settings.connect_timeout = Duration::from_millis(500);
    settings.connect_window = Duration::from_millis(300);
    settings.connect_backoff = Duration::from_millis(50);
    settings
}

pub fn host(ip: &str, mac: &str) -> Host {
    Host::new(ip, mac)
}

pub fn commands(list: &[&str]) -> Vec<String> {
    list.iter().map(|c| c.to_string()).collect()
}
