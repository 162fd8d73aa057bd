use super::*;

use std::io;

use log::warn;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

const READ_CHUNK: usize = 4096;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum IacState {
    #[default]
    Data,
    Command,
    Negotiate(u8),
    Subnegotiate,
    SubnegotiateIac,
}

/// Strips telnet commands from the inbound stream and refuses every option.
#[derive(Debug, Default)]
struct IacFilter {
    state: IacState,
}

impl IacFilter {
    /// Appends payload bytes to `data` and negotiation answers to `replies`.
    fn feed(&mut self, input: &[u8], data: &mut Vec<u8>, replies: &mut Vec<u8>) {
        for &byte in input {
            self.state = match (self.state, byte) {
                (IacState::Data, IAC) => IacState::Command,
                (IacState::Data, _) => {
                    data.push(byte);
                    IacState::Data
                }
                (IacState::Command, IAC) => {
                    data.push(IAC);
                    IacState::Data
                }
                (IacState::Command, DO | DONT | WILL | WONT) => IacState::Negotiate(byte),
                (IacState::Command, SB) => IacState::Subnegotiate,
                // NOP, GA, AYT and friends carry no payload
                (IacState::Command, _) => IacState::Data,
                (IacState::Negotiate(verb), option) => {
                    match verb {
                        DO => replies.extend_from_slice(&[IAC, WONT, option]),
                        WILL => replies.extend_from_slice(&[IAC, DONT, option]),
                        _ => {}
                    }
                    IacState::Data
                }
                (IacState::Subnegotiate, IAC) => IacState::SubnegotiateIac,
                (IacState::Subnegotiate, _) => IacState::Subnegotiate,
                (IacState::SubnegotiateIac, SE) => IacState::Data,
                (IacState::SubnegotiateIac, _) => IacState::Subnegotiate,
            };
        }
    }
}

/// Doubles IAC bytes in outbound data.
fn escape_iac(data: &[u8]) -> Cow<'_, [u8]> {
    if !data.contains(&IAC) {
        return Cow::Borrowed(data);
    }
    let mut escaped = Vec::with_capacity(data.len() + 2);
    for &byte in data {
        escaped.push(byte);
        if byte == IAC {
            escaped.push(IAC);
        }
    }
    Cow::Owned(escaped)
}

/// Telnet client over a tokio TCP stream.
///
/// Used for the OS shell on port 23 and, since the LGW channel never emits IAC, for the
/// plain TCP command channel on port 9528 as well.
#[derive(Debug, Default)]
pub struct TelnetTransport {
    stream: Option<TcpStream>,
    addr: String,
    buffer: ReadBuffer,
    filter: IacFilter,
    /// Negotiation answers not yet written.
    replies: Vec<u8>,
    pending_error: Option<io::Error>,
    /// Bound on every write, taken from the connect timeout.
    write_timeout: Duration,
}

impl TelnetTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn ingest(&mut self, chunk: &[u8]) {
        let mut data = Vec::with_capacity(chunk.len());
        self.filter.feed(chunk, &mut data, &mut self.replies);
        self.buffer.extend(&data);
    }

    fn drop_stream(&mut self, reason: &str) {
        if self.stream.take().is_some() {
            debug!("{} telnet connection dropped: {reason}", self.addr);
        }
    }

    async fn flush_replies(&mut self) {
        if self.replies.is_empty() {
            return;
        }
        let replies = std::mem::take(&mut self.replies);
        self.write_bounded(&replies).await;
    }

    /// Writes `bytes` within the write timeout. Failures are parked for the next read.
    async fn write_bounded(&mut self, bytes: &[u8]) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        let written = match tokio::time::timeout(self.write_timeout, stream.write_all(bytes)).await
        {
            Ok(written) => written,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("peer accepted no data within {:?}", self.write_timeout),
            )),
        };
        if let Err(err) = written {
            warn!("{} write failed: {err}", self.addr);
            self.pending_error = Some(err);
        }
    }
}

#[async_trait]
impl Transport for TelnetTransport {
    async fn connect(
        &mut self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        self.close().await;
        self.addr = format!("{host}:{port}");
        debug!("{} start to connect...", self.addr);

        let stream = match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                debug!("{} {err}", self.addr);
                return Err(EngineError::Connect {
                    addr: self.addr.clone(),
                    reason: err.to_string(),
                });
            }
            Err(_) => {
                return Err(EngineError::Connect {
                    addr: self.addr.clone(),
                    reason: format!("no answer within {timeout:?}"),
                });
            }
        };
        if let Err(err) = stream.set_nodelay(true) {
            trace!("{} set_nodelay failed: {err}", self.addr);
        }
        self.stream = Some(stream);
        self.write_timeout = timeout;
        debug!("{} successfully connected", self.addr);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn write(&mut self, data: &[u8]) {
        self.flush_replies().await;
        if self.pending_error.is_some() {
            return;
        }
        self.write_bounded(&escape_iac(data)).await;
    }

    async fn read_until(
        &mut self,
        delimiter: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, EngineError> {
        let deadline = Instant::now() + timeout;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(frame) = self.buffer.take_through(delimiter) {
                return Ok(frame);
            }
            if let Some(err) = self.pending_error.take() {
                self.drop_stream("write error");
                return Err(err.into());
            }
            let Some(stream) = self.stream.as_mut() else {
                return Err(EngineError::NotConnected);
            };
            match tokio::time::timeout_at(deadline, stream.read(&mut chunk)).await {
                Err(_) => {
                    return Err(EngineError::Timeout {
                        partial: self.buffer.take_all(),
                    });
                }
                Ok(Ok(0)) => {
                    self.drop_stream("closed by peer");
                    return Err(EngineError::ChannelDisconnect);
                }
                Ok(Ok(n)) => {
                    trace!("{} recv {n} bytes", self.addr);
                    self.ingest(&chunk[..n]);
                    self.flush_replies().await;
                }
                Ok(Err(err)) => {
                    self.drop_stream("read error");
                    return Err(err.into());
                }
            }
        }
    }

    fn discard_pending(&mut self) -> usize {
        let mut dropped = self.buffer.clear();
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let Some(stream) = self.stream.as_ref() else {
                break;
            };
            match stream.try_read(&mut chunk) {
                Ok(0) => {
                    self.drop_stream("closed by peer");
                    break;
                }
                Ok(n) => {
                    self.ingest(&chunk[..n]);
                    dropped += self.buffer.clear();
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    self.pending_error = Some(err);
                    break;
                }
            }
        }
        dropped
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let shutdown = tokio::time::timeout(self.write_timeout, stream.shutdown()).await;
            if let Ok(Err(err)) = shutdown {
                trace!("{} shutdown: {err}", self.addr);
            }
            debug!("{} telnet connection closed", self.addr);
        }
        self.buffer.clear();
        self.replies.clear();
        self.pending_error = None;
        self.filter = IacFilter::default();
    }
}
