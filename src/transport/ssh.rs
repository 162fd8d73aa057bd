use super::*;

use std::io;

use log::{info, warn};
use russh::ChannelMsg;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::time::Instant;

use crate::session::{ErrorCode, Payload, ResponseEnvelope};

const QUEUE_DEPTH: usize = 256;

/// Interactive shell over SSH, presented as a byte stream.
///
/// A background task bridges the russh channel to two mpsc queues so reads can be
/// bounded by a timeout without owning the channel.
pub struct SshShellTransport {
    options: SshOptions,
    addr: String,
    client: Option<Client>,
    sender: Option<Sender<Vec<u8>>>,
    receiver: Option<Receiver<Vec<u8>>>,
    buffer: ReadBuffer,
    pending_error: Option<EngineError>,
    /// Bound on queueing a write and on the disconnect handshake.
    write_timeout: Duration,
}

impl SshShellTransport {
    pub fn new(options: SshOptions) -> Self {
        Self {
            options,
            addr: String::new(),
            client: None,
            sender: None,
            receiver: None,
            buffer: ReadBuffer::new(),
            pending_error: None,
            write_timeout: Duration::from_secs(3),
        }
    }

    async fn open_shell(
        options: &SshOptions,
        addr: &str,
        host: &str,
        port: u16,
    ) -> Result<(Client, Sender<Vec<u8>>, Receiver<Vec<u8>>), EngineError> {
        let client = options.client(host, port).await?;

        let mut channel = client.get_channel().await?;
        channel
            .request_pty(false, "xterm", 800, 600, 0, 0, &[])
            .await?;
        channel.request_shell(false).await?;
        debug!("{addr} shell request successful");

        let (sender_to_shell, mut receiver_from_user) = mpsc::channel::<Vec<u8>>(QUEUE_DEPTH);
        let (sender_to_user, receiver_from_shell) = mpsc::channel::<Vec<u8>>(QUEUE_DEPTH);

        let io_task_addr = addr.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(data) = receiver_from_user.recv() => {
                        if let Err(e) = channel.data(&data[..]).await {
                            debug!("{} failed to send data to shell: {:?}", io_task_addr, e);
                            break;
                        }
                    },
                    Some(msg) = channel.wait() => {
                        match msg {
                            ChannelMsg::Data { ref data } | ChannelMsg::ExtendedData { ref data, .. } => {
                                if sender_to_user.send(data.to_vec()).await.is_err() {
                                    debug!("{} shell output receiver dropped", io_task_addr);
                                    break;
                                }
                            }
                            ChannelMsg::ExitStatus { exit_status } => {
                                debug!("{} shell exited with status code: {}", io_task_addr, exit_status);
                                let _ = channel.eof().await;
                                break;
                            }
                            ChannelMsg::Eof | ChannelMsg::Close => {
                                debug!("{} shell sent EOF", io_task_addr);
                                break;
                            }
                            _ => {}
                        }
                    },
                    else => break,
                }
            }
            debug!("{} SSH I/O task ended", io_task_addr);
        });

        Ok((client, sender_to_shell, receiver_from_shell))
    }

    fn drop_handles(&mut self) {
        self.sender = None;
        self.receiver = None;
        self.client = None;
    }
}

#[async_trait]
impl Transport for SshShellTransport {
    async fn connect(
        &mut self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        self.close().await;
        self.addr = format!("{}@{host}:{port}", self.options.user);
        debug!("{} start to connect...", self.addr);

        let opening = Self::open_shell(&self.options, &self.addr, host, port);
        match tokio::time::timeout(timeout, opening).await {
            Ok(Ok((client, sender, receiver))) => {
                self.client = Some(client);
                self.sender = Some(sender);
                self.receiver = Some(receiver);
                self.write_timeout = timeout;
                debug!("{} successfully connected", self.addr);
                Ok(())
            }
            Ok(Err(err)) => Err(EngineError::Connect {
                addr: self.addr.clone(),
                reason: err.to_string(),
            }),
            Err(_) => Err(EngineError::Connect {
                addr: self.addr.clone(),
                reason: format!("no answer within {timeout:?}"),
            }),
        }
    }

    fn is_connected(&self) -> bool {
        self.client.is_some() && self.sender.is_some()
    }

    async fn write(&mut self, data: &[u8]) {
        let Some(sender) = self.sender.as_ref() else {
            return;
        };
        match tokio::time::timeout(self.write_timeout, sender.send(data.to_vec())).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                warn!("{} shell task is gone, write dropped", self.addr);
                self.pending_error = Some(EngineError::ChannelDisconnect);
            }
            Err(_) => {
                warn!("{} shell queue stalled, write dropped", self.addr);
                self.pending_error = Some(EngineError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("shell accepted no data within {:?}", self.write_timeout),
                )));
            }
        }
    }

    async fn read_until(
        &mut self,
        delimiter: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, EngineError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(frame) = self.buffer.take_through(delimiter) {
                return Ok(frame);
            }
            if let Some(err) = self.pending_error.take() {
                self.drop_handles();
                return Err(err);
            }
            let Some(receiver) = self.receiver.as_mut() else {
                return Err(EngineError::NotConnected);
            };
            match tokio::time::timeout_at(deadline, receiver.recv()).await {
                Err(_) => {
                    return Err(EngineError::Timeout {
                        partial: self.buffer.take_all(),
                    });
                }
                Ok(None) => {
                    debug!("{} shell channel closed", self.addr);
                    self.drop_handles();
                    return Err(EngineError::ChannelDisconnect);
                }
                Ok(Some(chunk)) => {
                    trace!("{} recv {} bytes", self.addr, chunk.len());
                    self.buffer.extend(&chunk);
                }
            }
        }
    }

    fn discard_pending(&mut self) -> usize {
        let mut dropped = self.buffer.clear();
        if let Some(receiver) = self.receiver.as_mut() {
            while let Ok(chunk) = receiver.try_recv() {
                dropped += chunk.len();
            }
        }
        dropped
    }

    async fn close(&mut self) {
        if let Some(sender) = self.sender.take() {
            match tokio::time::timeout(self.write_timeout, sender.send(b"exit\n".to_vec())).await {
                Ok(Ok(())) => tokio::time::sleep(Duration::from_millis(100)).await,
                Ok(Err(e)) => debug!("{} failed to send exit command: {:?}", self.addr, e),
                Err(_) => debug!("{} exit command not accepted in time", self.addr),
            }
        }
        self.receiver = None;
        if let Some(client) = self.client.take() {
            match tokio::time::timeout(self.write_timeout, client.disconnect()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("{} disconnect: {}", self.addr, e),
                Err(_) => debug!("{} disconnect not acknowledged in time", self.addr),
            }
            debug!("{} SSH connection closed", self.addr);
        }
        self.buffer.clear();
        self.pending_error = None;
    }
}

/// Runs one command and reports `(ok, text)`.
///
/// Implementations never fail: every error is folded into `(false, description)`.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run_cmd(
        &self,
        command: &str,
        timeout: Duration,
        read_until: Option<&str>,
        waiting: Duration,
    ) -> (bool, String);
}

/// SSH exec-channel client, one channel per command.
pub struct SshExec {
    options: SshOptions,
    addr: String,
    client: Option<Client>,
}

impl SshExec {
    pub fn new(options: SshOptions) -> Self {
        Self {
            options,
            addr: String::new(),
            client: None,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn connect(
        &mut self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        self.close().await;
        self.addr = format!("{}@{host}:{port}", self.options.user);
        info!("host ({}) start to connect...", self.addr);
        match tokio::time::timeout(timeout, self.options.client(host, port)).await {
            Ok(Ok(client)) => {
                self.client = Some(client);
                info!("host ({}) successfully connected", self.addr);
                Ok(())
            }
            Ok(Err(err)) => Err(EngineError::Connect {
                addr: self.addr.clone(),
                reason: err.to_string(),
            }),
            Err(_) => Err(EngineError::Connect {
                addr: self.addr.clone(),
                reason: format!("no answer within {timeout:?}"),
            }),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    /// Runs `command` to completion.
    ///
    /// Exit status 0 yields stdout. A non-zero status is [`ErrorCode::Rejected`] with
    /// stderr as payload. No completion within `timeout` is [`ErrorCode::NoData`].
    pub async fn execute(&self, command: &str, timeout: Duration) -> ResponseEnvelope {
        let Some(client) = self.client.as_ref() else {
            return ResponseEnvelope::failure(
                ErrorCode::Unexpected,
                EngineError::NotConnected.to_string(),
                Payload::None,
            );
        };
        trace!("send command <SEND>\n{command}\n</SEND>");
        match tokio::time::timeout(timeout, client.execute(command)).await {
            Ok(Ok(result)) => {
                debug!(
                    "response code({}) <RECEIVE>\n{}\n</RECEIVE>",
                    result.exit_status, result.stdout
                );
                if result.exit_status == 0 {
                    ResponseEnvelope::success(Payload::Text(result.stdout))
                } else {
                    warn!(
                        "host ({}) '{command}' exited with {}",
                        self.addr, result.exit_status
                    );
                    ResponseEnvelope::failure(
                        ErrorCode::Rejected,
                        format!("exit status {}", result.exit_status),
                        Payload::Text(result.stderr),
                    )
                }
            }
            Ok(Err(err)) => {
                let err = EngineError::from(err);
                ResponseEnvelope::failure(err.error_code(), err.to_string(), Payload::None)
            }
            Err(_) => ResponseEnvelope::failure(
                ErrorCode::NoData,
                format!("no completion within {timeout:?}"),
                Payload::None,
            ),
        }
    }

    /// Reads the exec stream of `command` through `separator`, then closes the channel.
    async fn read_through(
        &self,
        command: &str,
        separator: &str,
        timeout: Duration,
        waiting: Duration,
    ) -> Result<String, EngineError> {
        let client = self.client.as_ref().ok_or(EngineError::NotConnected)?;
        let mut channel = client.get_channel().await?;
        channel.exec(true, command).await?;

        let deadline = Instant::now() + timeout;
        let mut buffer = ReadBuffer::new();
        let outcome = loop {
            if let Some(out) = buffer.take_through(separator.as_bytes()) {
                break Ok(String::from_utf8_lossy(&out).into_owned());
            }
            match tokio::time::timeout_at(deadline, channel.wait()).await {
                Err(_) => {
                    break Err(EngineError::Timeout {
                        partial: buffer.take_all(),
                    });
                }
                Ok(None) | Ok(Some(ChannelMsg::Eof | ChannelMsg::Close)) => {
                    break Err(EngineError::ChannelDisconnect);
                }
                Ok(Some(
                    ChannelMsg::Data { ref data } | ChannelMsg::ExtendedData { ref data, .. },
                )) => buffer.extend(data),
                Ok(Some(_)) => {}
            }
        };
        if let Ok(out) = &outcome {
            debug!("response readuntil({separator}) <RECEIVE>\n{out}\n</RECEIVE>");
        }
        info!("waiting ({waiting:?})...");
        tokio::time::sleep(waiting).await;
        if let Err(e) = channel.close().await {
            trace!("{} close exec channel: {e}", self.addr);
        }
        outcome
    }

    pub async fn close(&mut self) {
        if let Some(client) = self.client.take() {
            if let Err(e) = client.disconnect().await {
                debug!("{} disconnect: {}", self.addr, e);
            }
            debug!("{} SSH connection closed", self.addr);
        }
    }
}

#[async_trait]
impl CommandRunner for SshExec {
    async fn run_cmd(
        &self,
        command: &str,
        timeout: Duration,
        read_until: Option<&str>,
        waiting: Duration,
    ) -> (bool, String) {
        if let Some(separator) = read_until.filter(|s| !s.is_empty()) {
            return match self.read_through(command, separator, timeout, waiting).await {
                Ok(out) => (true, out),
                Err(err) => {
                    warn!(
                        "host ({}) readuntil({separator}) failed: {err}",
                        self.addr
                    );
                    (false, err.to_string())
                }
            };
        }

        let envelope = self.execute(command, timeout).await;
        let text = match &envelope.payload {
            Payload::Text(text) => text.clone(),
            _ => envelope.reason.clone().unwrap_or_default(),
        };
        info!("waiting ({waiting:?})...");
        tokio::time::sleep(waiting).await;
        (envelope.ok, text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exec_without_connection_reports_failure() {
        let exec = SshExec::new(SshOptions::new("root", "pw"));
        assert!(!exec.is_connected());

        let envelope = exec.execute("uname", Duration::from_secs(1)).await;
        assert!(!envelope.ok);
        assert_eq!(envelope.error_code, Some(ErrorCode::Unexpected));

        let (ok, text) = exec
            .run_cmd("cat /tmp/log", Duration::from_secs(1), Some("done"), Duration::ZERO)
            .await;
        assert!(!ok);
        assert_eq!(text, "not connected");
    }

    #[tokio::test]
    async fn shell_transport_starts_disconnected() {
        let mut transport = SshShellTransport::new(SshOptions::new("root", "pw"));
        assert!(!transport.is_connected());
        transport.write(b"ls\n").await;
        assert_eq!(transport.discard_pending(), 0);
        let err = transport
            .read_until(b"#", Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotConnected));
        transport.close().await;
    }

    /// Wires the transport to bare queues, standing in for the shell I/O task.
    fn bridged(
        transport: &mut SshShellTransport,
        depth: usize,
    ) -> (Receiver<Vec<u8>>, Sender<Vec<u8>>) {
        let (to_shell, from_user) = mpsc::channel(depth);
        let (to_user, from_shell) = mpsc::channel(depth);
        transport.sender = Some(to_shell);
        transport.receiver = Some(from_shell);
        (from_user, to_user)
    }

    #[tokio::test]
    async fn write_after_shell_task_ended_reports_disconnect() {
        let mut transport = SshShellTransport::new(SshOptions::new("root", "pw"));
        let (from_user, _to_user) = bridged(&mut transport, 4);
        drop(from_user);

        transport.write(b"uname\n").await;
        let err = transport
            .read_until(b"#", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ChannelDisconnect), "{err:?}");
        assert!(transport.sender.is_none());
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn shell_output_is_framed_until_the_task_ends() {
        let mut transport = SshShellTransport::new(SshOptions::new("root", "pw"));
        let (_from_user, to_user) = bridged(&mut transport, 4);
        to_user.send(b"Linux\r\n".to_vec()).await.unwrap();
        to_user.send(b"root@rtl8196e:~# ".to_vec()).await.unwrap();
        drop(to_user);

        let frame = transport
            .read_until(b"#", Duration::from_millis(50))
            .await
            .expect("frame");
        assert_eq!(frame, b"Linux\r\nroot@rtl8196e:~#");

        let err = transport
            .read_until(b"#", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ChannelDisconnect), "{err:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_shell_queue_times_out_the_write() {
        let mut transport = SshShellTransport::new(SshOptions::new("root", "pw"));
        let (_from_user, _to_user) = bridged(&mut transport, 1);

        transport.write(b"first\n").await;
        assert!(transport.pending_error.is_none());
        transport.write(b"second\n").await;

        let err = transport
            .read_until(b"#", Duration::from_millis(50))
            .await
            .unwrap_err();
        match err {
            EngineError::Io(err) => assert_eq!(err.kind(), io::ErrorKind::TimedOut),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
