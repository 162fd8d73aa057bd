use super::*;

use tokio::time::Instant;

const NO_OUTPUT: &str = "receive Error: Output is None !";

impl Session {
    /// Sends `content` and waits for the session terminator.
    pub async fn send(&mut self, content: &str, timeout: Duration) -> ResponseEnvelope {
        let expect = self.settings.expect.clone();
        self.send_expect(content, &expect, timeout).await
    }

    /// Sends `content` and waits for `expect`.
    ///
    /// Attempts that produce no data are repeated, flushing stale input first, while
    /// another retry interval still fits in `timeout`. Data without the terminator
    /// fails at once.
    pub async fn send_expect(
        &mut self,
        content: &str,
        expect: &str,
        timeout: Duration,
    ) -> ResponseEnvelope {
        let started = Instant::now();
        let line = format!("{content}{}", self.settings.line_ending);
        let mut attempt = 0u32;
        loop {
            let stale = self.transport.discard_pending();
            if stale > 0 {
                debug!("host ({}) flushed {stale} stale bytes", self.addr);
            }
            trace!("send command <SEND>\n{content}\n</SEND>");
            self.transport.write(line.as_bytes()).await;

            let remaining = timeout.saturating_sub(started.elapsed());
            let envelope = self.receive(expect, remaining).await;
            if envelope.error_code != Some(ErrorCode::NoData)
                || started.elapsed() + self.settings.retry_interval >= timeout
            {
                return envelope;
            }
            warn!(
                "host ({}) SENDS RETRY {attempt} SENT: {content}, OUT: {:?}",
                self.addr, envelope.reason
            );
            attempt += 1;
            tokio::time::sleep(self.settings.retry_interval).await;
        }
    }

    /// Writes `content` without waiting for a reply.
    pub async fn just_send(&mut self, content: &str) -> ResponseEnvelope {
        trace!("send command <SEND>\n{content}\n</SEND>");
        let line = format!("{content}{}", self.settings.line_ending);
        self.transport.write(line.as_bytes()).await;
        ResponseEnvelope::success(Payload::Text("just send !".to_string()))
    }

    /// Reads one response without writing anything first.
    ///
    /// `expect` defaults to the session terminator.
    pub async fn response(&mut self, expect: Option<&str>, timeout: Duration) -> ResponseEnvelope {
        let expect = expect.map_or_else(|| self.settings.expect.clone(), str::to_string);
        self.receive(&expect, timeout).await
    }

    async fn receive(&mut self, expect: &str, timeout: Duration) -> ResponseEnvelope {
        match self.transport.read_until(expect.as_bytes(), timeout).await {
            Ok(raw) => self.frame(&raw, expect),
            Err(EngineError::Timeout { partial }) => self.frame(&partial, expect),
            Err(err) => {
                warn!("host ({}) receive failed: {err}", self.addr);
                ResponseEnvelope::from_error(&err)
            }
        }
    }

    fn frame(&self, raw: &[u8], expect: &str) -> ResponseEnvelope {
        if raw.is_empty() {
            return ResponseEnvelope::failure(ErrorCode::NoData, NO_OUTPUT, Payload::None);
        }
        let text = String::from_utf8_lossy(raw).replace('\r', "");
        trace!("response() <RECEIVE>\n{text}\n</RECEIVE>");

        if !text.contains(expect) {
            return ResponseEnvelope::failure(
                ErrorCode::ExpectMissing,
                format!("receive Error: Can't find expect string({expect})"),
                Payload::Text(text),
            );
        }
        match self.settings.codec.parse(&text, &self.settings.prompt_marker) {
            Ok(payload) => ResponseEnvelope::success(payload),
            Err(err) => {
                ResponseEnvelope::failure(err.error_code(), err.to_string(), Payload::Text(text))
            }
        }
    }
}
