use super::*;

use tokio::runtime::{Builder, Runtime};

/// Synchronous front end for callers that run on plain threads.
///
/// Owns a current-thread runtime, so it must not be used from inside an async context.
pub struct BlockingSession {
    runtime: Runtime,
    session: Session,
}

impl BlockingSession {
    /// Connects within the connect window, draining the banner like [`Session::open`].
    pub fn open(
        link: &Link,
        host: &str,
        port: u16,
        settings: ProtocolSettings,
    ) -> Result<Self, EngineError> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let session = runtime.block_on(Session::open(link, host, port, settings))?;
        Ok(Self { runtime, session })
    }

    pub fn send(&mut self, content: &str, timeout: Duration) -> ResponseEnvelope {
        self.runtime.block_on(self.session.send(content, timeout))
    }

    pub fn send_expect(&mut self, content: &str, expect: &str, timeout: Duration) -> ResponseEnvelope {
        self.runtime
            .block_on(self.session.send_expect(content, expect, timeout))
    }

    pub fn just_send(&mut self, content: &str) -> ResponseEnvelope {
        self.runtime.block_on(self.session.just_send(content))
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn close(&mut self) {
        self.runtime.block_on(self.session.close());
    }
}

impl Drop for BlockingSession {
    fn drop(&mut self) {
        if self.session.is_connected() {
            self.close();
        }
    }
}
