use super::udp::{establish, DatagramListener};
use super::Conn;
use crate::config::{ProtocolKind, Settings};
use crate::error::Result;
use crate::rudp::{conv_for, RudpSession, SessionDriver};
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

/// Reliable UDP (`rudp` and `kcp`): an ARQ session per stream, optionally
/// protected by FEC.
#[derive(Clone)]
pub struct ReliableTransport {
    kind: ProtocolKind,
    settings: Settings,
    /// Driver tasks of every session this transport opened, shut down at
    /// teardown.
    drivers: Arc<Mutex<Vec<SessionDriver>>>,
}

impl fmt::Debug for ReliableTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReliableTransport")
            .field("kind", &self.kind)
            .field("settings", &self.settings)
            .field("sessions", &self.drivers.lock().len())
            .finish()
    }
}

impl ReliableTransport {
    pub fn new(kind: ProtocolKind, settings: Settings) -> Self {
        Self {
            kind,
            settings,
            drivers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn kind(&self) -> ProtocolKind {
        self.kind
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub(super) fn init(&mut self, settings: Settings) -> Result<()> {
        settings.reliable.validate()?;
        self.settings = settings;
        Ok(())
    }

    fn buffers(&self) -> (usize, usize) {
        (
            self.settings.reliable.read_buf_size,
            self.settings.reliable.write_buf_size,
        )
    }

    fn open(&self, socket: UdpSocket, cookie: &str, stream_id: u32) -> Result<Conn> {
        let conv = conv_for(cookie, stream_id);
        let (session, driver) = RudpSession::start(socket, conv, &self.settings.reliable)?;
        self.drivers.lock().push(driver);
        Ok(Conn::Rudp(session))
    }

    pub(super) async fn accept(
        &self,
        listener: &mut DatagramListener,
        cookie: &str,
        deadline: Duration,
    ) -> Result<(usize, Conn)> {
        let (id, socket) = listener.accept_stream(cookie, deadline).await?;
        Ok((id as usize, self.open(socket, cookie, id)?))
    }

    pub(super) async fn connect(
        &self,
        server: SocketAddr,
        cookie: &str,
        stream_id: usize,
        deadline: Duration,
    ) -> Result<Conn> {
        let id = stream_id as u32;
        let socket = establish(server, cookie, id, deadline, self.buffers()).await?;
        self.open(socket, cookie, id)
    }

    /// Stops every session driver and waits for it to exit.
    pub(super) async fn teardown(&self) {
        let drivers: Vec<SessionDriver> = std::mem::take(&mut *self.drivers.lock());
        let count = drivers.len();
        for driver in drivers {
            driver.shutdown().await;
        }
        if count > 0 {
            log::debug!("stopped {} reliable-UDP session(s)", count);
        }
    }

    #[cfg(test)]
    pub(super) fn session_count(&self) -> usize {
        self.drivers.lock().len()
    }
}
