//! Protocol variants behind one capability table.
//!
//! The engine selects a [`Protocol`] by name once per session and drives it
//! through `init`, `listen`, `accept`/`connect`, `teardown` and
//! `stats_callback`. The per-stream `send`/`recv` calls live on the [`Conn`]
//! each variant hands out.

mod reliable;
mod tcp;
mod udp;

pub use reliable::ReliableTransport;
pub use tcp::TcpTransport;
pub use udp::{DatagramListener, UdpConn, UdpTransport};

use crate::config::{ProtocolKind, Settings, TransportFamily};
use crate::error::Result;
use crate::measurements::TransportStats;
use crate::rudp::arq::SessionStats;
use crate::rudp::RudpSession;
use crate::tcp_info::{self, RawSocket};
use crate::udp_packet::SequenceTracker;
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Per-stream accept deadline on the server.
pub const ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Margin added to the test duration for client-side connects.
pub const CONNECT_MARGIN: Duration = Duration::from_secs(5);

/// Resend period for datagram stream hellos.
pub const HELLO_RETRY: Duration = Duration::from_millis(200);

/// Socket buffer size for plain UDP streams.
pub const UDP_SOCKET_BUFFER: usize = 4 * 1024 * 1024;

/// The active transport of a session.
#[derive(Debug, Clone)]
pub enum Protocol {
    Tcp(TcpTransport),
    Udp(UdpTransport),
    ReliableUdp(ReliableTransport),
}

impl Protocol {
    pub fn new(kind: ProtocolKind, settings: Settings) -> Self {
        match kind.family() {
            TransportFamily::Tcp => Protocol::Tcp(TcpTransport::new(settings)),
            TransportFamily::Udp => Protocol::Udp(UdpTransport::new(settings)),
            TransportFamily::ReliableUdp => {
                Protocol::ReliableUdp(ReliableTransport::new(kind, settings))
            }
        }
    }

    pub fn kind(&self) -> ProtocolKind {
        match self {
            Protocol::Tcp(_) => ProtocolKind::Tcp,
            Protocol::Udp(_) => ProtocolKind::Udp,
            Protocol::ReliableUdp(t) => t.kind(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().name()
    }

    pub fn settings(&self) -> &Settings {
        match self {
            Protocol::Tcp(t) => &t.settings,
            Protocol::Udp(t) => &t.settings,
            Protocol::ReliableUdp(t) => t.settings(),
        }
    }

    /// Attaches the session's settings. Fails only for settings this
    /// transport cannot honour.
    pub fn init(&mut self, settings: Settings) -> Result<()> {
        match self {
            Protocol::Tcp(t) => {
                t.settings = settings;
                Ok(())
            }
            Protocol::Udp(t) => t.init(settings),
            Protocol::ReliableUdp(t) => t.init(settings),
        }
    }

    /// Opens the server-side data endpoint, if this transport needs one
    /// besides the control listener.
    pub async fn listen(&self, bind: SocketAddr) -> Result<Option<DatagramListener>> {
        match self {
            Protocol::Tcp(_) => Ok(None),
            Protocol::Udp(_) | Protocol::ReliableUdp(_) => {
                let buffers = self.socket_buffers();
                DatagramListener::bind(bind, buffers).await.map(Some)
            }
        }
    }

    /// Accepts the next data stream carrying `cookie`, within `deadline`.
    pub async fn accept(
        &self,
        control: &TcpListener,
        datagram: Option<&mut DatagramListener>,
        cookie: &str,
        deadline: Duration,
    ) -> Result<(usize, Conn)> {
        match self {
            Protocol::Tcp(t) => t.accept(control, cookie, deadline).await,
            Protocol::Udp(t) => {
                let listener = require_datagram(datagram)?;
                t.accept(listener, cookie, deadline).await
            }
            Protocol::ReliableUdp(t) => {
                let listener = require_datagram(datagram)?;
                t.accept(listener, cookie, deadline).await
            }
        }
    }

    /// Opens data stream `stream_id` to `server`, within `deadline`.
    pub async fn connect(
        &self,
        server: SocketAddr,
        cookie: &str,
        stream_id: usize,
        deadline: Duration,
    ) -> Result<Conn> {
        match self {
            Protocol::Tcp(t) => t.connect(server, cookie, stream_id, deadline).await,
            Protocol::Udp(t) => t.connect(server, cookie, stream_id, deadline).await,
            Protocol::ReliableUdp(t) => t.connect(server, cookie, stream_id, deadline).await,
        }
    }

    /// Releases transport-owned resources. Connections themselves are closed
    /// by their owner.
    pub async fn teardown(&self) {
        if let Protocol::ReliableUdp(t) = self {
            t.teardown().await;
        }
    }

    /// Reads transport counters for one stream. Never touches the data path.
    pub fn stats_callback(&self, probe: &StreamProbe) -> TransportStats {
        match (self, probe) {
            (Protocol::Tcp(_), StreamProbe::Tcp(Some(fd))) => tcp_info::read(*fd)
                .map(|s| TransportStats {
                    rtt_ms: Some(s.rtt_us as f64 / 1000.0),
                    retransmits: Some(s.total_retrans as u64),
                    snd_cwnd: Some(s.snd_cwnd as u64),
                    ..Default::default()
                })
                .unwrap_or_default(),
            (Protocol::Udp(_), StreamProbe::Udp(tracker)) => {
                let t = tracker.lock();
                TransportStats {
                    packets: Some(t.received()),
                    lost: Some(t.lost()),
                    jitter_ms: Some(t.jitter_ms()),
                    out_of_order: Some(t.out_of_order()),
                    ..Default::default()
                }
            }
            (Protocol::ReliableUdp(_), StreamProbe::Rudp(stats)) => {
                let s = stats.snapshot();
                TransportStats {
                    rtt_ms: (s.srtt_ms > 0).then_some(s.srtt_ms as f64),
                    retransmits: Some(s.retransmits),
                    lost: Some(s.lost),
                    fec_recovered: Some(s.fec_recovered),
                    ..Default::default()
                }
            }
            _ => TransportStats::default(),
        }
    }

    fn socket_buffers(&self) -> (usize, usize) {
        match self {
            Protocol::ReliableUdp(t) => {
                let r = t.settings().reliable;
                (r.read_buf_size, r.write_buf_size)
            }
            _ => (UDP_SOCKET_BUFFER, UDP_SOCKET_BUFFER),
        }
    }
}

fn require_datagram(listener: Option<&mut DatagramListener>) -> Result<&mut DatagramListener> {
    listener.ok_or_else(|| {
        crate::error::Error::InvalidState("datagram transport accept without a bound socket".into())
    })
}

/// A data connection handed to a stream.
pub enum Conn {
    Tcp(TcpStream),
    Udp(UdpConn),
    Rudp(RudpSession),
}

impl Conn {
    /// Writes one block. For UDP the datagram header is stamped into `buf`.
    pub async fn send(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Conn::Tcp(s) => s.write(buf).await,
            Conn::Udp(u) => u.send(buf).await,
            Conn::Rudp(r) => r.send(buf).await,
        }
    }

    pub async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Conn::Tcp(s) => s.read(buf).await,
            Conn::Udp(u) => u.recv(buf).await,
            Conn::Rudp(r) => r.recv(buf).await,
        }
    }

    pub fn probe(&self) -> StreamProbe {
        match self {
            Conn::Tcp(s) => StreamProbe::Tcp(tcp_info::raw_socket(s)),
            Conn::Udp(u) => StreamProbe::Udp(u.tracker()),
            Conn::Rudp(r) => StreamProbe::Rudp(r.stats()),
        }
    }

    pub async fn close(self) {
        match self {
            Conn::Tcp(mut s) => {
                let _ = s.shutdown().await;
            }
            Conn::Udp(_) => {}
            Conn::Rudp(r) => r.close(),
        }
    }
}

/// Read-only view of a stream's transport state for the sampler.
#[derive(Clone)]
pub enum StreamProbe {
    /// Valid only while the engine holds the stream open.
    Tcp(Option<RawSocket>),
    Udp(Arc<Mutex<SequenceTracker>>),
    Rudp(Arc<SessionStats>),
}

/// Applies kernel buffer sizes to a datagram socket; failures are logged.
pub(crate) fn tune_datagram_socket(socket: &tokio::net::UdpSocket, buffers: (usize, usize)) {
    let sock = socket2::SockRef::from(socket);
    if let Err(e) = sock.set_recv_buffer_size(buffers.0) {
        log::warn!("could not set receive buffer to {} bytes: {}", buffers.0, e);
    }
    if let Err(e) = sock.set_send_buffer_size(buffers.1) {
        log::warn!("could not set send buffer to {} bytes: {}", buffers.1, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_selection() {
        for kind in ProtocolKind::ALL {
            let protocol = Protocol::new(kind, Settings::defaults_for(kind));
            assert_eq!(protocol.kind(), kind);
            assert_eq!(protocol.name(), kind.name());
        }
        assert!(matches!(
            Protocol::new(ProtocolKind::Kcp, Settings::default()),
            Protocol::ReliableUdp(_)
        ));
    }

    #[test]
    fn test_stats_callback_ignores_foreign_probe() {
        let protocol = Protocol::new(ProtocolKind::Tcp, Settings::default());
        let probe = StreamProbe::Udp(Arc::new(Mutex::new(SequenceTracker::new())));
        assert_eq!(protocol.stats_callback(&probe), TransportStats::default());
    }

    #[tokio::test]
    async fn test_tcp_listen_needs_no_datagram_socket() {
        let protocol = Protocol::new(ProtocolKind::Tcp, Settings::default());
        let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
        assert!(protocol.listen(bind).await.unwrap().is_none());

        let protocol = Protocol::new(ProtocolKind::Udp, Settings::defaults_for(ProtocolKind::Udp));
        assert!(protocol.listen(bind).await.unwrap().is_some());
    }
}
