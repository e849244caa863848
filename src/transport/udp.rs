use super::{tune_datagram_socket, Conn, HELLO_RETRY, UDP_SOCKET_BUFFER};
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::udp_packet::{
    decode_answer, decode_hello, encode_answer, encode_hello, now_micros, SequenceTracker,
    UdpPacketHeader, ANSWER_LEN, HELLO_LEN,
};
use log::{debug, trace};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};

/// Server-side datagram socket that turns stream hellos into dedicated,
/// connected sockets.
pub struct DatagramListener {
    socket: UdpSocket,
    buffers: (usize, usize),
    /// Stream id to dedicated port, so repeated hellos get the same answer.
    answered: HashMap<u32, u16>,
}

impl DatagramListener {
    pub(crate) async fn bind(addr: SocketAddr, buffers: (usize, usize)) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await.map_err(|source| Error::Listen {
            addr: addr.to_string(),
            source,
        })?;
        debug!("datagram listener bound on {}", addr);
        Ok(Self {
            socket,
            buffers,
            answered: HashMap::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Waits for the hello of a stream not yet accepted and returns its id and
    /// a socket connected to the sender.
    pub(crate) async fn accept_stream(
        &mut self,
        cookie: &str,
        deadline: Duration,
    ) -> Result<(u32, UdpSocket)> {
        let until = Instant::now() + deadline;
        let mut buf = [0u8; 512];
        loop {
            let (n, peer) = tokio::time::timeout_at(until, self.socket.recv_from(&mut buf))
                .await
                .map_err(|_| Error::Accept(format!("no stream hello within {:?}", deadline)))?
                .map_err(|e| Error::Accept(e.to_string()))?;

            let Some((their_cookie, stream_id)) = decode_hello(&buf[..n]) else {
                trace!("ignoring {} byte datagram from {}", n, peer);
                continue;
            };
            if their_cookie != cookie {
                debug!("ignoring hello with foreign cookie from {}", peer);
                continue;
            }
            if let Some(port) = self.answered.get(&stream_id) {
                self.answer(peer, stream_id, *port).await?;
                continue;
            }

            let local = self.socket.local_addr()?;
            let dedicated = UdpSocket::bind(SocketAddr::new(local.ip(), 0))
                .await
                .map_err(|e| Error::Accept(e.to_string()))?;
            dedicated
                .connect(peer)
                .await
                .map_err(|e| Error::Accept(e.to_string()))?;
            tune_datagram_socket(&dedicated, self.buffers);
            let port = dedicated.local_addr()?.port();

            self.answered.insert(stream_id, port);
            self.answer(peer, stream_id, port).await?;
            debug!("stream {} from {} on port {}", stream_id, peer, port);
            return Ok((stream_id, dedicated));
        }
    }

    async fn answer(&self, peer: SocketAddr, stream_id: u32, port: u16) -> Result<()> {
        self.socket
            .send_to(&encode_answer(stream_id, port), peer)
            .await
            .map_err(|e| Error::Accept(e.to_string()))?;
        Ok(())
    }
}

/// Client side of the hello exchange: returns a socket connected to the port
/// the server dedicated to `stream_id`.
pub(crate) async fn establish(
    server: SocketAddr,
    cookie: &str,
    stream_id: u32,
    deadline: Duration,
    buffers: (usize, usize),
) -> Result<UdpSocket> {
    let hello: [u8; HELLO_LEN] = encode_hello(cookie, stream_id)
        .ok_or_else(|| Error::Protocol(format!("malformed session cookie {:?}", cookie)))?;
    let unspecified = match server.ip() {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    let socket = UdpSocket::bind(SocketAddr::new(unspecified, 0))
        .await
        .map_err(|e| Error::connect(server, e))?;
    tune_datagram_socket(&socket, buffers);

    let exchange = async {
        let mut buf = [0u8; 64];
        loop {
            match socket.send_to(&hello, server).await {
                Ok(_) => {}
                // an earlier hello bounced off a closed port; keep trying
                Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {}
                Err(e) => return Err(e),
            }
            let waited = timeout(HELLO_RETRY, socket.recv_from(&mut buf)).await;
            match waited {
                Ok(Ok((n, from))) if n == ANSWER_LEN && from.ip() == server.ip() => {
                    if let Some((id, port)) = decode_answer(&buf[..n]) {
                        if id == stream_id {
                            return Ok(port);
                        }
                    }
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {}
                Ok(Err(e)) => return Err(e),
                Err(_) => trace!("resending hello for stream {}", stream_id),
            }
        }
    };

    let port = timeout(deadline, exchange)
        .await
        .map_err(|_| Error::connect(server, format!("no answer to stream hello within {:?}", deadline)))?
        .map_err(|e| Error::connect(server, e))?;

    let dedicated = SocketAddr::new(server.ip(), port);
    socket
        .connect(dedicated)
        .await
        .map_err(|e| Error::connect(dedicated, e))?;
    Ok(socket)
}

/// Plain UDP: unreliable datagrams with sequence numbers for loss and jitter.
#[derive(Debug, Clone)]
pub struct UdpTransport {
    pub(super) settings: Settings,
}

impl UdpTransport {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    pub(super) fn init(&mut self, settings: Settings) -> Result<()> {
        if settings.blksize < UdpPacketHeader::SIZE {
            return Err(Error::Config(format!(
                "UDP block size {} cannot hold the {} byte datagram header",
                settings.blksize,
                UdpPacketHeader::SIZE
            )));
        }
        self.settings = settings;
        Ok(())
    }

    pub(super) async fn accept(
        &self,
        listener: &mut DatagramListener,
        cookie: &str,
        deadline: Duration,
    ) -> Result<(usize, Conn)> {
        let (id, socket) = listener.accept_stream(cookie, deadline).await?;
        Ok((id as usize, Conn::Udp(UdpConn::new(socket))))
    }

    pub(super) async fn connect(
        &self,
        server: SocketAddr,
        cookie: &str,
        stream_id: usize,
        deadline: Duration,
    ) -> Result<Conn> {
        let buffers = (UDP_SOCKET_BUFFER, UDP_SOCKET_BUFFER);
        let socket = establish(server, cookie, stream_id as u32, deadline, buffers).await?;
        Ok(Conn::Udp(UdpConn::new(socket)))
    }
}

/// A connected UDP data socket.
pub struct UdpConn {
    socket: UdpSocket,
    next_seq: u64,
    tracker: Arc<Mutex<SequenceTracker>>,
}

impl UdpConn {
    fn new(socket: UdpSocket) -> Self {
        Self {
            socket,
            next_seq: 0,
            tracker: Arc::new(Mutex::new(SequenceTracker::new())),
        }
    }

    pub fn tracker(&self) -> Arc<Mutex<SequenceTracker>> {
        Arc::clone(&self.tracker)
    }

    /// Stamps the header into `buf` and sends it as one datagram. A refused
    /// send counts as nothing sent.
    pub async fn send(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.len() < UdpPacketHeader::SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "block smaller than the datagram header",
            ));
        }
        UdpPacketHeader::new(self.next_seq, now_micros()).write_to(buf);
        match self.socket.send(buf).await {
            Ok(n) => {
                self.next_seq += 1;
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Receives one datagram and feeds its header to the loss/jitter tracker.
    pub async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.socket.recv(buf).await {
                Ok(n) => {
                    if let Some(header) = UdpPacketHeader::parse(&buf[..n]) {
                        self.tracker.lock().record(&header, now_micros());
                    }
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => continue,
                Err(e) => return Err(e),
            }
        }
    }
}
