//! Reliable UDP: an ARQ session with optional forward error correction over
//! one connected datagram socket.
//!
//! A [`RudpSession`] is the byte-stream end used by the data path. The
//! protocol state lives in an [`arq::Arq`] behind a lock; a driver task owns
//! the socket, feeds inbound datagrams into the control block and flushes it
//! every flush interval.

pub mod arq;
pub mod fec;
pub mod segment;

use crate::config::ReliableUdpSettings;
use crate::error::{Error, Result};
use arq::{Arq, SessionStats, DEFAULT_MTU};
use fec::{FecDecoder, FecEncoder, FEC_OVERHEAD};
use log::{debug, warn};
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Derives the conversation id both ends use for a stream.
pub fn conv_for(cookie: &str, stream_id: u32) -> u32 {
    let prefix = cookie.get(..8).unwrap_or("0");
    u32::from_str_radix(prefix, 16).unwrap_or(0) ^ stream_id
}

struct Shared {
    arq: Mutex<Arq>,
    stats: Arc<SessionStats>,
    readable: Notify,
    writable: Notify,
    flush_now: Notify,
    closed: CancellationToken,
    failure: Mutex<Option<String>>,
    send_limit: usize,
}

impl Shared {
    fn closed_error(&self) -> io::Error {
        let reason = self
            .failure
            .lock()
            .clone()
            .unwrap_or_else(|| "reliable-UDP session closed".to_string());
        io::Error::new(io::ErrorKind::BrokenPipe, reason)
    }
}

/// Handle on a session's driver task, used to stop it and wait for it.
pub struct SessionDriver {
    closed: CancellationToken,
    join: JoinHandle<()>,
}

impl SessionDriver {
    pub async fn shutdown(self) {
        self.closed.cancel();
        if let Err(e) = self.join.await {
            if e.is_panic() {
                warn!("reliable-UDP driver panicked: {}", e);
            }
        }
    }
}

/// Byte-stream end of a reliable-UDP session.
pub struct RudpSession {
    shared: Arc<Shared>,
}

impl RudpSession {
    /// Starts a session over `socket`, which must already be connected to the
    /// peer.
    pub fn start(
        socket: UdpSocket,
        conv: u32,
        settings: &ReliableUdpSettings,
    ) -> Result<(Self, SessionDriver)> {
        let (encoder, decoder, mtu) = if settings.fec_enabled() {
            let enc = FecEncoder::new(settings.data_shards, settings.parity_shards)
                .map_err(|e| Error::Config(e.to_string()))?;
            let dec = FecDecoder::new(settings.data_shards, settings.parity_shards)
                .map_err(|e| Error::Config(e.to_string()))?;
            (Some(enc), Some(dec), DEFAULT_MTU - FEC_OVERHEAD)
        } else {
            (None, None, DEFAULT_MTU)
        };

        let arq = Arq::new(conv, settings, mtu);
        let stats = arq.stats();
        let closed = CancellationToken::new();
        let shared = Arc::new(Shared {
            arq: Mutex::new(arq),
            stats,
            readable: Notify::new(),
            writable: Notify::new(),
            flush_now: Notify::new(),
            closed: closed.clone(),
            failure: Mutex::new(None),
            send_limit: 2 * settings.snd_wnd.max(1) as usize,
        });

        let driver = Driver {
            shared: Arc::clone(&shared),
            socket,
            encoder,
            decoder,
            epoch: Instant::now(),
        };
        let join = tokio::spawn(driver.run(settings.flush_interval));
        debug!("reliable-UDP session conv={:#010x} started", conv);

        Ok((Self { shared }, SessionDriver { closed, join }))
    }

    /// Queues `data`, waiting while more than twice the send window is
    /// outstanding. Cancel-safe.
    pub async fn send(&self, data: &[u8]) -> io::Result<usize> {
        loop {
            if self.shared.closed.is_cancelled() {
                return Err(self.shared.closed_error());
            }
            {
                let mut arq = self.shared.arq.lock();
                if arq.wait_snd() < self.shared.send_limit {
                    let n = arq.send(data);
                    let full = arq.wait_snd() >= arq.snd_wnd() as usize;
                    drop(arq);
                    if full {
                        self.shared.flush_now.notify_one();
                    }
                    return Ok(n);
                }
            }
            tokio::select! {
                _ = self.shared.writable.notified() => {}
                _ = self.shared.closed.cancelled() => {}
            }
        }
    }

    /// Reads in-order bytes. Returns `Ok(0)` once the session is closed and
    /// drained. Cancel-safe.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let n = self.shared.arq.lock().recv(buf);
            if n > 0 {
                return Ok(n);
            }
            if self.shared.closed.is_cancelled() {
                return match self.shared.failure.lock().clone() {
                    Some(reason) => Err(io::Error::new(io::ErrorKind::ConnectionAborted, reason)),
                    None => Ok(0),
                };
            }
            tokio::select! {
                _ = self.shared.readable.notified() => {}
                _ = self.shared.closed.cancelled() => {}
            }
        }
    }

    pub fn stats(&self) -> Arc<SessionStats> {
        Arc::clone(&self.shared.stats)
    }

    pub fn close(&self) {
        self.shared.closed.cancel();
    }
}

impl Drop for RudpSession {
    fn drop(&mut self) {
        self.shared.closed.cancel();
    }
}

struct Driver {
    shared: Arc<Shared>,
    socket: UdpSocket,
    encoder: Option<FecEncoder>,
    decoder: Option<FecDecoder>,
    epoch: Instant,
}

impl Driver {
    fn now_ms(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }

    async fn run(mut self, flush_interval: std::time::Duration) {
        let mut ticker = time::interval(flush_interval.max(std::time::Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut buf = vec![0u8; 64 * 1024];

        let outcome: io::Result<()> = loop {
            tokio::select! {
                biased;
                _ = self.shared.closed.cancelled() => break Ok(()),
                received = self.socket.recv(&mut buf) => match received {
                    Ok(n) => self.ingest(&buf[..n]),
                    Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => continue,
                    Err(e) => break Err(e),
                },
                _ = ticker.tick() => {
                    if let Err(e) = self.flush().await {
                        break Err(e);
                    }
                }
                _ = self.shared.flush_now.notified() => {
                    if let Err(e) = self.flush().await {
                        break Err(e);
                    }
                }
            }
        };

        if let Err(e) = outcome {
            warn!("reliable-UDP session failed: {}", e);
            *self.shared.failure.lock() = Some(e.to_string());
        }
        self.shared.closed.cancel();
        self.shared.readable.notify_one();
        self.shared.writable.notify_one();
    }

    fn ingest(&mut self, raw: &[u8]) {
        let datagrams = match self.decoder.as_mut() {
            Some(dec) => match dec.decode(raw) {
                Ok(d) => {
                    self.shared
                        .stats
                        .fec_recovered
                        .store(dec.recovered(), Ordering::Relaxed);
                    d
                }
                Err(e) => {
                    debug!("dropping FEC packet: {}", e);
                    return;
                }
            },
            None => vec![raw.to_vec()],
        };

        let now = self.now_ms();
        let mut arq = self.shared.arq.lock();
        for d in &datagrams {
            if let Err(e) = arq.input(d, now) {
                debug!("dropping segment: {}", e);
            }
        }
        let readable = arq.readable();
        let writable = arq.wait_snd() < self.shared.send_limit;
        drop(arq);

        if readable {
            self.shared.readable.notify_one();
        }
        if writable {
            self.shared.writable.notify_one();
        }
    }

    async fn flush(&mut self) -> io::Result<()> {
        let now = self.now_ms();
        let mut out = Vec::new();
        self.shared.arq.lock().flush(now, &mut out);

        for datagram in out {
            match self.encoder.as_mut() {
                Some(enc) => {
                    let packets = enc
                        .encode(&datagram)
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                    for p in packets {
                        send_ignoring_refused(&self.socket, &p).await?;
                    }
                }
                None => send_ignoring_refused(&self.socket, &datagram).await?,
            }
        }
        Ok(())
    }
}

async fn send_ignoring_refused(socket: &UdpSocket, datagram: &[u8]) -> io::Result<()> {
    match socket.send(datagram).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn pair(settings: &ReliableUdpSettings) -> ((RudpSession, SessionDriver), (RudpSession, SessionDriver)) {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        a.connect(b.local_addr().unwrap()).await.unwrap();
        b.connect(a.local_addr().unwrap()).await.unwrap();
        (
            RudpSession::start(a, 9, settings).unwrap(),
            RudpSession::start(b, 9, settings).unwrap(),
        )
    }

    #[test]
    fn test_conv_derivation() {
        let cookie = "00000010aaaaaaaaaaaaaaaaaaaaaaaa";
        assert_eq!(conv_for(cookie, 5), 0x10 ^ 5);
        assert_ne!(conv_for(cookie, 5), conv_for(cookie, 7));
        assert_eq!(conv_for("zz", 3), 3);
    }

    #[tokio::test]
    async fn test_small_transfer() {
        let settings = ReliableUdpSettings::kcp_defaults();
        let ((tx, tx_driver), (rx, rx_driver)) = pair(&settings).await;

        tx.send(b"hello over arq").await.unwrap();
        let mut buf = [0u8; 64];
        let n = tokio::time::timeout(Duration::from_secs(2), rx.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"hello over arq");

        tx.close();
        rx.close();
        tx_driver.shutdown().await;
        rx_driver.shutdown().await;
    }

    #[tokio::test]
    async fn test_closed_session_reads_eof_and_refuses_writes() {
        let settings = ReliableUdpSettings::rudp_defaults();
        let ((tx, tx_driver), (rx, rx_driver)) = pair(&settings).await;
        rx.close();
        rx_driver.shutdown().await;
        let mut buf = [0u8; 8];
        assert_eq!(rx.recv(&mut buf).await.unwrap(), 0);

        tx_driver.shutdown().await;
        assert!(tx.send(b"x").await.is_err());
    }
}
