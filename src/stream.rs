//! Data streams and their send/receive workers.

use crate::error::{Error, Result};
use crate::token_bucket::TokenBucket;
use crate::transport::{Conn, StreamProbe};
use rand::RngCore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Running totals of one stream.
///
/// Written only by the stream's worker; the sampler reads them concurrently.
#[derive(Debug, Default)]
pub struct StreamCounters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    blocks_sent: AtomicU64,
    blocks_received: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub blocks_sent: u64,
    pub blocks_received: u64,
}

impl CounterSnapshot {
    pub fn bytes(&self) -> u64 {
        self.bytes_sent + self.bytes_received
    }
}

impl StreamCounters {
    /// A short write moves the byte count but does not complete a block.
    fn record_sent(&self, bytes: usize, block: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        if bytes >= block {
            self.blocks_sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.blocks_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            blocks_sent: self.blocks_sent.load(Ordering::Relaxed),
            blocks_received: self.blocks_received.load(Ordering::Relaxed),
        }
    }
}

/// Which way bytes flow on a stream, from this endpoint's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

impl Direction {
    /// Direction for an endpoint: clients send unless reversed.
    pub fn for_endpoint(is_client: bool, reverse: bool) -> Self {
        if is_client != reverse {
            Direction::Send
        } else {
            Direction::Receive
        }
    }
}

/// One data connection plus its transfer buffer and counters.
pub struct Stream {
    id: usize,
    direction: Direction,
    conn: Conn,
    buffer: Vec<u8>,
    counters: Arc<StreamCounters>,
}

impl Stream {
    pub fn new(id: usize, direction: Direction, conn: Conn, blksize: usize) -> Self {
        let mut buffer = vec![0u8; blksize];
        if direction == Direction::Send {
            rand::thread_rng().fill_bytes(&mut buffer);
        }
        Self {
            id,
            direction,
            conn,
            buffer,
            counters: Arc::new(StreamCounters::default()),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn counters(&self) -> Arc<StreamCounters> {
        Arc::clone(&self.counters)
    }

    pub fn probe(&self) -> StreamProbe {
        self.conn.probe()
    }

    /// Sends one buffer. Counters move only on success.
    pub async fn send_block(&mut self) -> std::io::Result<usize> {
        let n = self.conn.send(&mut self.buffer).await?;
        if n > 0 {
            self.counters.record_sent(n, self.buffer.len());
        }
        Ok(n)
    }

    /// Receives up to one buffer. `Ok(0)` means the peer closed the stream.
    pub async fn recv_block(&mut self) -> std::io::Result<usize> {
        let n = self.conn.recv(&mut self.buffer).await?;
        if n > 0 {
            self.counters.record_received(n);
        }
        Ok(n)
    }

    pub async fn close(self) {
        self.conn.close().await;
    }
}

/// Moves data until `run` is cancelled, the peer closes, or I/O fails.
///
/// The stream is always handed back so the engine can close it after every
/// worker has stopped. An I/O failure cancels `run` so the other workers stop
/// too.
pub(crate) async fn run_worker(
    mut stream: Stream,
    run: CancellationToken,
    mut pacer: Option<TokenBucket>,
) -> (Stream, Result<()>) {
    let block = stream.buffer.len();
    let outcome = loop {
        if let Some(bucket) = pacer.as_mut() {
            tokio::select! {
                biased;
                _ = run.cancelled() => break Ok(()),
                _ = bucket.consume(block) => {}
            }
        }

        let io = match stream.direction {
            Direction::Send => tokio::select! {
                biased;
                _ = run.cancelled() => break Ok(()),
                r = stream.send_block() => r,
            },
            Direction::Receive => tokio::select! {
                biased;
                _ = run.cancelled() => break Ok(()),
                r = stream.recv_block() => r,
            },
        };

        match io {
            Ok(0) if stream.direction == Direction::Receive => {
                log::debug!("stream {} closed by peer", stream.id);
                break Ok(());
            }
            Ok(0) => tokio::task::yield_now().await,
            Ok(_) => {}
            Err(e) => {
                run.cancel();
                break Err(Error::data_path(stream.id, e));
            }
        }
    };
    (stream, outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (a, b) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (a.unwrap(), b.unwrap().0)
    }

    #[test]
    fn test_direction_for_endpoint() {
        assert_eq!(Direction::for_endpoint(true, false), Direction::Send);
        assert_eq!(Direction::for_endpoint(false, false), Direction::Receive);
        assert_eq!(Direction::for_endpoint(true, true), Direction::Receive);
        assert_eq!(Direction::for_endpoint(false, true), Direction::Send);
    }

    #[test]
    fn test_short_write_is_not_a_block() {
        let counters = StreamCounters::default();
        counters.record_sent(4096, 4096);
        counters.record_sent(1000, 4096);
        counters.record_received(700);
        let snap = counters.snapshot();
        assert_eq!(snap.bytes_sent, 5096);
        assert_eq!(snap.blocks_sent, 1);
        assert_eq!(snap.blocks_received, 1);
    }

    #[tokio::test]
    async fn test_workers_move_bytes_until_cancelled() {
        let (a, b) = tcp_pair().await;
        let sender = Stream::new(5, Direction::Send, Conn::Tcp(a), 4096);
        let receiver = Stream::new(5, Direction::Receive, Conn::Tcp(b), 4096);
        let sent = sender.counters();
        let received = receiver.counters();

        let run = CancellationToken::new();
        let tx = tokio::spawn(run_worker(sender, run.clone(), None));
        let rx = tokio::spawn(run_worker(receiver, run.clone(), None));
        tokio::time::sleep(Duration::from_millis(200)).await;
        run.cancel();

        let (sender, tx_result) = tx.await.unwrap();
        let (receiver, rx_result) = rx.await.unwrap();
        assert!(tx_result.is_ok());
        assert!(rx_result.is_ok());

        let sent = sent.snapshot();
        let received = received.snapshot();
        assert!(sent.bytes_sent > 0);
        assert!(received.bytes_received > 0);
        assert!(received.bytes_received <= sent.bytes_sent);
        assert_eq!(sent.bytes_received, 0);

        sender.close().await;
        receiver.close().await;
    }

    #[tokio::test]
    async fn test_receiver_stops_on_peer_close() {
        let (a, b) = tcp_pair().await;
        let receiver = Stream::new(7, Direction::Receive, Conn::Tcp(b), 1024);
        drop(a);
        let run = CancellationToken::new();
        let (_, result) = tokio::time::timeout(Duration::from_secs(2), run_worker(receiver, run.clone(), None))
            .await
            .unwrap();
        assert!(result.is_ok());
        assert!(!run.is_cancelled());
    }

    #[tokio::test]
    async fn test_paced_sender_respects_rate() {
        let (a, b) = tcp_pair().await;
        let sender = Stream::new(5, Direction::Send, Conn::Tcp(a), 1000);
        let sink = Stream::new(5, Direction::Receive, Conn::Tcp(b), 65536);
        let counters = sender.counters();

        let run = CancellationToken::new();
        // 100 KB/s with a 10 KB burst allowance
        let pacer = TokenBucket::new(100_000);
        let tx = tokio::spawn(run_worker(sender, run.clone(), Some(pacer)));
        let rx = tokio::spawn(run_worker(sink, run.clone(), None));
        tokio::time::sleep(Duration::from_millis(500)).await;
        run.cancel();
        let _ = tx.await.unwrap();
        let _ = rx.await.unwrap();

        let sent = counters.snapshot().bytes_sent;
        assert!(sent >= 30_000, "sent {}", sent);
        assert!(sent <= 80_000, "sent {}", sent);
    }
}
