//! The control connection of a session.

use crate::error::{Error, Result};
use crate::protocol::{deserialize_message, send_message, Message};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Framed control messages over one TCP connection.
///
/// A reader task decodes incoming frames into an inbox, so waiting for a
/// message can be raced against other events without losing a half-read
/// frame.
pub(crate) struct ControlChannel {
    peer: SocketAddr,
    writer: OwnedWriteHalf,
    inbox: mpsc::Receiver<Result<Message>>,
    reader: JoinHandle<()>,
}

impl ControlChannel {
    pub fn new(stream: TcpStream) -> Result<Self> {
        let peer = stream.peer_addr()?;
        if let Err(e) = stream.set_nodelay(true) {
            log::warn!("failed to set TCP_NODELAY on control connection: {}", e);
        }
        let (mut read, writer) = stream.into_split();
        let (tx, inbox) = mpsc::channel(8);
        let reader = tokio::spawn(async move {
            loop {
                match deserialize_message(&mut read).await {
                    Ok(msg) => {
                        if tx.send(Ok(msg)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                }
            }
        });
        Ok(Self {
            peer,
            writer,
            inbox,
            reader,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub async fn send(&mut self, msg: &Message) -> Result<()> {
        log::debug!("-> {} {}", self.peer, msg.name());
        send_message(&mut self.writer, msg).await.map_err(|e| match e {
            Error::Io(io) => Error::Protocol(format!("control send to {}: {}", self.peer, io)),
            other => other,
        })
    }

    /// Best-effort error notice before the session is abandoned.
    pub async fn send_error(&mut self, message: impl Into<String>) {
        let msg = Message::error(message);
        match tokio::time::timeout(Duration::from_secs(1), self.send(&msg)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::debug!("could not deliver error to {}: {}", self.peer, e),
            Err(_) => log::debug!("timed out delivering error to {}", self.peer),
        }
    }

    /// Next message from the peer. A peer `Error` frame, a closed connection
    /// and a timeout all surface as handshake-class errors. Cancel-safe.
    pub async fn recv(&mut self, timeout: Duration) -> Result<Message> {
        let next = tokio::time::timeout(timeout, self.inbox.recv())
            .await
            .map_err(|_| {
                Error::Protocol(format!("no control message from {} within {:?}", self.peer, timeout))
            })?;
        let msg = match next {
            Some(Ok(msg)) => msg,
            Some(Err(Error::Io(e))) => {
                return Err(Error::Protocol(format!("control connection to {} lost: {}", self.peer, e)))
            }
            Some(Err(e)) => return Err(e),
            None => return Err(Error::Protocol(format!("control connection to {} closed", self.peer))),
        };
        log::debug!("<- {} {}", self.peer, msg.name());
        match msg {
            Message::Error { message } => Err(Error::Protocol(format!("peer reported: {}", message))),
            msg => Ok(msg),
        }
    }

    /// Like [`recv`](Self::recv), but gives up with `Cancelled` when `token`
    /// fires first.
    pub async fn recv_or_cancel(&mut self, timeout: Duration, token: &CancellationToken) -> Result<Message> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(Error::Cancelled),
            msg = self.recv(timeout) => msg,
        }
    }

    pub async fn close(mut self) {
        let _ = self.writer.shutdown().await;
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Expects a specific message kind, naming what arrived otherwise.
pub(crate) fn unexpected(expected: &str, got: &Message) -> Error {
    Error::Protocol(format!("expected {}, got {}", expected, got.name()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SessionTotals;
    use tokio::net::TcpListener;

    async fn pair() -> (ControlChannel, ControlChannel) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (a, b) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (
            ControlChannel::new(a.unwrap()).unwrap(),
            ControlChannel::new(b.unwrap().0).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_messages_flow_both_ways() {
        let (mut client, mut server) = pair().await;
        client.send(&Message::Done).await.unwrap();
        assert!(matches!(server.recv(Duration::from_secs(1)).await.unwrap(), Message::Done));

        let totals = SessionTotals {
            bytes_sent: 10,
            ..Default::default()
        };
        server.send(&Message::Results(totals)).await.unwrap();
        match client.recv(Duration::from_secs(1)).await.unwrap() {
            Message::Results(t) => assert_eq!(t, totals),
            other => panic!("unexpected {}", other.name()),
        }
    }

    #[tokio::test]
    async fn test_peer_error_and_close_are_protocol_errors() {
        let (mut client, mut server) = pair().await;
        server.send_error("no such protocol").await;
        let err = client.recv(Duration::from_secs(1)).await.unwrap_err();
        assert!(err.to_string().contains("no such protocol"));

        server.close().await;
        let err = client.recv(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn test_recv_is_cancel_safe() {
        let (mut client, mut server) = pair().await;
        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(
            server.recv_or_cancel(Duration::from_secs(1), &token).await,
            Err(Error::Cancelled)
        ));
        client.send(&Message::Done).await.unwrap();
        assert!(matches!(server.recv(Duration::from_secs(1)).await.unwrap(), Message::Done));
        assert!(matches!(
            server.recv(Duration::from_millis(50)).await,
            Err(Error::Protocol(_))
        ));
    }
}
