use super::Conn;
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::protocol::{deserialize_message, send_message, Message};
use log::{debug, warn};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Instant};

/// TCP streams, each opened with a hello on the control port.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    pub(super) settings: Settings,
}

impl TcpTransport {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    fn tune(&self, stream: &TcpStream) {
        if self.settings.no_delay {
            if let Err(e) = stream.set_nodelay(true) {
                warn!("failed to set TCP_NODELAY: {}", e);
            }
        }
    }

    /// Accepts connections on the control listener until one presents a
    /// hello carrying `cookie`.
    pub(super) async fn accept(
        &self,
        listener: &TcpListener,
        cookie: &str,
        deadline: Duration,
    ) -> Result<(usize, Conn)> {
        let until = Instant::now() + deadline;
        loop {
            let (mut stream, peer) = tokio::time::timeout_at(until, listener.accept())
                .await
                .map_err(|_| Error::Accept(format!("no data connection within {:?}", deadline)))?
                .map_err(|e| Error::Accept(e.to_string()))?;

            let hello = tokio::time::timeout_at(until, deserialize_message(&mut stream)).await;
            match hello {
                Ok(Ok(Message::StreamHello {
                    cookie: theirs,
                    stream_id,
                })) if theirs == cookie => {
                    self.tune(&stream);
                    debug!("stream {} accepted from {}", stream_id, peer);
                    return Ok((stream_id, Conn::Tcp(stream)));
                }
                Ok(Ok(other)) => {
                    debug!("dropping connection from {} that sent {}", peer, other.name());
                }
                Ok(Err(e)) => debug!("dropping connection from {}: {}", peer, e),
                Err(_) => {
                    return Err(Error::Accept(format!(
                        "connection from {} sent no stream hello",
                        peer
                    )))
                }
            }
        }
    }

    pub(super) async fn connect(
        &self,
        server: SocketAddr,
        cookie: &str,
        stream_id: usize,
        deadline: Duration,
    ) -> Result<Conn> {
        let mut stream = timeout(deadline, TcpStream::connect(server))
            .await
            .map_err(|_| Error::connect(server, "timed out"))?
            .map_err(|e| Error::connect(server, e))?;
        self.tune(&stream);

        let hello = Message::StreamHello {
            cookie: cookie.to_string(),
            stream_id,
        };
        send_message(&mut stream, &hello)
            .await
            .map_err(|e| Error::connect(server, e))?;
        Ok(Conn::Tcp(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::generate_cookie;

    #[tokio::test]
    async fn test_stream_hello_pairs_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let transport = TcpTransport::new(Settings::default());
        let cookie = generate_cookie();

        let (accepted, connected) = tokio::join!(
            transport.accept(&listener, &cookie, Duration::from_secs(2)),
            transport.connect(addr, &cookie, 9, Duration::from_secs(2)),
        );
        let (id, _) = accepted.unwrap();
        assert_eq!(id, 9);
        assert!(matches!(connected.unwrap(), Conn::Tcp(_)));
    }

    #[tokio::test]
    async fn test_wrong_cookie_is_skipped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let transport = TcpTransport::new(Settings::default());
        let cookie = generate_cookie();

        let accept = transport.accept(&listener, &cookie, Duration::from_secs(2));
        let clients = async {
            let _stray = transport
                .connect(addr, &generate_cookie(), 5, Duration::from_secs(1))
                .await
                .unwrap();
            transport.connect(addr, &cookie, 7, Duration::from_secs(1)).await.unwrap()
        };
        let (accepted, _conn) = tokio::join!(accept, clients);
        assert_eq!(accepted.unwrap().0, 7);
    }

    #[tokio::test]
    async fn test_accept_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let transport = TcpTransport::new(Settings::default());
        let err = transport
            .accept(&listener, &generate_cookie(), Duration::from_millis(100))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Accept(_)));
    }
}
