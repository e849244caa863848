//! Control-channel envelope shared by client and server.
//!
//! Every control message is a length-prefixed JSON object:
//!
//! ```text
//! ┌──────────────────────┬────────────────────────────────────┐
//! │ length (u32, BE)     │ JSON object with a "type" field    │
//! └──────────────────────┴────────────────────────────────────┘
//! ```
//!
//! Unknown fields are ignored and optional fields default, so a newer peer may
//! add fields without breaking an older one. The version field of
//! [`Message::Setup`] is checked against [`MIN_PROTOCOL_VERSION`].

use crate::config::{Config, ProtocolKind, ReliableUdpSettings};
use crate::error::{Error, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Version spoken by this build.
pub const PROTOCOL_VERSION: u32 = 3;

/// Oldest peer version this build accepts.
pub const MIN_PROTOCOL_VERSION: u32 = 3;

/// Upper bound on a single control message.
pub const MAX_MESSAGE_LEN: usize = 1024 * 1024;

/// Stream ID of the first data stream, matching iperf3.
pub const DEFAULT_STREAM_ID: usize = 5;

/// Stream ID for the `index`-th parallel stream.
///
/// ```
/// use riperf::protocol::stream_id_for_index;
///
/// assert_eq!(stream_id_for_index(0), 5);
/// assert_eq!(stream_id_for_index(2), 9);
/// ```
pub fn stream_id_for_index(index: usize) -> usize {
    DEFAULT_STREAM_ID + index * 2
}

/// Length of a session cookie in hex characters.
pub const COOKIE_LEN: usize = 32;

/// Generates a fresh session cookie.
pub fn generate_cookie() -> String {
    let bytes: [u8; COOKIE_LEN / 2] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn default_true() -> bool {
    true
}

/// Test parameters the client proposes and the server adopts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestParams {
    pub version: u32,
    pub protocol: String,
    pub duration_ms: u64,
    pub interval_ms: u64,
    pub blksize: usize,
    pub parallel: usize,
    pub reverse: bool,
    #[serde(default)]
    pub no_delay: bool,
    #[serde(default)]
    pub rate: Option<u64>,
    #[serde(default = "default_true")]
    pub burst: bool,
    #[serde(default)]
    pub reliable: Option<ReliableUdpSettings>,
}

impl TestParams {
    pub fn from_config(config: &Config) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            protocol: config.protocol.name().to_string(),
            duration_ms: config.duration.as_millis() as u64,
            interval_ms: config.interval.as_millis() as u64,
            blksize: config.effective_blksize(),
            parallel: config.parallel,
            reverse: config.reverse,
            no_delay: config.no_delay,
            rate: config.rate,
            burst: config.burst,
            reliable: Some(config.reliable_settings()),
        }
    }

    /// Overlays these parameters on a server's own configuration.
    ///
    /// The server keeps its role, address, port and loop policy; everything
    /// that shapes the test itself comes from the client.
    pub fn apply_to(&self, base: &Config) -> Result<Config> {
        if self.version < MIN_PROTOCOL_VERSION {
            return Err(Error::Protocol(format!(
                "peer protocol version {} is older than {}",
                self.version, MIN_PROTOCOL_VERSION
            )));
        }
        let protocol: ProtocolKind = self
            .protocol
            .parse()
            .map_err(|_| Error::Protocol(format!("unsupported protocol '{}'", self.protocol)))?;
        let config = Config {
            protocol,
            duration: Duration::from_millis(self.duration_ms),
            interval: Duration::from_millis(self.interval_ms),
            reverse: self.reverse,
            no_delay: self.no_delay,
            parallel: self.parallel,
            blksize: Some(self.blksize),
            burst: self.burst,
            rate: self.rate,
            reliable: self.reliable,
            ..base.clone()
        };
        config
            .validate()
            .map_err(|e| Error::Protocol(format!("rejected test parameters: {}", e)))?;
        Ok(config)
    }
}

/// Final counters one side reports to the other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTotals {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub blocks_sent: u64,
    pub blocks_received: u64,
    #[serde(default)]
    pub retransmits: u64,
    pub duration_ms: u64,
}

/// Control-channel messages.
///
/// # Session flow
///
/// 1. Client sends `Setup`.
/// 2. Server answers `SetupAck` with the session cookie, or `Error`.
/// 3. Client opens the data streams; TCP streams begin with `StreamHello`.
/// 4. Server sends `Start` once every stream is accepted.
/// 5. Client sends `Results` when its timer fires; server answers `Results`.
/// 6. Server sends `Done`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    Setup(TestParams),

    SetupAck { cookie: String },

    StreamHello { cookie: String, stream_id: usize },

    Start { timestamp: u64 },

    Results(SessionTotals),

    Done,

    Error { message: String },
}

impl Message {
    pub fn setup(config: &Config) -> Self {
        Message::Setup(TestParams::from_config(config))
    }

    pub fn start_now() -> Self {
        Message::Start {
            timestamp: chrono::Utc::now().timestamp_millis().max(0) as u64,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Message::Error {
            message: message.into(),
        }
    }

    /// Short name for log lines and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Message::Setup(_) => "Setup",
            Message::SetupAck { .. } => "SetupAck",
            Message::StreamHello { .. } => "StreamHello",
            Message::Start { .. } => "Start",
            Message::Results(_) => "Results",
            Message::Done => "Done",
            Message::Error { .. } => "Error",
        }
    }
}

/// Encodes a message as a length-prefixed JSON frame.
pub fn serialize_message(msg: &Message) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(msg)?;
    if json.len() > MAX_MESSAGE_LEN {
        return Err(Error::Protocol(format!(
            "{} message of {} bytes exceeds the {} byte limit",
            msg.name(),
            json.len(),
            MAX_MESSAGE_LEN
        )));
    }
    let mut frame = Vec::with_capacity(4 + json.len());
    frame.extend_from_slice(&(json.len() as u32).to_be_bytes());
    frame.extend_from_slice(&json);
    Ok(frame)
}

/// Reads one length-prefixed JSON frame.
///
/// Not cancel-safe: a partially read frame is lost if the future is dropped.
pub async fn deserialize_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_MESSAGE_LEN {
        return Err(Error::Protocol(format!(
            "control frame of {} bytes exceeds the {} byte limit",
            len, MAX_MESSAGE_LEN
        )));
    }

    let mut json = vec![0u8; len];
    reader.read_exact(&mut json).await?;
    Ok(serde_json::from_slice(&json)?)
}

/// Writes one frame and flushes it.
pub async fn send_message<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Message) -> Result<()> {
    let frame = serialize_message(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cookie_shape() {
        let a = generate_cookie();
        let b = generate_cookie();
        assert_eq!(a.len(), COOKIE_LEN);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_setup_carries_config() {
        let config = Config::client("h".to_string(), 5201)
            .with_protocol(ProtocolKind::Kcp)
            .with_parallel(3)
            .with_reverse(true)
            .with_duration(Duration::from_millis(2500));
        let Message::Setup(params) = Message::setup(&config) else {
            panic!("expected Setup");
        };
        assert_eq!(params.version, PROTOCOL_VERSION);
        assert_eq!(params.protocol, "kcp");
        assert_eq!(params.duration_ms, 2500);
        assert_eq!(params.parallel, 3);
        assert!(params.reverse);
        assert_eq!(params.reliable, Some(ReliableUdpSettings::kcp_defaults()));
    }

    #[test]
    fn test_apply_to_keeps_server_identity() {
        let client = Config::client("h".to_string(), 5201)
            .with_protocol(ProtocolKind::Udp)
            .with_blksize(1200);
        let server = Config::server(6000);
        let applied = TestParams::from_config(&client).apply_to(&server).unwrap();
        assert_eq!(applied.port, 6000);
        assert_eq!(applied.role, crate::config::Role::Server);
        assert_eq!(applied.protocol, ProtocolKind::Udp);
        assert_eq!(applied.blksize, Some(1200));
    }

    #[test]
    fn test_apply_to_rejects_old_version_and_bad_params() {
        let mut params = TestParams::from_config(&Config::default());
        params.version = MIN_PROTOCOL_VERSION - 1;
        assert!(params.apply_to(&Config::server(1)).is_err());

        let mut params = TestParams::from_config(&Config::default());
        params.protocol = "quic".to_string();
        let err = params.apply_to(&Config::server(1)).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Handshake);

        let mut params = TestParams::from_config(&Config::default());
        params.parallel = 0;
        assert!(params.apply_to(&Config::server(1)).is_err());
    }

    #[test]
    fn test_unknown_fields_and_defaults() {
        let json = br#"{"type":"Setup","version":3,"protocol":"tcp","duration_ms":1000,
            "interval_ms":1000,"blksize":4096,"parallel":1,"reverse":false,"future":42}"#;
        let msg: Message = serde_json::from_slice(json).unwrap();
        let Message::Setup(params) = msg else {
            panic!("expected Setup");
        };
        assert!(params.burst);
        assert!(!params.no_delay);
        assert_eq!(params.rate, None);
    }

    #[tokio::test]
    async fn test_frame_roundtrip_over_stream() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let sent = Message::Results(SessionTotals {
            bytes_sent: 10,
            bytes_received: 20,
            blocks_sent: 1,
            blocks_received: 2,
            retransmits: 3,
            duration_ms: 1000,
        });
        send_message(&mut a, &sent).await.unwrap();
        send_message(&mut a, &Message::Done).await.unwrap();
        assert_eq!(deserialize_message(&mut b).await.unwrap(), sent);
        assert_eq!(deserialize_message(&mut b).await.unwrap(), Message::Done);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let len = (MAX_MESSAGE_LEN as u32 + 1).to_be_bytes();
        a.write_all(&len).await.unwrap();
        let err = deserialize_message(&mut b).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_io_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&10u32.to_be_bytes()).await.unwrap();
        a.write_all(b"{\"ty").await.unwrap();
        drop(a);
        let err = deserialize_message(&mut b).await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn frame_length_matches_body(message in ".{0,200}", stream_id in 0usize..10_000) {
                let msg = Message::StreamHello { cookie: message, stream_id };
                let frame = serialize_message(&msg).unwrap();
                let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
                prop_assert_eq!(len, frame.len() - 4);
                let decoded: Message = serde_json::from_slice(&frame[4..]).unwrap();
                prop_assert_eq!(decoded, msg);
            }

            #[test]
            fn totals_survive_encoding(
                bytes_sent in any::<u64>(),
                bytes_received in any::<u64>(),
                retransmits in any::<u64>(),
                duration_ms in any::<u64>(),
            ) {
                let totals = SessionTotals {
                    bytes_sent,
                    bytes_received,
                    blocks_sent: bytes_sent / 7,
                    blocks_received: bytes_received / 7,
                    retransmits,
                    duration_ms,
                };
                let frame = serialize_message(&Message::Results(totals)).unwrap();
                let decoded: Message = serde_json::from_slice(&frame[4..]).unwrap();
                prop_assert_eq!(decoded, Message::Results(totals));
            }
        }
    }
}
