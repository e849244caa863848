use crate::error::{Error, ErrorKind, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

/// Default block size for TCP streams.
pub const DEFAULT_TCP_BLKSIZE: usize = 128 * 1024;
/// Default datagram size for UDP streams, header included.
pub const DEFAULT_UDP_BLKSIZE: usize = 1460;
/// Default write size for reliable-UDP streams.
pub const DEFAULT_RUDP_BLKSIZE: usize = 4 * 1024;
/// Largest payload a single IPv4 UDP datagram can carry.
pub const MAX_UDP_BLKSIZE: usize = 65_507;
/// Largest block size accepted for stream transports.
pub const MAX_TCP_BLKSIZE: usize = 16 * 1024 * 1024;

/// Which end of the test this engine plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Listens for a client and serves its test.
    Server,
    /// Connects to a server and drives the test.
    Client,
}

/// Protocol names recognised by the engine.
///
/// `Rudp` and `Kcp` select the same reliable-UDP transport and only differ in
/// their default tuning.
///
/// # Examples
///
/// ```
/// use riperf::config::ProtocolKind;
///
/// let kind: ProtocolKind = "KCP".parse().unwrap();
/// assert_eq!(kind, ProtocolKind::Kcp);
/// assert_eq!(kind.name(), "kcp");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    Tcp,
    Udp,
    Rudp,
    Kcp,
}

/// Transport implementation behind a protocol name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFamily {
    Tcp,
    Udp,
    ReliableUdp,
}

impl ProtocolKind {
    pub const ALL: [ProtocolKind; 4] = [
        ProtocolKind::Tcp,
        ProtocolKind::Udp,
        ProtocolKind::Rudp,
        ProtocolKind::Kcp,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ProtocolKind::Tcp => "tcp",
            ProtocolKind::Udp => "udp",
            ProtocolKind::Rudp => "rudp",
            ProtocolKind::Kcp => "kcp",
        }
    }

    pub fn family(self) -> TransportFamily {
        match self {
            ProtocolKind::Tcp => TransportFamily::Tcp,
            ProtocolKind::Udp => TransportFamily::Udp,
            ProtocolKind::Rudp | ProtocolKind::Kcp => TransportFamily::ReliableUdp,
        }
    }

    pub fn default_blksize(self) -> usize {
        match self.family() {
            TransportFamily::Tcp => DEFAULT_TCP_BLKSIZE,
            TransportFamily::Udp => DEFAULT_UDP_BLKSIZE,
            TransportFamily::ReliableUdp => DEFAULT_RUDP_BLKSIZE,
        }
    }

    pub fn max_blksize(self) -> usize {
        match self.family() {
            TransportFamily::Udp => MAX_UDP_BLKSIZE,
            TransportFamily::Tcp | TransportFamily::ReliableUdp => MAX_TCP_BLKSIZE,
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ProtocolKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(ProtocolKind::Tcp),
            "udp" => Ok(ProtocolKind::Udp),
            "rudp" => Ok(ProtocolKind::Rudp),
            "kcp" => Ok(ProtocolKind::Kcp),
            other => Err(Error::Config(format!("unknown protocol '{}'", other))),
        }
    }
}

/// Verbosity requested by the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    pub fn to_level_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
        }
    }
}

/// Tuning knobs for the reliable-UDP transport.
///
/// Both ends must agree on these values, so the client ships them to the
/// server in the setup message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReliableUdpSettings {
    /// Send window in segments.
    pub snd_wnd: u32,
    /// Receive window in segments.
    pub rcv_wnd: u32,
    /// Kernel receive buffer for the datagram socket, in bytes.
    pub read_buf_size: usize,
    /// Kernel send buffer for the datagram socket, in bytes.
    pub write_buf_size: usize,
    /// Interval between flushes of queued segments and acknowledgements.
    pub flush_interval: Duration,
    /// Disable congestion control; the window is then bounded only by the
    /// local send window and the peer's advertised window.
    pub no_cong: bool,
    /// Retransmit a segment after this many later acknowledgements skipped it.
    /// Zero turns fast resend off.
    pub fast_resend: u32,
    /// FEC data shards per group; zero disables FEC.
    pub data_shards: usize,
    /// FEC parity shards per group; zero disables FEC.
    pub parity_shards: usize,
}

impl ReliableUdpSettings {
    /// Defaults used by the `rudp` protocol name.
    pub fn rudp_defaults() -> Self {
        Self {
            snd_wnd: 10,
            rcv_wnd: 512,
            read_buf_size: 4 * 1024 * 1024,
            write_buf_size: 4 * 1024 * 1024,
            flush_interval: Duration::from_millis(10),
            no_cong: true,
            fast_resend: 0,
            data_shards: 0,
            parity_shards: 0,
        }
    }

    /// Defaults used by the `kcp` protocol name: larger windows and fast resend.
    pub fn kcp_defaults() -> Self {
        Self {
            snd_wnd: 128,
            rcv_wnd: 128,
            fast_resend: 2,
            ..Self::rudp_defaults()
        }
    }

    pub fn defaults_for(kind: ProtocolKind) -> Self {
        match kind {
            ProtocolKind::Kcp => Self::kcp_defaults(),
            _ => Self::rudp_defaults(),
        }
    }

    pub fn fec_enabled(&self) -> bool {
        self.data_shards > 0 && self.parity_shards > 0
    }

    pub fn with_windows(mut self, snd_wnd: u32, rcv_wnd: u32) -> Self {
        self.snd_wnd = snd_wnd;
        self.rcv_wnd = rcv_wnd;
        self
    }

    pub fn with_fec(mut self, data_shards: usize, parity_shards: usize) -> Self {
        self.data_shards = data_shards;
        self.parity_shards = parity_shards;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_congestion_control(mut self, enabled: bool) -> Self {
        self.no_cong = !enabled;
        self
    }

    pub fn with_fast_resend(mut self, fast_resend: u32) -> Self {
        self.fast_resend = fast_resend;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.snd_wnd == 0 || self.rcv_wnd == 0 {
            return Err(Error::Config(
                "reliable-UDP windows must be at least one segment".to_string(),
            ));
        }
        if self.flush_interval.is_zero() {
            return Err(Error::Config(
                "reliable-UDP flush interval must be positive".to_string(),
            ));
        }
        if (self.data_shards == 0) != (self.parity_shards == 0) {
            return Err(Error::Config(
                "FEC needs both data and parity shards, or neither".to_string(),
            ));
        }
        if self.data_shards + self.parity_shards > 255 {
            return Err(Error::Config(
                "FEC supports at most 255 shards per group".to_string(),
            ));
        }
        Ok(())
    }
}

/// Backoff and retry policy of the continuous server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerLoopPolicy {
    /// Wait after a listen failure (likely port contention).
    pub listen_backoff: Duration,
    /// Wait after an accept or handshake failure (likely a disconnecting peer).
    pub accept_backoff: Duration,
    /// Wait after any other recoverable failure.
    pub error_backoff: Duration,
    /// Pause between two successful sessions.
    pub settle_delay: Duration,
    /// Consecutive recoverable failures tolerated before the loop gives up.
    pub max_consecutive_failures: u32,
}

impl Default for ServerLoopPolicy {
    fn default() -> Self {
        Self {
            listen_backoff: Duration::from_secs(5),
            accept_backoff: Duration::from_secs(1),
            error_backoff: Duration::from_secs(2),
            settle_delay: Duration::from_millis(500),
            max_consecutive_failures: 5,
        }
    }
}

impl ServerLoopPolicy {
    /// Backoff before the next session, or `None` when the failure is terminal.
    pub fn backoff_for(&self, kind: ErrorKind) -> Option<Duration> {
        match kind {
            ErrorKind::Listen => Some(self.listen_backoff),
            ErrorKind::Accept | ErrorKind::Handshake => Some(self.accept_backoff),
            ErrorKind::DataPath => Some(self.error_backoff),
            ErrorKind::Setup | ErrorKind::Fatal | ErrorKind::Cancelled => None,
        }
    }
}

/// Configuration for a riperf test engine.
///
/// # Examples
///
/// ```
/// use riperf::config::{Config, ProtocolKind};
/// use std::time::Duration;
///
/// let config = Config::client("192.168.1.100".to_string(), 5201)
///     .with_protocol(ProtocolKind::Kcp)
///     .with_duration(Duration::from_secs(30))
///     .with_parallel(4)
///     .with_fec(4, 2);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub role: Role,

    /// Server address (client role).
    pub server_addr: Option<String>,

    /// Bind address (server role); all interfaces when unset.
    pub bind_addr: Option<IpAddr>,

    pub port: u16,

    pub protocol: ProtocolKind,

    pub duration: Duration,

    /// Reporting interval.
    pub interval: Duration,

    /// Sampling interval; follows `interval` when unset.
    pub stats_interval: Option<Duration>,

    /// Reverse mode: the server sends and the client receives.
    pub reverse: bool,

    /// Disable Nagle on TCP streams.
    pub no_delay: bool,

    /// Number of parallel data streams.
    pub parallel: usize,

    /// Bytes per send/recv call; the protocol default when unset.
    pub blksize: Option<usize>,

    /// Send as fast as possible, ignoring `rate`.
    pub burst: bool,

    /// Rate limit in bits per second, per stream.
    pub rate: Option<u64>,

    /// Reliable-UDP tuning; the protocol's family defaults when unset.
    pub reliable: Option<ReliableUdpSettings>,

    pub server_loop: ServerLoopPolicy,

    pub log_level: LogLevel,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            role: Role::Client,
            server_addr: Some("127.0.0.1".to_string()),
            bind_addr: None,
            port: 5201,
            protocol: ProtocolKind::Tcp,
            duration: Duration::from_secs(10),
            interval: Duration::from_secs(1),
            stats_interval: None,
            reverse: false,
            no_delay: false,
            parallel: 1,
            blksize: None,
            burst: true,
            rate: None,
            reliable: None,
            server_loop: ServerLoopPolicy::default(),
            log_level: LogLevel::Error,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Server configuration listening on `port`.
    pub fn server(port: u16) -> Self {
        Self {
            role: Role::Server,
            server_addr: None,
            port,
            ..Default::default()
        }
    }

    /// Client configuration targeting `server_addr:port`.
    pub fn client(server_addr: String, port: u16) -> Self {
        Self {
            role: Role::Client,
            server_addr: Some(server_addr),
            port,
            ..Default::default()
        }
    }

    pub fn with_protocol(mut self, protocol: ProtocolKind) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_bind_addr(mut self, addr: IpAddr) -> Self {
        self.bind_addr = Some(addr);
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = Some(interval);
        self
    }

    pub fn with_reverse(mut self, reverse: bool) -> Self {
        self.reverse = reverse;
        self
    }

    pub fn with_no_delay(mut self, no_delay: bool) -> Self {
        self.no_delay = no_delay;
        self
    }

    pub fn with_parallel(mut self, parallel: usize) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_blksize(mut self, blksize: usize) -> Self {
        self.blksize = Some(blksize);
        self
    }

    /// Limits every stream to `bits_per_second` and turns burst mode off.
    pub fn with_rate(mut self, bits_per_second: u64) -> Self {
        self.rate = Some(bits_per_second);
        self.burst = false;
        self
    }

    pub fn with_reliable(mut self, settings: ReliableUdpSettings) -> Self {
        self.reliable = Some(settings);
        self
    }

    /// Sets FEC shard counts on top of the current reliable-UDP settings.
    pub fn with_fec(mut self, data_shards: usize, parity_shards: usize) -> Self {
        let base = self.reliable_settings();
        self.reliable = Some(base.with_fec(data_shards, parity_shards));
        self
    }

    pub fn with_server_loop(mut self, policy: ServerLoopPolicy) -> Self {
        self.server_loop = policy;
        self
    }

    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// Reliable-UDP settings in effect for the configured protocol.
    pub fn reliable_settings(&self) -> ReliableUdpSettings {
        self.reliable
            .unwrap_or_else(|| ReliableUdpSettings::defaults_for(self.protocol))
    }

    pub fn effective_stats_interval(&self) -> Duration {
        self.stats_interval.unwrap_or(self.interval)
    }

    pub fn effective_blksize(&self) -> usize {
        self.blksize
            .unwrap_or_else(|| self.protocol.default_blksize())
    }

    /// Checks the configuration once, before any socket is opened.
    pub fn validate(&self) -> Result<()> {
        if self.role == Role::Client {
            match &self.server_addr {
                Some(addr) if !addr.trim().is_empty() => {}
                _ => {
                    return Err(Error::Config(
                        "server address is required in client mode".to_string(),
                    ))
                }
            }
        }
        if self.parallel == 0 {
            return Err(Error::Config("parallel must be at least 1".to_string()));
        }
        if self.interval.is_zero() || self.effective_stats_interval().is_zero() {
            return Err(Error::Config("intervals must be positive".to_string()));
        }
        let blksize = self.effective_blksize();
        if blksize == 0 || blksize > self.protocol.max_blksize() {
            return Err(Error::Config(format!(
                "block size {} out of range for {} (1..={})",
                blksize,
                self.protocol,
                self.protocol.max_blksize()
            )));
        }
        if self.protocol.family() == TransportFamily::Udp
            && blksize < crate::udp_packet::UdpPacketHeader::SIZE
        {
            return Err(Error::Config(format!(
                "UDP block size must hold the {}-byte datagram header",
                crate::udp_packet::UdpPacketHeader::SIZE
            )));
        }
        if !self.burst && self.rate == Some(0) {
            return Err(Error::Config(
                "rate limit must be positive when burst is off".to_string(),
            ));
        }
        if self.server_loop.max_consecutive_failures == 0 {
            return Err(Error::Config(
                "consecutive failure ceiling must be at least 1".to_string(),
            ));
        }
        self.reliable_settings().validate()
    }
}

/// Per-session tuning consumed by the active protocol.
///
/// Derived from [`Config`] when it is applied and never changed while a
/// session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub blksize: usize,
    pub burst: bool,
    /// Bits per second; only honoured when `burst` is off.
    pub rate: Option<u64>,
    pub no_delay: bool,
    pub reliable: ReliableUdpSettings,
}

impl Settings {
    pub fn defaults_for(kind: ProtocolKind) -> Self {
        Self {
            blksize: kind.default_blksize(),
            burst: true,
            rate: None,
            no_delay: false,
            reliable: ReliableUdpSettings::defaults_for(kind),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            blksize: config.effective_blksize(),
            burst: config.burst,
            rate: config.rate,
            no_delay: config.no_delay,
            reliable: config.reliable_settings(),
        }
    }

    /// Rate limit in bytes per second, if pacing applies.
    pub fn pacing_bytes_per_sec(&self) -> Option<u64> {
        if self.burst {
            return None;
        }
        self.rate.filter(|r| *r > 0).map(|r| (r / 8).max(1))
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::defaults_for(ProtocolKind::Tcp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_names_roundtrip() {
        for kind in ProtocolKind::ALL {
            assert_eq!(kind.name().parse::<ProtocolKind>().unwrap(), kind);
        }
        assert_eq!(" Tcp ".parse::<ProtocolKind>().unwrap(), ProtocolKind::Tcp);
        assert!("sctp".parse::<ProtocolKind>().is_err());
    }

    #[test]
    fn test_rudp_and_kcp_share_family() {
        assert_eq!(ProtocolKind::Rudp.family(), TransportFamily::ReliableUdp);
        assert_eq!(ProtocolKind::Kcp.family(), TransportFamily::ReliableUdp);
        assert_ne!(
            ReliableUdpSettings::rudp_defaults(),
            ReliableUdpSettings::kcp_defaults()
        );
    }

    #[test]
    fn test_stats_interval_follows_report_interval() {
        let config = Config::default().with_interval(Duration::from_millis(500));
        assert_eq!(config.effective_stats_interval(), Duration::from_millis(500));
        let config = config.with_stats_interval(Duration::from_millis(100));
        assert_eq!(config.effective_stats_interval(), Duration::from_millis(100));
        assert_eq!(config.interval, Duration::from_millis(500));
    }

    #[test]
    fn test_backoff_depends_on_error_kind() {
        let policy = ServerLoopPolicy::default();
        assert_eq!(policy.backoff_for(ErrorKind::Listen), Some(policy.listen_backoff));
        assert_eq!(policy.backoff_for(ErrorKind::Accept), Some(policy.accept_backoff));
        assert_eq!(policy.backoff_for(ErrorKind::Handshake), Some(policy.accept_backoff));
        assert_eq!(policy.backoff_for(ErrorKind::DataPath), Some(policy.error_backoff));
        assert!(policy.listen_backoff > policy.accept_backoff);
        for terminal in [ErrorKind::Setup, ErrorKind::Fatal, ErrorKind::Cancelled] {
            assert_eq!(policy.backoff_for(terminal), None, "{:?}", terminal);
        }
    }

    #[test]
    fn test_client_requires_address() {
        let mut config = Config::client(String::new(), 5201);
        assert!(config.validate().is_err());
        config.server_addr = None;
        assert!(config.validate().is_err());
        assert!(Config::server(5201).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let base = Config::client("127.0.0.1".to_string(), 5201);
        assert!(base.clone().with_parallel(0).validate().is_err());
        assert!(base.clone().with_interval(Duration::ZERO).validate().is_err());
        assert!(base.clone().with_stats_interval(Duration::ZERO).validate().is_err());
        assert!(base.clone().with_blksize(0).validate().is_err());
        assert!(base
            .clone()
            .with_protocol(ProtocolKind::Udp)
            .with_blksize(70_000)
            .validate()
            .is_err());
        assert!(base
            .clone()
            .with_protocol(ProtocolKind::Udp)
            .with_blksize(8)
            .validate()
            .is_err());
        assert!(base.clone().with_rate(0).validate().is_err());
        assert!(base.clone().with_fec(4, 0).validate().is_err());
        assert!(base
            .clone()
            .with_reliable(ReliableUdpSettings::rudp_defaults().with_windows(0, 10))
            .validate()
            .is_err());
        assert!(base.with_fec(4, 2).validate().is_ok());
    }

    #[test]
    fn test_effective_blksize_follows_protocol() {
        let config = Config::client("h".to_string(), 1);
        assert_eq!(config.effective_blksize(), DEFAULT_TCP_BLKSIZE);
        let config = config.with_protocol(ProtocolKind::Udp);
        assert_eq!(config.effective_blksize(), DEFAULT_UDP_BLKSIZE);
        let config = config.with_blksize(512);
        assert_eq!(config.effective_blksize(), 512);
    }

    #[test]
    fn test_reliable_settings_follow_protocol_until_overridden() {
        let config = Config::client("h".to_string(), 1).with_protocol(ProtocolKind::Kcp);
        assert_eq!(config.reliable_settings(), ReliableUdpSettings::kcp_defaults());
        let config = config.with_fec(4, 2);
        let settings = config.reliable_settings();
        assert_eq!(settings.snd_wnd, 128);
        assert!(settings.fec_enabled());
    }

    #[test]
    fn test_pacing_only_without_burst() {
        let settings = Settings::from_config(&Config::default());
        assert_eq!(settings.pacing_bytes_per_sec(), None);
        let settings = Settings::from_config(&Config::default().with_rate(8_000_000));
        assert_eq!(settings.pacing_bytes_per_sec(), Some(1_000_000));
    }

    #[test]
    fn test_backoff_policy_is_total() {
        let policy = ServerLoopPolicy::default();
        assert_eq!(policy.backoff_for(ErrorKind::Listen), Some(Duration::from_secs(5)));
        assert_eq!(policy.backoff_for(ErrorKind::Accept), Some(Duration::from_secs(1)));
        assert_eq!(policy.backoff_for(ErrorKind::Handshake), Some(Duration::from_secs(1)));
        assert_eq!(policy.backoff_for(ErrorKind::DataPath), Some(Duration::from_secs(2)));
        assert_eq!(policy.backoff_for(ErrorKind::Setup), None);
        assert_eq!(policy.backoff_for(ErrorKind::Fatal), None);
        assert_eq!(policy.backoff_for(ErrorKind::Cancelled), None);
        assert!(policy.listen_backoff > policy.accept_backoff);
    }
}
