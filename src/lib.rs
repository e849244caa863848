//! riperf - an iperf-style network throughput test engine
//!
//! One engine type, [`IperfTest`], runs a test session as either client or
//! server over one of three transports:
//!
//! - `tcp`: plain TCP streams, with kernel RTT and retransmit statistics
//! - `udp`: sequenced datagrams with loss, jitter and reordering tracking
//! - `rudp` / `kcp`: a KCP-style ARQ over UDP, optionally protected by
//!   Reed-Solomon forward error correction
//!
//! Sessions follow iperf3's shape: a JSON control connection negotiates the
//! parameters, the data streams run for the agreed duration while interval
//! results are reported through an [`EventCallback`], and both sides swap
//! their totals at the end. A server can serve sessions back to back with
//! [`IperfTest::run_server_loop`].
//!
//! # Examples
//!
//! ```no_run
//! use riperf::{Config, IperfTest, TestEvent};
//!
//! # #[tokio::main]
//! # async fn main() -> riperf::Result<()> {
//! let config = Config::client("127.0.0.1".to_string(), 5201);
//! let mut engine = IperfTest::from_config(&config)?;
//! let result = engine
//!     .run_test(|event: TestEvent| {
//!         if let TestEvent::Interval(report) = event {
//!             for line in riperf::reporter::format_interval(&report) {
//!                 println!("{}", line);
//!             }
//!         }
//!     })
//!     .await?;
//! println!("{}", riperf::reporter::format_summary(&result));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod measurements;
pub mod protocol;
pub mod reporter;
pub mod rudp;
pub mod state;
pub mod stream;
mod tcp_info;
pub mod timer;
pub mod token_bucket;
pub mod transport;
pub mod udp_packet;

pub use config::{Config, LogLevel, ProtocolKind, ReliableUdpSettings, Role, ServerLoopPolicy, Settings};
pub use engine::{EngineHandle, EngineStatus, IperfTest};
pub use error::{Error, ErrorKind, Result};
pub use measurements::{IntervalReport, IntervalResult, StreamSummary, TestResult, TransportStats};
pub use reporter::{EventCallback, TestEvent};
pub use state::TestState;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
