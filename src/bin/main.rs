use clap::{Args, Parser, Subcommand};
use riperf::reporter::{format_interval, format_summary};
use riperf::{Config, IperfTest, LogLevel, ProtocolKind, ServerLoopPolicy, TestEvent};
use std::net::IpAddr;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "riperf")]
#[command(about = "iperf-style throughput testing over TCP, UDP and reliable UDP", long_about = None)]
#[command(version)]
struct Cli {
    /// Log verbosity: error, warn, info or debug (RUST_LOG overrides)
    #[arg(long, global = true, default_value = "info", value_parser = parse_log_level)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct TransportArgs {
    /// Transport: tcp, udp, rudp or kcp
    #[arg(long, default_value = "tcp", value_parser = parse_protocol)]
    protocol: ProtocolKind,

    /// FEC shards for reliable UDP, as DATA,PARITY
    #[arg(long, value_parser = parse_pair)]
    fec: Option<(usize, usize)>,

    /// Reliable-UDP windows in segments, as SEND,RECEIVE
    #[arg(long, value_parser = parse_windows)]
    window: Option<(u32, u32)>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run in server mode
    Server {
        /// Port to listen on
        #[arg(short, long, default_value = "5201")]
        port: u16,

        /// Bind to specific address
        #[arg(short, long)]
        bind: Option<IpAddr>,

        /// Serve a single session and exit
        #[arg(short = '1', long)]
        one_off: bool,

        /// Consecutive failed sessions tolerated before giving up
        #[arg(long, default_value = "5")]
        max_failures: u32,
    },

    /// Run in client mode
    Client {
        /// Server address to connect to
        server: String,

        /// Port to connect to
        #[arg(short, long, default_value = "5201")]
        port: u16,

        #[command(flatten)]
        transport: TransportArgs,

        /// Test duration in seconds
        #[arg(short = 't', long, default_value = "10")]
        time: u64,

        /// Target bandwidth in Mbps; turns burst mode off
        #[arg(short, long, value_parser = parse_mbps)]
        bandwidth: Option<u64>,

        /// Block size in bytes (defaults per protocol)
        #[arg(short = 'l', long)]
        length: Option<usize>,

        /// Number of parallel streams
        #[arg(short = 'P', long, default_value = "1")]
        parallel: usize,

        /// Run in reverse mode (server sends, client receives)
        #[arg(short = 'R', long)]
        reverse: bool,

        /// Disable Nagle's algorithm on TCP streams
        #[arg(short = 'N', long)]
        no_delay: bool,

        /// Output the final result as JSON
        #[arg(short = 'J', long)]
        json: bool,

        /// Interval for periodic reports in seconds
        #[arg(short, long, default_value = "1", value_parser = parse_seconds)]
        interval: Duration,

        /// Interval for statistics samples in seconds (defaults to --interval)
        #[arg(long, value_parser = parse_seconds)]
        stats_interval: Option<Duration>,
    },
}

fn parse_log_level(s: &str) -> Result<LogLevel, String> {
    match s.to_ascii_lowercase().as_str() {
        "error" => Ok(LogLevel::Error),
        "warn" => Ok(LogLevel::Warn),
        "info" => Ok(LogLevel::Info),
        "debug" => Ok(LogLevel::Debug),
        other => Err(format!("unknown log level '{}'", other)),
    }
}

fn parse_protocol(s: &str) -> Result<ProtocolKind, String> {
    s.parse().map_err(|e: riperf::Error| e.to_string())
}

fn parse_pair(s: &str) -> Result<(usize, usize), String> {
    let (a, b) = s
        .split_once(',')
        .ok_or_else(|| format!("expected two comma-separated numbers, got '{}'", s))?;
    let a = a.trim().parse().map_err(|e| format!("{}: {}", a, e))?;
    let b = b.trim().parse().map_err(|e| format!("{}: {}", b, e))?;
    Ok((a, b))
}

fn parse_windows(s: &str) -> Result<(u32, u32), String> {
    let (snd, rcv) = parse_pair(s)?;
    let snd = u32::try_from(snd).map_err(|_| format!("send window {} is too large", snd))?;
    let rcv = u32::try_from(rcv).map_err(|_| format!("receive window {} is too large", rcv))?;
    Ok((snd, rcv))
}

/// Parses megabits per second into bits per second.
fn parse_mbps(s: &str) -> Result<u64, String> {
    let mbps: u64 = s.trim().parse().map_err(|e| format!("{}: {}", s, e))?;
    mbps.checked_mul(1_000_000)
        .ok_or_else(|| format!("{} Mbps does not fit in bits per second", mbps))
}

fn parse_seconds(s: &str) -> Result<Duration, String> {
    let secs: f64 = s.trim().parse().map_err(|e| format!("{}: {}", s, e))?;
    Duration::try_from_secs_f64(secs)
        .ok()
        .filter(|d| !d.is_zero())
        .ok_or_else(|| format!("'{}' is not a positive number of seconds", s))
}

fn print_event(event: TestEvent) {
    match event {
        TestEvent::Connected { test_num } => println!("[test {}] connected", test_num),
        TestEvent::Interval(report) => {
            for line in format_interval(&report) {
                println!("{}", line);
            }
        }
        TestEvent::Completed(result) => println!("{}", format_summary(&result)),
        TestEvent::Error { kind, message } => eprintln!("error ({}): {}", kind.status(), message),
        TestEvent::Sample(_) => {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::new()
        .filter_level(cli.log_level.to_level_filter())
        .parse_default_env()
        .init();

    match cli.command {
        Commands::Server {
            port,
            bind,
            one_off,
            max_failures,
        } => {
            let mut config = Config::server(port)
                .with_log_level(cli.log_level)
                .with_server_loop(ServerLoopPolicy {
                    max_consecutive_failures: max_failures,
                    ..ServerLoopPolicy::default()
                });
            if let Some(addr) = bind {
                config = config.with_bind_addr(addr);
            }

            let mut engine = IperfTest::from_config(&config)?;
            let handle = engine.handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    handle.stop();
                }
            });

            if one_off {
                engine.run_test(print_event).await?;
            } else {
                engine.run_server_loop(print_event).await?;
            }
        }

        Commands::Client {
            server,
            port,
            transport,
            time,
            bandwidth,
            length,
            parallel,
            reverse,
            no_delay,
            json,
            interval,
            stats_interval,
        } => {
            let mut config = Config::client(server, port)
                .with_protocol(transport.protocol)
                .with_duration(Duration::from_secs(time))
                .with_interval(interval)
                .with_parallel(parallel)
                .with_reverse(reverse)
                .with_no_delay(no_delay)
                .with_log_level(cli.log_level);
            if let Some(length) = length {
                config = config.with_blksize(length);
            }
            if let Some(bits) = bandwidth {
                config = config.with_rate(bits);
            }
            if let Some(every) = stats_interval {
                config = config.with_stats_interval(every);
            }
            if let Some((data, parity)) = transport.fec {
                config = config.with_fec(data, parity);
            }
            if let Some((snd, rcv)) = transport.window {
                let reliable = config.reliable_settings().with_windows(snd, rcv);
                config = config.with_reliable(reliable);
            }

            let mut engine = IperfTest::from_config(&config)?;
            let handle = engine.handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    handle.stop();
                }
            });

            if json {
                let result = engine.run_test(|_event: TestEvent| {}).await?;
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                engine.run_test(print_event).await?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bandwidth_rejects_overflow() {
        assert_eq!(parse_mbps("100"), Ok(100_000_000));
        assert!(parse_mbps(&u64::MAX.to_string()).is_err());
        assert!(Cli::try_parse_from(["riperf", "client", "h", "-b", "18446744073709551615"]).is_err());
    }

    #[test]
    fn test_windows_must_fit_u32() {
        assert_eq!(parse_windows("128, 256"), Ok((128, 256)));
        assert!(parse_windows("4294967296,1").is_err());
        assert!(parse_windows("64").is_err());
    }

    #[test]
    fn test_intervals_must_be_positive() {
        assert_eq!(parse_seconds("0.5"), Ok(Duration::from_millis(500)));
        assert!(parse_seconds("0").is_err());
        assert!(parse_seconds("-1").is_err());
        assert!(parse_seconds("nan").is_err());
    }
}
