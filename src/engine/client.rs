use super::control::{unexpected, ControlChannel};
use super::{cancellable, intervals, IperfTest, CANCEL_GRACE, HANDSHAKE_TIMEOUT, RESULT_TIMEOUT};
use crate::error::{Error, Result};
use crate::measurements::TestResult;
use crate::protocol::{stream_id_for_index, Message, SessionTotals};
use crate::reporter::EventCallback;
use crate::state::TestState;
use crate::stream::{Direction, Stream};
use crate::transport::CONNECT_MARGIN;
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// How long the client waits for the server to take the control connection.
const CONTROL_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| Error::Config(format!("cannot resolve {}: {}", host, e)))?;
    addrs
        .next()
        .ok_or_else(|| Error::Config(format!("{} resolved to no addresses", host)))
}

impl IperfTest {
    pub(super) async fn client_session(
        &mut self,
        session: &CancellationToken,
        callback: &Arc<dyn EventCallback>,
    ) -> Result<TestResult> {
        let config = self.config.clone();
        let host = config
            .server_addr
            .as_deref()
            .ok_or_else(|| Error::Config("server address is required in client mode".into()))?;
        let server = cancellable(session, resolve(host, config.port)).await?;

        let stream = cancellable(session, async {
            match tokio::time::timeout(CONTROL_CONNECT_TIMEOUT, TcpStream::connect(server)).await {
                Ok(Ok(stream)) => Ok(stream),
                Ok(Err(e)) => Err(Error::connect(server, e)),
                Err(_) => Err(Error::connect(server, "timed out")),
            }
        })
        .await?;
        self.control = Some(ControlChannel::new(stream)?);
        self.advance(TestState::ParamExchange)?;
        info!("connected to {} for a {} test", server, config.protocol);

        let control = self.control_mut()?;
        control.send(&Message::setup(&config)).await?;
        let cookie = match control.recv_or_cancel(HANDSHAKE_TIMEOUT, session).await? {
            Message::SetupAck { cookie } => cookie,
            other => return Err(unexpected("SetupAck", &other)),
        };
        self.announce(callback);

        let protocol = self.active_protocol()?;
        let direction = Direction::for_endpoint(true, config.reverse);
        let count = if config.duration.is_zero() { 0 } else { config.parallel };
        for index in 0..count {
            let id = stream_id_for_index(index);
            let conn = cancellable(
                session,
                protocol.connect(server, &cookie, id, config.duration + CONNECT_MARGIN),
            )
            .await?;
            debug!("stream {} connected", id);
            self.streams
                .push(Stream::new(id, direction, conn, protocol.settings().blksize));
        }

        match self.control_mut()?.recv_or_cancel(HANDSHAKE_TIMEOUT, session).await? {
            Message::Start { .. } => {}
            other => return Err(unexpected("Start", &other)),
        }

        self.advance(TestState::Running)?;
        let run = session.child_token();
        let handles = self.start_run(&run, config.duration, intervals(&config), callback)?;
        let interruption = {
            let control = self.control_mut()?;
            tokio::select! {
                biased;
                _ = run.cancelled() => None,
                msg = control.recv(config.duration + RESULT_TIMEOUT) => Some(msg),
            }
        };
        run.cancel();
        let (outcome, workers) = self.finish_run(handles, callback).await;

        // The server only speaks mid-run when it gives up.
        if let Some(msg) = interruption {
            return Err(match msg {
                Ok(other) => unexpected("no message during the run", &other),
                Err(e) => e,
            });
        }
        workers?;

        self.advance(TestState::ResultExchange)?;
        let result = self.build_result(&outcome, config.duration);
        let stopped = session.is_cancelled();
        let wait = if stopped { CANCEL_GRACE } else { RESULT_TIMEOUT };
        let remote = match self.report_to_server(result.totals(), wait).await {
            Ok(remote) => Some(remote),
            Err(e) if stopped => {
                warn!("result exchange after stop failed: {}", e);
                None
            }
            Err(e) => return Err(e),
        };
        self.advance(TestState::Done)?;
        Ok(result.with_remote(remote))
    }

    /// Sends our totals, then expects the server's totals and `Done`.
    async fn report_to_server(&mut self, totals: SessionTotals, wait: Duration) -> Result<SessionTotals> {
        let control = self.control_mut()?;
        tokio::time::timeout(wait, control.send(&Message::Results(totals)))
            .await
            .map_err(|_| Error::Protocol("timed out sending results".into()))??;
        let remote = match control.recv(wait).await? {
            Message::Results(remote) => remote,
            other => return Err(unexpected("Results", &other)),
        };
        match control.recv(wait).await? {
            Message::Done => Ok(remote),
            other => Err(unexpected("Done", &other)),
        }
    }
}
