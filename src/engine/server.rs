use super::control::{unexpected, ControlChannel};
use super::{
    cancellable, intervals, IperfTest, CANCEL_GRACE, HANDSHAKE_TIMEOUT, RESULT_TIMEOUT, SERVER_RUN_MARGIN,
};
use crate::config::{Config, Settings};
use crate::error::{Error, Result};
use crate::measurements::TestResult;
use crate::protocol::{generate_cookie, Message, SessionTotals};
use crate::reporter::EventCallback;
use crate::state::TestState;
use crate::stream::{Direction, Stream};
use crate::transport::{Protocol, ACCEPT_TIMEOUT};
use log::{debug, info, warn};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

impl IperfTest {
    fn bind_addr(&self) -> SocketAddr {
        let ip = self
            .config
            .bind_addr
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        SocketAddr::new(ip, self.config.port)
    }

    pub(super) async fn server_session(
        &mut self,
        session: &CancellationToken,
        callback: &Arc<dyn EventCallback>,
    ) -> Result<TestResult> {
        let bind = self.bind_addr();
        let listener = TcpListener::bind(bind).await.map_err(|source| Error::Listen {
            addr: bind.to_string(),
            source,
        })?;
        // Datagram streams share the control port, which may have been
        // picked by the kernel.
        let bound = listener.local_addr()?;
        let bind = SocketAddr::new(bind.ip(), bound.port());
        info!("server listening on {}", bind);
        self.listener = Some(listener);

        let (stream, peer) = {
            let listener = self
                .listener
                .as_ref()
                .ok_or_else(|| Error::InvalidState("no listener".into()))?;
            cancellable(session, async {
                listener.accept().await.map_err(|e| Error::Accept(e.to_string()))
            })
            .await?
        };
        self.control = Some(ControlChannel::new(stream)?);
        self.advance(TestState::ParamExchange)?;
        info!("accepted control connection from {}", peer);

        let (session_config, cookie) = self.negotiate(session, bind).await?;
        self.announce(callback);

        let protocol = self.active_protocol()?;
        let direction = Direction::for_endpoint(false, session_config.reverse);
        let count = if session_config.duration.is_zero() {
            0
        } else {
            session_config.parallel
        };
        for _ in 0..count {
            let (id, conn) = {
                let listener = self
                    .listener
                    .as_ref()
                    .ok_or_else(|| Error::InvalidState("no listener".into()))?;
                cancellable(
                    session,
                    protocol.accept(listener, self.datagram.as_mut(), &cookie, ACCEPT_TIMEOUT),
                )
                .await?
            };
            debug!("stream {} accepted", id);
            self.streams
                .push(Stream::new(id, direction, conn, protocol.settings().blksize));
        }
        self.control_mut()?.send(&Message::start_now()).await?;

        self.advance(TestState::Running)?;
        let run = session.child_token();
        let run_for = session_config.duration + SERVER_RUN_MARGIN;
        let handles = self.start_run(&run, run_for, intervals(&session_config), callback)?;
        let early = {
            let control = self.control_mut()?;
            tokio::select! {
                biased;
                _ = run.cancelled() => None,
                msg = control.recv(run_for + RESULT_TIMEOUT) => Some(msg),
            }
        };
        run.cancel();
        let (outcome, workers) = self.finish_run(handles, callback).await;

        let client_totals = match early {
            Some(Ok(Message::Results(totals))) => Some(totals),
            Some(Ok(other)) => return Err(unexpected("Results", &other)),
            Some(Err(e)) => return Err(e),
            None => None,
        };
        workers?;

        self.advance(TestState::ResultExchange)?;
        let result = self.build_result(&outcome, session_config.duration);
        let stopped = session.is_cancelled();
        let wait = if stopped { CANCEL_GRACE } else { RESULT_TIMEOUT };
        let remote = match self.report_to_client(client_totals, result.totals(), wait).await {
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

    /// Adopts the client's parameters, prepares the protocol and answers
    /// with a fresh cookie.
    async fn negotiate(&mut self, session: &CancellationToken, bind: SocketAddr) -> Result<(Config, String)> {
        let params = match self.control_mut()?.recv_or_cancel(HANDSHAKE_TIMEOUT, session).await? {
            Message::Setup(params) => params,
            other => return Err(unexpected("Setup", &other)),
        };
        let session_config = params.apply_to(&self.config)?;
        let settings = Settings::from_config(&session_config);
        let mut protocol = Protocol::new(session_config.protocol, settings);
        protocol.init(settings)?;
        debug!(
            "client asked for {} x{} over {} for {:?}",
            protocol.name(),
            session_config.parallel,
            if session_config.reverse { "reverse" } else { "forward" },
            session_config.duration
        );
        self.datagram = protocol.listen(bind).await?;
        self.protocol = Some(protocol);

        let cookie = generate_cookie();
        self.control_mut()?
            .send(&Message::SetupAck {
                cookie: cookie.clone(),
            })
            .await?;
        Ok((session_config, cookie))
    }

    /// Completes the client's `Results`, then answers with ours and `Done`.
    async fn report_to_client(
        &mut self,
        client_totals: Option<SessionTotals>,
        totals: SessionTotals,
        wait: Duration,
    ) -> Result<SessionTotals> {
        let control = self.control_mut()?;
        let remote = match client_totals {
            Some(remote) => remote,
            None => match control.recv(wait).await? {
                Message::Results(remote) => remote,
                other => return Err(unexpected("Results", &other)),
            },
        };
        tokio::time::timeout(wait, async {
            control.send(&Message::Results(totals)).await?;
            control.send(&Message::Done).await
        })
        .await
        .map_err(|_| Error::Protocol("timed out sending results".into()))??;
        Ok(remote)
    }
}
