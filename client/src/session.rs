//! Single-use tunnel session
//!
//! Connects the transport, binds the local listener, then waits for exactly
//! one local client and pipes it to the target until it goes away.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use deskgate_shared::pump::{pipe, PipeStats};
use deskgate_shared::{Error, Result};

use crate::child::{ChildCommand, ChildRelay};
use crate::params::TunnelParams;
use crate::port::bind_local;
use crate::state::{AcceptGate, Admission, CloseReason, SessionEvent, SessionState};
use crate::transport::{Connector, Transport};

/// Summary of a finished session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub local_port: u16,
    pub reason: CloseReason,
    /// Local connections piped, including the first
    pub connections: usize,
    /// Local connections closed without being piped
    pub refused: usize,
    /// Byte totals of the first connection
    pub stats: PipeStats,
}

#[derive(Debug, Default)]
struct Counters {
    connections: AtomicUsize,
    refused: AtomicUsize,
}

/// A tunnel session before its transport is up
pub struct TunnelSession<C> {
    connector: C,
    params: TunnelParams,
    local_port: u16,
}

impl<C: Connector> TunnelSession<C> {
    /// `local_port` 0 picks a random free port
    pub fn new(connector: C, params: TunnelParams, local_port: u16) -> Self {
        Self {
            connector,
            params,
            local_port,
        }
    }

    /// Connect the transport, then bind the local listener.
    pub async fn establish(self) -> Result<EstablishedSession<C::Transport>> {
        let mut state = SessionState::Init;
        advance(&mut state, SessionEvent::Start);

        let transport = match self.connector.connect(&self.params).await {
            Ok(transport) => transport,
            Err(e) => {
                advance(&mut state, SessionEvent::ConnectFailed);
                return Err(e);
            }
        };

        let listener = match bind_local(self.local_port).await {
            Ok(listener) => listener,
            Err(e) => {
                transport.disconnect().await;
                advance(&mut state, SessionEvent::ConnectFailed);
                return Err(e);
            }
        };
        let local_addr = listener.local_addr()?;
        info!(
            "Listening on {} for {}:{}",
            local_addr, self.params.target_host, self.params.target_port
        );
        advance(&mut state, SessionEvent::Connected);

        Ok(EstablishedSession {
            state,
            params: self.params,
            transport: Arc::new(transport),
            listener,
            local_addr,
            child: None,
            counters: Arc::new(Counters::default()),
        })
    }

    /// Full lifecycle: establish, launch `child` if any, run until closed.
    pub async fn run<F>(self, child: Option<ChildCommand>, shutdown: F) -> Result<SessionReport>
    where
        F: Future<Output = ()> + Send,
    {
        let local_port = self.local_port;
        tokio::pin!(shutdown);

        let mut session = tokio::select! {
            res = self.establish() => res?,
            _ = &mut shutdown => {
                info!("Terminated while connecting");
                return Ok(SessionReport {
                    local_port,
                    reason: CloseReason::Terminated,
                    connections: 0,
                    refused: 0,
                    stats: PipeStats::default(),
                });
            }
        };

        if let Some(command) = child {
            if let Err(e) = session.launch_child(&command) {
                session.transport.disconnect().await;
                return Err(e);
            }
        }
        session.run(shutdown).await
    }
}

/// A tunnel session with its transport up and its listener bound
pub struct EstablishedSession<T: Transport> {
    state: SessionState,
    params: TunnelParams,
    transport: Arc<T>,
    listener: TcpListener,
    local_addr: SocketAddr,
    child: Option<ChildRelay>,
    counters: Arc<Counters>,
}

enum Waited {
    Accepted(TcpStream, SocketAddr),
    Expired,
    ListenerGone,
    Terminated,
}

impl<T: Transport> EstablishedSession<T> {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Launch the client. The listener is already bound at this point.
    pub fn launch_child(&mut self, command: &ChildCommand) -> Result<()> {
        self.child = Some(ChildRelay::launch(command, self.local_addr.port())?);
        Ok(())
    }

    /// Wait for the first local client and pipe it until the session closes.
    pub async fn run<F>(self, shutdown: F) -> Result<SessionReport>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);

        let (first_tx, first_rx) = oneshot::channel();
        let listener = self.listener;
        let accept_task = tokio::spawn(accept_loop(
            listener,
            self.transport.clone(),
            self.params.clone(),
            self.counters.clone(),
            first_tx,
        ));
        let mut session = Closing {
            state: self.state,
            transport: self.transport,
            accept_task,
            child: self.child,
            counters: self.counters,
            local_port: self.local_addr.port(),
        };

        let grace = self.params.accept_grace;
        let waited = tokio::select! {
            _ = &mut shutdown => Waited::Terminated,
            res = timeout(grace, first_rx) => match res {
                Err(_) => Waited::Expired,
                Ok(Ok((stream, peer))) => Waited::Accepted(stream, peer),
                Ok(Err(_)) => Waited::ListenerGone,
            },
        };

        let (stream, peer) = match waited {
            Waited::Accepted(stream, peer) => (stream, peer),
            Waited::Expired => {
                warn!("No local client within {:?}; abandoning session", grace);
                session.advance(SessionEvent::GraceExpired);
                session.close(PipeStats::default()).await;
                return Err(Error::AcceptTimeout(grace));
            }
            Waited::Terminated => {
                session.advance(SessionEvent::Terminate);
                return Ok(session.close(PipeStats::default()).await);
            }
            Waited::ListenerGone => {
                error!("Local listener stopped before any client connected");
                session.advance(SessionEvent::Terminate);
                return Ok(session.close(PipeStats::default()).await);
            }
        };

        session.advance(SessionEvent::ClientAccepted);
        info!("Piping {} to {}:{}", peer, self.params.target_host, self.params.target_port);

        let stats = match session
            .transport
            .open_forward(&self.params.target_host, self.params.target_port, peer)
            .await
        {
            Ok(remote) => {
                tokio::select! {
                    stats = pipe("tunnel", stream, remote) => Some(stats),
                    _ = &mut shutdown => None,
                }
            }
            Err(e) => {
                warn!("{}", e);
                Some(PipeStats {
                    broken: true,
                    ..PipeStats::default()
                })
            }
        };

        match stats {
            Some(stats) => {
                if stats.broken {
                    debug!("{}", Error::PipeBroken);
                }
                session.advance(SessionEvent::PipeClosed);
                Ok(session.close(stats).await)
            }
            None => {
                session.advance(SessionEvent::Terminate);
                Ok(session.close(PipeStats::default()).await)
            }
        }
    }
}

/// Everything torn down when the session closes
struct Closing<T: Transport> {
    state: SessionState,
    transport: Arc<T>,
    accept_task: JoinHandle<()>,
    child: Option<ChildRelay>,
    counters: Arc<Counters>,
    local_port: u16,
}

impl<T: Transport> Closing<T> {
    fn advance(&mut self, event: SessionEvent) {
        advance(&mut self.state, event);
    }

    async fn close(self, stats: PipeStats) -> SessionReport {
        // Dropping the accept task closes the listener and any extra pipes.
        self.accept_task.abort();
        self.transport.disconnect().await;
        if let Some(child) = self.child {
            child.detach();
        }

        let reason = match self.state {
            SessionState::Closed(reason) => reason,
            _ => CloseReason::Terminated,
        };
        let report = SessionReport {
            local_port: self.local_port,
            reason,
            connections: self.counters.connections.load(Ordering::Relaxed),
            refused: self.counters.refused.load(Ordering::Relaxed),
            stats,
        };
        info!(
            "Session closed ({:?}): {} connection(s), {} refused, sent {} bytes, received {} bytes",
            report.reason, report.connections, report.refused, report.stats.sent, report.stats.received
        );
        report
    }
}

fn advance(state: &mut SessionState, event: SessionEvent) {
    match state.on(event, Instant::now()) {
        Ok(next) => {
            debug!("{} -> {}", state, next);
            *state = next;
        }
        Err(e) => error!("{}", e),
    }
}

/// Accept local clients until the gate closes.
///
/// The first connection is handed to the session; extras admitted by the
/// gate are piped here and dropped with this task.
async fn accept_loop<T: Transport>(
    listener: TcpListener,
    transport: Arc<T>,
    params: TunnelParams,
    counters: Arc<Counters>,
    first_tx: oneshot::Sender<(TcpStream, SocketAddr)>,
) {
    let mut gate = AcceptGate::new(params.extended_accept_window);
    let mut first_tx = Some(first_tx);
    let mut extras = JoinSet::new();

    loop {
        let closes_at = gate.closes_at();
        let (stream, peer) = tokio::select! {
            res = listener.accept() => match res {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    continue;
                }
            },
            _ = sleep_until(closes_at) => {
                info!("Extended accept window elapsed; closing listener");
                break;
            }
        };

        match gate.admit(Instant::now()) {
            Admission::First => {
                counters.connections.fetch_add(1, Ordering::Relaxed);
                if let Some(tx) = first_tx.take() {
                    let _ = tx.send((stream, peer));
                }
            }
            Admission::Extra => {
                counters.connections.fetch_add(1, Ordering::Relaxed);
                info!("Admitting extra client {}", peer);
                let transport = transport.clone();
                let host = params.target_host.clone();
                let port = params.target_port;
                extras.spawn(async move {
                    match transport.open_forward(&host, port, peer).await {
                        Ok(remote) => {
                            let stats = pipe("tunnel extra", stream, remote).await;
                            debug!("Extra client {} done: {:?}", peer, stats);
                        }
                        Err(e) => warn!("{}", e),
                    }
                });
            }
            Admission::Refused => {
                counters.refused.fetch_add(1, Ordering::Relaxed);
                warn!("Refusing {}: tunnel already in use", peer);
                drop(stream);
            }
            Admission::Closed => {
                counters.refused.fetch_add(1, Ordering::Relaxed);
                info!("Refusing {}; closing listener", peer);
                drop(stream);
                break;
            }
        }
    }

    drop(listener);
    while extras.join_next().await.is_some() {}
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}
