//! Orchestrator: portmappers plus the rotating VXI-11 listener
//!
//! The VXI-11 side serves exactly one connection at a time. After each session
//! the listener is closed and reopened on the next port of the range; some VISA
//! clients need a fresh port per session. The portmappers run as separate tasks
//! and read the port through the shared [`PortState`].

use crate::config::ServerConfig;
use crate::error::{NetinstrError, Result};
use crate::port_state::PortState;
use crate::portmap::Portmapper;
use crate::vxi11::Vxi11Engine;
use crate::wire::{self, Transport};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pending connections beyond the one being served
const LISTEN_BACKLOG: u32 = 1;

/// Pause after a failed accept before trying again
pub(crate) const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Open a TCP listener with SO_REUSEADDR, since ports are switched quickly.
pub(crate) fn bind_tcp_listener(addr: SocketAddr) -> Result<TcpListener> {
    let bind_err = |source: std::io::Error| NetinstrError::Bind {
        transport: "TCP",
        addr,
        source,
    };

    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(bind_err)?;
    socket.set_reuseaddr(true).map_err(bind_err)?;
    socket.bind(addr).map_err(bind_err)?;
    socket.listen(LISTEN_BACKLOG).map_err(bind_err)
}

/// The simulated network instrument
pub struct Vxi11Server {
    config: ServerConfig,
    port_state: PortState,
    engine: Vxi11Engine,
    listener: TcpListener,
    portmappers: Vec<Portmapper>,
    shutdown: Arc<AtomicBool>,
}

impl Vxi11Server {
    /// Bind every socket the server needs. Nothing is served until [`run`].
    ///
    /// [`run`]: Vxi11Server::run
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        config.validate_server()?;

        let port_state = PortState::new(config.vxi11_port_start, config.vxi11_port_end);
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut portmappers = Vec::new();
        let transports = [
            (Transport::Tcp, config.tcp_portmapper),
            (Transport::Udp, config.udp_portmapper),
        ];
        for (transport, enabled) in transports {
            if !enabled {
                continue;
            }
            debug!(
                target: "portmap",
                "Portmapper: Listening to {} ports on {}",
                transport,
                config.rpcbind_addr()
            );
            let pm = Portmapper::bind(
                transport,
                config.rpcbind_addr(),
                port_state.clone(),
                shutdown.clone(),
            )
            .await?;
            portmappers.push(pm);
        }

        let addr = config.vxi11_addr(port_state.current());
        debug!(target: "portmap", "VXI-11: Listening to TCP port {}", addr);
        let listener = bind_tcp_listener(addr)?;

        Ok(Self {
            engine: Vxi11Engine::new(&config),
            config,
            port_state,
            listener,
            portmappers,
            shutdown,
        })
    }

    /// Shared handle on the active VXI-11 port
    pub fn port_state(&self) -> PortState {
        self.port_state.clone()
    }

    /// Where the portmapper for `transport` is listening, if enabled
    pub fn portmap_addr(&self, transport: Transport) -> Option<SocketAddr> {
        self.portmappers
            .iter()
            .find(|pm| pm.transport() == transport)
            .map(Portmapper::local_addr)
    }

    /// Setting this stops the server once the current iteration finishes
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Serve until Ctrl-C.
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            if tokio::signal::ctrl_c().await.is_err() {
                warn!("Cannot listen for Ctrl-C; stop the server with a signal");
                std::future::pending::<()>().await;
            }
            info!("Ctrl+C pressed. Exiting...");
        })
        .await
    }

    /// Serve until `signal` completes or the shutdown flag is set.
    ///
    /// Only a bind failure on the next VXI-11 port ends the loop with an error.
    pub async fn run_until<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let Vxi11Server {
            config,
            port_state,
            mut engine,
            mut listener,
            portmappers,
            shutdown,
        } = self;

        let tasks: Vec<JoinHandle<()>> = portmappers
            .into_iter()
            .map(|pm| tokio::spawn(pm.run()))
            .collect();

        tokio::pin!(signal);
        let mut sessions: u64 = 0;

        let outcome = loop {
            if shutdown.load(Ordering::Relaxed) {
                break Ok(());
            }

            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = &mut signal => break Ok(()),
            };

            let (stream, peer) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "VXI-11: accept failed");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    continue;
                }
            };

            tokio::select! {
                _ = serve_connection(&mut engine, stream, peer) => {}
                _ = &mut signal => break Ok(()),
            }
            sessions += 1;

            // every session must go to a new socket for some clients
            drop(listener);
            let port = port_state.advance();
            debug!(target: "portmap", sessions, "VXI-11: moving to TCP port {}", port);
            listener = match bind_tcp_listener(config.vxi11_addr(port)) {
                Ok(listener) => listener,
                Err(e) => break Err(e),
            };
        };

        shutdown.store(true, Ordering::Relaxed);
        for task in &tasks {
            task.abort();
        }
        info!(sessions, "Network server stopped");
        outcome
    }
}

/// Run one client connection through the engine until it ends.
async fn serve_connection<S>(engine: &mut Vxi11Engine, mut stream: S, peer: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    debug!(target: "vxi11", %peer, "VXI-11: Incoming connection");
    let max_record_len = engine.max_record_len();

    loop {
        let frame = match wire::read_record(&mut stream, max_record_len).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!(target: "vxi11", %peer, "VXI-11: client closed the connection");
                break;
            }
            Err(e) => {
                debug!(target: "vxi11", %peer, error = %e, "VXI-11: cannot read request");
                break;
            }
        };

        match engine.handle_frame(&frame) {
            Ok(reply) => {
                if let Err(e) = stream.write_all(&reply.data).await {
                    warn!(%peer, error = %e, "VXI-11: cannot send reply");
                    break;
                }
                if !reply.keep_open {
                    break;
                }
            }
            Err(e) => {
                debug!(target: "vxi11", %peer, error = %e, "VXI-11: ending connection");
                break;
            }
        }
    }

    let _ = stream.shutdown().await;
}
