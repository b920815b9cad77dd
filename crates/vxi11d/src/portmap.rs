//! Portmapper responder
//!
//! Answers PMAPPROC_GETPORT (RFC 1833, version 2) for the VXI-11 core program
//! with whatever port the orchestrator is listening on right now. Everything
//! else is dropped without a reply.
//!
//! Request offsets are measured from the xid. On TCP the record mark is
//! stripped first so both transports share [`handle_getport`].

use crate::error::{NetinstrError, PortmapReject, Result};
use crate::port_state::PortState;
use crate::server::{bind_tcp_listener, ACCEPT_RETRY_DELAY};
use crate::vxi11::VXI11_CORE_PROGRAM;
use crate::wire::{self, Transport, RECORD_MARK_LEN};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, UdpSocket};
use tracing::{debug, warn};

/// PMAPPROC_GETPORT
pub const GETPORT: u32 = 3;

/// Offset of the procedure number in the call body
const PROCEDURE_OFFSET: usize = 0x14;

/// Offset of the `prog` argument of GETPORT (AUTH_NULL credentials assumed)
const PROGRAM_ARG_OFFSET: usize = 0x28;

/// Shortest body that still contains the `prog` argument
const MIN_REQUEST_LEN: usize = PROGRAM_ARG_OFFSET + 4;

/// Largest call body read from a TCP connection
const TCP_RECV_LEN: usize = 128;

/// Datagram buffer size
const UDP_RECV_LEN: usize = 1024;

/// Validate a GETPORT call body and build the reply advertising `port`.
pub fn handle_getport(
    body: &[u8],
    port: u16,
    transport: Transport,
) -> std::result::Result<Vec<u8>, PortmapReject> {
    if body.len() < MIN_REQUEST_LEN {
        return Err(PortmapReject::Malformed { len: body.len() });
    }

    let malformed = |_| PortmapReject::Malformed { len: body.len() };
    let procedure = wire::decode_u32(body, PROCEDURE_OFFSET).map_err(malformed)?;
    if procedure != GETPORT {
        return Err(PortmapReject::NotGetPort(procedure));
    }

    let program = wire::decode_u32(body, PROGRAM_ARG_OFFSET).map_err(malformed)?;
    if program != VXI11_CORE_PROGRAM {
        return Err(PortmapReject::NotVxi11(program));
    }

    let xid = wire::decode_u32(body, 0).map_err(malformed)?;
    let payload = wire::encode_u32(u32::from(port));
    Ok(wire::build_reply(xid, &payload, transport))
}

enum Endpoint {
    Tcp(TcpListener),
    Udp(UdpSocket),
}

/// One portmapper listener, TCP or UDP
pub struct Portmapper {
    endpoint: Endpoint,
    local_addr: SocketAddr,
    port_state: PortState,
    shutdown: Arc<AtomicBool>,
}

impl Portmapper {
    /// Bind the listener. Failure here is fatal for the daemon.
    pub async fn bind(
        transport: Transport,
        addr: SocketAddr,
        port_state: PortState,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self> {
        let endpoint = match transport {
            Transport::Tcp => Endpoint::Tcp(bind_tcp_listener(addr)?),
            Transport::Udp => {
                let socket = UdpSocket::bind(addr)
                    .await
                    .map_err(|source| NetinstrError::Bind {
                        transport: "UDP",
                        addr,
                        source,
                    })?;
                Endpoint::Udp(socket)
            }
        };

        let local_addr = match &endpoint {
            Endpoint::Tcp(listener) => listener.local_addr()?,
            Endpoint::Udp(socket) => socket.local_addr()?,
        };

        debug!(target: "portmap", %local_addr, "Portmapper: listening on {}", transport);

        Ok(Self {
            endpoint,
            local_addr,
            port_state,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn transport(&self) -> Transport {
        match self.endpoint {
            Endpoint::Tcp(_) => Transport::Tcp,
            Endpoint::Udp(_) => Transport::Udp,
        }
    }

    /// Serve requests until the shutdown flag is seen.
    ///
    /// The flag is checked between requests only; a pending accept or receive
    /// is not interrupted.
    pub async fn run(self) {
        let transport = self.transport();
        while !self.shutdown.load(Ordering::Relaxed) {
            let served = match &self.endpoint {
                Endpoint::Tcp(listener) => self.serve_tcp(listener).await,
                Endpoint::Udp(socket) => self.serve_udp(socket).await,
            };
            match served {
                Ok(Ok(())) => {}
                Ok(Err(reject)) => {
                    debug!(target: "portmap", %reject, "{}Portmapper: incompatible RPCBIND request", transport);
                }
                Err(e) => {
                    warn!(error = %e, "{}Portmapper: request failed", transport);
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }
        debug!(target: "portmap", "{}Portmapper: shut down", transport);
    }

    /// One connection, one request.
    async fn serve_tcp(
        &self,
        listener: &TcpListener,
    ) -> Result<std::result::Result<(), PortmapReject>> {
        let (mut stream, peer) = listener.accept().await?;
        debug!(target: "portmap", %peer, "TCPPortmapper: incoming connection");

        let outcome = match wire::read_record(&mut stream, TCP_RECV_LEN).await {
            Ok(Some(record)) => {
                let body = &record[RECORD_MARK_LEN..];
                match handle_getport(body, self.port_state.current(), Transport::Tcp) {
                    Ok(reply) => {
                        self.log_reply(Transport::Tcp);
                        stream.write_all(&reply).await?;
                        Ok(())
                    }
                    Err(reject) => Err(reject),
                }
            }
            Ok(None) => Err(PortmapReject::Malformed { len: 0 }),
            Err(NetinstrError::Decode(_)) => Err(PortmapReject::Malformed { len: TCP_RECV_LEN }),
            Err(e) => return Err(e),
        };

        let _ = stream.shutdown().await;
        Ok(outcome)
    }

    async fn serve_udp(&self, socket: &UdpSocket) -> Result<std::result::Result<(), PortmapReject>> {
        let mut buf = [0u8; UDP_RECV_LEN];
        let (len, peer) = socket.recv_from(&mut buf).await?;
        debug!(target: "portmap", %peer, "UDPPortmapper: incoming datagram");

        match handle_getport(&buf[..len], self.port_state.current(), Transport::Udp) {
            Ok(reply) => {
                self.log_reply(Transport::Udp);
                socket.send_to(&reply, peer).await?;
                Ok(Ok(()))
            }
            Err(reject) => Ok(Err(reject)),
        }
    }

    fn log_reply(&self, transport: Transport) {
        debug!(
            target: "portmap",
            "{}Portmapper: sending to TCP port {}",
            transport,
            self.port_state.current()
        );
    }
}
