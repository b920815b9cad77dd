//! Minimal VXI-11 client
//!
//! Just enough of a VISA-side implementation to drive the simulator: portmapper
//! lookups on both transports and a core-channel session. Unlike the server,
//! every wait here is bounded so a silent drop shows up as `None`.

use crate::frames::*;
use anyhow::{bail, ensure, Context, Result};
use netinstr_vxi11d::wire::{self, RECORD_MARK_LEN, RPC_REPLY_HEADER_LEN};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::debug;

/// How long to wait for a reply before treating the request as dropped
pub const REPLY_TIMEOUT: Duration = Duration::from_millis(500);

/// Largest reply record accepted from the server
const MAX_REPLY_LEN: usize = 4096;

/// Check the RPC reply header (starting at the xid) and return the payload.
fn reply_payload(reply: &[u8], xid: u32) -> Result<&[u8]> {
    ensure!(reply.len() >= RPC_REPLY_HEADER_LEN, "short reply ({} bytes)", reply.len());
    let got = wire::decode_u32(reply, 0)?;
    ensure!(got == xid, "reply xid {} does not match call xid {}", got, xid);
    ensure!(wire::decode_u32(reply, 4)? == 1, "not an RPC reply");
    ensure!(wire::decode_u32(reply, 8)? == 0, "RPC call denied");
    ensure!(wire::decode_u32(reply, 20)? == 0, "RPC call not executed");
    Ok(&reply[RPC_REPLY_HEADER_LEN..])
}

/// Ask the UDP portmapper for `program`. `None` if nothing came back.
pub async fn getport_udp(addr: SocketAddr, xid: u32, program: u32) -> Result<Option<u16>> {
    let socket = UdpSocket::bind(("127.0.0.1", 0)).await?;
    socket.send_to(&getport_body(xid, program), addr).await?;

    let mut buf = [0u8; 256];
    let len = match timeout(REPLY_TIMEOUT, socket.recv_from(&mut buf)).await {
        Ok(received) => received?.0,
        Err(_) => return Ok(None),
    };
    let payload = reply_payload(&buf[..len], xid)?;
    Ok(Some(wire::decode_u32(payload, 0)? as u16))
}

/// Ask the TCP portmapper for `program`. `None` if the server hung up silently.
pub async fn getport_tcp(addr: SocketAddr, xid: u32, program: u32) -> Result<Option<u16>> {
    let mut stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connecting to portmapper {}", addr))?;
    stream
        .write_all(&record_marked(&getport_body(xid, program)))
        .await?;

    let mut reply = Vec::new();
    timeout(REPLY_TIMEOUT, stream.read_to_end(&mut reply))
        .await
        .context("portmapper kept the connection open")??;
    if reply.is_empty() {
        return Ok(None);
    }
    ensure!(reply.len() >= RECORD_MARK_LEN, "short record");
    let payload = reply_payload(&reply[RECORD_MARK_LEN..], xid)?;
    Ok(Some(wire::decode_u32(payload, 0)? as u16))
}

/// Decoded DEVICE_READ reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadReply {
    pub error: u32,
    pub reason: u32,
    pub data: Vec<u8>,
    /// Bytes after the data: terminator and fill
    pub trailer: Vec<u8>,
}

/// Decoded CREATE_LINK reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateLinkReply {
    pub error: u32,
    pub link_id: u32,
    pub abort_port: u32,
    pub max_recv_size: u32,
}

/// One TCP connection to the VXI-11 core channel
pub struct Vxi11Client {
    stream: TcpStream,
    next_xid: u32,
}

impl Vxi11Client {
    /// Connect, retrying while the server is still rebinding its listener.
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let mut last_err = None;
        for _ in 0..50 {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    return Ok(Self {
                        stream,
                        next_xid: 1,
                    })
                }
                Err(e) => {
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            }
        }
        match last_err {
            Some(e) => Err(e).with_context(|| format!("connecting to VXI-11 port {}", addr)),
            None => bail!("connecting to VXI-11 port {}", addr),
        }
    }

    fn xid(&mut self) -> u32 {
        let xid = self.next_xid;
        self.next_xid = self.next_xid.wrapping_add(1);
        xid
    }

    /// Send an already-built call body.
    pub async fn send_body(&mut self, body: &[u8]) -> Result<()> {
        self.stream.write_all(&record_marked(body)).await?;
        Ok(())
    }

    /// Next reply record, or `None` if the server closed the connection
    /// (or said nothing within [`REPLY_TIMEOUT`]).
    pub async fn recv_reply(&mut self) -> Result<Option<Vec<u8>>> {
        match timeout(REPLY_TIMEOUT, wire::read_record(&mut self.stream, MAX_REPLY_LEN)).await {
            Ok(Ok(record)) => Ok(record),
            Ok(Err(e)) => {
                debug!(error = %e, "connection ended");
                Ok(None)
            }
            Err(_) => Ok(None),
        }
    }

    /// Send a call and return the payload of its reply.
    async fn call(&mut self, xid: u32, body: Vec<u8>) -> Result<Option<Vec<u8>>> {
        self.send_body(&body).await?;
        match self.recv_reply().await? {
            Some(record) => Ok(Some(reply_payload(&record[RECORD_MARK_LEN..], xid)?.to_vec())),
            None => Ok(None),
        }
    }

    pub async fn create_link(&mut self, device: &str) -> Result<Option<CreateLinkReply>> {
        let xid = self.xid();
        let Some(p) = self.call(xid, create_link_body(xid, device)).await? else {
            return Ok(None);
        };
        Ok(Some(CreateLinkReply {
            error: wire::decode_u32(&p, 0)?,
            link_id: wire::decode_u32(&p, 4)?,
            abort_port: wire::decode_u32(&p, 8)?,
            max_recv_size: wire::decode_u32(&p, 12)?,
        }))
    }

    /// Returns (error, size)
    pub async fn device_write(&mut self, link_id: u32, data: &[u8]) -> Result<Option<(u32, u32)>> {
        let xid = self.xid();
        let Some(p) = self.call(xid, device_write_body(xid, link_id, data)).await? else {
            return Ok(None);
        };
        Ok(Some((wire::decode_u32(&p, 0)?, wire::decode_u32(&p, 4)?)))
    }

    pub async fn device_read(&mut self, link_id: u32) -> Result<Option<ReadReply>> {
        let xid = self.xid();
        let Some(p) = self.call(xid, device_read_body(xid, link_id)).await? else {
            return Ok(None);
        };
        let len = wire::decode_u32(&p, 8)? as usize;
        let data = wire::field(&p, 12, len)?.to_vec();
        Ok(Some(ReadReply {
            error: wire::decode_u32(&p, 0)?,
            reason: wire::decode_u32(&p, 4)?,
            data,
            trailer: p[12 + len..].to_vec(),
        }))
    }

    /// Returns the error code
    pub async fn destroy_link(&mut self, link_id: u32) -> Result<Option<u32>> {
        let xid = self.xid();
        let Some(p) = self.call(xid, destroy_link_body(xid, link_id)).await? else {
            return Ok(None);
        };
        Ok(Some(wire::decode_u32(&p, 0)?))
    }

    /// True once the server has closed its end.
    pub async fn is_closed(&mut self) -> bool {
        let mut byte = [0u8; 1];
        matches!(
            timeout(REPLY_TIMEOUT, self.stream.read(&mut byte)).await,
            Ok(Ok(0)) | Ok(Err(_))
        )
    }
}
