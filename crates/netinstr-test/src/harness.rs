//! Running a simulator on loopback for a test

use anyhow::{bail, Context, Result};
use netinstr_vxi11d::{PortState, ServerConfig, Transport, Vxi11Server, VXI11_CORE_PROGRAM};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::client::getport_udp;

const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// A server bound to loopback with ephemeral portmapper ports
pub struct TestServer {
    pub tcp_portmapper: SocketAddr,
    pub udp_portmapper: SocketAddr,
    pub port_state: PortState,
    task: JoinHandle<netinstr_vxi11d::Result<()>>,
}

impl TestServer {
    /// Start a server serving `num_instruments` on the VXI-11 range
    /// `[port_start, port_end]`. Each test should use its own range.
    pub async fn start(num_instruments: u32, port_start: u16, port_end: u16) -> Result<Self> {
        let config = ServerConfig {
            host: LOOPBACK,
            rpcbind_port: 0,
            vxi11_port_start: port_start,
            vxi11_port_end: port_end,
            num_instruments,
            ..Default::default()
        };

        let server = Vxi11Server::bind(config)
            .await
            .context("binding test server")?;
        let tcp_portmapper = server
            .portmap_addr(Transport::Tcp)
            .context("TCP portmapper not running")?;
        let udp_portmapper = server
            .portmap_addr(Transport::Udp)
            .context("UDP portmapper not running")?;
        let port_state = server.port_state();
        let task = tokio::spawn(server.run_until(std::future::pending()));

        Ok(Self {
            tcp_portmapper,
            udp_portmapper,
            port_state,
            task,
        })
    }

    /// Current VXI-11 address as the portmapper reports it
    pub async fn lookup(&self) -> Result<SocketAddr> {
        let port = getport_udp(self.udp_portmapper, 0x5EED, VXI11_CORE_PROGRAM)
            .await?
            .context("portmapper did not answer")?;
        Ok(SocketAddr::new(LOOPBACK, port))
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

/// Poll the UDP portmapper until it reports `expected`.
pub async fn wait_for_port(portmapper: SocketAddr, expected: u16) -> Result<()> {
    let mut last = None;
    for xid in 0..100u32 {
        last = getport_udp(portmapper, xid, VXI11_CORE_PROGRAM).await?;
        if last == Some(expected) {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    bail!("portmapper reports {:?}, expected {}", last, expected)
}
