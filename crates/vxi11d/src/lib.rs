//! VXI-11 network instrument simulator
//!
//! Pretends to be a LAN-attached instrument so VISA/SCPI client stacks can be
//! exercised without hardware. The daemon answers ONC-RPC portmapper GETPORT
//! queries for the VXI-11 core program and serves the core channel
//! (CREATE_LINK, DEVICE_WRITE, DEVICE_READ, DESTROY_LINK) over TCP.
//!
//! # Components
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`wire`] | Big-endian fields, RPC reply header, TCP record marking |
//! | [`portmap`] | GETPORT responder, one instance per transport |
//! | [`vxi11`] | Request decoding, link table, replies |
//! | [`server`] | Accept loop and port rotation |
//! | [`port_state`] | The active VXI-11 port, shared with the portmappers |
//! | [`config`] | Ports, instrument count, reply constants |
//!
//! # Limitations
//!
//! One VXI-11 client is served at a time. Invalid link references and unknown
//! device names are not answered with VXI-11 error codes; the connection is
//! simply closed.

pub mod config;
pub mod error;
pub mod port_state;
pub mod portmap;
pub mod server;
pub mod vxi11;
pub mod wire;

pub use config::ServerConfig;
pub use error::{DecodeError, NetinstrError, PortmapReject, Result, Vxi11Error};
pub use port_state::PortState;
pub use portmap::{handle_getport, Portmapper, GETPORT};
pub use server::Vxi11Server;
pub use vxi11::{
    decode_call, resolve_device_name, LinkTable, Vxi11Call, Vxi11Engine, Vxi11Reply,
    Vxi11Request, CREATE_LINK, DESTROY_LINK, DEVICE_READ, DEVICE_WRITE, VXI11_CORE_PROGRAM,
};
pub use wire::Transport;
