//! Integration test infrastructure for the VXI-11 instrument simulator
//!
//! Provides:
//! - ONC-RPC call builders for portmapper and VXI-11 core requests
//! - A minimal VXI-11 client speaking to a running server
//! - Helpers that start a server on loopback and wait for port rotation

pub mod client;
pub mod frames;
mod harness;

pub use client::{getport_tcp, getport_udp, CreateLinkReply, ReadReply, Vxi11Client};
pub use frames::*;
pub use harness::{wait_for_port, TestServer};
