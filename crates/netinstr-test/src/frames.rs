//! ONC-RPC call bodies as a VISA library would send them
//!
//! Bodies start at the xid and carry AUTH_NULL credentials and verifier. TCP
//! callers prefix them with [`record_marked`].

use netinstr_vxi11d::vxi11::{
    CREATE_LINK, DESTROY_LINK, DEVICE_READ, DEVICE_WRITE, VXI11_CORE_PROGRAM,
};
use netinstr_vxi11d::wire::{encode_u32, record_mark};
use netinstr_vxi11d::GETPORT;

/// PMAP program number
pub const PORTMAP_PROGRAM: u32 = 100000;

/// IPPROTO_TCP, the protocol VXI-11 clients ask the portmapper about
pub const IPPROTO_TCP: u32 = 6;

/// END flag on DEVICE_WRITE
pub const WRITE_FLAG_END: u32 = 8;

/// Concatenate big-endian words
pub fn words(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| encode_u32(*v)).collect()
}

/// XDR variable-length opaque: length, bytes, zero padding to 4
pub fn xdr_opaque(data: &[u8]) -> Vec<u8> {
    let mut out = encode_u32(data.len() as u32).to_vec();
    out.extend_from_slice(data);
    out.resize(out.len() + (4 - data.len() % 4) % 4, 0);
    out
}

/// RPC call header followed by `args`
pub fn call_body(xid: u32, program: u32, version: u32, procedure: u32, args: &[u8]) -> Vec<u8> {
    let mut body = words(&[
        xid, 0, // CALL
        2, // RPC version
        program, version, procedure, //
        0, 0, // credentials
        0, 0, // verifier
    ]);
    body.extend_from_slice(args);
    body
}

/// Prefix a body with a single last-fragment record mark
pub fn record_marked(body: &[u8]) -> Vec<u8> {
    let mut frame = record_mark(body.len()).to_vec();
    frame.extend_from_slice(body);
    frame
}

/// PMAPPROC_GETPORT for `program` over TCP
pub fn getport_body(xid: u32, program: u32) -> Vec<u8> {
    call_body(
        xid,
        PORTMAP_PROGRAM,
        2,
        GETPORT,
        &words(&[program, 1, IPPROTO_TCP, 0]),
    )
}

pub fn create_link_body(xid: u32, device: &str) -> Vec<u8> {
    let mut args = words(&[0x0C1E_0001, 0, 10000]); // client id, no lock, lock timeout
    args.extend(xdr_opaque(device.as_bytes()));
    call_body(xid, VXI11_CORE_PROGRAM, 1, CREATE_LINK, &args)
}

pub fn device_write_body(xid: u32, link_id: u32, data: &[u8]) -> Vec<u8> {
    let mut args = words(&[link_id, 10000, 10000, WRITE_FLAG_END]);
    args.extend(xdr_opaque(data));
    call_body(xid, VXI11_CORE_PROGRAM, 1, DEVICE_WRITE, &args)
}

pub fn device_read_body(xid: u32, link_id: u32) -> Vec<u8> {
    // request size, io timeout, lock timeout, flags, term char
    let args = words(&[link_id, 1024, 10000, 10000, 0, 0]);
    call_body(xid, VXI11_CORE_PROGRAM, 1, DEVICE_READ, &args)
}

pub fn destroy_link_body(xid: u32, link_id: u32) -> Vec<u8> {
    call_body(xid, VXI11_CORE_PROGRAM, 1, DESTROY_LINK, &words(&[link_id]))
}
