//! ONC-RPC wire helpers
//!
//! Big-endian field access, the accepted-reply header, and TCP record marking
//! (RFC 5531 section 11). Both the portmapper and the VXI-11 engine build their
//! replies through [`build_reply`].

use crate::error::{DecodeError, Result};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Size of the record-marking prefix on TCP
pub const RECORD_MARK_LEN: usize = 4;

/// Size of the header produced by [`rpc_reply_header`]
pub const RPC_REPLY_HEADER_LEN: usize = 24;

/// Top bit of the record mark: this fragment ends the record
const LAST_FRAGMENT: u32 = 0x8000_0000;

/// Remaining bits of the record mark: fragment length
const FRAGMENT_LEN_MASK: u32 = 0x7FFF_FFFF;

/// RPC message type REPLY
const MSG_TYPE_REPLY: u32 = 1;

/// Reply state MSG_ACCEPTED
const REPLY_ACCEPTED: u32 = 0;

/// Verifier flavor AUTH_NULL
const AUTH_NULL: u32 = 0;

/// Accept state SUCCESS
const ACCEPT_SUCCESS: u32 = 0;

/// Transport a reply is sent over
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "TCP",
            Transport::Udp => "UDP",
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Borrow `len` bytes at `offset`, failing instead of reading past the buffer.
pub fn field(buf: &[u8], offset: usize, len: usize) -> std::result::Result<&[u8], DecodeError> {
    let needed = offset.saturating_add(len);
    buf.get(offset..needed).ok_or(DecodeError::Truncated {
        needed,
        len: buf.len(),
    })
}

/// Read a big-endian u32 at `offset`.
pub fn decode_u32(buf: &[u8], offset: usize) -> std::result::Result<u32, DecodeError> {
    let bytes = field(buf, offset, 4)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub fn encode_u32(value: u32) -> [u8; 4] {
    value.to_be_bytes()
}

/// Header of a successful, accepted reply to the call identified by `xid`.
pub fn rpc_reply_header(xid: u32) -> [u8; RPC_REPLY_HEADER_LEN] {
    let words = [
        xid,
        MSG_TYPE_REPLY,
        REPLY_ACCEPTED,
        AUTH_NULL,
        0, // verifier length
        ACCEPT_SUCCESS,
    ];
    let mut hdr = [0u8; RPC_REPLY_HEADER_LEN];
    for (chunk, word) in hdr.chunks_exact_mut(4).zip(words) {
        chunk.copy_from_slice(&word.to_be_bytes());
    }
    hdr
}

/// Record mark for a single, final fragment of `len` bytes.
pub fn record_mark(len: usize) -> [u8; RECORD_MARK_LEN] {
    encode_u32((len as u32 & FRAGMENT_LEN_MASK) | LAST_FRAGMENT)
}

/// Assemble a complete reply: RPC header plus `payload`, record-marked on TCP.
pub fn build_reply(xid: u32, payload: &[u8], transport: Transport) -> Vec<u8> {
    let body_len = RPC_REPLY_HEADER_LEN + payload.len();
    let mut out = Vec::with_capacity(RECORD_MARK_LEN + body_len);
    if transport == Transport::Tcp {
        out.extend_from_slice(&record_mark(body_len));
    }
    out.extend_from_slice(&rpc_reply_header(xid));
    out.extend_from_slice(payload);
    out
}

/// Read one complete RPC record from a TCP stream.
///
/// Fragments are joined and the result is returned behind a single record mark,
/// so offsets measured from the start of the TCP payload stay valid. Returns
/// `None` when the peer closes the stream between records.
pub async fn read_record<R>(reader: &mut R, max_len: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut body = Vec::new();
    loop {
        let mut mark = [0u8; RECORD_MARK_LEN];
        match reader.read_exact(&mut mark).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof && body.is_empty() => {
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        let mark = u32::from_be_bytes(mark);
        let frag_len = (mark & FRAGMENT_LEN_MASK) as usize;
        let total = body.len() + frag_len;
        if total > max_len {
            return Err(DecodeError::Oversized {
                len: total,
                max: max_len,
            }
            .into());
        }

        let start = body.len();
        body.resize(total, 0);
        reader.read_exact(&mut body[start..]).await?;

        if mark & LAST_FRAGMENT != 0 {
            break;
        }
    }

    let mut record = Vec::with_capacity(RECORD_MARK_LEN + body.len());
    record.extend_from_slice(&record_mark(body.len()));
    record.extend_from_slice(&body);
    Ok(Some(record))
}
