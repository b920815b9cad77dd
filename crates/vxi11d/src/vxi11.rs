//! VXI-11 core channel protocol engine
//!
//! Decodes DEVICE_CORE calls from a record-marked TCP frame, tracks which
//! logical instruments have an open link, and produces the replies. Requests
//! we cannot honour are not answered with VXI-11 error codes: the engine
//! returns a [`Vxi11Error`] and the caller drops the connection.
//!
//! # Frame offsets
//!
//! Offsets include the 4-byte record mark that precedes the RPC call on TCP.
//!
//! | Field | Offset |
//! |-------|--------|
//! | xid | 0x04 |
//! | program | 0x10 |
//! | procedure | 0x18 |
//! | link id (write/read/destroy) | 0x2C |
//! | device name length / bytes (create) | 0x38 / 0x3C |
//! | data length / bytes (write) | 0x3C / 0x40 |

use crate::config::ServerConfig;
use crate::error::Vxi11Error;
use crate::wire::{self, Transport};
use tracing::debug;

/// DEVICE_CORE program number
pub const VXI11_CORE_PROGRAM: u32 = 395183;

pub const CREATE_LINK: u32 = 10;
pub const DEVICE_WRITE: u32 = 11;
pub const DEVICE_READ: u32 = 12;
pub const DESTROY_LINK: u32 = 23;

/// Reason bit reported with the data of a DEVICE_READ: END
pub const REASON_END: u32 = 4;

const XID_OFFSET: usize = 0x04;
const PROGRAM_OFFSET: usize = 0x10;
const PROCEDURE_OFFSET: usize = 0x18;
const LINK_ID_OFFSET: usize = 0x2C;
const DEVICE_NAME_LEN_OFFSET: usize = 0x38;
const DEVICE_NAME_OFFSET: usize = 0x3C;
const WRITE_DATA_LEN_OFFSET: usize = 0x3C;
const WRITE_DATA_OFFSET: usize = 0x40;

/// Appended to DEVICE_READ data: terminator plus two fill bytes
const READ_TRAILER: [u8; 3] = [b'\n', 0, 0];

/// Error code "no error" at the start of every reply
const NO_ERROR: u32 = 0;

/// A decoded DEVICE_CORE call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Vxi11Request {
    CreateLink { device: String },
    DeviceWrite { link_id: u32, data: Vec<u8> },
    DeviceRead { link_id: u32 },
    DestroyLink { link_id: u32 },
    Unknown { procedure: u32 },
}

impl Vxi11Request {
    pub fn name(&self) -> &'static str {
        match self {
            Vxi11Request::CreateLink { .. } => "CREATE_LINK",
            Vxi11Request::DeviceWrite { .. } => "DEVICE_WRITE",
            Vxi11Request::DeviceRead { .. } => "DEVICE_READ",
            Vxi11Request::DestroyLink { .. } => "DESTROY_LINK",
            Vxi11Request::Unknown { .. } => "UNKNOWN",
        }
    }
}

/// A request together with the xid its reply must carry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vxi11Call {
    pub xid: u32,
    pub request: Vxi11Request,
}

/// Decode one record-marked frame.
///
/// A foreign program id is an error; an unknown procedure is not, it decodes to
/// [`Vxi11Request::Unknown`].
pub fn decode_call(frame: &[u8]) -> Result<Vxi11Call, Vxi11Error> {
    let program = wire::decode_u32(frame, PROGRAM_OFFSET)?;
    if program != VXI11_CORE_PROGRAM {
        return Err(Vxi11Error::NotVxi11(program));
    }

    let xid = wire::decode_u32(frame, XID_OFFSET)?;
    let procedure = wire::decode_u32(frame, PROCEDURE_OFFSET)?;

    let request = match procedure {
        CREATE_LINK => {
            // client id, lockDevice and lock_timeout are ignored
            let len = wire::decode_u32(frame, DEVICE_NAME_LEN_OFFSET)? as usize;
            let name = wire::field(frame, DEVICE_NAME_OFFSET, len)?;
            Vxi11Request::CreateLink {
                device: String::from_utf8_lossy(name).trim().to_string(),
            }
        }
        DEVICE_WRITE => {
            // io_timeout, lock_timeout and flags are ignored
            let link_id = wire::decode_u32(frame, LINK_ID_OFFSET)?;
            let len = wire::decode_u32(frame, WRITE_DATA_LEN_OFFSET)? as usize;
            let data = wire::field(frame, WRITE_DATA_OFFSET, len)?.to_vec();
            Vxi11Request::DeviceWrite { link_id, data }
        }
        DEVICE_READ => Vxi11Request::DeviceRead {
            link_id: wire::decode_u32(frame, LINK_ID_OFFSET)?,
        },
        DESTROY_LINK => Vxi11Request::DestroyLink {
            link_id: wire::decode_u32(frame, LINK_ID_OFFSET)?,
        },
        procedure => Vxi11Request::Unknown { procedure },
    };

    Ok(Vxi11Call { xid, request })
}

/// Map a VISA device name to a link id.
///
/// `inst` / `inst0` is the instrument itself (link 0). `gpib0,<n>` and its
/// aliases address sub-instrument `n` in `1..=num_instruments`.
pub fn resolve_device_name(name: &str, num_instruments: u32) -> Option<u32> {
    let name = name.trim().to_ascii_lowercase();
    if name == "inst" || name == "inst0" {
        return Some(0);
    }

    let (alias, address) = name.split_once(',')?;
    if !matches!(alias, "gpib" | "gpib0" | "hpib" | "hpib0") {
        return None;
    }
    if address.is_empty() || !address.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let address: u32 = address.parse().ok()?;
    (1..=num_instruments).contains(&address).then_some(address)
}

/// Open/closed flag for every logical instrument, sized once at startup
#[derive(Debug, Clone)]
pub struct LinkTable {
    open: Vec<bool>,
}

impl LinkTable {
    /// Link 0 plus one link per sub-instrument.
    pub fn new(num_instruments: u32) -> Self {
        Self {
            open: vec![false; num_instruments as usize + 1],
        }
    }

    /// False for ids outside the table.
    pub fn is_open(&self, link_id: u32) -> bool {
        self.open.get(link_id as usize).copied().unwrap_or(false)
    }

    pub fn any_open(&self) -> bool {
        self.open.iter().any(|&open| open)
    }

    fn set(&mut self, link_id: u32, open: bool) {
        if let Some(slot) = self.open.get_mut(link_id as usize) {
            *slot = open;
        }
    }
}

/// Reply to send back and whether the connection stays up afterwards
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vxi11Reply {
    pub data: Vec<u8>,
    pub keep_open: bool,
}

/// Per-server VXI-11 state: the link table and the reply constants.
///
/// Lives as long as the orchestrator, so links survive from one connection to
/// the next.
#[derive(Debug)]
pub struct Vxi11Engine {
    links: LinkTable,
    num_instruments: u32,
    id_string: String,
    max_recv_size: u32,
}

impl Vxi11Engine {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            links: LinkTable::new(config.num_instruments),
            num_instruments: config.num_instruments,
            id_string: config.id_string.clone(),
            max_recv_size: config.max_recv_size,
        }
    }

    pub fn links(&self) -> &LinkTable {
        &self.links
    }

    /// Largest record body a connection must accept: a DEVICE_WRITE carrying
    /// `max_recv_size` bytes of data, padded.
    pub fn max_record_len(&self) -> usize {
        self.max_recv_size as usize + WRITE_DATA_OFFSET
    }

    /// Handle one frame. `Err` means: send nothing and drop the connection.
    pub fn handle_frame(&mut self, frame: &[u8]) -> Result<Vxi11Reply, Vxi11Error> {
        let call = decode_call(frame)?;
        self.log_request(&call.request);
        self.handle_call(call)
    }

    pub fn handle_call(&mut self, call: Vxi11Call) -> Result<Vxi11Reply, Vxi11Error> {
        let mut keep_open = true;
        let payload = match call.request {
            Vxi11Request::Unknown { procedure } => {
                return Err(Vxi11Error::UnknownProcedure(procedure));
            }
            Vxi11Request::CreateLink { device } => {
                let link_id = resolve_device_name(&device, self.num_instruments)
                    .ok_or(Vxi11Error::InvalidDeviceName(device))?;
                if self.links.is_open(link_id) {
                    return Err(Vxi11Error::LinkInUse(link_id));
                }
                self.links.set(link_id, true);
                debug!(target: "vxi11", link_id, "VXI-11: creating link");
                self.create_link_reply(link_id)
            }
            Vxi11Request::DeviceWrite { link_id, data } => {
                self.require_open(link_id)?;
                device_write_reply(data.len())
            }
            Vxi11Request::DeviceRead { link_id } => {
                self.require_open(link_id)?;
                let mut response = self.id_string.clone().into_bytes();
                response.extend_from_slice(link_id.to_string().as_bytes());
                device_read_reply(&response)
            }
            Vxi11Request::DestroyLink { link_id } => {
                self.require_open(link_id)?;
                self.links.set(link_id, false);
                keep_open = self.links.any_open();
                encode_words(&[NO_ERROR])
            }
        };

        Ok(Vxi11Reply {
            data: wire::build_reply(call.xid, &payload, Transport::Tcp),
            keep_open,
        })
    }

    fn require_open(&self, link_id: u32) -> Result<(), Vxi11Error> {
        if self.links.is_open(link_id) {
            Ok(())
        } else {
            Err(Vxi11Error::LinkNotOpen(link_id))
        }
    }

    fn create_link_reply(&self, link_id: u32) -> Vec<u8> {
        // error, lid, abortPort, maxRecvSize
        encode_words(&[NO_ERROR, link_id, 0, self.max_recv_size])
    }

    fn log_request(&self, request: &Vxi11Request) {
        match request {
            Vxi11Request::CreateLink { device } => {
                debug!(target: "vxi11", "VXI-11: {}, '{}'", request.name(), device);
            }
            Vxi11Request::DeviceWrite { link_id, data } => {
                debug!(
                    target: "vxi11",
                    "VXI-11: {}, LID={} '{}'",
                    request.name(),
                    link_id,
                    String::from_utf8_lossy(data).trim()
                );
            }
            Vxi11Request::DeviceRead { link_id } | Vxi11Request::DestroyLink { link_id } => {
                debug!(target: "vxi11", "VXI-11: {}, LID={}", request.name(), link_id);
            }
            Vxi11Request::Unknown { procedure } => {
                debug!(target: "vxi11", "VXI-11: Unsupported VXI-11 command received. Code {}", procedure);
            }
        }
    }
}

fn encode_words(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| wire::encode_u32(*w)).collect()
}

fn device_write_reply(size: usize) -> Vec<u8> {
    encode_words(&[NO_ERROR, size as u32])
}

fn device_read_reply(data: &[u8]) -> Vec<u8> {
    let mut out = encode_words(&[NO_ERROR, REASON_END, data.len() as u32]);
    out.extend_from_slice(data);
    out.extend_from_slice(&READ_TRAILER);
    out
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::wire::{record_mark, RECORD_MARK_LEN, RPC_REPLY_HEADER_LEN};
    use pretty_assertions::assert_eq;

    const REPLY_PAYLOAD: usize = RECORD_MARK_LEN + RPC_REPLY_HEADER_LEN;

    /// Record-marked DEVICE_CORE call with AUTH_NULL credentials
    pub(crate) fn call_frame(xid: u32, program: u32, procedure: u32, args: &[u8]) -> Vec<u8> {
        let mut body: Vec<u8> = [xid, 0, 2, program, 1, procedure, 0, 0, 0, 0]
            .iter()
            .flat_map(|w| w.to_be_bytes())
            .collect();
        body.extend_from_slice(args);
        let mut frame = record_mark(body.len()).to_vec();
        frame.extend_from_slice(&body);
        frame
    }

    pub(crate) fn opaque(data: &[u8]) -> Vec<u8> {
        let mut out = (data.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(data);
        out.resize(out.len() + (4 - data.len() % 4) % 4, 0);
        out
    }

    pub(crate) fn create_link(xid: u32, device: &str) -> Vec<u8> {
        let mut args = encode_words(&[0x1234, 0, 0]); // client id, lock, lock timeout
        args.extend(opaque(device.as_bytes()));
        call_frame(xid, VXI11_CORE_PROGRAM, CREATE_LINK, &args)
    }

    pub(crate) fn device_write(xid: u32, link_id: u32, data: &[u8]) -> Vec<u8> {
        let mut args = encode_words(&[link_id, 1000, 0, 8]); // lid, io timeout, lock timeout, END
        args.extend(opaque(data));
        call_frame(xid, VXI11_CORE_PROGRAM, DEVICE_WRITE, &args)
    }

    pub(crate) fn device_read(xid: u32, link_id: u32) -> Vec<u8> {
        let args = encode_words(&[link_id, 1024, 1000, 0, 0, 0]);
        call_frame(xid, VXI11_CORE_PROGRAM, DEVICE_READ, &args)
    }

    pub(crate) fn destroy_link(xid: u32, link_id: u32) -> Vec<u8> {
        call_frame(xid, VXI11_CORE_PROGRAM, DESTROY_LINK, &encode_words(&[link_id]))
    }

    fn engine(num_instruments: u32) -> Vxi11Engine {
        Vxi11Engine::new(&ServerConfig {
            num_instruments,
            ..Default::default()
        })
    }

    fn payload(reply: &Vxi11Reply) -> &[u8] {
        &reply.data[REPLY_PAYLOAD..]
    }

    #[test]
    fn test_field_offsets_match_frame_layout() {
        let frame = device_write(5, 3, b"*RST");
        assert_eq!(wire::decode_u32(&frame, XID_OFFSET).unwrap(), 5);
        assert_eq!(wire::decode_u32(&frame, PROGRAM_OFFSET).unwrap(), VXI11_CORE_PROGRAM);
        assert_eq!(wire::decode_u32(&frame, PROCEDURE_OFFSET).unwrap(), DEVICE_WRITE);
        assert_eq!(wire::decode_u32(&frame, LINK_ID_OFFSET).unwrap(), 3);
        assert_eq!(wire::decode_u32(&frame, WRITE_DATA_LEN_OFFSET).unwrap(), 4);
        assert_eq!(&frame[WRITE_DATA_OFFSET..WRITE_DATA_OFFSET + 4], b"*RST");
    }

    #[test]
    fn test_decode_create_link() {
        let call = decode_call(&create_link(42, " inst0 ")).unwrap();
        assert_eq!(call.xid, 42);
        assert_eq!(
            call.request,
            Vxi11Request::CreateLink {
                device: "inst0".to_string()
            }
        );
    }

    #[test]
    fn test_decode_unknown_procedure() {
        let frame = call_frame(1, VXI11_CORE_PROGRAM, 13, &encode_words(&[0; 8]));
        let call = decode_call(&frame).unwrap();
        assert_eq!(call.request, Vxi11Request::Unknown { procedure: 13 });
    }

    #[test]
    fn test_decode_foreign_program() {
        let frame = call_frame(1, 100000, CREATE_LINK, &[]);
        assert_eq!(decode_call(&frame), Err(Vxi11Error::NotVxi11(100000)));
    }

    #[test]
    fn test_decode_truncated_payload() {
        let mut frame = device_write(1, 0, b"*IDN?");
        frame.truncate(WRITE_DATA_OFFSET + 2);
        assert!(matches!(decode_call(&frame), Err(Vxi11Error::Decode(_))));

        let frame = call_frame(1, VXI11_CORE_PROGRAM, DEVICE_READ, &[]);
        assert!(matches!(decode_call(&frame), Err(Vxi11Error::Decode(_))));

        assert!(matches!(decode_call(&[0u8; 8]), Err(Vxi11Error::Decode(_))));
    }

    #[test]
    fn test_resolve_device_name() {
        assert_eq!(resolve_device_name("inst", 0), Some(0));
        assert_eq!(resolve_device_name("INST0", 0), Some(0));
        assert_eq!(resolve_device_name("  inst0\n", 0), Some(0));
        assert_eq!(resolve_device_name("gpib0,1", 3), Some(1));
        assert_eq!(resolve_device_name("GPIB,3", 3), Some(3));
        assert_eq!(resolve_device_name("hpib,2", 3), Some(2));
        assert_eq!(resolve_device_name("hpib0,2", 3), Some(2));
    }

    #[test]
    fn test_resolve_device_name_rejects() {
        assert_eq!(resolve_device_name("", 3), None);
        assert_eq!(resolve_device_name("inst1", 3), None);
        assert_eq!(resolve_device_name("gpib0,0", 3), None);
        assert_eq!(resolve_device_name("gpib0,4", 3), None);
        assert_eq!(resolve_device_name("gpib0,1", 0), None);
        assert_eq!(resolve_device_name("gpib1,1", 3), None);
        assert_eq!(resolve_device_name("gpib0,", 3), None);
        assert_eq!(resolve_device_name("gpib0,+1", 3), None);
        assert_eq!(resolve_device_name("gpib0,1,2", 3), None);
        assert_eq!(resolve_device_name("gpib0 ,1", 3), None);
        assert_eq!(resolve_device_name("com1", 3), None);
    }

    #[test]
    fn test_link_table() {
        let mut links = LinkTable::new(2);
        assert!(!links.any_open());
        links.set(2, true);
        assert!(links.is_open(2));
        assert!(links.any_open());
        assert!(!links.is_open(3));
        links.set(7, true);
        assert!(!links.is_open(7));
    }

    #[test]
    fn test_lone_instrument_session() {
        let mut engine = engine(0);

        let reply = engine.handle_frame(&create_link(1, "inst0")).unwrap();
        assert!(reply.keep_open);
        assert_eq!(&reply.data[..4], &record_mark(RPC_REPLY_HEADER_LEN + 16));
        assert_eq!(wire::decode_u32(&reply.data, 4).unwrap(), 1);
        assert_eq!(
            payload(&reply),
            &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x00, 0x80, 0x00, 0x00]
        );

        let reply = engine.handle_frame(&device_write(2, 0, b"*IDN?")).unwrap();
        assert!(reply.keep_open);
        assert_eq!(payload(&reply), &[0, 0, 0, 0, 0, 0, 0, 5]);

        let reply = engine.handle_frame(&device_read(3, 0)).unwrap();
        assert!(reply.keep_open);
        let mut expected = vec![0, 0, 0, 0, 0, 0, 0, 4, 0, 0, 0, 10];
        expected.extend_from_slice(b"IDN-DUMMY0");
        expected.extend_from_slice(&[0x0A, 0x00, 0x00]);
        assert_eq!(payload(&reply), &expected[..]);

        let reply = engine.handle_frame(&destroy_link(4, 0)).unwrap();
        assert!(!reply.keep_open);
        assert_eq!(wire::decode_u32(&reply.data, 4).unwrap(), 4);
        assert_eq!(payload(&reply), &[0, 0, 0, 0]);
        assert!(!engine.links().any_open());
    }

    #[test]
    fn test_read_reply_carries_link_id() {
        let mut engine = engine(4);
        engine.handle_frame(&create_link(1, "gpib0,4")).unwrap();
        let reply = engine.handle_frame(&device_read(2, 4)).unwrap();
        assert_eq!(&payload(&reply)[12..22], b"IDN-DUMMY4");
    }

    #[test]
    fn test_duplicate_create_link_rejected() {
        let mut engine = engine(0);
        engine.handle_frame(&create_link(1, "inst0")).unwrap();
        assert_eq!(
            engine.handle_frame(&create_link(2, "inst")),
            Err(Vxi11Error::LinkInUse(0))
        );
        assert!(engine.links().is_open(0));
    }

    #[test]
    fn test_invalid_device_name_rejected() {
        let mut engine = engine(2);
        assert_eq!(
            engine.handle_frame(&create_link(1, "gpib0,3")),
            Err(Vxi11Error::InvalidDeviceName("gpib0,3".to_string()))
        );
        assert!(!engine.links().any_open());
    }

    #[test]
    fn test_requests_on_closed_link_rejected() {
        let mut engine = engine(2);
        engine.handle_frame(&create_link(1, "gpib0,1")).unwrap();

        assert_eq!(
            engine.handle_frame(&device_write(2, 2, b"VOLT 1")),
            Err(Vxi11Error::LinkNotOpen(2))
        );
        assert_eq!(
            engine.handle_frame(&device_read(3, 0)),
            Err(Vxi11Error::LinkNotOpen(0))
        );
        assert_eq!(
            engine.handle_frame(&destroy_link(4, 9)),
            Err(Vxi11Error::LinkNotOpen(9))
        );
        assert!(engine.links().is_open(1));
    }

    #[test]
    fn test_destroy_keeps_connection_while_links_remain() {
        let mut engine = engine(2);
        engine.handle_frame(&create_link(1, "inst0")).unwrap();
        engine.handle_frame(&create_link(2, "gpib0,2")).unwrap();

        let reply = engine.handle_frame(&destroy_link(3, 0)).unwrap();
        assert!(reply.keep_open);

        let reply = engine.handle_frame(&destroy_link(4, 2)).unwrap();
        assert!(!reply.keep_open);
    }

    #[test]
    fn test_unknown_procedure_ends_connection() {
        let mut engine = engine(0);
        let frame = call_frame(1, VXI11_CORE_PROGRAM, 15, &encode_words(&[0]));
        assert_eq!(
            engine.handle_frame(&frame),
            Err(Vxi11Error::UnknownProcedure(15))
        );
    }
}
