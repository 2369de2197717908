//! Wire-level definitions of the vendor control-request protocol.
//!
//! Each logical request is carried by a sequence of *service requests*
//! (INIT, CHECK, SEND, RECV, RESET), each of which is a single vendor
//! control transfer. IN service transfers return a [`ServiceReply`], a
//! flag-prefixed record occupying the first bytes of a 64-byte minimum
//! buffer.

use crate::error::{Error, ErrorKind, Result};

/// `bmRequestType` for vendor OUT (host-to-device) transfers.
pub const VENDOR_REQUEST_OUT: u8 = 0x40;

/// `bmRequestType` for vendor IN (device-to-host) transfers.
pub const VENDOR_REQUEST_IN: u8 = 0xC0;

/// `bRequest` of non-service Particle vendor transfers (ASCII 'P').
///
/// Used by collaborators that bypass the service layer via the session's
/// raw transfer passthroughs.
pub const PARTICLE_BREQUEST: u8 = 0x50;

/// Minimum IN length for service requests that carry only a reply record.
pub const MIN_WLENGTH: u16 = 64;

/// The 8-byte USB control-transfer header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct SetupPacket {
    #[doc(alias = "bmRequestType")]
    pub request_type: u8,
    #[doc(alias = "bRequest")]
    pub request: u8,
    #[doc(alias = "wValue")]
    pub value: u16,
    #[doc(alias = "wIndex")]
    pub index: u16,
    #[doc(alias = "wLength")]
    pub length: u16,
}

impl SetupPacket {
    /// Whether this setup packet describes a device-to-host transfer.
    pub fn is_in(&self) -> bool {
        self.request_type & 0x80 != 0
    }

    /// Serialize in the little-endian order the packet crosses the bus.
    pub fn to_bytes(&self) -> [u8; 8] {
        [
            self.request_type,
            self.request,
            (self.value & 0xFF) as u8,
            (self.value >> 8) as u8,
            (self.index & 0xFF) as u8,
            (self.index >> 8) as u8,
            (self.length & 0xFF) as u8,
            (self.length >> 8) as u8,
        ]
    }
}

/// Service request type, sent in the `bRequest` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceType {
    /// Start a logical request; the device allocates and returns its id.
    Init = 1,

    /// Poll a logical request for completion.
    Check = 2,

    /// Send the outbound payload (the only OUT service request).
    Send = 3,

    /// Read the inbound payload.
    Recv = 4,

    /// Abort a request (`wIndex` 0 aborts all).
    Reset = 5,
}

/// INIT setup packet: announce a request of `request_type` carrying
/// `payload_size` outbound bytes (0 if none).
pub fn init_packet(request_type: u16, payload_size: u16) -> SetupPacket {
    SetupPacket {
        request_type: VENDOR_REQUEST_IN,
        request: ServiceType::Init as u8,
        value: payload_size,
        index: request_type,
        length: MIN_WLENGTH,
    }
}

/// CHECK setup packet: poll request `id` until its status is no longer
/// [`Status::Pending`].
pub fn check_packet(id: u16) -> SetupPacket {
    SetupPacket {
        request_type: VENDOR_REQUEST_IN,
        request: ServiceType::Check as u8,
        value: 0,
        index: id,
        length: MIN_WLENGTH,
    }
}

/// SEND setup packet: the data stage carries `payload_size` bytes.
pub fn send_packet(id: u16, payload_size: u16) -> SetupPacket {
    SetupPacket {
        request_type: VENDOR_REQUEST_OUT,
        request: ServiceType::Send as u8,
        value: 0,
        index: id,
        length: payload_size,
    }
}

/// RECV setup packet: read `size` reply payload bytes.
pub fn recv_packet(id: u16, size: u16) -> SetupPacket {
    SetupPacket {
        request_type: VENDOR_REQUEST_IN,
        request: ServiceType::Recv as u8,
        value: 0,
        index: id,
        length: size,
    }
}

/// RESET setup packet: best-effort abort of request `id`, or of every
/// outstanding request when `id` is 0.
pub fn reset_packet(id: u16) -> SetupPacket {
    SetupPacket {
        request_type: VENDOR_REQUEST_IN,
        request: ServiceType::Reset as u8,
        value: 0,
        index: id,
        length: MIN_WLENGTH,
    }
}

/// Transport-level outcome of a service request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Status {
    /// Request processed successfully.
    Ok = 0,

    /// Request failed.
    Error = 1,

    /// Request is still being processed; keep polling.
    Pending = 2,

    /// Device cannot take another request right now.
    Busy = 3,

    /// Device could not allocate memory for the request.
    NoMemory = 4,

    /// Request id (or request type) is not known to the device.
    NotFound = 5,
}

impl Status {
    fn from_u16(value: u16) -> Option<Status> {
        match value {
            0 => Some(Status::Ok),
            1 => Some(Status::Error),
            2 => Some(Status::Pending),
            3 => Some(Status::Busy),
            4 => Some(Status::NoMemory),
            5 => Some(Status::NotFound),
            _ => None,
        }
    }
}

// Field-presence flags of the service reply, in field order.
const FLAG_STATUS: u32 = 0x01;
const FLAG_ID: u32 = 0x02;
const FLAG_SIZE: u32 = 0x04;
const FLAG_RESULT: u32 = 0x08;

/// The fixed-layout record returned by IN service transfers.
///
/// On the wire: 4-byte little-endian flags, then `status` (2 bytes,
/// mandatory), `id` (2 bytes), `size` (4 bytes) and `result` (4 bytes,
/// signed), each present when its flag is set. 6 to 16 bytes total; the
/// remainder of the 64-byte transfer is padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceReply {
    /// Transport-level status of the polled request.
    pub status: Status,

    /// Request id assigned by the device (INIT replies).
    pub id: Option<u16>,

    /// Size of the device-to-host payload, once known.
    pub size: Option<u32>,

    /// Logical result code of the completed request.
    pub result: Option<i32>,
}

impl ServiceReply {
    /// Parse a reply from the head of an IN transfer buffer.
    pub fn parse(buf: &[u8]) -> Result<ServiceReply> {
        let mut r = Reader::new(buf);
        let flags = r.u32()?;
        if flags & FLAG_STATUS == 0 {
            return Err(Error::new(
                ErrorKind::Protocol,
                "service reply is missing the status field",
            ));
        }
        let raw_status = r.u16()?;
        let status = Status::from_u16(raw_status).ok_or_else(|| {
            Error::new(
                ErrorKind::Protocol,
                format!("unknown service reply status: {raw_status}"),
            )
        })?;
        let id = if flags & FLAG_ID != 0 {
            Some(r.u16()?)
        } else {
            None
        };
        let size = if flags & FLAG_SIZE != 0 {
            Some(r.u32()?)
        } else {
            None
        };
        let result = if flags & FLAG_RESULT != 0 {
            Some(r.u32()? as i32)
        } else {
            None
        };
        Ok(ServiceReply {
            status,
            id,
            size,
            result,
        })
    }

    /// Serialize the declared fields (no padding).
    pub fn encode(&self) -> Vec<u8> {
        let mut flags = FLAG_STATUS;
        if self.id.is_some() {
            flags |= FLAG_ID;
        }
        if self.size.is_some() {
            flags |= FLAG_SIZE;
        }
        if self.result.is_some() {
            flags |= FLAG_RESULT;
        }
        let mut buf = Vec::with_capacity(16);
        buf.extend_from_slice(&flags.to_le_bytes());
        buf.extend_from_slice(&(self.status as u16).to_le_bytes());
        if let Some(id) = self.id {
            buf.extend_from_slice(&id.to_le_bytes());
        }
        if let Some(size) = self.size {
            buf.extend_from_slice(&size.to_le_bytes());
        }
        if let Some(result) = self.result {
            buf.extend_from_slice(&result.to_le_bytes());
        }
        buf
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let buf: &'a [u8] = self.buf;
        let end = self.pos + n;
        if end > buf.len() {
            return Err(Error::new(
                ErrorKind::Protocol,
                "service reply is shorter than its declared fields",
            ));
        }
        let s = &buf[self.pos..end];
        self.pos = end;
        Ok(s)
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}
