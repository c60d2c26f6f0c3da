//! Request and reply envelopes
//!
//! Every message on a connection is a length-prefixed [`Frame`]: either a
//! request (which may ask for a reply) or the reply to an earlier request,
//! paired by `handle`.

use crate::wire::{ensure, len_u32};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use hvfs_common::{Error, Result, SiteId, Status};
use std::fmt;
use std::ops::BitOr;

/// Length prefix in front of every frame
pub const FRAME_HEADER_LEN: usize = 4;

/// Largest frame body accepted from the wire
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

const FRAME_REQUEST: u8 = 1;
const FRAME_REPLY: u8 = 2;

const REQUEST_HEADER_LEN: usize = 8 + 2 + 8 + 8 + 4 + 8 + 8 + 4 + 4;
const REPLY_HEADER_LEN: usize = 8 + 8 + 4 + 1 + 4;

/// Request operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum OpCode {
    MdsCreate = 1,
    MdsLookup = 2,
    MdsUnlink = 3,
    MdsList = 4,
    /// KV put/get/del/update against an MDS
    KvRequest = 5,
    MdslWrite = 6,
    MdslRead = 7,
    Register = 8,
    Unregister = 9,
    Online = 10,
    Offline = 11,
    /// Unsolicited push of both rings
    RingUpdate = 12,
    Commit = 13,
}

impl OpCode {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::MdsCreate => "create",
            Self::MdsLookup => "lookup",
            Self::MdsUnlink => "unlink",
            Self::MdsList => "list",
            Self::KvRequest => "kv",
            Self::MdslWrite => "column write",
            Self::MdslRead => "column read",
            Self::Register => "register",
            Self::Unregister => "unregister",
            Self::Online => "online",
            Self::Offline => "offline",
            Self::RingUpdate => "ring update",
            Self::Commit => "commit",
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<u16> for OpCode {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self> {
        Ok(match value {
            1 => Self::MdsCreate,
            2 => Self::MdsLookup,
            3 => Self::MdsUnlink,
            4 => Self::MdsList,
            5 => Self::KvRequest,
            6 => Self::MdslWrite,
            7 => Self::MdslRead,
            8 => Self::Register,
            9 => Self::Unregister,
            10 => Self::Online,
            11 => Self::Offline,
            12 => Self::RingUpdate,
            13 => Self::Commit,
            other => return Err(Error::corrupt(format!("unknown op code {other}"))),
        })
    }
}

/// Transmission flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxFlags(u32);

impl TxFlags {
    /// The sender waits for a paired reply
    pub const NEED_REPLY: Self = Self(0x01);
    /// The payload buffer belongs to the transport once sent
    pub const NEED_DATA_FREE: Self = Self(0x02);

    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for TxFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Outbound request envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Pairs the reply with this request; assigned by the RPC client
    pub handle: u64,
    pub op: OpCode,
    pub source: SiteId,
    pub dest: SiteId,
    pub flags: TxFlags,
    pub arg0: u64,
    pub arg1: u64,
    pub reserved: u32,
    pub payload: Bytes,
}

impl Request {
    /// New request expecting a reply
    #[must_use]
    pub fn new(op: OpCode, source: SiteId, dest: SiteId) -> Self {
        Self {
            handle: 0,
            op,
            source,
            dest,
            flags: TxFlags::NEED_REPLY,
            arg0: 0,
            arg1: 0,
            reserved: 0,
            payload: Bytes::new(),
        }
    }

    #[must_use]
    pub const fn with_args(mut self, arg0: u64, arg1: u64) -> Self {
        self.arg0 = arg0;
        self.arg1 = arg1;
        self
    }

    #[must_use]
    pub const fn with_reserved(mut self, reserved: u32) -> Self {
        self.reserved = reserved;
        self
    }

    /// Attach a payload; ownership moves to the transport on send
    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self.flags = self.flags | TxFlags::NEED_DATA_FREE;
        self
    }

    /// Fire-and-forget: the receiver sends nothing back
    #[must_use]
    pub fn one_way(mut self) -> Self {
        self.flags = TxFlags::from_bits(self.flags.bits() & !TxFlags::NEED_REPLY.bits());
        self
    }

    #[must_use]
    pub const fn needs_reply(&self) -> bool {
        self.flags.contains(TxFlags::NEED_REPLY)
    }
}

/// Inbound reply envelope
///
/// `payload` is `Some` exactly when the sender attached data, which is what
/// callers check before trusting a successful status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub handle: u64,
    pub source: SiteId,
    pub status: Status,
    pub payload: Option<Bytes>,
}

impl Reply {
    #[must_use]
    pub fn ok(handle: u64, source: SiteId, payload: impl Into<Bytes>) -> Self {
        Self {
            handle,
            source,
            status: Status::Ok,
            payload: Some(payload.into()),
        }
    }

    /// Successful reply without data
    #[must_use]
    pub const fn ack(handle: u64, source: SiteId) -> Self {
        Self {
            handle,
            source,
            status: Status::Ok,
            payload: None,
        }
    }

    #[must_use]
    pub const fn error(handle: u64, source: SiteId, status: Status) -> Self {
        Self {
            handle,
            source,
            status,
            payload: None,
        }
    }

    /// Payload bytes, or an empty slice when none was attached
    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.payload.as_deref().unwrap_or_default()
    }
}

/// One message on a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Request(Request),
    Reply(Reply),
}

impl Frame {
    /// Encode with the length prefix
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        buf.put_u32_le(0);
        match self {
            Self::Request(req) => {
                buf.put_u8(FRAME_REQUEST);
                buf.put_u64_le(req.handle);
                buf.put_u16_le(req.op as u16);
                buf.put_u64_le(req.source.raw());
                buf.put_u64_le(req.dest.raw());
                buf.put_u32_le(req.flags.bits());
                buf.put_u64_le(req.arg0);
                buf.put_u64_le(req.arg1);
                buf.put_u32_le(req.reserved);
                buf.put_u32_le(len_u32(req.payload.len(), "request payload")?);
                buf.put_slice(&req.payload);
            }
            Self::Reply(rep) => {
                buf.put_u8(FRAME_REPLY);
                buf.put_u64_le(rep.handle);
                buf.put_u64_le(rep.source.raw());
                buf.put_i32_le(rep.status.code());
                match &rep.payload {
                    Some(payload) => {
                        buf.put_u8(1);
                        buf.put_u32_le(len_u32(payload.len(), "reply payload")?);
                        buf.put_slice(payload);
                    }
                    None => {
                        buf.put_u8(0);
                        buf.put_u32_le(0);
                    }
                }
            }
        }
        let body_len = len_u32(buf.len() - FRAME_HEADER_LEN, "frame")?;
        buf[..FRAME_HEADER_LEN].copy_from_slice(&body_len.to_le_bytes());
        Ok(buf.freeze())
    }

    /// Decode a frame body (the bytes after the length prefix)
    pub fn decode(mut body: Bytes) -> Result<Self> {
        ensure(&body, 1, "frame kind")?;
        match body.get_u8() {
            FRAME_REQUEST => {
                ensure(&body, REQUEST_HEADER_LEN, "request header")?;
                let handle = body.get_u64_le();
                let op = OpCode::try_from(body.get_u16_le())?;
                let source = SiteId::from(body.get_u64_le());
                let dest = SiteId::from(body.get_u64_le());
                let flags = TxFlags::from_bits(body.get_u32_le());
                let arg0 = body.get_u64_le();
                let arg1 = body.get_u64_le();
                let reserved = body.get_u32_le();
                let len = body.get_u32_le() as usize;
                ensure(&body, len, "request payload")?;
                Ok(Self::Request(Request {
                    handle,
                    op,
                    source,
                    dest,
                    flags,
                    arg0,
                    arg1,
                    reserved,
                    payload: body.split_to(len),
                }))
            }
            FRAME_REPLY => {
                ensure(&body, REPLY_HEADER_LEN, "reply header")?;
                let handle = body.get_u64_le();
                let source = SiteId::from(body.get_u64_le());
                let status = Status::from_code(body.get_i32_le());
                let has_payload = body.get_u8() != 0;
                let len = body.get_u32_le() as usize;
                ensure(&body, len, "reply payload")?;
                let data = body.split_to(len);
                Ok(Self::Reply(Reply {
                    handle,
                    source,
                    status,
                    payload: has_payload.then_some(data),
                }))
            }
            other => Err(Error::corrupt(format!("unknown frame kind {other}"))),
        }
    }
}
