//! Namespace requests: create, lookup, unlink and list under a container

use crate::reply::{INDEX_DESCRIPTOR_LEN, IndexDescriptor};
use crate::wire::{ensure, len_u32};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use hvfs_common::{ContainerId, Error, Result, Salt, ShardId};
use std::ops::BitOr;

/// How the target entry is addressed and what a create produces
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexFlags(u32);

impl IndexFlags {
    /// Address by name inside the parent
    pub const BY_NAME: Self = Self(0x01);
    /// Address by uuid
    pub const BY_UUID: Self = Self(0x02);
    /// The shard id was computed by the client
    pub const BY_ITBID: Self = Self(0x04);
    /// Create a container
    pub const CREATE_DIR: Self = Self(0x10);
    /// Create a KV table
    pub const CREATE_KV: Self = Self(0x20);
    /// Target is a global directory table slot
    pub const GDT: Self = Self(0x40);

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

impl BitOr for IndexFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Request payload for create/lookup/unlink/list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexRequest {
    pub flags: IndexFlags,
    pub uuid: ContainerId,
    pub hash: u64,
    pub itbid: ShardId,
    pub puuid: ContainerId,
    pub psalt: Salt,
    pub name: String,
    pub data: Bytes,
}

impl IndexRequest {
    pub fn encode(&self) -> Result<Bytes> {
        let desc = IndexDescriptor {
            namelen: len_u32(self.name.len(), "name")?,
            flag: self.flags.bits(),
            uuid: self.uuid,
            hash: self.hash,
            itbid: self.itbid,
            puuid: self.puuid,
            psalt: self.psalt,
            ssalt: 0,
            dlen: len_u32(self.data.len(), "data")?,
            column: 0,
        };
        let mut buf =
            BytesMut::with_capacity(INDEX_DESCRIPTOR_LEN + self.name.len() + self.data.len());
        desc.encode(&mut buf);
        buf.put_slice(self.name.as_bytes());
        buf.put_slice(&self.data);
        Ok(buf.freeze())
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        let desc = IndexDescriptor::decode(&mut buf)?;
        let namelen = desc.namelen as usize;
        let dlen = desc.dlen as usize;
        ensure(&buf, namelen + dlen, "index request body")?;
        let name = String::from_utf8(buf.split_to(namelen).to_vec())
            .map_err(|e| Error::corrupt(format!("name is not UTF-8: {e}")))?;
        Ok(Self {
            flags: IndexFlags::from_bits(desc.flag),
            uuid: desc.uuid,
            hash: desc.hash,
            itbid: desc.itbid,
            puuid: desc.puuid,
            psalt: desc.psalt,
            name,
            data: buf.split_to(dlen),
        })
    }
}

/// Server-side listing operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ListOp {
    /// Every name in the shard
    Scan = 0,
    /// Number of names in the shard
    Count = 1,
    /// Names matching a pattern
    Grep = 2,
    /// Number of names matching a pattern
    GrepCount = 3,
}

impl ListOp {
    #[must_use]
    pub const fn counts(self) -> bool {
        matches!(self, Self::Count | Self::GrepCount)
    }
}

impl TryFrom<u32> for ListOp {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        Ok(match value {
            0 => Self::Scan,
            1 => Self::Count,
            2 => Self::Grep,
            3 => Self::GrepCount,
            other => return Err(Error::corrupt(format!("unknown list op {other}"))),
        })
    }
}

/// Data of a list request: `{op:u32}{pattern}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    pub op: ListOp,
    pub pattern: String,
}

impl ListQuery {
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.pattern.len());
        buf.put_u32_le(self.op as u32);
        buf.put_slice(self.pattern.as_bytes());
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        ensure(&buf, 4, "list query")?;
        let op = ListOp::try_from(buf.get_u32_le())?;
        let pattern = String::from_utf8(buf.to_vec())
            .map_err(|e| Error::corrupt(format!("list pattern is not UTF-8: {e}")))?;
        Ok(Self { op, pattern })
    }
}
