//! KV records, column pointers and the indirect column table
//!
//! A KV row keeps its inline value in column 0. Columns up to the indirect
//! threshold are stored out of line and referenced by a [`Column`] pointer
//! kept in the row; higher columns are referenced from an [`IndirectTable`]
//! that is itself stored out of line, with its pointer in the row's
//! indirect slot.

use crate::wire::{ensure, len_u32};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use hvfs_common::{ContainerId, Error, Result, Salt, ShardId};

/// Encoded size of a [`Column`]
pub const COLUMN_LEN: usize = 24;

/// Encoded size of one indirect table entry
pub const INDIRECT_ENTRY_LEN: usize = 4 + COLUMN_LEN;

/// `{key_len:u32}{value_len:u32}` in front of a record
pub const KV_HEADER_LEN: usize = 8;

const KV_REQUEST_HEADER_LEN: usize = 2 + 2 + 4 + 8 * 4 + 4 + 4;

const REPLY_HAS_RECORD: u8 = 0x01;
const REPLY_HAS_COLUMN: u8 = 0x02;

/// Pointer to a value stored on a storage site
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Column {
    /// Shard the value was written under (selects the storage site)
    pub shard: ShardId,
    pub offset: u64,
    pub len: u64,
}

impl Column {
    /// A zero-length pointer marks an unset column
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.shard);
        buf.put_u64_le(self.offset);
        buf.put_u64_le(self.len);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        ensure(&*buf, COLUMN_LEN, "column pointer")?;
        Ok(Self {
            shard: buf.get_u64_le(),
            offset: buf.get_u64_le(),
            len: buf.get_u64_le(),
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(COLUMN_LEN);
        self.encode(&mut buf);
        buf.freeze()
    }
}

/// One entry of an indirect table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndirectEntry {
    pub column: u32,
    pub pointer: Column,
}

/// Column number -> pointer map for columns above the indirect threshold
///
/// Column numbers are unique; lookup is a linear scan, tables are small.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndirectTable {
    entries: Vec<IndirectEntry>,
}

impl IndirectTable {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Parse a stored table; any length that is not a whole number of
    /// entries is corrupt
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() % INDIRECT_ENTRY_LEN != 0 {
            return Err(Error::corrupt(format!(
                "indirect table of {} bytes is not a multiple of {INDIRECT_ENTRY_LEN}",
                data.len()
            )));
        }
        let mut buf = data;
        let mut entries = Vec::with_capacity(data.len() / INDIRECT_ENTRY_LEN);
        while buf.has_remaining() {
            let column = buf.get_u32_le();
            let pointer = Column::decode(&mut buf)?;
            entries.push(IndirectEntry { column, pointer });
        }
        Ok(Self { entries })
    }

    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.entries.len() * INDIRECT_ENTRY_LEN);
        for entry in &self.entries {
            buf.put_u32_le(entry.column);
            entry.pointer.encode(&mut buf);
        }
        buf.freeze()
    }

    #[must_use]
    pub fn get(&self, column: u32) -> Option<Column> {
        self.entries
            .iter()
            .find(|e| e.column == column)
            .map(|e| e.pointer)
    }

    /// Insert or replace; returns `true` when an entry was replaced
    pub fn upsert(&mut self, column: u32, pointer: Column) -> bool {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.column == column) {
            entry.pointer = pointer;
            return true;
        }
        self.entries.push(IndirectEntry { column, pointer });
        false
    }

    /// Drop the entry for `column`, returning its pointer
    pub fn remove(&mut self, column: u32) -> Option<Column> {
        let pos = self.entries.iter().position(|e| e.column == column)?;
        Some(self.entries.swap_remove(pos).pointer)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IndirectEntry> {
        self.entries.iter()
    }
}

/// Stored KV record: `{key_len}{value_len}{key}{value}`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvRecord {
    pub key: Bytes,
    pub value: Bytes,
}

impl KvRecord {
    pub fn encode(&self, buf: &mut impl BufMut) -> Result<()> {
        buf.put_u32_le(len_u32(self.key.len(), "key")?);
        buf.put_u32_le(len_u32(self.value.len(), "value")?);
        buf.put_slice(&self.key);
        buf.put_slice(&self.value);
        Ok(())
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        ensure(&*buf, KV_HEADER_LEN, "kv record header")?;
        let key_len = buf.get_u32_le() as usize;
        let value_len = buf.get_u32_le() as usize;
        ensure(&*buf, key_len + value_len, "kv record")?;
        let key = buf.split_to(key_len);
        let value = buf.split_to(value_len);
        Ok(Self { key, value })
    }
}

/// KV operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum KvOp {
    Put = 1,
    Get = 2,
    Del = 3,
    Update = 4,
    /// String-keyed variants carry the key bytes for verification
    SPut = 5,
    SGet = 6,
    SDel = 7,
    SUpdate = 8,
}

impl KvOp {
    #[must_use]
    pub const fn is_string(self) -> bool {
        matches!(self, Self::SPut | Self::SGet | Self::SDel | Self::SUpdate)
    }

    /// String-keyed counterpart
    #[must_use]
    pub const fn stringly(self) -> Self {
        match self {
            Self::Put | Self::SPut => Self::SPut,
            Self::Get | Self::SGet => Self::SGet,
            Self::Del | Self::SDel => Self::SDel,
            Self::Update | Self::SUpdate => Self::SUpdate,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Put => "put",
            Self::Get => "get",
            Self::Del => "del",
            Self::Update => "update",
            Self::SPut => "sput",
            Self::SGet => "sget",
            Self::SDel => "sdel",
            Self::SUpdate => "supdate",
        }
    }
}

impl TryFrom<u16> for KvOp {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self> {
        Ok(match value {
            1 => Self::Put,
            2 => Self::Get,
            3 => Self::Del,
            4 => Self::Update,
            5 => Self::SPut,
            6 => Self::SGet,
            7 => Self::SDel,
            8 => Self::SUpdate,
            other => return Err(Error::corrupt(format!("unknown kv op {other}"))),
        })
    }
}

/// Column addressed by a KV request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnSel {
    /// Column 0, value stored in the record
    Inline,
    /// Out-of-line column with its pointer in the record
    Direct(u32),
    /// The slot holding the indirect table pointer
    Indirect,
}

impl ColumnSel {
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn to_wire(self) -> i32 {
        match self {
            Self::Inline => 0,
            Self::Direct(n) => n as i32,
            Self::Indirect => -1,
        }
    }

    #[allow(clippy::cast_sign_loss)]
    pub fn from_wire(value: i32) -> Result<Self> {
        match value {
            0 => Ok(Self::Inline),
            -1 => Ok(Self::Indirect),
            n if n > 0 => Ok(Self::Direct(n as u32)),
            other => Err(Error::corrupt(format!("invalid column selector {other}"))),
        }
    }
}

/// KV request payload sent to an MDS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvRequest {
    pub op: KvOp,
    pub column: ColumnSel,
    pub table: ContainerId,
    pub salt: Salt,
    pub shard: ShardId,
    /// Numeric key, or the hash of the string key
    pub key: u64,
    /// String key bytes (empty for numeric keys)
    pub key_bytes: Bytes,
    /// Inline value or encoded [`Column`] pointer
    pub data: Bytes,
}

impl KvRequest {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf =
            BytesMut::with_capacity(KV_REQUEST_HEADER_LEN + self.key_bytes.len() + self.data.len());
        buf.put_u16_le(self.op as u16);
        buf.put_u16_le(0);
        buf.put_i32_le(self.column.to_wire());
        buf.put_u64_le(self.table);
        buf.put_u64_le(self.salt);
        buf.put_u64_le(self.shard);
        buf.put_u64_le(self.key);
        buf.put_u32_le(len_u32(self.key_bytes.len(), "key")?);
        buf.put_u32_le(len_u32(self.data.len(), "value")?);
        buf.put_slice(&self.key_bytes);
        buf.put_slice(&self.data);
        Ok(buf.freeze())
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        ensure(&buf, KV_REQUEST_HEADER_LEN, "kv request header")?;
        let op = KvOp::try_from(buf.get_u16_le())?;
        buf.advance(2);
        let column = ColumnSel::from_wire(buf.get_i32_le())?;
        let table = buf.get_u64_le();
        let salt = buf.get_u64_le();
        let shard = buf.get_u64_le();
        let key = buf.get_u64_le();
        let klen = buf.get_u32_le() as usize;
        let dlen = buf.get_u32_le() as usize;
        ensure(&buf, klen + dlen, "kv request body")?;
        let key_bytes = buf.split_to(klen);
        let data = buf.split_to(dlen);
        Ok(Self {
            op,
            column,
            table,
            salt,
            shard,
            key,
            key_bytes,
            data,
        })
    }
}

/// KV reply payload: `{shard:u64}{flags:u8}[record][column]`
///
/// The shard is echoed so the client can mark it allocated in its bitmap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvReply {
    pub shard: ShardId,
    pub record: Option<KvRecord>,
    pub column: Option<Column>,
}

impl KvReply {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        buf.put_u64_le(self.shard);
        let mut flags = 0;
        if self.record.is_some() {
            flags |= REPLY_HAS_RECORD;
        }
        if self.column.is_some() {
            flags |= REPLY_HAS_COLUMN;
        }
        buf.put_u8(flags);
        if let Some(record) = &self.record {
            record.encode(&mut buf)?;
        }
        if let Some(column) = &self.column {
            column.encode(&mut buf);
        }
        Ok(buf.freeze())
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        ensure(&buf, 9, "kv reply header")?;
        let shard = buf.get_u64_le();
        let flags = buf.get_u8();
        let record = if flags & REPLY_HAS_RECORD != 0 {
            Some(KvRecord::decode(&mut buf)?)
        } else {
            None
        };
        let column = if flags & REPLY_HAS_COLUMN != 0 {
            Some(Column::decode(&mut buf)?)
        } else {
            None
        };
        Ok(Self {
            shard,
            record,
            column,
        })
    }
}
