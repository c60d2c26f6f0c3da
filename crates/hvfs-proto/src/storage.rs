//! Column I/O requests against a storage (MDSL) site

use crate::wire::ensure;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use hvfs_common::{ContainerId, Result, ShardId};

/// Encoded size of a [`StorageIndex`]
pub const STORAGE_INDEX_LEN: usize = 56;

/// Header of every column read or write
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageIndex {
    pub table: ContainerId,
    /// Shard the request is routed by
    pub shard: ShardId,
    pub column: u32,
    /// Shard recorded in the column pointer (reads)
    pub stored_shard: ShardId,
    /// Location of the value in the column file (reads)
    pub file_offset: u64,
    pub req_offset: u64,
    pub req_len: u64,
}

impl StorageIndex {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.table);
        buf.put_u64_le(self.shard);
        buf.put_u32_le(self.column);
        buf.put_u32_le(0);
        buf.put_u64_le(self.stored_shard);
        buf.put_u64_le(self.file_offset);
        buf.put_u64_le(self.req_offset);
        buf.put_u64_le(self.req_len);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        ensure(&*buf, STORAGE_INDEX_LEN, "storage index")?;
        let table = buf.get_u64_le();
        let shard = buf.get_u64_le();
        let column = buf.get_u32_le();
        buf.advance(4);
        Ok(Self {
            table,
            shard,
            column,
            stored_shard: buf.get_u64_le(),
            file_offset: buf.get_u64_le(),
            req_offset: buf.get_u64_le(),
            req_len: buf.get_u64_le(),
        })
    }

    /// Header followed by `data`, as sent for a write
    #[must_use]
    pub fn with_data(&self, data: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(STORAGE_INDEX_LEN + data.len());
        self.encode(&mut buf);
        buf.put_slice(data);
        buf.freeze()
    }
}

/// Location assigned to a written value, from a write reply
pub fn decode_location(mut payload: &[u8]) -> Result<u64> {
    ensure(&payload, 8, "write location")?;
    Ok(payload.get_u64_le())
}
