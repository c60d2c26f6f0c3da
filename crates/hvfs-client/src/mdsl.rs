//! Column reads and writes against the storage layer
//!
//! Values are placed by the shard they were written under: the column
//! pointer records that shard, and reads route by it rather than by the
//! current bitmap.

use crate::context::{ClientContext, corrupt_reply};
use crate::rpc::RetryPolicy;
use bytes::Bytes;
use hvfs_common::{Error, Result, ShardId};
use hvfs_placement::DirEntry;
use hvfs_proto::storage::decode_location;
use hvfs_proto::{Column, OpCode, Request, StorageIndex};
use tracing::debug;

impl ClientContext {
    /// Append `data` to a column file; returns the pointer to store
    pub async fn write_column(
        &self,
        dir: &DirEntry,
        shard: ShardId,
        column: u32,
        data: Bytes,
    ) -> Result<Column> {
        let len = data.len() as u64;
        let payload = StorageIndex {
            table: dir.uuid(),
            shard,
            column,
            stored_shard: shard,
            file_offset: 0,
            req_offset: 0,
            req_len: len,
        }
        .with_data(&data);
        let reply = self
            .rpc
            .call_with_retry(RetryPolicy::standard(), || {
                let (site, vid) = self.mdsl_point(shard, dir.salt())?;
                Ok(Request::new(OpCode::MdslWrite, self.site, site)
                    .with_args(dir.uuid(), shard)
                    .with_reserved(vid)
                    .with_payload(payload.clone()))
            })
            .await?;
        let offset = decode_location(reply.data())
            .map_err(|e| corrupt_reply(reply.source, "column write", e))?;
        debug!(
            "column {} of {:#x}: {} bytes at shard {} offset {}",
            column,
            dir.uuid(),
            len,
            shard,
            offset
        );
        Ok(Column { shard, offset, len })
    }

    /// Read the value a column pointer refers to
    pub async fn read_column(&self, dir: &DirEntry, column: u32, pointer: Column) -> Result<Bytes> {
        let payload = StorageIndex {
            table: dir.uuid(),
            shard: pointer.shard,
            column,
            stored_shard: pointer.shard,
            file_offset: pointer.offset,
            req_offset: 0,
            req_len: pointer.len,
        }
        .with_data(&[]);
        let reply = self
            .rpc
            .call_with_retry(RetryPolicy::standard(), || {
                let (site, vid) = self.mdsl_point(pointer.shard, dir.salt())?;
                Ok(Request::new(OpCode::MdslRead, self.site, site)
                    .with_args(dir.uuid(), pointer.shard)
                    .with_reserved(vid)
                    .with_payload(payload.clone()))
            })
            .await?;
        let source = reply.source;
        let data = reply.payload.unwrap_or_default();
        if data.len() as u64 != pointer.len {
            return Err(corrupt_reply(
                source,
                "column read",
                Error::corrupt(format!(
                    "expected {} bytes, got {}",
                    pointer.len,
                    data.len()
                )),
            ));
        }
        Ok(data)
    }
}
