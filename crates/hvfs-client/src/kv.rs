//! KV operations on tables
//!
//! A row is addressed by a numeric key or a string key hashed to one. Its
//! columns are stored three ways:
//!
//! | column                        | where the value lives                      |
//! |-------------------------------|--------------------------------------------|
//! | `0`                           | inline in the row                          |
//! | `1..=indirect_threshold`      | storage layer, pointer in the row          |
//! | above the threshold           | storage layer, pointer in the indirect table |
//!
//! The indirect table is itself a value in the storage layer (column file
//! `0`), referenced from the row's indirect slot. A put to an indirect
//! column replaces any earlier entry; an update needs one to exist.
//!
//! Out-of-line values may not be empty: a zero-length pointer marks an
//! unset column.

use crate::context::{ClientContext, corrupt_reply, missing_field};
use crate::rpc::RetryPolicy;
use bytes::Bytes;
use hvfs_common::hash::{key_hash, string_key};
use hvfs_common::{Error, Result, SiteId};
use hvfs_placement::DirEntry;
use hvfs_proto::{
    Column, ColumnSel, IndirectTable, KvOp, KvRecord, KvReply, KvRequest, OpCode, Request,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Column file holding indirect tables
pub const INDIRECT_TABLE_FILE: u32 = 0;

/// Row key as given by the caller
#[derive(Debug, Clone, Copy)]
enum Key<'a> {
    Numeric(u64),
    Named(&'a str),
}

impl Key<'_> {
    fn value(self) -> u64 {
        match self {
            Self::Numeric(key) => key,
            Self::Named(key) => string_key(key),
        }
    }

    fn bytes(self) -> Bytes {
        match self {
            Self::Numeric(_) => Bytes::new(),
            Self::Named(key) => Bytes::copy_from_slice(key.as_bytes()),
        }
    }

    const fn op(self, op: KvOp) -> KvOp {
        match self {
            Self::Numeric(_) => op,
            Self::Named(_) => op.stringly(),
        }
    }

    /// String-keyed rows must carry the key they were stored with
    fn verify(self, record: Option<&KvRecord>) -> Result<()> {
        let Self::Named(key) = self else {
            return Ok(());
        };
        match record {
            Some(record) if record.key == key.as_bytes() => Ok(()),
            Some(_) => {
                debug!("key {:?} collides with another stored key", key);
                Err(Error::not_found(format!("key {key}")))
            }
            None => Err(Error::not_found(format!("key {key}"))),
        }
    }
}

impl std::fmt::Display for Key<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Numeric(key) => write!(f, "{key}"),
            Self::Named(key) => f.write_str(key),
        }
    }
}

/// Resolved target of one KV operation
struct Row<'a> {
    dir: Arc<DirEntry>,
    key: Key<'a>,
    hash: u64,
}

/// Where a column's value is kept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Inline,
    Direct(u32),
    Indirect(u32),
}

/// KV client over a registered [`ClientContext`]
#[derive(Clone)]
pub struct KvClient {
    ctx: Arc<ClientContext>,
}

impl KvClient {
    #[must_use]
    pub const fn new(ctx: Arc<ClientContext>) -> Self {
        Self { ctx }
    }

    #[must_use]
    pub fn context(&self) -> &Arc<ClientContext> {
        &self.ctx
    }

    /// Store a new value; fails if the column is already set
    pub async fn put(
        &self,
        table: &str,
        key: u64,
        column: u32,
        value: impl Into<Bytes>,
    ) -> Result<()> {
        self.write(table, Key::Numeric(key), column, KvOp::Put, value.into())
            .await
    }

    pub async fn get(&self, table: &str, key: u64, column: u32) -> Result<Bytes> {
        self.read(table, Key::Numeric(key), column).await
    }

    pub async fn del(&self, table: &str, key: u64, column: u32) -> Result<()> {
        self.delete(table, Key::Numeric(key), column).await
    }

    /// Replace the value of an existing row
    pub async fn update(
        &self,
        table: &str,
        key: u64,
        column: u32,
        value: impl Into<Bytes>,
    ) -> Result<()> {
        self.write(table, Key::Numeric(key), column, KvOp::Update, value.into())
            .await
    }

    pub async fn sput(
        &self,
        table: &str,
        key: &str,
        column: u32,
        value: impl Into<Bytes>,
    ) -> Result<()> {
        self.write(table, Key::Named(key), column, KvOp::Put, value.into())
            .await
    }

    pub async fn sget(&self, table: &str, key: &str, column: u32) -> Result<Bytes> {
        self.read(table, Key::Named(key), column).await
    }

    pub async fn sdel(&self, table: &str, key: &str, column: u32) -> Result<()> {
        self.delete(table, Key::Named(key), column).await
    }

    pub async fn supdate(
        &self,
        table: &str,
        key: &str,
        column: u32,
        value: impl Into<Bytes>,
    ) -> Result<()> {
        self.write(table, Key::Named(key), column, KvOp::Update, value.into())
            .await
    }

    /// Check everything that needs no network round trip
    fn validate(&self, key: Key<'_>, column: u32) -> Result<Placement> {
        let limits = &self.ctx.config.kv;
        if column > limits.max_column {
            return Err(Error::InvalidColumn {
                column,
                max: limits.max_column,
            });
        }
        if matches!(key, Key::Named(k) if k.is_empty()) {
            return Err(Error::EmptyKey);
        }
        Ok(match column {
            0 => Placement::Inline,
            c if c <= limits.indirect_threshold => Placement::Direct(c),
            c => Placement::Indirect(c),
        })
    }

    async fn row<'a>(&self, table: &str, key: Key<'a>) -> Result<Row<'a>> {
        let info = self.ctx.find_table(table).await?;
        let dir = self.ctx.dir_cache.search(info.uuid)?;
        let hash = key_hash(key.value(), dir.salt());
        Ok(Row { dir, key, hash })
    }

    /// Send one KV request to the MDS owning the row
    async fn send(
        &self,
        row: &Row<'_>,
        op: KvOp,
        column: ColumnSel,
        data: Bytes,
    ) -> Result<(SiteId, KvReply)> {
        let ctx = &self.ctx;
        let op = row.key.op(op);
        let mut request = KvRequest {
            op,
            column,
            table: row.dir.uuid(),
            salt: row.dir.salt(),
            shard: 0,
            key: row.key.value(),
            key_bytes: row.key.bytes(),
            data,
        };
        let reply = ctx
            .rpc
            .call_with_retry(RetryPolicy::standard(), || {
                request.shard = row.dir.resolve_shard(row.hash);
                let site = ctx.mds_site(request.shard, row.dir.salt())?;
                Ok(Request::new(OpCode::KvRequest, ctx.site, site)
                    .with_args(row.dir.uuid(), request.shard)
                    .with_payload(request.encode()?))
            })
            .await?;
        let source = reply.source;
        let decoded = KvReply::decode(reply.payload.unwrap_or_default())
            .map_err(|e| corrupt_reply(source, op.name(), e))?;
        row.dir.mark(decoded.shard);
        Ok((source, decoded))
    }

    /// Pointer stored in a non-inline slot; an empty pointer is a miss
    fn pointer(row: &Row<'_>, site: SiteId, reply: &KvReply) -> Result<Option<Column>> {
        row.key.verify(reply.record.as_ref())?;
        let pointer = reply
            .column
            .ok_or_else(|| missing_field(site, "get", "column pointer"))?;
        Ok((!pointer.is_empty()).then_some(pointer))
    }

    /// Indirect table of a row; a missing row or slot reads as `None`
    async fn indirect_table(&self, row: &Row<'_>) -> Result<Option<IndirectTable>> {
        let answer = self
            .send(row, KvOp::Get, ColumnSel::Indirect, Bytes::new())
            .await;
        let (site, reply) = match answer {
            Ok(answer) => answer,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        let Some(pointer) = Self::pointer(row, site, &reply)? else {
            return Ok(None);
        };
        let raw = self
            .ctx
            .read_column(&row.dir, INDIRECT_TABLE_FILE, pointer)
            .await?;
        IndirectTable::decode(&raw).map(Some)
    }

    /// Store an indirect table and point the row's indirect slot at it
    async fn store_indirect(
        &self,
        row: &Row<'_>,
        table: &IndirectTable,
        existed: bool,
    ) -> Result<()> {
        let shard = row.dir.resolve_shard(row.hash);
        let pointer = self
            .ctx
            .write_column(&row.dir, shard, INDIRECT_TABLE_FILE, table.encode())
            .await?;
        let op = if existed { KvOp::Update } else { KvOp::Put };
        self.send(row, op, ColumnSel::Indirect, pointer.to_bytes())
            .await?;
        Ok(())
    }

    async fn write(
        &self,
        table: &str,
        key: Key<'_>,
        column: u32,
        op: KvOp,
        value: Bytes,
    ) -> Result<()> {
        let placement = self.validate(key, column)?;
        let max = self.ctx.config.kv.max_inline_value;
        if placement == Placement::Inline && value.len() > max {
            return Err(Error::ValueTooLarge {
                len: value.len(),
                max,
            });
        }
        // A zero-length pointer reads back as an unset column
        if placement != Placement::Inline && value.is_empty() {
            return Err(Error::invalid_argument(format!(
                "empty value for out-of-line column {column}"
            )));
        }
        let row = self.row(table, key).await?;
        match placement {
            Placement::Inline => {
                self.send(&row, op, ColumnSel::Inline, value).await?;
            }
            Placement::Direct(c) => {
                let shard = row.dir.resolve_shard(row.hash);
                let pointer = self.ctx.write_column(&row.dir, shard, c, value).await?;
                self.send(&row, op, ColumnSel::Direct(c), pointer.to_bytes())
                    .await?;
            }
            Placement::Indirect(c) => {
                let existing = self.indirect_table(&row).await?;
                if op == KvOp::Update && existing.as_ref().and_then(|t| t.get(c)).is_none() {
                    return Err(Error::not_found(format!("key {key} column {c}")));
                }
                let existed = existing.is_some();
                let mut indirect = existing.unwrap_or_default();
                let shard = row.dir.resolve_shard(row.hash);
                let pointer = self.ctx.write_column(&row.dir, shard, c, value).await?;
                if indirect.upsert(c, pointer) {
                    debug!("key {} column {}: replaced indirect entry", key, c);
                }
                self.store_indirect(&row, &indirect, existed).await?;
            }
        }
        Ok(())
    }

    async fn read(&self, table: &str, key: Key<'_>, column: u32) -> Result<Bytes> {
        let placement = self.validate(key, column)?;
        let row = self.row(table, key).await?;
        let missing = || Error::not_found(format!("key {key} column {column}"));
        match placement {
            Placement::Inline => {
                let (site, reply) = self
                    .send(&row, KvOp::Get, ColumnSel::Inline, Bytes::new())
                    .await?;
                key.verify(reply.record.as_ref())?;
                let record = reply
                    .record
                    .ok_or_else(|| missing_field(site, "get", "record"))?;
                Ok(record.value)
            }
            Placement::Direct(c) => {
                let (site, reply) = self
                    .send(&row, KvOp::Get, ColumnSel::Direct(c), Bytes::new())
                    .await?;
                let pointer = Self::pointer(&row, site, &reply)?.ok_or_else(missing)?;
                self.ctx.read_column(&row.dir, c, pointer).await
            }
            Placement::Indirect(c) => {
                let indirect = self.indirect_table(&row).await?.ok_or_else(missing)?;
                let pointer = indirect.get(c).ok_or_else(missing)?;
                self.ctx.read_column(&row.dir, c, pointer).await
            }
        }
    }

    async fn delete(&self, table: &str, key: Key<'_>, column: u32) -> Result<()> {
        let placement = self.validate(key, column)?;
        let row = self.row(table, key).await?;
        match placement {
            Placement::Inline => {
                self.send(&row, KvOp::Del, ColumnSel::Inline, Bytes::new())
                    .await?;
            }
            Placement::Direct(c) => {
                self.send(&row, KvOp::Del, ColumnSel::Direct(c), Bytes::new())
                    .await?;
            }
            Placement::Indirect(c) => {
                let missing = || Error::not_found(format!("key {key} column {c}"));
                let mut indirect = self.indirect_table(&row).await?.ok_or_else(missing)?;
                if indirect.remove(c).is_none() {
                    warn!("key {} has no indirect column {}", key, c);
                    return Err(missing());
                }
                self.store_indirect(&row, &indirect, true).await?;
            }
        }
        Ok(())
    }
}
