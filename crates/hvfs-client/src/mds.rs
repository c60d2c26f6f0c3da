//! Namespace operations against the metadata service
//!
//! Tables are containers created under the file-system root. Every table also
//! owns a slot in the global directory table (GDT), which is where its salt is
//! looked up by uuid. Requests routed by a hash re-resolve their shard on
//! every attempt so a split seen by the server is followed on resend.

use crate::context::{ClientContext, corrupt_reply, missing_field};
use crate::rpc::RetryPolicy;
use bytes::{Buf, Bytes};
use hvfs_common::hash::{gdt_hash, name_hash};
use hvfs_common::{ContainerId, Error, Result, Salt, ShardId, SiteId};
use hvfs_placement::DirEntry;
use hvfs_proto::reply::decode_list_entries;
use hvfs_proto::{
    IndexFlags, IndexRequest, ListOp, ListQuery, MdReply, MetadataUnit, OpCode, Request,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Identity of a KV table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableInfo {
    pub uuid: ContainerId,
    pub salt: Salt,
    /// Container the table was created in
    pub puuid: ContainerId,
}

/// One shard's worth of a listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    pub shard: ShardId,
    pub names: Vec<String>,
    pub count: u64,
}

/// Aggregated listing of a table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListResult {
    pub names: Vec<String>,
    pub count: u64,
}

/// Restartable walk over the allocated shards of a container
#[derive(Debug)]
pub struct ShardCursor {
    dir: Arc<DirEntry>,
    query: ListQuery,
    next: Option<ShardId>,
}

impl ShardCursor {
    #[must_use]
    pub const fn new(dir: Arc<DirEntry>, query: ListQuery) -> Self {
        Self {
            dir,
            query,
            next: Some(0),
        }
    }

    /// Resume the walk at `shard`
    #[must_use]
    pub const fn starting_at(mut self, shard: ShardId) -> Self {
        self.next = Some(shard);
        self
    }

    /// Shard the next page will come from, if any remain
    #[must_use]
    pub fn position(&self) -> Option<ShardId> {
        self.next.and_then(|from| self.dir.next_allocated(from))
    }

    /// Fetch the next page; `None` once every allocated shard was visited
    pub async fn next_page(&mut self, ctx: &ClientContext) -> Result<Option<ListPage>> {
        let Some(shard) = self.position() else {
            self.next = None;
            return Ok(None);
        };
        self.next = shard.checked_add(1);
        ctx.list_shard(&self.dir, shard, &self.query).await.map(Some)
    }
}

impl TableInfo {
    fn from_reply(site: SiteId, op: &'static str, reply: &MdReply) -> Result<Self> {
        let hi = reply
            .index_descriptor()
            .map_err(|e| corrupt_reply(site, op, e))?
            .ok_or_else(|| missing_field(site, op, "index descriptor"))?;
        let mdu = reply
            .metadata_units()
            .map_err(|e| corrupt_reply(site, op, e))?
            .into_iter()
            .next()
            .ok_or_else(|| missing_field(site, op, "metadata unit"))?;
        if !mdu.is_dir() {
            return Err(Error::invalid_argument(format!(
                "entry {:#x} is not a table",
                hi.uuid
            )));
        }
        Ok(Self {
            uuid: hi.uuid,
            salt: mdu.salt,
            puuid: hi.puuid,
        })
    }
}

impl ClientContext {
    /// Send an index request routed by `hash` inside `dir`
    ///
    /// A reply announcing a new shard marks it in the directory bitmap.
    async fn index_call<F>(
        &self,
        op: OpCode,
        dir: &DirEntry,
        hash: u64,
        build: F,
    ) -> Result<(SiteId, MdReply)>
    where
        F: Fn(ShardId) -> IndexRequest + Send + Sync,
    {
        let mut shard_used = 0;
        let reply = self
            .rpc
            .call_with_retry(RetryPolicy::standard(), || {
                let shard = dir.resolve_shard(hash);
                shard_used = shard;
                let site = self.mds_site(shard, dir.salt())?;
                let payload = build(shard).encode()?;
                Ok(Request::new(op, self.site, site)
                    .with_args(dir.uuid(), shard)
                    .with_payload(payload))
            })
            .await?;
        let source = reply.source;
        let decoded = MdReply::decode(reply.payload.unwrap_or_default())
            .map_err(|e| corrupt_reply(source, op.name(), e))?;
        if decoded.bitmap_flipped() {
            let created = decoded
                .index_descriptor()
                .ok()
                .flatten()
                .map_or(shard_used, |hi| hi.itbid);
            debug!("{} created shard {} of {:#x}", source, created, dir.uuid());
            dir.mark(created);
        }
        Ok((source, decoded))
    }

    fn gdt_dir(&self) -> Result<Arc<DirEntry>> {
        self.dir_cache.search(self.fs_info().gdt_uuid)
    }

    /// Request addressing the GDT slot of `uuid`
    fn gdt_request(&self, gdt: &DirEntry, uuid: ContainerId, shard: ShardId) -> IndexRequest {
        IndexRequest {
            flags: IndexFlags::BY_UUID | IndexFlags::BY_ITBID | IndexFlags::GDT,
            uuid,
            hash: gdt_hash(uuid, gdt.salt()),
            itbid: shard,
            puuid: gdt.uuid(),
            psalt: gdt.salt(),
            ..IndexRequest::default()
        }
    }

    /// Look the root container up in the GDT and cache it
    pub async fn lookup_root(&self) -> Result<Arc<DirEntry>> {
        let gdt = self.gdt_dir()?;
        let root = self.fs_info().root_uuid;
        let (site, reply) = self
            .index_call(OpCode::MdsLookup, &gdt, gdt_hash(root, gdt.salt()), |shard| {
                self.gdt_request(&gdt, root, shard)
            })
            .await?;
        let mdu = reply
            .metadata_units()
            .map_err(|e| corrupt_reply(site, "lookup", e))?
            .into_iter()
            .next()
            .ok_or_else(|| missing_field(site, "lookup", "metadata unit"))?;
        self.set_root_salt(mdu.salt);
        Ok(self.dir_cache.insert(root, gdt.uuid(), mdu.salt))
    }

    /// Create the root container's GDT entry, or look it up if present
    pub async fn create_root(&self) -> Result<Arc<DirEntry>> {
        let gdt = self.gdt_dir()?;
        let info = self.fs_info();
        let mdu = MetadataUnit {
            mode: MetadataUnit::MODE_DIR | 0o755,
            nlink: 2,
            flags: MetadataUnit::FLAG_GDT,
            salt: info.root_salt,
            puuid: gdt.uuid(),
            psalt: gdt.salt(),
            ..MetadataUnit::default()
        }
        .to_bytes();
        let created = self
            .index_call(
                OpCode::MdsCreate,
                &gdt,
                gdt_hash(info.root_uuid, gdt.salt()),
                |shard| {
                    let mut req = self.gdt_request(&gdt, info.root_uuid, shard);
                    req.flags = req.flags | IndexFlags::CREATE_DIR;
                    req.data = mdu.clone();
                    req
                },
            )
            .await;
        match created {
            Ok(_) => {
                info!("created root {:#x} of fs {}", info.root_uuid, info.fsid);
                Ok(self
                    .dir_cache
                    .insert(info.root_uuid, gdt.uuid(), info.root_salt))
            }
            Err(e) if e.is_already_exists() => {
                debug!("root {:#x} already exists", info.root_uuid);
                self.lookup_root().await
            }
            Err(e) => Err(e),
        }
    }

    /// Cached root container, looked up (or created) on first use
    pub async fn bootstrap_root(&self) -> Result<Arc<DirEntry>> {
        let root = self.fs_info().root_uuid;
        if let Ok(dir) = self.dir_cache.search(root) {
            return Ok(dir);
        }
        match self.lookup_root().await {
            Err(e) if e.is_not_found() => {
                warn!("root {:#x} missing, creating it", root);
                self.create_root().await
            }
            other => other,
        }
    }

    /// Look a table up by name and cache its directory handle
    pub async fn find_table(&self, name: &str) -> Result<TableInfo> {
        let root = self.bootstrap_root().await?;
        let hash = name_hash(name, root.salt());
        let (site, reply) = self
            .index_call(OpCode::MdsLookup, &root, hash, |shard| IndexRequest {
                flags: IndexFlags::BY_NAME,
                hash,
                itbid: shard,
                puuid: root.uuid(),
                psalt: root.salt(),
                name: name.to_owned(),
                ..IndexRequest::default()
            })
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    Error::not_found(format!("table {name}"))
                } else {
                    e
                }
            })?;
        let table = TableInfo::from_reply(site, "lookup", &reply)?;
        self.dir_cache.insert(table.uuid, root.uuid(), table.salt);
        Ok(table)
    }

    /// Create a KV table and its GDT entry
    pub async fn create_table(&self, name: &str) -> Result<TableInfo> {
        if name.is_empty() {
            return Err(Error::invalid_argument("empty table name"));
        }
        let root = self.bootstrap_root().await?;
        let hash = name_hash(name, root.salt());
        let mdu = MetadataUnit {
            mode: MetadataUnit::MODE_DIR | 0o755,
            nlink: 2,
            flags: MetadataUnit::FLAG_KV,
            puuid: root.uuid(),
            psalt: root.salt(),
            ..MetadataUnit::default()
        };
        let payload = mdu.to_bytes();
        let (site, reply) = self
            .index_call(OpCode::MdsCreate, &root, hash, |shard| IndexRequest {
                flags: IndexFlags::BY_NAME | IndexFlags::CREATE_DIR | IndexFlags::CREATE_KV,
                hash,
                itbid: shard,
                puuid: root.uuid(),
                psalt: root.salt(),
                name: name.to_owned(),
                data: payload.clone(),
                ..IndexRequest::default()
            })
            .await
            .map_err(|e| {
                if e.is_already_exists() {
                    Error::AlreadyExists(format!("table {name}"))
                } else {
                    e
                }
            })?;
        let table = TableInfo::from_reply(site, "create", &reply)?;

        let gdt = self.gdt_dir()?;
        let gdt_mdu = MetadataUnit {
            salt: table.salt,
            flags: MetadataUnit::FLAG_KV | MetadataUnit::FLAG_GDT,
            ..mdu
        }
        .to_bytes();
        self.index_call(
            OpCode::MdsCreate,
            &gdt,
            gdt_hash(table.uuid, gdt.salt()),
            |shard| {
                let mut req = self.gdt_request(&gdt, table.uuid, shard);
                req.flags = req.flags | IndexFlags::CREATE_DIR;
                req.data = gdt_mdu.clone();
                req
            },
        )
        .await?;

        self.dir_cache.insert(table.uuid, root.uuid(), table.salt);
        info!("created table {} ({:#x})", name, table.uuid);
        Ok(table)
    }

    /// Remove an empty table
    pub async fn drop_table(&self, name: &str) -> Result<()> {
        let table = self.find_table(name).await?;
        let listed = self.list(name, ListOp::Count, "").await?;
        if listed.count > 0 {
            return Err(Error::invalid_argument(format!(
                "table {name} still holds {} entries",
                listed.count
            )));
        }

        let root = self.bootstrap_root().await?;
        let hash = name_hash(name, root.salt());
        self.index_call(OpCode::MdsUnlink, &root, hash, |shard| IndexRequest {
            flags: IndexFlags::BY_NAME,
            hash,
            itbid: shard,
            puuid: root.uuid(),
            psalt: root.salt(),
            name: name.to_owned(),
            ..IndexRequest::default()
        })
        .await?;

        let gdt = self.gdt_dir()?;
        self.index_call(
            OpCode::MdsUnlink,
            &gdt,
            gdt_hash(table.uuid, gdt.salt()),
            |shard| self.gdt_request(&gdt, table.uuid, shard),
        )
        .await?;

        self.dir_cache.remove(table.uuid);
        info!("dropped table {} ({:#x})", name, table.uuid);
        Ok(())
    }

    /// List one shard of a container
    ///
    /// Shards below `2^initial_depth` exist from the start without being
    /// created on the server; a not-found there is an empty page.
    pub async fn list_shard(
        &self,
        dir: &DirEntry,
        shard: ShardId,
        query: &ListQuery,
    ) -> Result<ListPage> {
        let data = query.encode();
        let result = self
            .rpc
            .call_with_retry(RetryPolicy::standard(), || {
                let site = self.mds_site(shard, dir.salt())?;
                let payload = IndexRequest {
                    flags: IndexFlags::BY_ITBID,
                    uuid: dir.uuid(),
                    itbid: shard,
                    puuid: dir.puuid(),
                    data: data.clone(),
                    ..IndexRequest::default()
                }
                .encode()?;
                Ok(Request::new(OpCode::MdsList, self.site, site)
                    .with_args(dir.uuid(), shard)
                    .with_payload(payload))
            })
            .await;

        let reply = match result {
            Ok(reply) => reply,
            Err(e) if e.is_not_found() && shard < (1u64 << self.config.dir_cache.initial_depth) => {
                debug!("shard {} of {:#x} not instantiated yet", shard, dir.uuid());
                return Ok(ListPage {
                    shard,
                    ..ListPage::default()
                });
            }
            Err(e) => return Err(e),
        };

        let source = reply.source;
        let md = MdReply::decode(reply.payload.unwrap_or_default())
            .map_err(|e| corrupt_reply(source, "list", e))?;
        let mut body: Bytes = md.trailing().map_err(|e| corrupt_reply(source, "list", e))?;
        if query.op.counts() {
            if body.remaining() < 8 {
                return Err(corrupt_reply(
                    source,
                    "list",
                    Error::corrupt("count reply shorter than 8 bytes"),
                ));
            }
            return Ok(ListPage {
                shard,
                names: Vec::new(),
                count: body.get_u64_le(),
            });
        }
        let names = decode_list_entries(body).map_err(|e| corrupt_reply(source, "list", e))?;
        Ok(ListPage {
            shard,
            count: names.len() as u64,
            names,
        })
    }

    /// List a table across every allocated shard
    pub async fn list(&self, table: &str, op: ListOp, pattern: &str) -> Result<ListResult> {
        let info = self.find_table(table).await?;
        let dir = self.dir_cache.search(info.uuid)?;
        let mut cursor = ShardCursor::new(
            dir,
            ListQuery {
                op,
                pattern: pattern.to_owned(),
            },
        );
        let mut result = ListResult::default();
        while let Some(page) = cursor.next_page(self).await? {
            result.count += page.count;
            result.names.extend(page.names);
        }
        Ok(result)
    }

    /// Ask MDS `index` to commit its dirty state
    pub async fn commit(&self, index: u64) -> Result<()> {
        let dest = SiteId::mds(index);
        self.rpc
            .call_with_retry(RetryPolicy::no_payload(), || {
                Ok(Request::new(OpCode::Commit, self.site, dest))
            })
            .await?;
        info!("{} committed", dest);
        Ok(())
    }
}
