//! In-memory cluster for tests
//!
//! One [`MockCluster`] answers for the root service, every MDS and every
//! MDSL. Shards only matter for listing and for the echo in KV replies; rows
//! are kept per `(table, key)`. Statuses queued with [`MockCluster::inject`]
//! are returned, in order, before an op is served normally; an injected
//! [`Status::Ok`] produces a successful reply without payload.

use crate::context::ClientContext;
use crate::transport::{ReplyRouter, Transport};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use hvfs_common::hash::string_key;
use hvfs_common::{
    Config, ContainerId, FsInfo, Result, RingKind, ShardId, SiteId, SiteKind, Status,
};
use hvfs_placement::{HashRing, RingTx};
use hvfs_proto::reply::encode_list_entries;
use hvfs_proto::{
    Column, ColumnSel, IndexDescriptor, IndexFlags, IndexRequest, KvOp, KvRecord, KvReply,
    KvRequest, ListQuery, MdReply, MetadataUnit, OpCode, RegisterReply, Reply, Request, RootTx,
    SiteAddr, StorageIndex,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

pub const FSID: u64 = 1;
pub const GDT_UUID: ContainerId = 0;
pub const GDT_SALT: u64 = 0x6764_7400_0000_0001;
pub const ROOT_UUID: ContainerId = 1;
pub const ROOT_SALT: u64 = 0x0123_4567_89ab_cdef;

type Answer = std::result::Result<Option<Bytes>, Status>;

struct Row {
    key: Bytes,
    shard: ShardId,
    inline: Option<Bytes>,
    /// Non-inline slots by wire column selector
    columns: HashMap<i32, Column>,
}

struct State {
    info: FsInfo,
    mds_ring: RingTx,
    mdsl_ring: RingTx,
    gdt: HashMap<ContainerId, MetadataUnit>,
    names: HashMap<(ContainerId, String), (ContainerId, MetadataUnit)>,
    rows: HashMap<(ContainerId, u64), Row>,
    files: HashMap<(ContainerId, u32, ShardId), Vec<u8>>,
    next_uuid: ContainerId,
    injected: HashMap<OpCode, VecDeque<Status>>,
    counts: HashMap<OpCode, usize>,
    recovering: bool,
    flip_next_create: Option<ShardId>,
    echo_shard: Option<ShardId>,
    last_online: Option<(SiteId, Ipv4Addr)>,
}

pub struct MockCluster {
    router: Arc<ReplyRouter>,
    state: Mutex<State>,
}

fn ring(kind: RingKind, sites: &[SiteId]) -> RingTx {
    let mut ring = HashRing::new(kind, 0);
    for site in sites {
        ring.add_site(*site, 16).expect("distinct mock ring points");
    }
    ring.to_wire()
}

fn root_mdu(salt: u64) -> MetadataUnit {
    MetadataUnit {
        mode: MetadataUnit::MODE_DIR | 0o755,
        nlink: 2,
        flags: MetadataUnit::FLAG_GDT,
        salt,
        ..MetadataUnit::default()
    }
}

fn descriptor(req: &IndexRequest, uuid: ContainerId, itbid: ShardId) -> IndexDescriptor {
    IndexDescriptor {
        namelen: 0,
        flag: req.flags.bits(),
        uuid,
        hash: req.hash,
        itbid,
        puuid: req.puuid,
        psalt: req.psalt,
        ssalt: 0,
        dlen: 0,
        column: 0,
    }
}

fn md_reply(builder: hvfs_proto::MdReplyBuilder) -> Answer {
    builder.build().map(Some).map_err(|_| Status::Fault)
}

impl MockCluster {
    pub fn new(router: Arc<ReplyRouter>) -> Arc<Self> {
        let mut gdt = HashMap::new();
        gdt.insert(ROOT_UUID, root_mdu(ROOT_SALT));
        Arc::new(Self {
            router,
            state: Mutex::new(State {
                info: FsInfo {
                    fsid: FSID,
                    group: 0,
                    gdt_uuid: GDT_UUID,
                    gdt_salt: GDT_SALT,
                    root_uuid: ROOT_UUID,
                    root_salt: ROOT_SALT,
                },
                mds_ring: ring(RingKind::Mds, &[SiteId::mds(0), SiteId::mds(1)]),
                mdsl_ring: ring(RingKind::Mdsl, &[SiteId::mdsl(0)]),
                gdt,
                names: HashMap::new(),
                rows: HashMap::new(),
                files: HashMap::new(),
                next_uuid: 100,
                injected: HashMap::new(),
                counts: HashMap::new(),
                recovering: false,
                flip_next_create: None,
                echo_shard: None,
                last_online: None,
            }),
        })
    }

    /// Cluster plus a context that has not registered yet
    pub fn unregistered() -> (Arc<Self>, Arc<ClientContext>) {
        let mut config = Config::default();
        config.client.fsid = FSID;
        config.rpc.busy_backoff_ms = 1;
        let router = Arc::new(ReplyRouter::new());
        let cluster = Self::new(Arc::clone(&router));
        let ctx = ClientContext::new(config, cluster.clone(), router);
        (cluster, Arc::new(ctx))
    }

    /// Cluster plus a registered context
    pub async fn connected() -> (Arc<Self>, Arc<ClientContext>) {
        let (cluster, ctx) = Self::unregistered();
        ctx.register().await.expect("mock registration");
        (cluster, ctx)
    }

    pub fn inject(&self, op: OpCode, statuses: &[Status]) {
        self.state
            .lock()
            .injected
            .entry(op)
            .or_default()
            .extend(statuses.iter().copied());
    }

    /// Requests seen for `op`, injected failures included
    pub fn count(&self, op: OpCode) -> usize {
        self.state.lock().counts.get(&op).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.state.lock().counts.values().sum()
    }

    pub fn set_recovering(&self, recovering: bool) {
        self.state.lock().recovering = recovering;
    }

    /// Drop the root's GDT entry
    pub fn forget_root(&self) {
        self.state.lock().gdt.remove(&ROOT_UUID);
    }

    /// Make the next name create report a new shard
    pub fn flip_next_create(&self, shard: ShardId) {
        self.state.lock().flip_next_create = Some(shard);
    }

    /// Answer KV requests as if served by `shard`
    pub fn echo_shard(&self, shard: ShardId) {
        self.state.lock().echo_shard = Some(shard);
    }

    pub fn last_online(&self) -> Option<(SiteId, Ipv4Addr)> {
        self.state.lock().last_online
    }

    /// Store a row under the string key `key` in `shard`
    pub fn plant_row(&self, table: ContainerId, shard: ShardId, key: &[u8], value: &[u8]) {
        let hashed = string_key(&String::from_utf8_lossy(key));
        self.state.lock().rows.insert(
            (table, hashed),
            Row {
                key: Bytes::copy_from_slice(key),
                shard,
                inline: Some(Bytes::copy_from_slice(value)),
                columns: HashMap::new(),
            },
        );
    }

    /// Store a row under numeric key `key` carrying arbitrary key bytes
    pub fn plant_row_keyed(&self, table: ContainerId, key: u64, stored: &[u8], value: &[u8]) {
        self.state.lock().rows.insert(
            (table, key),
            Row {
                key: Bytes::copy_from_slice(stored),
                shard: 0,
                inline: Some(Bytes::copy_from_slice(value)),
                columns: HashMap::new(),
            },
        );
    }

    fn serve(&self, request: Request) -> Reply {
        let (handle, op, dest) = (request.handle, request.op, request.dest);
        let mut state = self.state.lock();
        *state.counts.entry(op).or_default() += 1;
        if let Some(status) = state.injected.get_mut(&op).and_then(VecDeque::pop_front) {
            return if status.is_ok() {
                Reply::ack(handle, dest)
            } else {
                Reply::error(handle, dest, status)
            };
        }

        let expected = match op {
            OpCode::Register
            | OpCode::Unregister
            | OpCode::Online
            | OpCode::Offline
            | OpCode::RingUpdate => SiteKind::Root,
            OpCode::MdslWrite | OpCode::MdslRead => SiteKind::Mdsl,
            _ => SiteKind::Mds,
        };
        if dest.kind() != Some(expected) {
            return Reply::error(handle, dest, Status::InvalidArgument);
        }

        let answer = match op {
            OpCode::Register => state.register(),
            OpCode::Unregister | OpCode::Offline | OpCode::Commit => Ok(None),
            OpCode::Online => {
                #[allow(clippy::cast_possible_truncation)]
                let ip = Ipv4Addr::from(request.arg1 as u32);
                state.last_online = Some((SiteId::from(request.arg0), ip));
                Ok(None)
            }
            OpCode::MdsCreate => state.create(&request.payload),
            OpCode::MdsLookup => state.lookup(&request.payload),
            OpCode::MdsUnlink => state.unlink(&request.payload),
            OpCode::MdsList => state.list(&request.payload),
            OpCode::KvRequest => state.kv(&request.payload),
            OpCode::MdslWrite => state.write(&request.payload),
            OpCode::MdslRead => state.read(&request.payload),
            OpCode::RingUpdate => Err(Status::InvalidArgument),
        };
        match answer {
            Ok(Some(payload)) => {
                let mut reply = Reply::ok(handle, dest, payload);
                if op == OpCode::Register && state.recovering {
                    reply.status = Status::Recover;
                }
                reply
            }
            Ok(None) => Reply::ack(handle, dest),
            Err(status) => Reply::error(handle, dest, status),
        }
    }
}

impl State {
    fn register(&self) -> Answer {
        let info = self.info;
        RegisterReply {
            info,
            mds_ring: self.mds_ring.clone(),
            mdsl_ring: self.mdsl_ring.clone(),
            root: RootTx {
                fsid: info.fsid,
                gdt_uuid: info.gdt_uuid,
                gdt_salt: info.gdt_salt,
                root_uuid: info.root_uuid,
                root_salt: info.root_salt,
            },
            gdt_bitmap: Bytes::from_static(&[0xff]),
            sites: vec![
                SiteAddr {
                    site: SiteId::mds(0),
                    addr: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 8720),
                },
                SiteAddr {
                    site: SiteId::mdsl(0),
                    addr: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 8730),
                },
            ],
        }
        .encode()
        .map(Some)
        .map_err(|_| Status::Fault)
    }

    fn create(&mut self, payload: &Bytes) -> Answer {
        let req = IndexRequest::decode(payload.clone()).map_err(|_| Status::InvalidArgument)?;
        let mut mdu = if req.data.is_empty() {
            MetadataUnit::default()
        } else {
            MetadataUnit::decode(&mut req.data.clone()).map_err(|_| Status::InvalidArgument)?
        };
        if req.flags.contains(IndexFlags::GDT) {
            if self.gdt.contains_key(&req.uuid) {
                return Err(Status::AlreadyExists);
            }
            self.gdt.insert(req.uuid, mdu);
            return md_reply(
                MdReply::builder()
                    .index(descriptor(&req, req.uuid, req.itbid))
                    .mdu(mdu),
            );
        }

        let key = (req.puuid, req.name.clone());
        if self.names.contains_key(&key) {
            return Err(Status::AlreadyExists);
        }
        let uuid = self.next_uuid;
        self.next_uuid += 1;
        mdu.salt = uuid.wrapping_mul(0x9e37_79b9_7f4a_7c15);
        self.names.insert(key, (uuid, mdu));

        let mut builder = MdReply::builder();
        if let Some(shard) = self.flip_next_create.take() {
            builder = builder
                .index(descriptor(&req, uuid, shard))
                .bitmap_flip();
        } else {
            builder = builder.index(descriptor(&req, uuid, req.itbid));
        }
        md_reply(builder.mdu(mdu))
    }

    fn lookup(&self, payload: &Bytes) -> Answer {
        let req = IndexRequest::decode(payload.clone()).map_err(|_| Status::InvalidArgument)?;
        let (uuid, mdu) = if req.flags.contains(IndexFlags::GDT) {
            (req.uuid, *self.gdt.get(&req.uuid).ok_or(Status::NotFound)?)
        } else {
            *self
                .names
                .get(&(req.puuid, req.name.clone()))
                .ok_or(Status::NotFound)?
        };
        md_reply(
            MdReply::builder()
                .index(descriptor(&req, uuid, req.itbid))
                .mdu(mdu),
        )
    }

    fn unlink(&mut self, payload: &Bytes) -> Answer {
        let req = IndexRequest::decode(payload.clone()).map_err(|_| Status::InvalidArgument)?;
        let uuid = if req.flags.contains(IndexFlags::GDT) {
            self.gdt.remove(&req.uuid).ok_or(Status::NotFound)?;
            req.uuid
        } else {
            self.names
                .remove(&(req.puuid, req.name.clone()))
                .ok_or(Status::NotFound)?
                .0
        };
        md_reply(MdReply::builder().index(descriptor(&req, uuid, req.itbid)))
    }

    fn list(&self, payload: &Bytes) -> Answer {
        let req = IndexRequest::decode(payload.clone()).map_err(|_| Status::InvalidArgument)?;
        let query = ListQuery::decode(req.data.clone()).map_err(|_| Status::InvalidArgument)?;
        let in_shard: Vec<String> = self
            .rows
            .iter()
            .filter(|((table, _), row)| *table == req.uuid && row.shard == req.itbid)
            .map(|(_, row)| String::from_utf8_lossy(&row.key).into_owned())
            .collect();
        if in_shard.is_empty() {
            return Err(Status::NotFound);
        }
        let matched: Vec<&str> = in_shard
            .iter()
            .map(String::as_str)
            .filter(|name| query.pattern.is_empty() || name.contains(query.pattern.as_str()))
            .collect();
        let builder = MdReply::builder();
        if query.op.counts() {
            return md_reply(builder.trailing(&(matched.len() as u64).to_le_bytes()));
        }
        let mut entries = BytesMut::new();
        encode_list_entries(matched, &mut entries).map_err(|_| Status::Fault)?;
        md_reply(builder.trailing(&entries))
    }

    fn kv(&mut self, payload: &Bytes) -> Answer {
        let req = KvRequest::decode(payload.clone()).map_err(|_| Status::InvalidArgument)?;
        let shard = self.echo_shard.unwrap_or(req.shard);
        let id = (req.table, req.key);
        let slot = req.column.to_wire();
        let stored_key = if req.key_bytes.is_empty() {
            Bytes::copy_from_slice(&req.key.to_le_bytes())
        } else {
            req.key_bytes.clone()
        };
        let pointer = || Column::decode(&mut req.data.clone()).map_err(|_| Status::InvalidArgument);

        let mut reply = KvReply {
            shard,
            ..KvReply::default()
        };
        match req.op {
            KvOp::Put | KvOp::SPut => {
                let pointer = match req.column {
                    ColumnSel::Inline => None,
                    _ => Some(pointer()?),
                };
                let row = self.rows.entry(id).or_insert_with(|| Row {
                    key: stored_key,
                    shard,
                    inline: None,
                    columns: HashMap::new(),
                });
                match pointer {
                    None if row.inline.is_some() => return Err(Status::AlreadyExists),
                    None => row.inline = Some(req.data.clone()),
                    Some(_) if row.columns.get(&slot).is_some_and(|c| !c.is_empty()) => {
                        return Err(Status::AlreadyExists);
                    }
                    Some(column) => {
                        row.columns.insert(slot, column);
                    }
                }
            }
            KvOp::Update | KvOp::SUpdate => {
                let pointer = match req.column {
                    ColumnSel::Inline => None,
                    _ => Some(pointer()?),
                };
                let row = self.rows.get_mut(&id).ok_or(Status::NotFound)?;
                match pointer {
                    None => row.inline = Some(req.data.clone()),
                    Some(column) => {
                        row.columns.insert(slot, column);
                    }
                }
            }
            KvOp::Get | KvOp::SGet => {
                let row = self.rows.get(&id).ok_or(Status::NotFound)?;
                if req.column == ColumnSel::Inline && row.inline.is_none() {
                    return Err(Status::NotFound);
                }
                reply.record = Some(KvRecord {
                    key: row.key.clone(),
                    value: row.inline.clone().unwrap_or_default(),
                });
                if req.column != ColumnSel::Inline {
                    reply.column = Some(row.columns.get(&slot).copied().unwrap_or_default());
                }
            }
            KvOp::Del | KvOp::SDel => {
                if req.column == ColumnSel::Inline {
                    self.rows.remove(&id).ok_or(Status::NotFound)?;
                } else {
                    let row = self.rows.get_mut(&id).ok_or(Status::NotFound)?;
                    row.columns.remove(&slot).ok_or(Status::NotFound)?;
                }
            }
        }
        reply.encode().map(Some).map_err(|_| Status::Fault)
    }

    fn write(&mut self, payload: &Bytes) -> Answer {
        let mut body = payload.clone();
        let index = StorageIndex::decode(&mut body).map_err(|_| Status::InvalidArgument)?;
        let file = self
            .files
            .entry((index.table, index.column, index.shard))
            .or_default();
        let offset = file.len() as u64;
        file.extend_from_slice(&body);
        Ok(Some(Bytes::copy_from_slice(&offset.to_le_bytes())))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn read(&self, payload: &Bytes) -> Answer {
        let index =
            StorageIndex::decode(&mut payload.clone()).map_err(|_| Status::InvalidArgument)?;
        let file = self
            .files
            .get(&(index.table, index.column, index.stored_shard))
            .ok_or(Status::NotFound)?;
        let start = index.file_offset as usize;
        if start > file.len() {
            return Err(Status::InvalidArgument);
        }
        let end = (start + index.req_len as usize).min(file.len());
        Ok(Some(Bytes::copy_from_slice(&file[start..end])))
    }
}

#[async_trait]
impl Transport for MockCluster {
    async fn send(&self, request: Request) -> Result<()> {
        let needs_reply = request.needs_reply();
        let reply = self.serve(request);
        if needs_reply {
            self.router.complete(reply);
        }
        Ok(())
    }

    async fn reply(&self, _dest: SiteId, _reply: Reply) -> Result<()> {
        Ok(())
    }
}
