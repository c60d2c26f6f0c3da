//! Client context: everything a site needs to route a request
//!
//! One [`ClientContext`] owns the published rings, the directory cache, the
//! file-system identity learned at registration and the RPC client. Ring
//! updates pushed by the root service land here and are applied as a whole.

use crate::rpc::RpcClient;
use crate::transport::{ReplyRouter, Transport};
use hvfs_common::{Config, Error, FsInfo, Result, RingKind, Salt, ShardId, SiteId, Status};
use hvfs_placement::{DirectoryCache, HashRing, SharedRing};
use hvfs_proto::{OpCode, RegisterReply, Reply, Request, RingUpdate};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Shared client state
pub struct ClientContext {
    pub(crate) site: SiteId,
    pub(crate) root_site: SiteId,
    pub(crate) config: Config,
    pub(crate) rpc: RpcClient,
    mds_ring: SharedRing,
    mdsl_ring: SharedRing,
    pub(crate) dir_cache: DirectoryCache,
    fs: RwLock<FsInfo>,
}

impl ClientContext {
    /// Create an unregistered context; rings stay empty until registration
    #[must_use]
    pub fn new(config: Config, transport: Arc<dyn Transport>, router: Arc<ReplyRouter>) -> Self {
        let site = SiteId::client(config.client.site_index);
        let group = config.client.group;
        Self {
            site,
            root_site: SiteId::root(0),
            rpc: RpcClient::new(site, transport, router),
            mds_ring: SharedRing::new(HashRing::new(RingKind::Mds, group)),
            mdsl_ring: SharedRing::new(HashRing::new(RingKind::Mdsl, group)),
            dir_cache: DirectoryCache::new(config.dir_cache.initial_depth),
            fs: RwLock::new(FsInfo {
                fsid: config.client.fsid,
                group,
                ..FsInfo::default()
            }),
            config,
        }
    }

    #[must_use]
    pub const fn site(&self) -> SiteId {
        self.site
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub const fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    #[must_use]
    pub const fn dir_cache(&self) -> &DirectoryCache {
        &self.dir_cache
    }

    /// File-system identity as last learned from the root service
    #[must_use]
    pub fn fs_info(&self) -> FsInfo {
        *self.fs.read()
    }

    pub(crate) fn set_root_salt(&self, salt: Salt) {
        self.fs.write().root_salt = salt;
    }

    /// Current snapshot of a ring
    #[must_use]
    pub fn ring(&self, kind: RingKind) -> Arc<HashRing> {
        match kind {
            RingKind::Mds => self.mds_ring.load(),
            RingKind::Mdsl => self.mdsl_ring.load(),
        }
    }

    /// MDS site owning `shard` of a container salted with `salt`
    pub fn mds_site(&self, shard: ShardId, salt: Salt) -> Result<SiteId> {
        self.mds_ring.load().resolve(shard, salt)
    }

    /// MDSL site and virtual id owning `shard`
    pub fn mdsl_point(&self, shard: ShardId, salt: Salt) -> Result<(SiteId, u32)> {
        let ring = self.mdsl_ring.load();
        let point = ring.resolve_point(shard, salt)?;
        Ok((point.site, point.vid))
    }

    /// Distinct sites currently present on a ring
    #[must_use]
    pub fn active_sites(&self, kind: RingKind) -> Vec<SiteId> {
        self.ring(kind).sites()
    }

    /// Install everything learned from a registration reply
    pub fn apply_registration(&self, reply: &RegisterReply) -> Result<()> {
        let mds = HashRing::rebuild_from_wire(RingKind::Mds, reply.mds_ring.clone())?;
        let mdsl = HashRing::rebuild_from_wire(RingKind::Mdsl, reply.mdsl_ring.clone())?;
        self.mds_ring.store(mds);
        self.mdsl_ring.store(mdsl);

        let info = reply.info;
        *self.fs.write() = info;

        for entry in &reply.sites {
            self.rpc
                .transport()
                .learn_address(entry.site, SocketAddr::V4(entry.addr));
        }

        self.dir_cache.insert(info.gdt_uuid, 0, info.gdt_salt);
        if !reply.gdt_bitmap.is_empty() {
            self.dir_cache
                .bitmap_load(info.gdt_uuid, 0, &reply.gdt_bitmap)?;
        }
        info!(
            "{} attached to fs {} (group {}, {} known sites)",
            self.site,
            info.fsid,
            info.group,
            reply.sites.len()
        );
        Ok(())
    }

    /// Replace both rings; neither is touched unless both are valid
    pub fn apply_ring_update(&self, update: RingUpdate) -> Result<()> {
        let mds = HashRing::rebuild_from_wire(RingKind::Mds, update.mds)?;
        let mdsl = HashRing::rebuild_from_wire(RingKind::Mdsl, update.mdsl)?;
        self.mds_ring.store(mds);
        self.mdsl_ring.store(mdsl);
        Ok(())
    }

    /// Handle an unsolicited request; returns the reply to send, if any
    pub fn dispatch(&self, request: Request) -> Option<Reply> {
        let needs_reply = request.needs_reply();
        let (handle, source, op) = (request.handle, request.source, request.op);
        let status = match op {
            OpCode::RingUpdate => match RingUpdate::decode(request.payload)
                .and_then(|update| self.apply_ring_update(update))
            {
                Ok(()) => Status::Ok,
                Err(e) => {
                    error!("bad ring update from {}: {}", source, e);
                    Status::InvalidArgument
                }
            },
            other => {
                warn!("{} sent unsupported request {}", source, other);
                Status::InvalidArgument
            }
        };
        needs_reply.then(|| {
            if status.is_ok() {
                Reply::ack(handle, self.site)
            } else {
                Reply::error(handle, self.site, status)
            }
        })
    }

    /// Serve inbound requests until the channel closes
    pub async fn serve_inbound(self: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<Request>) {
        while let Some(request) = inbound.recv().await {
            let source = request.source;
            if let Some(reply) = self.dispatch(request) {
                if let Err(e) = self.rpc.transport().reply(source, reply).await {
                    warn!("reply to {} failed: {}", source, e);
                }
            }
        }
        debug!("{} inbound channel closed", self.site);
    }
}

/// Map a payload decoding failure to a protocol fault from `site`
pub(crate) fn corrupt_reply(site: SiteId, op: &'static str, err: Error) -> Error {
    error!("corrupt {} reply from {}: {}", op, site, err);
    Error::CorruptReply {
        site,
        op,
        reason: err.to_string(),
    }
}

/// A required sub-record was missing from a reply
pub(crate) fn missing_field(site: SiteId, op: &'static str, field: &'static str) -> Error {
    error!("{} reply from {} has no {}", op, site, field);
    Error::MissingField { site, op, field }
}
