//! Membership calls against the root service

use crate::context::{ClientContext, corrupt_reply};
use crate::rpc::RetryPolicy;
use bytes::BytesMut;
use hvfs_common::{Result, SiteId};
use hvfs_proto::root::encode_fs_info;
use hvfs_proto::{OpCode, RegisterReply, Request};
use std::net::Ipv4Addr;
use tracing::info;

impl ClientContext {
    /// Register this site and install the returned rings and fs identity
    ///
    /// Busy replies back off and retry; a recovering root is accepted.
    pub async fn register(&self) -> Result<RegisterReply> {
        let policy = RetryPolicy::registration(self.config.rpc.busy_backoff());
        let (fsid, group) = (self.config.client.fsid, self.config.client.group);
        let reply = self
            .rpc
            .call_with_retry(policy, || {
                Ok(Request::new(OpCode::Register, self.site, self.root_site)
                    .with_args(self.site.raw(), fsid)
                    .with_reserved(group))
            })
            .await?;
        let source = reply.source;
        let registered = RegisterReply::decode(reply.payload.unwrap_or_default())
            .map_err(|e| corrupt_reply(source, "register", e))?;
        self.apply_registration(&registered)?;
        Ok(registered)
    }

    /// Tell the root service this site is leaving
    pub async fn unregister(&self) -> Result<()> {
        let mut payload = BytesMut::new();
        encode_fs_info(&self.fs_info(), &mut payload);
        let payload = payload.freeze();
        self.rpc
            .call_with_retry(RetryPolicy::no_payload(), || {
                Ok(Request::new(OpCode::Unregister, self.site, self.root_site)
                    .with_args(self.site.raw(), self.config.client.fsid)
                    .with_payload(payload.clone()))
            })
            .await?;
        info!("{} unregistered", self.site);
        Ok(())
    }

    /// Announce that `site` is reachable at `addr`
    pub async fn online(&self, site: SiteId, addr: Ipv4Addr) -> Result<()> {
        self.rpc
            .call_with_retry(RetryPolicy::no_payload(), || {
                Ok(Request::new(OpCode::Online, self.site, self.root_site)
                    .with_args(site.raw(), u64::from(u32::from(addr))))
            })
            .await?;
        info!("{} online at {}", site, addr);
        Ok(())
    }

    /// Mark `site` as gone
    pub async fn offline(&self, site: SiteId) -> Result<()> {
        self.rpc
            .call_with_retry(RetryPolicy::no_payload(), || {
                Ok(Request::new(OpCode::Offline, self.site, self.root_site)
                    .with_args(site.raw(), 0))
            })
            .await?;
        info!("{} offline", site);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::mock::MockCluster;
    use hvfs_common::{Error, SiteId, Status};
    use hvfs_proto::OpCode;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn test_register_backs_off_when_busy() {
        let (cluster, ctx) = MockCluster::unregistered();
        cluster.inject(OpCode::Register, &[Status::ServerBusy, Status::ServerBusy]);
        let reply = ctx.register().await.unwrap();
        assert_eq!(reply.info.fsid, ctx.fs_info().fsid);
        assert_eq!(cluster.count(OpCode::Register), 3);
    }

    #[tokio::test]
    async fn test_register_accepts_recover() {
        let (cluster, ctx) = MockCluster::unregistered();
        cluster.set_recovering(true);
        ctx.register().await.unwrap();
        assert!(!ctx.active_sites(hvfs_common::RingKind::Mds).is_empty());
    }

    #[tokio::test]
    async fn test_register_hard_failure() {
        let (cluster, ctx) = MockCluster::unregistered();
        cluster.inject(OpCode::Register, &[Status::NotExist]);
        let err = ctx.register().await.unwrap_err();
        assert!(matches!(err, Error::Remote { status: Status::NotExist, .. }));
    }

    #[tokio::test]
    async fn test_membership_calls() {
        let (cluster, ctx) = MockCluster::connected().await;
        ctx.online(ctx.site(), Ipv4Addr::new(10, 0, 0, 7)).await.unwrap();
        ctx.offline(SiteId::mds(1)).await.unwrap();
        ctx.unregister().await.unwrap();
        assert_eq!(cluster.count(OpCode::Online), 1);
        assert_eq!(cluster.count(OpCode::Offline), 1);
        assert_eq!(cluster.count(OpCode::Unregister), 1);
        assert_eq!(cluster.last_online(), Some((ctx.site(), Ipv4Addr::new(10, 0, 0, 7))));
    }
}
