//! Request/reply client with the reconfiguration retry loop
//!
//! Servers answer with three transient statuses that the client resolves by
//! resending a freshly built request:
//!
//! - shard splitting: resend once per logical call; a second split fails
//! - restart required: resend, without limit
//! - server busy: sleep and resend, only where the call opts in
//!
//! Any other non-zero status is returned to the caller unchanged.

use crate::transport::{ReplyRouter, Transport};
use hvfs_common::{Error, Result, SiteId, Status};
use hvfs_proto::{Reply, Request};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};

/// How a call reacts to transient statuses and empty replies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Sleep and resend on server-busy
    pub busy_backoff: Option<Duration>,
    /// A successful reply must carry a payload
    pub expect_payload: bool,
    /// Treat a recovering root as success
    pub accept_recover: bool,
}

impl RetryPolicy {
    /// Metadata and storage calls: payload required, busy is fatal
    #[must_use]
    pub const fn standard() -> Self {
        Self {
            busy_backoff: None,
            expect_payload: true,
            accept_recover: false,
        }
    }

    /// Calls answered with a bare status
    #[must_use]
    pub const fn no_payload() -> Self {
        Self {
            busy_backoff: None,
            expect_payload: false,
            accept_recover: false,
        }
    }

    /// Registration with the root service
    #[must_use]
    pub const fn registration(backoff: Duration) -> Self {
        Self {
            busy_backoff: Some(backoff),
            expect_payload: true,
            accept_recover: true,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    First,
    RetriedAfterSplit,
}

/// RPC client bound to one local site
pub struct RpcClient {
    site: SiteId,
    transport: Arc<dyn Transport>,
    router: Arc<ReplyRouter>,
    next_handle: AtomicU64,
}

impl RpcClient {
    #[must_use]
    pub fn new(site: SiteId, transport: Arc<dyn Transport>, router: Arc<ReplyRouter>) -> Self {
        Self {
            site,
            transport,
            router,
            next_handle: AtomicU64::new(1),
        }
    }

    /// Local site id
    #[must_use]
    pub const fn site(&self) -> SiteId {
        self.site
    }

    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    #[must_use]
    pub fn router(&self) -> &Arc<ReplyRouter> {
        &self.router
    }

    /// Send one request and wait for its reply, whatever the status
    pub async fn call(&self, mut request: Request) -> Result<Reply> {
        request.handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let (handle, op, dest) = (request.handle, request.op, request.dest);
        let waiter = self.router.register(handle, dest);
        debug!("{} -> {}: {} (handle {})", self.site, dest, op, handle);

        if let Err(e) = self.transport.send(request).await {
            self.router.cancel(handle);
            warn!("{} to {} not sent: {}", op, dest, e);
            return Err(match e {
                Error::ConnectionFailed(_) | Error::UnknownSite(_) => e,
                other => Error::ConnectionFailed(other.to_string()),
            });
        }

        waiter.await.unwrap_or_else(|_| {
            Err(Error::ConnectionFailed(format!(
                "{op} to {dest}: reply channel closed"
            )))
        })
    }

    /// Send a request that expects no reply
    pub async fn send_one_way(&self, request: Request) -> Result<()> {
        let request = request.one_way();
        self.transport.send(request).await
    }

    /// Run one logical call, rebuilding and resending on transient statuses
    ///
    /// `build` runs before every send so routing decisions (shard, site)
    /// are taken again after a split or restart.
    pub async fn call_with_retry<F>(&self, policy: RetryPolicy, mut build: F) -> Result<Reply>
    where
        F: FnMut() -> Result<Request> + Send,
    {
        let mut attempt = Attempt::First;
        loop {
            let request = build()?;
            let op = request.op;
            let reply = self.call(request).await?;
            match reply.status {
                Status::Ok => return Self::check_payload(op.name(), policy, reply),
                Status::Recover if policy.accept_recover => {
                    warn!("{} is recovering a previous instance of {}", reply.source, self.site);
                    return Self::check_payload(op.name(), policy, reply);
                }
                Status::ShardSplitting if attempt == Attempt::First => {
                    debug!("{} to {}: shard splitting, resending", op, reply.source);
                    attempt = Attempt::RetriedAfterSplit;
                }
                Status::RestartRequired => {
                    warn!("{} to {}: restart required, resending", op, reply.source);
                }
                Status::ServerBusy if policy.busy_backoff.is_some() => {
                    let backoff = policy.busy_backoff.unwrap_or_default();
                    debug!("{} busy, retrying {} in {:?}", reply.source, op, backoff);
                    tokio::time::sleep(backoff).await;
                }
                status => {
                    if status.is_transient() {
                        warn!("{} to {}: {} persists, giving up", op, reply.source, status);
                    } else {
                        debug!("{} to {} failed: {}", op, reply.source, status);
                    }
                    return Err(Error::Remote {
                        site: reply.source,
                        status,
                    });
                }
            }
        }
    }

    fn check_payload(op: &'static str, policy: RetryPolicy, reply: Reply) -> Result<Reply> {
        if policy.expect_payload && reply.payload.is_none() {
            error!("{} reply from {} carries no payload", op, reply.source);
            return Err(Error::CorruptReply {
                site: reply.source,
                op,
                reason: "successful reply without payload".into(),
            });
        }
        Ok(reply)
    }
}
