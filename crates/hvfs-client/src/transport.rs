//! Transport seam and reply routing
//!
//! A [`Transport`] only moves frames. Replies travel back through the
//! [`ReplyRouter`], which pairs each one with the caller waiting on its
//! handle. The receive side of a transport calls [`ReplyRouter::complete`]
//! for replies and hands unsolicited requests to whoever owns the inbound
//! channel.

use async_trait::async_trait;
use dashmap::DashMap;
use hvfs_common::{Error, Result, SiteId};
use hvfs_proto::{Reply, Request};
use std::net::SocketAddr;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Moves requests and replies between sites
#[async_trait]
pub trait Transport: Send + Sync {
    /// Put a request on the wire; the reply arrives through the router
    async fn send(&self, request: Request) -> Result<()>;

    /// Answer an inbound request
    async fn reply(&self, dest: SiteId, reply: Reply) -> Result<()>;

    /// Record where a site can be reached
    fn learn_address(&self, _site: SiteId, _addr: SocketAddr) {}
}

type Waiter = oneshot::Sender<Result<Reply>>;

/// Table of in-flight requests keyed by handle
#[derive(Debug, Default)]
pub struct ReplyRouter {
    inflight: DashMap<u64, (SiteId, Waiter)>,
}

impl ReplyRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `handle`, sent to `dest`
    pub fn register(&self, handle: u64, dest: SiteId) -> oneshot::Receiver<Result<Reply>> {
        let (tx, rx) = oneshot::channel();
        self.inflight.insert(handle, (dest, tx));
        rx
    }

    /// Deliver a reply to its waiter
    pub fn complete(&self, reply: Reply) {
        match self.inflight.remove(&reply.handle) {
            Some((_, (_, waiter))) => {
                // The caller may have given up; nothing to do then.
                let _ = waiter.send(Ok(reply));
            }
            None => warn!(
                "dropping reply from {} for unknown handle {}",
                reply.source, reply.handle
            ),
        }
    }

    /// Deliver a local failure to the waiter of `handle`
    pub fn fail(&self, handle: u64, error: Error) {
        if let Some((_, (_, waiter))) = self.inflight.remove(&handle) {
            let _ = waiter.send(Err(error));
        }
    }

    /// Fail every request still waiting on `site`
    pub fn fail_site(&self, site: SiteId, reason: &str) {
        let handles: Vec<u64> = self
            .inflight
            .iter()
            .filter(|entry| entry.value().0 == site)
            .map(|entry| *entry.key())
            .collect();
        if !handles.is_empty() {
            debug!("failing {} requests to {}: {}", handles.len(), site, reason);
        }
        for handle in handles {
            self.fail(
                handle,
                Error::ConnectionFailed(format!("{site}: {reason}")),
            );
        }
    }

    /// Forget a waiter without notifying it
    pub fn cancel(&self, handle: u64) {
        self.inflight.remove(&handle);
    }

    /// Number of requests awaiting a reply
    #[must_use]
    pub fn len(&self) -> usize {
        self.inflight.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }
}
