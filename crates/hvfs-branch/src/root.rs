//! Root operator: ack check at the head of every chain

use crate::ack::{AckCache, AckVerdict};
use crate::error::BranchResult;
use crate::line::BranchLine;
use crate::operator::{Flow, OpContext, Operator, OperatorKind, Signal};

use hvfs_common::SiteId;
use std::sync::Arc;
use tracing::debug;

pub struct RootOperator {
    acks: Arc<AckCache>,
}

impl RootOperator {
    pub const fn new(acks: Arc<AckCache>) -> Self {
        Self { acks }
    }
}

impl Operator for RootOperator {
    fn kind(&self) -> OperatorKind {
        OperatorKind::Root
    }

    fn input(
        &mut self,
        cx: &OpContext<'_>,
        line: &BranchLine,
        site: SiteId,
        ack: u64,
        signal: &mut Signal,
    ) -> BranchResult<Flow> {
        self.enter(cx, signal)?;
        *signal = Signal::Continue;

        match self.acks.lookup_create(site, ack, line.id) {
            AckVerdict::Accept => Ok(Flow::Forward),
            verdict => {
                *signal = Signal::Stop;
                Ok(Flow::Reject(verdict))
            }
        }
    }

    /// Store the ack table through the backend
    fn flush(&mut self, cx: &OpContext<'_>) -> BranchResult<()> {
        let records = self.acks.flush();
        debug!("flushing {} ack entries of {}", records.len(), cx.branch);
        cx.backend
            .store_ack_table(cx.branch, &AckCache::encode(&records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BranchBackend, FsBackend};
    use bytes::Bytes;
    use tempfile::TempDir;

    #[test]
    fn test_duplicate_is_rejected() {
        let dir = TempDir::new().unwrap();
        let backend = FsBackend::new(dir.path());
        let cx = OpContext {
            branch: "b",
            backend: &backend,
        };
        let acks = Arc::new(AckCache::new(4));
        let mut root = RootOperator::new(Arc::clone(&acks));
        let site = SiteId::client(2);
        acks.update(site, 10);

        let mut signal = Signal::Continue;
        let old = BranchLine::primary(8, Bytes::from_static(b"old"));
        let flow = root.input(&cx, &old, site, 10, &mut signal).unwrap();
        assert_eq!(flow, Flow::Reject(AckVerdict::Ignore));
        assert_eq!(signal, Signal::Stop);

        let mut signal = Signal::Continue;
        let new = BranchLine::primary(11, Bytes::from_static(b"new"));
        let flow = root.input(&cx, &new, site, 10, &mut signal).unwrap();
        assert_eq!(flow, Flow::Forward);
        assert_eq!(signal, Signal::Continue);
    }

    #[test]
    fn test_flush_signal_stores_acks() {
        let dir = TempDir::new().unwrap();
        let backend = FsBackend::new(dir.path());
        let cx = OpContext {
            branch: "audit",
            backend: &backend,
        };
        let acks = Arc::new(AckCache::new(4));
        acks.update(SiteId::client(1), 3);
        let mut root = RootOperator::new(acks);

        let mut signal = Signal::Flush;
        let line = BranchLine::primary(1, Bytes::from_static(b"x"));
        root.input(&cx, &line, SiteId::client(5), 0, &mut signal)
            .unwrap();
        assert_eq!(signal, Signal::Continue);

        let stored = backend.load_ack_table("audit").unwrap().unwrap();
        let records = AckCache::decode(&stored).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].last_ack, 3);
    }
}
