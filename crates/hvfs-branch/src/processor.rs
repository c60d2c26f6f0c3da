//! Branch processor: feeds pushed lines through an operator chain

use crate::ack::{AckCache, AckVerdict};
use crate::backend::BranchBackend;
use crate::error::BranchResult;
use crate::filter::FilterOperator;
use crate::line::BranchPush;
use crate::operator::{
    Flow, OpContext, Operator, OperatorArena, OperatorKind, PassThrough, Signal,
};
use crate::root::RootOperator;

use hvfs_common::config::BranchConfig;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, error, info, warn};

/// One operator entry of a branch descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorSpec {
    pub id: u32,
    /// Wire operator code
    pub code: u32,
    pub config: String,
}

impl OperatorSpec {
    pub fn new(id: u32, kind: OperatorKind, config: impl Into<String>) -> Self {
        Self {
            id,
            code: kind as u32,
            config: config.into(),
        }
    }
}

/// What happened to a pushed line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Every operator took the line
    Delivered,
    /// An operator consumed the line
    Filtered,
    /// Duplicate of a line already processed
    Ignored,
    /// The sender must resynchronize
    NeedsAdjust,
    /// The sender should hold the line
    NeedsWait,
}

impl From<AckVerdict> for PushOutcome {
    fn from(verdict: AckVerdict) -> Self {
        match verdict {
            AckVerdict::Accept => Self::Delivered,
            AckVerdict::Ignore => Self::Ignored,
            AckVerdict::NeedsAdjust => Self::NeedsAdjust,
            AckVerdict::NeedsWait => Self::NeedsWait,
        }
    }
}

pub struct BranchProcessor {
    name: String,
    backend: Arc<dyn BranchBackend>,
    acks: Arc<AckCache>,
    chain: Mutex<OperatorArena>,
    live: AtomicUsize,
    memory_limit: usize,
}

impl BranchProcessor {
    /// Build the chain described by `ops` under a root operator
    ///
    /// The stored ack table of `name` is loaded first. Unknown operator codes
    /// are skipped with an error log; an operator that fails to open fails
    /// the whole build.
    pub fn from_descriptor(
        name: &str,
        ops: &[OperatorSpec],
        backend: Arc<dyn BranchBackend>,
        config: &BranchConfig,
    ) -> BranchResult<Self> {
        let acks = Arc::new(AckCache::new(config.ack_buckets));
        if let Some(table) = backend.load_ack_table(name)? {
            acks.load(&AckCache::decode(&table)?)?;
            debug!("branch {} restored {} ack entries", name, acks.len());
        }

        let root = RootOperator::new(Arc::clone(&acks));
        let processor = Self {
            name: name.to_string(),
            backend,
            chain: Mutex::new(OperatorArena::new(Box::new(root))),
            acks,
            live: AtomicUsize::new(1),
            memory_limit: config.memory_limit,
        };

        for spec in ops {
            let kind = match OperatorKind::try_from(spec.code) {
                Ok(OperatorKind::Root) => {
                    error!("branch {}: operator {} cannot be a second root", name, spec.id);
                    continue;
                }
                Ok(kind) => kind,
                Err(e) => {
                    error!("branch {}: operator {}: {}", name, spec.id, e);
                    continue;
                }
            };
            let op: Box<dyn Operator> = match kind {
                OperatorKind::Filter => {
                    Box::new(FilterOperator::open(&spec.config, config.filter_chunk)?)
                }
                other => Box::new(PassThrough::open(other, &spec.config)),
            };
            processor.chain.lock().append(spec.id, op);
            processor.live.fetch_add(1, Ordering::Relaxed);
        }

        info!(
            "branch {} ready with {} operators",
            name,
            processor.operator_count()
        );
        Ok(processor)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Operators in the chain, root included
    #[must_use]
    pub fn operator_count(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn kinds(&self) -> Vec<OperatorKind> {
        self.chain.lock().kinds()
    }

    #[must_use]
    pub const fn acks(&self) -> &Arc<AckCache> {
        &self.acks
    }

    fn context(&self) -> OpContext<'_> {
        OpContext {
            branch: &self.name,
            backend: self.backend.as_ref(),
        }
    }

    /// Run one pushed line through the chain
    ///
    /// Ordering anomalies are reported in the outcome; only operator
    /// failures are errors.
    pub fn handle_push(&self, push: &BranchPush) -> BranchResult<PushOutcome> {
        let site = push.line.origin(push.sender)?;
        let cx = self.context();
        let mut signal = if push.flush {
            Signal::Flush
        } else {
            Signal::Continue
        };

        let mut chain = self.chain.lock();
        let flow = chain
            .feed(&cx, &push.line, site, push.ack, &mut signal)
            .inspect_err(|e| {
                error!(
                    "branch {}: line {} from {} (origin {}, ack {}) failed: {}",
                    self.name, push.line.id, push.sender, site, push.ack, e
                );
            })?;

        let outcome = match flow {
            Flow::Forward => PushOutcome::Delivered,
            Flow::Swallow => PushOutcome::Filtered,
            Flow::Reject(verdict) => {
                warn!(
                    "branch {}: root swallowed line {} from {} (origin {}, ack {}): {:?}",
                    self.name, push.line.id, push.sender, site, push.ack, verdict
                );
                verdict.into()
            }
        };

        let buffered = chain.buffered_bytes();
        if buffered > self.memory_limit {
            debug!(
                "branch {} holds {} bytes over limit {}, flushing",
                self.name, buffered, self.memory_limit
            );
            chain.flush(&cx)?;
        }
        Ok(outcome)
    }

    /// Flush every operator, writing the ack table and buffered output
    pub fn flush(&self) -> BranchResult<()> {
        let cx = self.context();
        self.chain.lock().flush(&cx)
    }

    /// Close every operator; returns operator ids in close order
    ///
    /// Buffered output that was not flushed is dropped.
    pub fn teardown(&mut self) -> Vec<u32> {
        let chain = self.chain.get_mut();
        let pending = chain.buffered_bytes();
        if pending > 0 {
            warn!("branch {} torn down with {} unflushed bytes", self.name, pending);
        }
        let closed = chain.teardown();
        self.live.store(0, Ordering::Relaxed);
        info!("branch {} torn down", self.name);
        closed
    }
}

impl Drop for BranchProcessor {
    fn drop(&mut self) {
        if self.live.load(Ordering::Relaxed) > 0 {
            self.teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FsBackend;
    use crate::error::BranchError;
    use crate::line::{BranchLine, LinePosition};
    use bytes::Bytes;
    use hvfs_common::SiteId;
    use std::fs;
    use tempfile::TempDir;

    struct FailingBackend;

    impl BranchBackend for FailingBackend {
        fn append_output(&self, _target: &str, _data: &[u8]) -> BranchResult<()> {
            Err(std::io::Error::other("disk full").into())
        }

        fn store_ack_table(&self, _branch: &str, _table: &[u8]) -> BranchResult<()> {
            Err(std::io::Error::other("disk full").into())
        }

        fn load_ack_table(&self, _branch: &str) -> BranchResult<Option<Vec<u8>>> {
            Ok(None)
        }
    }

    fn push(sender: u64, ack: u64, id: u64, data: &'static [u8]) -> BranchPush {
        BranchPush::new(
            SiteId::client(sender),
            ack,
            BranchLine::primary(id, Bytes::from_static(data)),
        )
    }

    fn filter_processor(dir: &TempDir, config: &BranchConfig) -> BranchProcessor {
        let ops = [
            OperatorSpec::new(1, OperatorKind::Filter, "rule:^err;output_filename:/out/err.log;"),
            OperatorSpec::new(2, OperatorKind::Sum, ""),
        ];
        BranchProcessor::from_descriptor(
            "audit",
            &ops,
            Arc::new(FsBackend::new(dir.path())),
            config,
        )
        .unwrap()
    }

    #[test]
    fn test_chain_from_descriptor() {
        let dir = TempDir::new().unwrap();
        let ops = [
            OperatorSpec::new(1, OperatorKind::Filter, "output_filename:all;"),
            OperatorSpec {
                id: 2,
                code: 42,
                config: String::new(),
            },
            OperatorSpec::new(3, OperatorKind::TopN, ""),
            OperatorSpec::new(4, OperatorKind::Codec, ""),
        ];
        let mut processor = BranchProcessor::from_descriptor(
            "b",
            &ops,
            Arc::new(FsBackend::new(dir.path())),
            &BranchConfig::default(),
        )
        .unwrap();
        assert_eq!(processor.operator_count(), 4);
        assert_eq!(
            processor.kinds(),
            vec![
                OperatorKind::Root,
                OperatorKind::Filter,
                OperatorKind::TopN,
                OperatorKind::Codec
            ]
        );
        assert_eq!(processor.teardown(), vec![4, 3, 1, 0]);
        assert_eq!(processor.operator_count(), 0);
    }

    #[test]
    fn test_bad_filter_fails_build() {
        let dir = TempDir::new().unwrap();
        let ops = [OperatorSpec::new(1, OperatorKind::Filter, "rule:[;output_filename:x;")];
        let result = BranchProcessor::from_descriptor(
            "b",
            &ops,
            Arc::new(FsBackend::new(dir.path())),
            &BranchConfig::default(),
        );
        assert!(matches!(result, Err(BranchError::Regex(_))));
    }

    #[test]
    fn test_push_filter_and_flush() {
        let dir = TempDir::new().unwrap();
        let processor = filter_processor(&dir, &BranchConfig::default());

        assert_eq!(
            processor.handle_push(&push(1, 0, 1, b"err one\n")).unwrap(),
            PushOutcome::Delivered
        );
        assert_eq!(
            processor.handle_push(&push(1, 0, 2, b"info two\n")).unwrap(),
            PushOutcome::Filtered
        );
        assert_eq!(
            processor.handle_push(&push(1, 0, 3, b"err three\n")).unwrap(),
            PushOutcome::Delivered
        );
        processor.flush().unwrap();

        let out = fs::read(dir.path().join("out/err.log")).unwrap();
        assert_eq!(out, b"err one\nerr three\n");
        let table = fs::read(dir.path().join("audit.acks")).unwrap();
        assert_eq!(AckCache::decode(&table).unwrap().len(), 1);
    }

    #[test]
    fn test_ordering_outcomes() {
        let dir = TempDir::new().unwrap();
        let processor = filter_processor(&dir, &BranchConfig::default());
        processor.acks().update(SiteId::client(7), 10);

        let cases = [
            (10, 5, PushOutcome::Ignored),
            (5, 3, PushOutcome::NeedsAdjust),
            (5, 20, PushOutcome::NeedsWait),
            (0, 30, PushOutcome::NeedsAdjust),
            (10, 15, PushOutcome::Delivered),
        ];
        for (ack, id, expected) in cases {
            let outcome = processor
                .handle_push(&push(7, ack, id, b"err x\n"))
                .unwrap();
            assert_eq!(outcome, expected, "ack {ack} id {id}");
        }
    }

    #[test]
    fn test_replica_uses_origin_watermark() {
        let dir = TempDir::new().unwrap();
        let processor = filter_processor(&dir, &BranchConfig::default());
        processor.acks().update(SiteId::client(9), 4);

        let mut replica = push(2, 4, 3, b"err replayed\n");
        replica.line.position = LinePosition::Replica;
        replica.line.sites = vec![SiteId::client(9), SiteId::client(2)];
        assert_eq!(processor.handle_push(&replica).unwrap(), PushOutcome::Ignored);
        assert_eq!(processor.acks().get(SiteId::client(2)), None);

        replica.line.sites.clear();
        assert!(matches!(
            processor.handle_push(&replica),
            Err(BranchError::MissingOrigin(3))
        ));
    }

    #[test]
    fn test_memory_limit_forces_flush() {
        let dir = TempDir::new().unwrap();
        let config = BranchConfig {
            memory_limit: 8,
            ..BranchConfig::default()
        };
        let processor = filter_processor(&dir, &config);
        processor.handle_push(&push(1, 0, 1, b"err 1234\n")).unwrap();

        let out = fs::read(dir.path().join("out/err.log")).unwrap();
        assert_eq!(out, b"err 1234\n");
        assert!(dir.path().join("audit.acks").exists());
    }

    #[test]
    fn test_flush_push_writes_before_line() {
        let dir = TempDir::new().unwrap();
        let processor = filter_processor(&dir, &BranchConfig::default());
        processor.handle_push(&push(1, 0, 1, b"err a\n")).unwrap();

        let mut flushing = push(1, 0, 2, b"err b\n");
        flushing.flush = true;
        processor.handle_push(&flushing).unwrap();
        assert!(dir.path().join("audit.acks").exists());
    }

    #[test]
    fn test_acks_survive_restart() {
        let dir = TempDir::new().unwrap();
        {
            let processor = filter_processor(&dir, &BranchConfig::default());
            processor.handle_push(&push(3, 0, 1, b"err\n")).unwrap();
            processor.acks().update(SiteId::client(3), 6);
            processor.flush().unwrap();
        }
        let processor = filter_processor(&dir, &BranchConfig::default());
        assert_eq!(processor.acks().get(SiteId::client(3)), Some(6));
        assert_eq!(
            processor.handle_push(&push(3, 6, 5, b"err\n")).unwrap(),
            PushOutcome::Ignored
        );
    }

    #[test]
    fn test_failed_flush_is_hard_stop() {
        let processor = BranchProcessor::from_descriptor(
            "b",
            &[],
            Arc::new(FailingBackend),
            &BranchConfig::default(),
        )
        .unwrap();
        assert!(matches!(processor.flush(), Err(BranchError::Io(_))));

        let mut flushing = push(1, 0, 1, b"x");
        flushing.flush = true;
        let err = processor.handle_push(&flushing).unwrap_err();
        assert!(matches!(err, BranchError::HardStop { ref operator, .. } if operator == "root"));
    }
}
