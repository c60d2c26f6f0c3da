//! Operator trait and the node arena holding a processor's chain
//!
//! Nodes reference their children by index. Chains are built as a single
//! `left` path under the root node; teardown visits children before their
//! parent and closes each node exactly once.

use crate::ack::AckVerdict;
use crate::backend::BranchBackend;
use crate::error::{BranchError, BranchResult};
use crate::line::BranchLine;

use hvfs_common::SiteId;
use std::fmt;
use tracing::{debug, info};

/// Control state threaded through one push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Continue,
    /// Flush before handling the line; reset by the root operator
    Flush,
    /// Drop this line; later operators are not called
    Stop,
}

/// Result of feeding a line to one operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Hand the line to the next operator
    Forward,
    /// The operator consumed the line
    Swallow,
    /// The ack check refused the line
    Reject(AckVerdict),
}

/// Operator codes carried in a branch descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum OperatorKind {
    Root = 0,
    Filter = 1,
    Sum = 2,
    Max = 3,
    Min = 4,
    TopN = 5,
    GroupBy = 6,
    Rank = 7,
    Indexer = 8,
    Codec = 9,
}

impl OperatorKind {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Root => "root",
            Self::Filter => "filter",
            Self::Sum => "sum",
            Self::Max => "max",
            Self::Min => "min",
            Self::TopN => "topn",
            Self::GroupBy => "groupby",
            Self::Rank => "rank",
            Self::Indexer => "indexer",
            Self::Codec => "udf_codec",
        }
    }
}

impl fmt::Display for OperatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<u32> for OperatorKind {
    type Error = BranchError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Root,
            1 => Self::Filter,
            2 => Self::Sum,
            3 => Self::Max,
            4 => Self::Min,
            5 => Self::TopN,
            6 => Self::GroupBy,
            7 => Self::Rank,
            8 => Self::Indexer,
            9 => Self::Codec,
            _ => return Err(BranchError::UnknownOperator(value)),
        })
    }
}

/// What an operator may touch while handling a line
pub struct OpContext<'a> {
    pub branch: &'a str,
    pub backend: &'a dyn BranchBackend,
}

/// One stage of a branch pipeline
pub trait Operator: Send {
    fn kind(&self) -> OperatorKind;

    /// Handle one line sent by (or on behalf of) `site`
    fn input(
        &mut self,
        cx: &OpContext<'_>,
        line: &BranchLine,
        site: SiteId,
        ack: u64,
        signal: &mut Signal,
    ) -> BranchResult<Flow>;

    /// Write out buffered state; the operator keeps accepting input
    fn flush(&mut self, cx: &OpContext<'_>) -> BranchResult<()>;

    fn close(&mut self) {}

    /// Bytes held in memory awaiting a flush
    fn buffered_bytes(&self) -> usize {
        0
    }

    /// Apply the incoming signal before handling a line
    ///
    /// A pending flush runs now; a failing flush or an earlier stop aborts
    /// the push.
    fn enter(&mut self, cx: &OpContext<'_>, signal: &mut Signal) -> BranchResult<()> {
        match *signal {
            Signal::Continue => Ok(()),
            Signal::Flush => self.flush(cx).map_err(|e| {
                *signal = Signal::Stop;
                BranchError::hard_stop(self.kind().name(), format!("flush failed: {e}"))
            }),
            Signal::Stop => Err(BranchError::hard_stop(self.kind().name(), "stopped")),
        }
    }
}

/// Placeholder for operators without behaviour of their own
///
/// Lines pass through unchanged.
pub struct PassThrough {
    kind: OperatorKind,
}

impl PassThrough {
    #[must_use]
    pub fn open(kind: OperatorKind, config: &str) -> Self {
        info!("operator {} has no implementation, passing lines through", kind);
        if !config.is_empty() {
            debug!("ignoring {} config {:?}", kind, config);
        }
        Self { kind }
    }
}

impl Operator for PassThrough {
    fn kind(&self) -> OperatorKind {
        self.kind
    }

    fn input(
        &mut self,
        cx: &OpContext<'_>,
        _line: &BranchLine,
        _site: SiteId,
        _ack: u64,
        signal: &mut Signal,
    ) -> BranchResult<Flow> {
        self.enter(cx, signal)?;
        Ok(Flow::Forward)
    }

    fn flush(&mut self, _cx: &OpContext<'_>) -> BranchResult<()> {
        Ok(())
    }
}

struct Node {
    id: u32,
    op: Box<dyn Operator>,
    left: Option<usize>,
    right: Option<usize>,
    closed: bool,
}

/// Operator nodes of one processor; index 0 is the root
pub struct OperatorArena {
    nodes: Vec<Node>,
    tail: usize,
}

impl OperatorArena {
    pub fn new(root: Box<dyn Operator>) -> Self {
        Self {
            nodes: vec![Node {
                id: 0,
                op: root,
                left: None,
                right: None,
                closed: false,
            }],
            tail: 0,
        }
    }

    /// Append `op` as the left child of the current tail
    pub fn append(&mut self, id: u32, op: Box<dyn Operator>) -> usize {
        let index = self.nodes.len();
        self.nodes.push(Node {
            id,
            op,
            left: None,
            right: None,
            closed: false,
        });
        self.nodes[self.tail].left = Some(index);
        self.tail = index;
        index
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node indices along the chain, root first
    fn chain(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut cursor = Some(0);
        while let Some(index) = cursor {
            order.push(index);
            cursor = self.nodes[index].left;
        }
        order
    }

    /// Operator kinds along the chain
    #[must_use]
    pub fn kinds(&self) -> Vec<OperatorKind> {
        self.chain().into_iter().map(|i| self.nodes[i].op.kind()).collect()
    }

    /// Run a line through the chain until an operator does not forward it
    pub fn feed(
        &mut self,
        cx: &OpContext<'_>,
        line: &BranchLine,
        site: SiteId,
        ack: u64,
        signal: &mut Signal,
    ) -> BranchResult<Flow> {
        for index in self.chain() {
            let flow = self.nodes[index].op.input(cx, line, site, ack, signal)?;
            if flow != Flow::Forward {
                return Ok(flow);
            }
            if *signal == Signal::Stop {
                return Ok(Flow::Swallow);
            }
        }
        Ok(Flow::Forward)
    }

    /// Flush every operator, root first
    pub fn flush(&mut self, cx: &OpContext<'_>) -> BranchResult<()> {
        for index in self.chain() {
            self.nodes[index].op.flush(cx)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn buffered_bytes(&self) -> usize {
        self.nodes.iter().map(|node| node.op.buffered_bytes()).sum()
    }

    /// Close every node, children before parents; returns ids in close order
    pub fn teardown(&mut self) -> Vec<u32> {
        let mut closed = Vec::with_capacity(self.nodes.len());
        // Explicit stack: (node, children already pushed)
        let mut stack = vec![(0usize, false)];
        while let Some((index, expanded)) = stack.pop() {
            if expanded {
                let node = &mut self.nodes[index];
                if !node.closed {
                    node.op.close();
                    node.closed = true;
                    closed.push(node.id);
                }
                continue;
            }
            stack.push((index, true));
            let node = &self.nodes[index];
            if let Some(right) = node.right {
                stack.push((right, false));
            }
            if let Some(left) = node.left {
                stack.push((left, false));
            }
        }
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FsBackend;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct Recorder {
        kind: OperatorKind,
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        swallow: bool,
    }

    impl Operator for Recorder {
        fn kind(&self) -> OperatorKind {
            self.kind
        }

        fn input(
            &mut self,
            cx: &OpContext<'_>,
            _line: &BranchLine,
            _site: SiteId,
            _ack: u64,
            signal: &mut Signal,
        ) -> BranchResult<Flow> {
            self.enter(cx, signal)?;
            self.log.lock().push(format!("input {}", self.name));
            if self.swallow {
                *signal = Signal::Stop;
            }
            Ok(Flow::Forward)
        }

        fn flush(&mut self, _cx: &OpContext<'_>) -> BranchResult<()> {
            self.log.lock().push(format!("flush {}", self.name));
            Ok(())
        }

        fn close(&mut self) {
            self.log.lock().push(format!("close {}", self.name));
        }
    }

    fn recorder(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Box<dyn Operator> {
        Box::new(Recorder {
            kind: OperatorKind::Sum,
            name,
            log: Arc::clone(log),
            swallow: false,
        })
    }

    #[test]
    fn test_kind_codes() {
        assert_eq!(OperatorKind::try_from(5).unwrap(), OperatorKind::TopN);
        assert_eq!(OperatorKind::Codec.name(), "udf_codec");
        assert!(matches!(
            OperatorKind::try_from(10),
            Err(BranchError::UnknownOperator(10))
        ));
    }

    #[test]
    fn test_teardown_closes_children_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut arena = OperatorArena::new(recorder("root", &log));
        arena.append(11, recorder("a", &log));
        arena.append(12, recorder("b", &log));
        assert_eq!(arena.teardown(), vec![12, 11, 0]);
        assert_eq!(*log.lock(), vec!["close b", "close a", "close root"]);
        assert!(arena.teardown().is_empty());
    }

    #[test]
    fn test_stop_ends_chain() {
        let dir = tempfile::TempDir::new().unwrap();
        let backend = FsBackend::new(dir.path());
        let cx = OpContext {
            branch: "b",
            backend: &backend,
        };
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut arena = OperatorArena::new(recorder("root", &log));
        arena.append(
            1,
            Box::new(Recorder {
                kind: OperatorKind::Filter,
                name: "gate",
                log: Arc::clone(&log),
                swallow: true,
            }),
        );
        arena.append(2, recorder("tail", &log));

        let line = BranchLine::primary(1, Bytes::from_static(b"x"));
        let mut signal = Signal::Continue;
        let flow = arena
            .feed(&cx, &line, SiteId::client(1), 0, &mut signal)
            .unwrap();
        assert_eq!(flow, Flow::Swallow);
        assert_eq!(*log.lock(), vec!["input root", "input gate"]);
    }

    #[test]
    fn test_flush_signal_runs_before_input() {
        let dir = tempfile::TempDir::new().unwrap();
        let backend = FsBackend::new(dir.path());
        let cx = OpContext {
            branch: "b",
            backend: &backend,
        };
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut arena = OperatorArena::new(recorder("root", &log));
        let line = BranchLine::primary(1, Bytes::from_static(b"x"));
        let mut signal = Signal::Flush;
        arena
            .feed(&cx, &line, SiteId::client(1), 0, &mut signal)
            .unwrap();
        assert_eq!(*log.lock(), vec!["flush root", "input root"]);
    }

    #[test]
    fn test_pass_through_forwards() {
        let dir = tempfile::TempDir::new().unwrap();
        let backend = FsBackend::new(dir.path());
        let cx = OpContext {
            branch: "b",
            backend: &backend,
        };
        let mut op = PassThrough::open(OperatorKind::Rank, "");
        let line = BranchLine::primary(3, Bytes::from_static(b"y"));
        let mut signal = Signal::Continue;
        let flow = op
            .input(&cx, &line, SiteId::client(1), 0, &mut signal)
            .unwrap();
        assert_eq!(flow, Flow::Forward);
        assert_eq!(op.buffered_bytes(), 0);
    }
}
