//! HVFS Branch - line processing pipeline
//!
//! A [`BranchProcessor`] feeds every pushed branch line through a chain of
//! operators. The root operator at the head of the chain checks the line
//! against the per-source [`AckCache`]; the operators after it filter,
//! aggregate or index the lines and write their results through a
//! [`BranchBackend`].
//!
//! ```text
//! push ──► root (ack check) ──► filter ──► sum ──► ...
//!                │                  │
//!                ▼                  ▼
//!           <branch>.acks      output file
//! ```

pub mod ack;
pub mod backend;
pub mod error;
pub mod filter;
pub mod line;
pub mod operator;
pub mod processor;
pub mod root;

pub use ack::{AckCache, AckRecord, AckVerdict};
pub use backend::{BranchBackend, FsBackend};
pub use error::{BranchError, BranchResult};
pub use filter::{AcceptMode, FilterOperator};
pub use line::{BranchLine, BranchPush, LinePosition};
pub use operator::{Flow, OpContext, Operator, OperatorArena, OperatorKind, PassThrough, Signal};
pub use processor::{BranchProcessor, OperatorSpec, PushOutcome};
pub use root::RootOperator;
