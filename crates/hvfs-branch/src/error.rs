//! Branch pipeline error types

use hvfs_common::SiteId;
use thiserror::Error;

/// Branch processor error
///
/// Ordering anomalies are not errors; they surface as
/// [`crate::AckVerdict`] and [`crate::PushOutcome`].
#[derive(Error, Debug)]
pub enum BranchError {
    /// An operator could not continue; the push is aborted
    #[error("Operator {operator} stopped: {reason}")]
    HardStop { operator: String, reason: String },

    /// Ack entry already present for the site
    #[error("Ack entry for {0} already exists")]
    AckExists(SiteId),

    /// Stored ack table is malformed
    #[error("Corrupt ack table: {0}")]
    CorruptAckTable(String),

    /// Operator configuration string could not be parsed
    #[error("Invalid operator config: {0}")]
    InvalidConfig(String),

    /// Operator code outside the known set
    #[error("Unknown operator code: {0}")]
    UnknownOperator(u32),

    /// Branch line position outside the known set
    #[error("Invalid branch line position: {0}")]
    InvalidPosition(u8),

    /// Replica line without an originating site
    #[error("Replica line {0} carries no origin site")]
    MissingOrigin(u64),

    /// Filter rule does not compile
    #[error("Invalid filter rule: {0}")]
    Regex(#[from] regex::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BranchError {
    pub fn hard_stop(operator: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::HardStop {
            operator: operator.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for branch operations
pub type BranchResult<T> = Result<T, BranchError>;
