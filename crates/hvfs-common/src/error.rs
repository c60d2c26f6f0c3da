//! Error types for HVFS
//!
//! This module defines the common error type shared by the placement,
//! protocol and client layers.

use crate::status::Status;
use crate::types::{ContainerId, RingKind, SiteId};
use thiserror::Error;

/// Common result type for HVFS operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for HVFS
#[derive(Debug, Error)]
pub enum Error {
    // Placement errors
    #[error("{0} ring is empty")]
    EmptyRing(RingKind),

    #[error("duplicate ring hash point {point:#x}")]
    RingCollision { point: u64 },

    #[error("container {container:#x} is not in the directory cache")]
    NotCached { container: ContainerId },

    // Remote errors
    #[error("site {site} replied {status}")]
    Remote { site: SiteId, status: Status },

    #[error("corrupt reply from {site} to {op}: {reason}")]
    CorruptReply {
        site: SiteId,
        op: &'static str,
        reason: String,
    },

    #[error("reply from {site} to {op} has no {field}")]
    MissingField {
        site: SiteId,
        op: &'static str,
        field: &'static str,
    },

    // KV errors
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("value of {len} bytes exceeds inline limit of {max} bytes")]
    ValueTooLarge { len: usize, max: usize },

    #[error("column {column} exceeds maximum column {max}")]
    InvalidColumn { column: u32, max: u32 },

    #[error("empty key")]
    EmptyKey,

    #[error("corrupt data: {0}")]
    Corrupt(String),

    // Network errors
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("no address known for site {0}")]
    UnknownSite(SiteId),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a not found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create a corrupt data error
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    /// Wire status carried by a remote failure
    #[must_use]
    pub const fn status(&self) -> Option<Status> {
        match self {
            Self::Remote { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Check if this is a not found error, local or remote
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_)
                | Self::Remote {
                    status: Status::NotFound | Status::NotExist,
                    ..
                }
        )
    }

    /// Check if this is an already-exists error, local or remote
    #[must_use]
    pub const fn is_already_exists(&self) -> bool {
        matches!(
            self,
            Self::AlreadyExists(_)
                | Self::Remote {
                    status: Status::AlreadyExists,
                    ..
                }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_not_found() {
        assert!(Error::not_found("key 7").is_not_found());
        assert!(
            Error::Remote {
                site: SiteId::mds(1),
                status: Status::NotFound,
            }
            .is_not_found()
        );
        assert!(!Error::NotCached { container: 3 }.is_not_found());
    }

    #[test]
    fn test_remote_status_is_kept_verbatim() {
        let err = Error::Remote {
            site: SiteId::mds(2),
            status: Status::from_code(-77),
        };
        assert_eq!(err.status().map(Status::code), Some(-77));
        assert!(err.to_string().contains("-77"));
    }
}
