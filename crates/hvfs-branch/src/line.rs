//! Branch lines as pushed into a processor

use crate::error::{BranchError, BranchResult};

use bytes::Bytes;
use hvfs_common::SiteId;

/// Where the pushing site sits relative to the line's origin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinePosition {
    /// The sender produced the line
    Primary = 0,
    /// The sender forwards a line produced by `sites[0]`
    Replica = 1,
}

impl TryFrom<u8> for LinePosition {
    type Error = BranchError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Primary),
            1 => Ok(Self::Replica),
            _ => Err(BranchError::InvalidPosition(value)),
        }
    }
}

/// One streamed record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchLine {
    /// Sequence id assigned by the origin site
    pub id: u64,
    pub position: LinePosition,
    /// Replica chain; the first entry is the origin
    pub sites: Vec<SiteId>,
    pub data: Bytes,
}

impl BranchLine {
    pub fn primary(id: u64, data: impl Into<Bytes>) -> Self {
        Self {
            id,
            position: LinePosition::Primary,
            sites: Vec::new(),
            data: data.into(),
        }
    }

    /// Site whose ack watermark governs this line
    pub fn origin(&self, sender: SiteId) -> BranchResult<SiteId> {
        match self.position {
            LinePosition::Primary => Ok(sender),
            LinePosition::Replica => self
                .sites
                .first()
                .copied()
                .ok_or(BranchError::MissingOrigin(self.id)),
        }
    }
}

/// A line together with the envelope it arrived in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchPush {
    /// Site that sent the push
    pub sender: SiteId,
    /// Last ack the sender has received
    pub ack: u64,
    /// Flush every operator before processing the line
    pub flush: bool,
    pub line: BranchLine,
}

impl BranchPush {
    pub const fn new(sender: SiteId, ack: u64, line: BranchLine) -> Self {
        Self {
            sender,
            ack,
            flush: false,
            line,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin() {
        let sender = SiteId::client(4);
        let line = BranchLine::primary(1, "x");
        assert_eq!(line.origin(sender).unwrap(), sender);

        let replica = BranchLine {
            position: LinePosition::Replica,
            sites: vec![SiteId::client(9), sender],
            ..line.clone()
        };
        assert_eq!(replica.origin(sender).unwrap(), SiteId::client(9));

        let orphan = BranchLine {
            position: LinePosition::Replica,
            ..line
        };
        assert!(matches!(orphan.origin(sender), Err(BranchError::MissingOrigin(1))));
    }

    #[test]
    fn test_position_codes() {
        assert_eq!(LinePosition::try_from(1).unwrap(), LinePosition::Replica);
        assert!(matches!(
            LinePosition::try_from(7),
            Err(BranchError::InvalidPosition(7))
        ));
    }
}
