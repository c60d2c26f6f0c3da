//! Core type definitions for HVFS
//!
//! Site identifiers, container/shard aliases and the file-system info block
//! handed out by the root service at registration time.

use derive_more::{From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Container (directory / table) identifier
pub type ContainerId = u64;

/// Shard (ITB) identifier within a container
pub type ShardId = u64;

/// Per-container hashing salt
pub type Salt = u64;

/// Number of low bits reserved for the per-kind site index
const SITE_INDEX_BITS: u32 = 48;
const SITE_INDEX_MASK: u64 = (1 << SITE_INDEX_BITS) - 1;

/// Role a site plays in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SiteKind {
    Client = 0,
    Mds = 1,
    Mdsl = 2,
    Root = 3,
    Amc = 4,
    Branch = 5,
}

impl SiteKind {
    /// Short lowercase name used in logs and site display
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Mds => "mds",
            Self::Mdsl => "mdsl",
            Self::Root => "root",
            Self::Amc => "amc",
            Self::Branch => "bp",
        }
    }

    const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Client),
            1 => Some(Self::Mds),
            2 => Some(Self::Mdsl),
            3 => Some(Self::Root),
            4 => Some(Self::Amc),
            5 => Some(Self::Branch),
            _ => None,
        }
    }
}

impl fmt::Display for SiteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cluster-wide site identifier
///
/// The top bits carry the [`SiteKind`], the low 48 bits the index of the
/// site within its kind.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into)]
pub struct SiteId(u64);

impl SiteId {
    /// Build a site id from its kind and index
    #[must_use]
    pub const fn new(kind: SiteKind, index: u64) -> Self {
        Self(((kind as u64) << SITE_INDEX_BITS) | (index & SITE_INDEX_MASK))
    }

    #[must_use]
    pub const fn client(index: u64) -> Self {
        Self::new(SiteKind::Client, index)
    }

    #[must_use]
    pub const fn mds(index: u64) -> Self {
        Self::new(SiteKind::Mds, index)
    }

    #[must_use]
    pub const fn mdsl(index: u64) -> Self {
        Self::new(SiteKind::Mdsl, index)
    }

    #[must_use]
    pub const fn root(index: u64) -> Self {
        Self::new(SiteKind::Root, index)
    }

    #[must_use]
    pub const fn amc(index: u64) -> Self {
        Self::new(SiteKind::Amc, index)
    }

    /// Raw wire value
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Kind encoded in the id, `None` for unknown kinds
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn kind(self) -> Option<SiteKind> {
        let tag = self.0 >> SITE_INDEX_BITS;
        if tag > u8::MAX as u64 {
            return None;
        }
        SiteKind::from_u8(tag as u8)
    }

    #[must_use]
    pub const fn index(self) -> u64 {
        self.0 & SITE_INDEX_MASK
    }
}

impl fmt::Debug for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SiteId({self})")
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            Some(kind) => write!(f, "{kind}.{}", self.index()),
            None => write!(f, "{:#x}", self.0),
        }
    }
}

/// Which of the two published rings a lookup goes through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RingKind {
    Mds,
    Mdsl,
}

impl fmt::Display for RingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mds => f.write_str("mds"),
            Self::Mdsl => f.write_str("mdsl"),
        }
    }
}

/// File-system identity handed out by the root service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsInfo {
    pub fsid: u64,
    pub group: u32,
    /// Global directory table container
    pub gdt_uuid: ContainerId,
    pub gdt_salt: Salt,
    pub root_uuid: ContainerId,
    pub root_salt: Salt,
}
