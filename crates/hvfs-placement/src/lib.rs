//! HVFS Placement - consistent hashing and directory routing
//!
//! This crate decides where a request goes. The [`HashRing`] maps a shard id
//! to the metadata or storage site that owns it; the [`DirectoryCache`] maps
//! a container and key hash to the shard id.
//!
//! # Example
//! ```ignore
//! use hvfs_placement::{DirectoryCache, HashRing};
//!
//! let shard = cache.resolve_shard(table_uuid, key_hash)?;
//! let site = ring.resolve(shard, table_salt)?;
//! ```

pub mod dircache;
pub mod ring;

pub use dircache::{BITMAP_PAGE_BITS, BITMAP_PAGE_BYTES, DirEntry, DirectoryCache};
pub use ring::{HashRing, PointKind, RingPoint, RingTx, SharedRing};
