//! Hash functions used for placement and key routing
//!
//! Every hash is XXH64 with a per-purpose seed so the same input never lands
//! on correlated positions in two different address spaces (ring points
//! versus shard ids, for instance).

use crate::types::{ContainerId, Salt, SiteId};
use xxhash_rust::xxh64::xxh64;

const SEED_VSITE: u64 = 0x7673_6974_6531_0001;
const SEED_RING: u64 = 0x7269_6e67_0000_0002;
const SEED_SHARD: u64 = 0x6974_6200_0000_0003;
const SEED_NAME: u64 = 0x6e61_6d65_0000_0004;
const SEED_GDT: u64 = 0x6764_7400_0000_0005;
const SEED_KVS: u64 = 0x6b76_7300_0000_0006;

/// Ring position of virtual point `vid` of `site`
///
/// The input is the textual `"{site}.{vid}"` form so the layout does not
/// depend on the integer width of either field.
#[must_use]
pub fn vsite_point(site: SiteId, vid: u32) -> u64 {
    let label = format!("{}.{}", site.raw(), vid);
    xxh64(label.as_bytes(), SEED_VSITE ^ site.raw())
}

/// Query position on a ring for `key` under `salt`
#[must_use]
pub fn ring_point(key: u64, salt: Salt) -> u64 {
    xxh64(&key.to_le_bytes(), SEED_RING ^ salt)
}

/// Shard-routing hash of a numeric key inside a container
#[must_use]
pub fn key_hash(key: u64, salt: Salt) -> u64 {
    xxh64(&key.to_le_bytes(), SEED_SHARD ^ salt)
}

/// Hash of an entry name inside its parent container
#[must_use]
pub fn name_hash(name: &str, parent_salt: Salt) -> u64 {
    xxh64(name.as_bytes(), SEED_NAME ^ parent_salt)
}

/// Hash of a container's slot in the global directory table
#[must_use]
pub fn gdt_hash(uuid: ContainerId, gdt_salt: Salt) -> u64 {
    xxh64(&uuid.to_le_bytes(), SEED_GDT ^ gdt_salt)
}

/// Numeric key derived from a string key
#[must_use]
pub fn string_key(key: &str) -> u64 {
    xxh64(key.as_bytes(), SEED_KVS)
}

/// Bucket index for a site in a table of `buckets` slots
#[must_use]
pub fn site_bucket(site: SiteId, buckets: usize) -> usize {
    let hash = xxh64(&site.raw().to_le_bytes(), 0);
    // The modulus is bounded by `buckets`, so it always fits.
    #[allow(clippy::cast_possible_truncation)]
    let slot = (hash % buckets.max(1) as u64) as usize;
    slot
}
