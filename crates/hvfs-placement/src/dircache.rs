//! Directory handle cache
//!
//! Maps a container id to its hashing salt and the bitmap of shards (ITBs)
//! that currently exist for it. A key is routed by hashing it into
//! `[0, 2^depth)` and falling back to the parent shard (highest bit cleared)
//! while the candidate is not allocated yet, so keys follow a split as soon
//! as the bitmap learns about the new shard.
//!
//! Lookups of a missing container return [`Error::NotCached`]; that is a
//! local cache miss, not a statement about the server.

use hvfs_common::{ContainerId, Error, Result, Salt, ShardId};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// Shards covered by one bitmap page
pub const BITMAP_PAGE_BITS: u64 = 128 * 1024;

/// Bytes in one bitmap page
pub const BITMAP_PAGE_BYTES: usize = (BITMAP_PAGE_BITS / 8) as usize;

/// Deepest supported split level
const MAX_DEPTH: u8 = 63;

#[derive(Debug)]
struct ShardMap {
    depth: u8,
    /// Page index -> page bytes
    pages: BTreeMap<u64, Box<[u8]>>,
}

impl ShardMap {
    fn with_depth(depth: u8) -> Self {
        let depth = depth.min(MAX_DEPTH);
        let mut map = Self {
            depth,
            pages: BTreeMap::new(),
        };
        for shard in 0..(1u64 << depth).min(BITMAP_PAGE_BITS) {
            map.set(shard);
        }
        map
    }

    // Byte and bit offsets are below the page size.
    #[allow(clippy::cast_possible_truncation)]
    const fn split(shard: ShardId) -> (u64, usize, u8) {
        let page = shard / BITMAP_PAGE_BITS;
        let byte = ((shard % BITMAP_PAGE_BITS) / 8) as usize;
        let bit = (shard % 8) as u8;
        (page, byte, bit)
    }

    fn test(&self, shard: ShardId) -> bool {
        let (page, byte, bit) = Self::split(shard);
        self.pages
            .get(&page)
            .is_some_and(|bytes| bytes[byte] & (1 << bit) != 0)
    }

    fn set(&mut self, shard: ShardId) {
        let (page, byte, bit) = Self::split(shard);
        let bytes = self
            .pages
            .entry(page)
            .or_insert_with(|| vec![0u8; BITMAP_PAGE_BYTES].into_boxed_slice());
        bytes[byte] |= 1 << bit;
        self.raise_depth(shard);
    }

    #[allow(clippy::cast_possible_truncation)]
    fn raise_depth(&mut self, shard: ShardId) {
        let bits = (u64::BITS - shard.leading_zeros()) as u8;
        if bits > self.depth {
            self.depth = bits.min(MAX_DEPTH);
        }
    }

    const fn mask(&self) -> u64 {
        (1u64 << self.depth) - 1
    }

    fn resolve(&self, hash: u64) -> ShardId {
        let mut shard = hash & self.mask();
        while shard != 0 && !self.test(shard) {
            // Clear the highest set bit: the shard this one split from.
            shard &= !(1u64 << (u64::BITS - 1 - shard.leading_zeros()));
        }
        shard
    }

    fn load_page(&mut self, page: u64, data: &[u8]) {
        let mut bytes = vec![0u8; BITMAP_PAGE_BYTES].into_boxed_slice();
        let len = data.len().min(BITMAP_PAGE_BYTES);
        bytes[..len].copy_from_slice(&data[..len]);
        let highest = bytes
            .iter()
            .enumerate()
            .rev()
            .find(|(_, b)| **b != 0)
            .map(|(idx, b)| {
                let bit = 7 - b.leading_zeros() as u64;
                page * BITMAP_PAGE_BITS + idx as u64 * 8 + bit
            });
        self.pages.insert(page, bytes);
        if let Some(shard) = highest {
            self.raise_depth(shard);
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn next_allocated(&self, from: ShardId) -> Option<ShardId> {
        let limit = 1u64 << self.depth;
        let (first_page, _, _) = Self::split(from);
        for (&page, bytes) in self.pages.range(first_page..) {
            let base = page * BITMAP_PAGE_BITS;
            let start = if page == first_page { from - base } else { 0 };
            for offset in start..BITMAP_PAGE_BITS {
                let shard = base + offset;
                if shard >= limit {
                    return None;
                }
                if bytes[(offset / 8) as usize] & (1 << (offset % 8)) != 0 {
                    return Some(shard);
                }
            }
        }
        None
    }
}

/// Cached directory handle
#[derive(Debug)]
pub struct DirEntry {
    uuid: ContainerId,
    puuid: ContainerId,
    salt: Salt,
    shards: Mutex<ShardMap>,
}

impl DirEntry {
    #[must_use]
    pub const fn uuid(&self) -> ContainerId {
        self.uuid
    }

    /// Parent container
    #[must_use]
    pub const fn puuid(&self) -> ContainerId {
        self.puuid
    }

    #[must_use]
    pub const fn salt(&self) -> Salt {
        self.salt
    }

    /// Current split depth; shard ids live in `[0, 2^depth)`
    #[must_use]
    pub fn depth(&self) -> u8 {
        self.shards.lock().depth
    }

    /// Shard owning `hash`
    #[must_use]
    pub fn resolve_shard(&self, hash: u64) -> ShardId {
        self.shards.lock().resolve(hash)
    }

    #[must_use]
    pub fn is_allocated(&self, shard: ShardId) -> bool {
        self.shards.lock().test(shard)
    }

    /// First allocated shard at or after `from`
    #[must_use]
    pub fn next_allocated(&self, from: ShardId) -> Option<ShardId> {
        self.shards.lock().next_allocated(from)
    }

    /// Record that `shard` exists
    pub fn mark(&self, shard: ShardId) {
        let mut shards = self.shards.lock();
        if !shards.test(shard) {
            debug!("container {:#x}: shard {} now allocated", self.uuid, shard);
            shards.set(shard);
        }
    }
}

/// Directory cache: container id -> [`DirEntry`]
#[derive(Debug)]
pub struct DirectoryCache {
    entries: RwLock<HashMap<ContainerId, Arc<DirEntry>>>,
    initial_depth: u8,
}

impl DirectoryCache {
    /// Create a cache whose new entries start with `2^initial_depth` shards
    #[must_use]
    pub fn new(initial_depth: u8) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            initial_depth,
        }
    }

    /// Look up a cached container
    pub fn search(&self, uuid: ContainerId) -> Result<Arc<DirEntry>> {
        self.entries
            .read()
            .get(&uuid)
            .cloned()
            .ok_or(Error::NotCached { container: uuid })
    }

    /// Cache a container, returning the existing entry if already present
    pub fn insert(&self, uuid: ContainerId, puuid: ContainerId, salt: Salt) -> Arc<DirEntry> {
        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(&uuid) {
            if existing.salt != salt {
                warn!(
                    "container {:#x} cached with salt {:#x}, ignoring {:#x}",
                    uuid, existing.salt, salt
                );
            }
            return Arc::clone(existing);
        }
        let entry = Arc::new(DirEntry {
            uuid,
            puuid,
            salt,
            shards: Mutex::new(ShardMap::with_depth(self.initial_depth)),
        });
        entries.insert(uuid, Arc::clone(&entry));
        debug!("cached container {:#x} (salt {:#x})", uuid, salt);
        entry
    }

    /// Evict a container
    pub fn remove(&self, uuid: ContainerId) -> Option<Arc<DirEntry>> {
        self.entries.write().remove(&uuid)
    }

    /// Shard owning `hash` in a cached container
    pub fn resolve_shard(&self, uuid: ContainerId, hash: u64) -> Result<ShardId> {
        Ok(self.search(uuid)?.resolve_shard(hash))
    }

    /// Record that `shard` exists in a cached container
    pub fn bitmap_mark(&self, uuid: ContainerId, shard: ShardId) -> Result<()> {
        self.search(uuid)?.mark(shard);
        Ok(())
    }

    /// Install a bitmap page received from a server
    ///
    /// `offset` is the first shard covered by the page and must be page
    /// aligned; bytes past the end of `data` read as unallocated.
    pub fn bitmap_load(&self, uuid: ContainerId, offset: ShardId, data: &[u8]) -> Result<()> {
        if offset % BITMAP_PAGE_BITS != 0 {
            return Err(Error::invalid_argument(format!(
                "bitmap offset {offset} is not page aligned"
            )));
        }
        let entry = self.search(uuid)?;
        entry
            .shards
            .lock()
            .load_page(offset / BITMAP_PAGE_BITS, data);
        Ok(())
    }

    /// Number of cached containers
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
