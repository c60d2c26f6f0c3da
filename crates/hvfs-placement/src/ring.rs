//! Consistent-hash ring
//!
//! A ring is a sorted array of virtual points. Each site contributes a fixed
//! number of points; a lookup hashes `(key, salt)` onto the ring and takes the
//! first point at or after that position, wrapping to the start.
//!
//! Rings are built once (from configuration or from the root service's wire
//! copy) and then published through [`SharedRing`]; a published ring is never
//! mutated, a reconfiguration publishes a whole new one.

use bytes::{Buf, BufMut};
use hvfs_common::{Error, Result, RingKind, Salt, SiteId, hash};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Encoded size of one ring point
pub const POINT_WIRE_LEN: usize = 24;

/// Encoded size of the ring header
pub const RING_HEADER_LEN: usize = 8;

/// How a point got onto the ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PointKind {
    /// Generated from the site id and vid
    Auto = 0,
    /// Placed explicitly by an administrator
    Manual = 1,
}

impl TryFrom<u32> for PointKind {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::Auto),
            1 => Ok(Self::Manual),
            other => Err(Error::corrupt(format!("invalid ring point kind {other}"))),
        }
    }
}

/// One virtual point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingPoint {
    /// Position on the ring
    pub point: u64,
    /// Virtual id within the owning site
    pub vid: u32,
    pub kind: PointKind,
    /// Owning site
    pub site: SiteId,
}

/// Ring as transferred on the wire: `{count:u32}{group:u32}` then the points
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingTx {
    pub group: u32,
    pub points: Vec<RingPoint>,
}

impl RingTx {
    /// Encoded length in bytes
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        RING_HEADER_LEN + self.points.len() * POINT_WIRE_LEN
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        let count = u32::try_from(self.points.len()).unwrap_or(u32::MAX);
        buf.put_u32_le(count);
        buf.put_u32_le(self.group);
        for p in self.points.iter().take(count as usize) {
            buf.put_u64_le(p.point);
            buf.put_u32_le(p.vid);
            buf.put_u32_le(p.kind as u32);
            buf.put_u64_le(p.site.raw());
        }
    }

    /// Decode one ring, advancing `buf` past it
    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < RING_HEADER_LEN {
            return Err(Error::corrupt("truncated ring header"));
        }
        let count = buf.get_u32_le() as usize;
        let group = buf.get_u32_le();
        if buf.remaining() < count * POINT_WIRE_LEN {
            return Err(Error::corrupt(format!(
                "ring claims {count} points, only {} bytes follow",
                buf.remaining()
            )));
        }
        let mut points = Vec::with_capacity(count);
        for _ in 0..count {
            let point = buf.get_u64_le();
            let vid = buf.get_u32_le();
            let kind = PointKind::try_from(buf.get_u32_le())?;
            let site = SiteId::from(buf.get_u64_le());
            points.push(RingPoint {
                point,
                vid,
                kind,
                site,
            });
        }
        Ok(Self { group, points })
    }
}

/// Consistent-hash ring mapping shard keys to sites
#[derive(Debug, Clone)]
pub struct HashRing {
    kind: RingKind,
    group: u32,
    points: Vec<RingPoint>,
}

impl HashRing {
    /// Create an empty ring
    #[must_use]
    pub const fn new(kind: RingKind, group: u32) -> Self {
        Self {
            kind,
            group,
            points: Vec::new(),
        }
    }

    /// Add `vcount` virtual points for `site`
    ///
    /// On a hash point collision the ring is left unchanged.
    pub fn add_site(&mut self, site: SiteId, vcount: u32) -> Result<()> {
        let mut points = self.points.clone();
        points.extend((0..vcount).map(|vid| RingPoint {
            point: hash::vsite_point(site, vid),
            vid,
            kind: PointKind::Auto,
            site,
        }));
        sort_checked(&mut points)?;
        self.points = points;
        debug!("{} ring: added site {} with {} points", self.kind, site, vcount);
        Ok(())
    }

    /// Rebuild a ring from its wire copy
    ///
    /// Points arrive in arbitrary order; they are inserted in bulk and sorted
    /// once.
    pub fn rebuild_from_wire(kind: RingKind, tx: RingTx) -> Result<Self> {
        let RingTx { group, mut points } = tx;
        sort_checked(&mut points)?;
        let ring = Self {
            kind,
            group,
            points,
        };
        info!(
            "{} ring rebuilt: group {}, {} points, checksum {}",
            kind,
            group,
            ring.points.len(),
            ring.checksum()
        );
        Ok(ring)
    }

    /// Wire copy of this ring
    #[must_use]
    pub fn to_wire(&self) -> RingTx {
        RingTx {
            group: self.group,
            points: self.points.clone(),
        }
    }

    /// First point at or after `position`, wrapping to the first point
    pub fn locate(&self, position: u64) -> Result<&RingPoint> {
        let idx = self.points.partition_point(|p| p.point < position);
        let idx = if idx == self.points.len() { 0 } else { idx };
        self.points.get(idx).ok_or_else(|| {
            error!("lookup on empty {} ring", self.kind);
            Error::EmptyRing(self.kind)
        })
    }

    /// Point responsible for `(key, salt)`
    pub fn resolve_point(&self, key: u64, salt: Salt) -> Result<&RingPoint> {
        self.locate(hash::ring_point(key, salt))
    }

    /// Site responsible for `(key, salt)`
    pub fn resolve(&self, key: u64, salt: Salt) -> Result<SiteId> {
        self.resolve_point(key, salt).map(|p| p.site)
    }

    /// MD5 over the encoded point array, for comparing rings across sites
    #[must_use]
    pub fn checksum(&self) -> String {
        let mut buf = Vec::with_capacity(self.points.len() * POINT_WIRE_LEN);
        for p in &self.points {
            buf.put_u64_le(p.point);
            buf.put_u32_le(p.vid);
            buf.put_u32_le(p.kind as u32);
            buf.put_u64_le(p.site.raw());
        }
        format!("{:x}", md5::compute(&buf))
    }

    /// Distinct sites present on the ring, in ascending order
    #[must_use]
    pub fn sites(&self) -> Vec<SiteId> {
        let mut sites: Vec<SiteId> = self.points.iter().map(|p| p.site).collect();
        sites.sort_unstable();
        sites.dedup();
        sites
    }

    #[must_use]
    pub fn points(&self) -> &[RingPoint] {
        &self.points
    }

    #[must_use]
    pub const fn kind(&self) -> RingKind {
        self.kind
    }

    #[must_use]
    pub const fn group(&self) -> u32 {
        self.group
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

fn sort_checked(points: &mut [RingPoint]) -> Result<()> {
    points.sort_unstable_by_key(|p| p.point);
    if let Some(pair) = points.windows(2).find(|w| w[0].point == w[1].point) {
        error!(
            "ring point {:#x} claimed by {} and {}",
            pair[0].point, pair[0].site, pair[1].site
        );
        return Err(Error::RingCollision {
            point: pair[0].point,
        });
    }
    Ok(())
}

/// Published ring, replaced wholesale on reconfiguration
///
/// Readers take a cheap `Arc` snapshot, so a lookup never observes a
/// half-updated ring.
#[derive(Debug)]
pub struct SharedRing {
    inner: RwLock<Arc<HashRing>>,
}

impl SharedRing {
    #[must_use]
    pub fn new(ring: HashRing) -> Self {
        Self {
            inner: RwLock::new(Arc::new(ring)),
        }
    }

    /// Current ring snapshot
    #[must_use]
    pub fn load(&self) -> Arc<HashRing> {
        Arc::clone(&self.inner.read())
    }

    /// Publish a replacement ring
    pub fn store(&self, ring: HashRing) {
        let points = ring.len();
        let old = std::mem::replace(&mut *self.inner.write(), Arc::new(ring));
        debug!("{} ring replaced ({} -> {} points)", old.kind(), old.len(), points);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::collections::HashMap;

    fn manual_ring(points: &[(u64, SiteId)]) -> HashRing {
        let tx = RingTx {
            group: 0,
            points: points
                .iter()
                .map(|&(point, site)| RingPoint {
                    point,
                    vid: 0,
                    kind: PointKind::Manual,
                    site,
                })
                .collect(),
        };
        HashRing::rebuild_from_wire(RingKind::Mds, tx).unwrap()
    }

    #[test]
    fn test_locate_wraps_around() {
        let ring = manual_ring(&[
            (300, SiteId::mds(3)),
            (100, SiteId::mds(1)),
            (200, SiteId::mds(2)),
        ]);
        assert_eq!(ring.locate(0).unwrap().site, SiteId::mds(1));
        assert_eq!(ring.locate(100).unwrap().site, SiteId::mds(1));
        assert_eq!(ring.locate(101).unwrap().site, SiteId::mds(2));
        assert_eq!(ring.locate(300).unwrap().site, SiteId::mds(3));
        assert_eq!(ring.locate(301).unwrap().site, SiteId::mds(1));
        assert_eq!(ring.locate(u64::MAX).unwrap().site, SiteId::mds(1));
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let mut ring = HashRing::new(RingKind::Mds, 0);
        for index in 0..4 {
            ring.add_site(SiteId::mds(index), 64).unwrap();
        }
        for key in 0..1000 {
            assert_eq!(ring.resolve(key, 17).unwrap(), ring.resolve(key, 17).unwrap());
        }
    }

    #[test]
    fn test_every_site_gets_keys() {
        let mut ring = HashRing::new(RingKind::Mdsl, 0);
        for index in 0..4 {
            ring.add_site(SiteId::mdsl(index), 256).unwrap();
        }
        let mut rng = rand::thread_rng();
        let mut hits: HashMap<SiteId, usize> = HashMap::new();
        for _ in 0..20_000 {
            let site = ring.resolve(rng.r#gen(), rng.r#gen()).unwrap();
            *hits.entry(site).or_default() += 1;
        }
        assert_eq!(hits.len(), 4);
        for count in hits.values() {
            assert!(*count > 2_000, "unbalanced ring: {hits:?}");
        }
    }

    #[test]
    fn test_empty_ring_lookup_fails() {
        let ring = HashRing::new(RingKind::Mds, 0);
        assert!(matches!(ring.resolve(1, 1), Err(Error::EmptyRing(RingKind::Mds))));
    }

    #[test]
    fn test_duplicate_point_rejected() {
        let tx = RingTx {
            group: 0,
            points: vec![
                RingPoint {
                    point: 5,
                    vid: 0,
                    kind: PointKind::Manual,
                    site: SiteId::mds(0),
                },
                RingPoint {
                    point: 5,
                    vid: 1,
                    kind: PointKind::Manual,
                    site: SiteId::mds(1),
                },
            ],
        };
        let err = HashRing::rebuild_from_wire(RingKind::Mds, tx).unwrap_err();
        assert!(matches!(err, Error::RingCollision { point: 5 }));
    }

    #[test]
    fn test_add_same_site_twice_keeps_ring() {
        let mut ring = HashRing::new(RingKind::Mds, 0);
        ring.add_site(SiteId::mds(0), 8).unwrap();
        assert!(ring.add_site(SiteId::mds(0), 8).is_err());
        assert_eq!(ring.len(), 8);
    }

    #[test]
    fn test_wire_rebuild_matches_source() {
        let mut ring = HashRing::new(RingKind::Mds, 2);
        ring.add_site(SiteId::mds(0), 16).unwrap();
        ring.add_site(SiteId::mds(1), 16).unwrap();

        let mut tx = ring.to_wire();
        tx.points.reverse();
        let mut buf = Vec::new();
        tx.encode(&mut buf);
        assert_eq!(buf.len(), tx.encoded_len());

        let mut cursor = &buf[..];
        let decoded = RingTx::decode(&mut cursor).unwrap();
        assert!(cursor.is_empty());
        let rebuilt = HashRing::rebuild_from_wire(RingKind::Mds, decoded).unwrap();
        assert_eq!(rebuilt.checksum(), ring.checksum());
        assert_eq!(rebuilt.group(), 2);
        assert_eq!(rebuilt.sites(), vec![SiteId::mds(0), SiteId::mds(1)]);
    }

    #[test]
    fn test_truncated_wire_ring() {
        let mut buf = Vec::new();
        buf.put_u32_le(3);
        buf.put_u32_le(0);
        buf.put_u64_le(1);
        let mut cursor = &buf[..];
        assert!(RingTx::decode(&mut cursor).is_err());
    }

    #[test]
    fn test_shared_ring_swap() {
        let shared = SharedRing::new(HashRing::new(RingKind::Mds, 0));
        let before = shared.load();
        let mut next = HashRing::new(RingKind::Mds, 0);
        next.add_site(SiteId::mds(9), 4).unwrap();
        shared.store(next);
        assert!(before.is_empty());
        assert_eq!(shared.load().sites(), vec![SiteId::mds(9)]);
    }
}
