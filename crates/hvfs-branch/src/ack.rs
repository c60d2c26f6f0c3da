//! Per-source ack watermarks
//!
//! Every site pushing branch lines has one entry holding the last ack this
//! processor has seen from it. The cache decides whether an incoming line is
//! new, a duplicate, or comes from a sender whose view has drifted.

use crate::error::{BranchError, BranchResult};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use hvfs_common::SiteId;
use hvfs_common::hash::site_bucket;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{error, warn};

/// Encoded size of one [`AckRecord`]
pub const ACK_RECORD_LEN: usize = 16;

/// One entry of the ack table as stored on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckRecord {
    pub site: SiteId,
    pub last_ack: u64,
}

/// What to do with a line given its ack and sequence id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckVerdict {
    /// Process the line
    Accept,
    /// Already seen; drop silently
    Ignore,
    /// The sender restarted or replays old lines and must resynchronize
    NeedsAdjust,
    /// An ack may be in flight to the sender; hold the line
    NeedsWait,
}

/// Bucketed map from site to last ack
pub struct AckCache {
    buckets: Vec<Mutex<HashMap<SiteId, u64>>>,
    len: AtomicUsize,
}

impl AckCache {
    /// Create a cache with `buckets` lock domains (at least one)
    #[must_use]
    pub fn new(buckets: usize) -> Self {
        Self {
            buckets: (0..buckets.max(1)).map(|_| Mutex::new(HashMap::new())).collect(),
            len: AtomicUsize::new(0),
        }
    }

    fn bucket(&self, site: SiteId) -> &Mutex<HashMap<SiteId, u64>> {
        &self.buckets[site_bucket(site, self.buckets.len())]
    }

    /// Add an entry; an existing entry for the site is left untouched
    pub fn insert(&self, record: AckRecord) -> BranchResult<()> {
        let mut bucket = self.bucket(record.site).lock();
        if bucket.contains_key(&record.site) {
            return Err(BranchError::AckExists(record.site));
        }
        bucket.insert(record.site, record.last_ack);
        self.len.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn remove(&self, site: SiteId) -> Option<u64> {
        let removed = self.bucket(site).lock().remove(&site);
        if removed.is_some() {
            self.len.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    #[must_use]
    pub fn get(&self, site: SiteId) -> Option<u64> {
        self.bucket(site).lock().get(&site).copied()
    }

    /// Raise the watermark of `site` to `ack`; never lowers it
    pub fn update(&self, site: SiteId, ack: u64) {
        let mut bucket = self.bucket(site).lock();
        match bucket.get_mut(&site) {
            Some(last) => *last = (*last).max(ack),
            None => {
                warn!("ack update for {} without a prior lookup", site);
                if ack != 0 {
                    error!("new ack entry for {} starts at {}", site, ack);
                }
                bucket.insert(site, ack);
                self.len.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Judge a line from `site` carrying the sender's `ack` and its own `id`
    ///
    /// A site seen for the first time is recorded with `last_ack = ack` and
    /// then judged against that entry.
    pub fn lookup_create(&self, site: SiteId, ack: u64, id: u64) -> AckVerdict {
        let mut bucket = self.bucket(site).lock();
        let last = bucket.entry(site).or_insert_with(|| {
            if ack != 0 {
                error!("new ack entry for {} starts at {}", site, ack);
            }
            self.len.fetch_add(1, Ordering::Relaxed);
            ack
        });

        if ack == 0 && *last > 0 {
            warn!("{} restarted, expected resync after ack {}", site, *last);
            AckVerdict::NeedsAdjust
        } else if ack == *last {
            if id <= *last {
                AckVerdict::Ignore
            } else {
                AckVerdict::Accept
            }
        } else if ack < *last {
            if id <= *last {
                AckVerdict::NeedsAdjust
            } else {
                AckVerdict::NeedsWait
            }
        } else {
            warn!("{} is ahead, adopting ack {} over {}", site, ack, *last);
            *last = ack;
            AckVerdict::Accept
        }
    }

    /// Install records read at start-up
    ///
    /// On a duplicate site every record installed by this call is removed
    /// again and the error is returned.
    pub fn load(&self, records: &[AckRecord]) -> BranchResult<()> {
        for (done, record) in records.iter().enumerate() {
            if let Err(e) = self.insert(*record) {
                error!("loading ack table failed at {}: {}", record.site, e);
                for installed in &records[..done] {
                    self.remove(installed.site);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Snapshot every entry
    ///
    /// Buckets are copied one at a time; concurrent lookups during a flush
    /// may or may not be reflected.
    #[must_use]
    pub fn flush(&self) -> Vec<AckRecord> {
        let mut records = Vec::with_capacity(self.len());
        for bucket in &self.buckets {
            let bucket = bucket.lock();
            records.extend(
                bucket
                    .iter()
                    .map(|(site, last_ack)| AckRecord { site: *site, last_ack: *last_ack }),
            );
        }
        records
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encode records as a flat array of `{site:u64, last_ack:u64}`
    #[must_use]
    pub fn encode(records: &[AckRecord]) -> Bytes {
        let mut buf = BytesMut::with_capacity(records.len() * ACK_RECORD_LEN);
        for record in records {
            buf.put_u64_le(record.site.raw());
            buf.put_u64_le(record.last_ack);
        }
        buf.freeze()
    }

    pub fn decode(mut data: &[u8]) -> BranchResult<Vec<AckRecord>> {
        if data.len() % ACK_RECORD_LEN != 0 {
            return Err(BranchError::CorruptAckTable(format!(
                "{} bytes is not a multiple of {}",
                data.len(),
                ACK_RECORD_LEN
            )));
        }
        let mut records = Vec::with_capacity(data.len() / ACK_RECORD_LEN);
        while data.has_remaining() {
            records.push(AckRecord {
                site: SiteId::from(data.get_u64_le()),
                last_ack: data.get_u64_le(),
            });
        }
        Ok(records)
    }
}
