//! Metadata reply payloads and typed extraction
//!
//! An MDS reply payload is a 16-byte header followed by optional
//! sub-records in a fixed order:
//!
//! ```text
//! [index descriptor][metadata unit x mdu_no][link source][bitmap][trailing]
//! ```
//!
//! Presence is announced by flag bits only; offsets are never stored, they
//! are recomputed from the flags on every extraction so a reply with some
//! sub-records missing is still read correctly.

use crate::wire::{ensure, len_u32};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use hvfs_common::{ContainerId, Error, Result, Salt};
use std::ops::BitOr;

/// Size of the reply header
pub const MD_REPLY_HEADER_LEN: usize = 16;

/// Encoded size of an [`IndexDescriptor`]
pub const INDEX_DESCRIPTOR_LEN: usize = 64;

/// Encoded size of a [`MetadataUnit`]
pub const MDU_LEN: usize = 88;

/// Encoded size of a [`LinkSource`]
pub const LINK_SOURCE_LEN: usize = 24;

/// Header in front of the bitmap bytes: `{offset:u64}{len:u32}`
pub const BITMAP_HEADER_LEN: usize = 12;

/// Sub-record presence flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplyFlags(u32);

impl ReplyFlags {
    pub const WITH_HI: Self = Self(0x01);
    pub const WITH_MDU: Self = Self(0x02);
    pub const WITH_LS: Self = Self(0x04);
    pub const WITH_BITMAP: Self = Self(0x08);
    /// The server created a new shard; no bytes attached
    pub const WITH_BFLIP: Self = Self(0x10);

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ReplyFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Extractable sub-record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    IndexDescriptor,
    MetadataUnit,
    LinkSource,
    Bitmap,
}

impl FieldKind {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::IndexDescriptor => "index descriptor",
            Self::MetadataUnit => "metadata unit",
            Self::LinkSource => "link source",
            Self::Bitmap => "bitmap",
        }
    }

    const fn flag(self) -> ReplyFlags {
        match self {
            Self::IndexDescriptor => ReplyFlags::WITH_HI,
            Self::MetadataUnit => ReplyFlags::WITH_MDU,
            Self::LinkSource => ReplyFlags::WITH_LS,
            Self::Bitmap => ReplyFlags::WITH_BITMAP,
        }
    }
}

/// Descriptor of a name or uuid lookup, echoed back by the server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexDescriptor {
    pub namelen: u32,
    pub flag: u32,
    pub uuid: ContainerId,
    pub hash: u64,
    pub itbid: u64,
    pub puuid: ContainerId,
    pub psalt: Salt,
    /// Salt of the entry itself, for containers
    pub ssalt: Salt,
    pub dlen: u32,
    pub column: i32,
}

impl IndexDescriptor {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.namelen);
        buf.put_u32_le(self.flag);
        buf.put_u64_le(self.uuid);
        buf.put_u64_le(self.hash);
        buf.put_u64_le(self.itbid);
        buf.put_u64_le(self.puuid);
        buf.put_u64_le(self.psalt);
        buf.put_u64_le(self.ssalt);
        buf.put_u32_le(self.dlen);
        buf.put_i32_le(self.column);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        ensure(&*buf, INDEX_DESCRIPTOR_LEN, "index descriptor")?;
        Ok(Self {
            namelen: buf.get_u32_le(),
            flag: buf.get_u32_le(),
            uuid: buf.get_u64_le(),
            hash: buf.get_u64_le(),
            itbid: buf.get_u64_le(),
            puuid: buf.get_u64_le(),
            psalt: buf.get_u64_le(),
            ssalt: buf.get_u64_le(),
            dlen: buf.get_u32_le(),
            column: buf.get_i32_le(),
        })
    }
}

/// Metadata unit of an entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetadataUnit {
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub flags: u32,
    pub version: u32,
    pub size: u64,
    pub dev: u64,
    pub atime: u64,
    pub ctime: u64,
    pub mtime: u64,
    /// Hashing salt, for containers
    pub salt: Salt,
    pub puuid: ContainerId,
    pub psalt: Salt,
}

impl MetadataUnit {
    /// Directory bit in `mode`
    pub const MODE_DIR: u32 = 0o040_000;
    /// Entry is a KV table
    pub const FLAG_KV: u32 = 0x0001;
    /// Entry lives in the global directory table
    pub const FLAG_GDT: u32 = 0x0002;

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.mode);
        buf.put_u32_le(self.nlink);
        buf.put_u32_le(self.uid);
        buf.put_u32_le(self.gid);
        buf.put_u32_le(self.flags);
        buf.put_u32_le(self.version);
        buf.put_u64_le(self.size);
        buf.put_u64_le(self.dev);
        buf.put_u64_le(self.atime);
        buf.put_u64_le(self.ctime);
        buf.put_u64_le(self.mtime);
        buf.put_u64_le(self.salt);
        buf.put_u64_le(self.puuid);
        buf.put_u64_le(self.psalt);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        ensure(&*buf, MDU_LEN, "metadata unit")?;
        Ok(Self {
            mode: buf.get_u32_le(),
            nlink: buf.get_u32_le(),
            uid: buf.get_u32_le(),
            gid: buf.get_u32_le(),
            flags: buf.get_u32_le(),
            version: buf.get_u32_le(),
            size: buf.get_u64_le(),
            dev: buf.get_u64_le(),
            atime: buf.get_u64_le(),
            ctime: buf.get_u64_le(),
            mtime: buf.get_u64_le(),
            salt: buf.get_u64_le(),
            puuid: buf.get_u64_le(),
            psalt: buf.get_u64_le(),
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MDU_LEN);
        self.encode(&mut buf);
        buf.freeze()
    }

    #[must_use]
    pub const fn is_dir(&self) -> bool {
        self.mode & Self::MODE_DIR != 0
    }
}

/// Source of a hard link
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkSource {
    pub hash: u64,
    pub puuid: ContainerId,
    pub uuid: ContainerId,
}

impl LinkSource {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.hash);
        buf.put_u64_le(self.puuid);
        buf.put_u64_le(self.uuid);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        ensure(&*buf, LINK_SOURCE_LEN, "link source")?;
        Ok(Self {
            hash: buf.get_u64_le(),
            puuid: buf.get_u64_le(),
            uuid: buf.get_u64_le(),
        })
    }
}

/// Bitmap page carried in a reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitmapPage {
    /// First shard covered by the page
    pub offset: u64,
    pub bytes: Bytes,
}

/// Parsed metadata reply
#[derive(Debug, Clone)]
pub struct MdReply {
    pub err: i32,
    pub mdu_no: u32,
    pub flags: ReplyFlags,
    data: Bytes,
}

impl MdReply {
    /// Parse the header; sub-records are located lazily
    pub fn decode(mut payload: Bytes) -> Result<Self> {
        ensure(&payload, MD_REPLY_HEADER_LEN, "reply header")?;
        let err = payload.get_i32_le();
        let mdu_no = payload.get_u32_le();
        let len = payload.get_u32_le() as usize;
        let flags = ReplyFlags::from_bits(payload.get_u32_le());
        ensure(&payload, len, "reply body")?;
        Ok(Self {
            err,
            mdu_no,
            flags,
            data: payload.split_to(len),
        })
    }

    #[must_use]
    pub fn builder() -> MdReplyBuilder {
        MdReplyBuilder::default()
    }

    /// Whether the server created a new shard while handling the request
    #[must_use]
    pub const fn bitmap_flipped(&self) -> bool {
        self.flags.contains(ReplyFlags::WITH_BFLIP)
    }

    fn has(&self, kind: FieldKind) -> bool {
        self.flags.contains(kind.flag())
    }

    fn field_len(&self, kind: FieldKind, at: usize) -> Result<usize> {
        Ok(match kind {
            FieldKind::IndexDescriptor => INDEX_DESCRIPTOR_LEN,
            FieldKind::MetadataUnit => self.mdu_no as usize * MDU_LEN,
            FieldKind::LinkSource => LINK_SOURCE_LEN,
            FieldKind::Bitmap => {
                let mut header = self.data.get(at..).unwrap_or_default();
                ensure(&header, BITMAP_HEADER_LEN, "bitmap header")?;
                header.advance(8);
                BITMAP_HEADER_LEN + header.get_u32_le() as usize
            }
        })
    }

    /// Start of `upto`, or the end of all present sub-records for `None`
    fn offset_of(&self, upto: Option<FieldKind>) -> Result<usize> {
        let mut at = 0;
        for kind in [
            FieldKind::IndexDescriptor,
            FieldKind::MetadataUnit,
            FieldKind::LinkSource,
            FieldKind::Bitmap,
        ] {
            if Some(kind) == upto {
                return Ok(at);
            }
            if self.has(kind) {
                at += self.field_len(kind, at)?;
            }
        }
        Ok(at)
    }

    /// Raw bytes of a sub-record; `None` when its flag is clear
    pub fn extract(&self, kind: FieldKind) -> Result<Option<&[u8]>> {
        if !self.has(kind) {
            return Ok(None);
        }
        let start = self.offset_of(Some(kind))?;
        let len = self.field_len(kind, start)?;
        self.data
            .get(start..start + len)
            .map(Some)
            .ok_or_else(|| {
                Error::corrupt(format!(
                    "{} at {start}+{len} overruns {}-byte reply",
                    kind.name(),
                    self.data.len()
                ))
            })
    }

    /// Bytes after every flagged sub-record (list entries, KV data)
    pub fn trailing(&self) -> Result<Bytes> {
        let start = self.offset_of(None)?;
        if start > self.data.len() {
            return Err(Error::corrupt("sub-records overrun reply body"));
        }
        Ok(self.data.slice(start..))
    }

    pub fn index_descriptor(&self) -> Result<Option<IndexDescriptor>> {
        self.extract(FieldKind::IndexDescriptor)?
            .map(|mut raw| IndexDescriptor::decode(&mut raw))
            .transpose()
    }

    pub fn metadata_units(&self) -> Result<Vec<MetadataUnit>> {
        let Some(mut raw) = self.extract(FieldKind::MetadataUnit)? else {
            return Ok(Vec::new());
        };
        (0..self.mdu_no)
            .map(|_| MetadataUnit::decode(&mut raw))
            .collect()
    }

    pub fn link_source(&self) -> Result<Option<LinkSource>> {
        self.extract(FieldKind::LinkSource)?
            .map(|mut raw| LinkSource::decode(&mut raw))
            .transpose()
    }

    pub fn bitmap(&self) -> Result<Option<BitmapPage>> {
        let Some(raw) = self.extract(FieldKind::Bitmap)? else {
            return Ok(None);
        };
        let mut header = raw;
        let offset = header.get_u64_le();
        let len = header.get_u32_le() as usize;
        let start = self.offset_of(Some(FieldKind::Bitmap))? + BITMAP_HEADER_LEN;
        Ok(Some(BitmapPage {
            offset,
            bytes: self.data.slice(start..start + len),
        }))
    }
}

/// Assembles a reply payload; used by servers and test doubles
#[derive(Debug, Default)]
pub struct MdReplyBuilder {
    err: i32,
    flags: ReplyFlags,
    index: Option<IndexDescriptor>,
    mdus: Vec<MetadataUnit>,
    link: Option<LinkSource>,
    bitmap: Option<BitmapPage>,
    trailing: BytesMut,
}

impl MdReplyBuilder {
    #[must_use]
    pub const fn err(mut self, err: i32) -> Self {
        self.err = err;
        self
    }

    #[must_use]
    pub fn index(mut self, index: IndexDescriptor) -> Self {
        self.flags = self.flags | ReplyFlags::WITH_HI;
        self.index = Some(index);
        self
    }

    #[must_use]
    pub fn mdu(mut self, mdu: MetadataUnit) -> Self {
        self.flags = self.flags | ReplyFlags::WITH_MDU;
        self.mdus.push(mdu);
        self
    }

    #[must_use]
    pub fn link(mut self, link: LinkSource) -> Self {
        self.flags = self.flags | ReplyFlags::WITH_LS;
        self.link = Some(link);
        self
    }

    #[must_use]
    pub fn bitmap(mut self, offset: u64, bytes: impl Into<Bytes>) -> Self {
        self.flags = self.flags | ReplyFlags::WITH_BITMAP;
        self.bitmap = Some(BitmapPage {
            offset,
            bytes: bytes.into(),
        });
        self
    }

    #[must_use]
    pub fn bitmap_flip(mut self) -> Self {
        self.flags = self.flags | ReplyFlags::WITH_BFLIP;
        self
    }

    #[must_use]
    pub fn trailing(mut self, data: &[u8]) -> Self {
        self.trailing.put_slice(data);
        self
    }

    pub fn build(self) -> Result<Bytes> {
        let mut body = BytesMut::new();
        if let Some(index) = &self.index {
            index.encode(&mut body);
        }
        for mdu in &self.mdus {
            mdu.encode(&mut body);
        }
        if let Some(link) = &self.link {
            link.encode(&mut body);
        }
        if let Some(page) = &self.bitmap {
            body.put_u64_le(page.offset);
            body.put_u32_le(len_u32(page.bytes.len(), "bitmap")?);
            body.put_slice(&page.bytes);
        }
        body.put_slice(&self.trailing);

        let mut buf = BytesMut::with_capacity(MD_REPLY_HEADER_LEN + body.len());
        buf.put_i32_le(self.err);
        buf.put_u32_le(len_u32(self.mdus.len(), "metadata units")?);
        buf.put_u32_le(len_u32(body.len(), "reply body")?);
        buf.put_u32_le(self.flags.bits());
        buf.put_slice(&body);
        Ok(buf.freeze())
    }
}

/// Names returned by a list request: `{namelen:u32}{name}` until the end
/// of the data or a zero length
pub fn decode_list_entries(mut data: Bytes) -> Result<Vec<String>> {
    let mut names = Vec::new();
    while data.remaining() >= 4 {
        let len = data.get_u32_le() as usize;
        if len == 0 {
            break;
        }
        ensure(&data, len, "list entry")?;
        let raw = data.split_to(len);
        let name = String::from_utf8(raw.to_vec())
            .map_err(|e| Error::corrupt(format!("list entry is not UTF-8: {e}")))?;
        names.push(name);
    }
    Ok(names)
}

pub fn encode_list_entries<'a>(
    names: impl IntoIterator<Item = &'a str>,
    buf: &mut impl BufMut,
) -> Result<()> {
    for name in names {
        buf.put_u32_le(len_u32(name.len(), "list entry")?);
        buf.put_slice(name.as_bytes());
    }
    Ok(())
}
