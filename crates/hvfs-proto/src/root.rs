//! Root service payloads: registration, unregistration and ring pushes

use crate::wire::{ensure, len_u32, take_prefixed};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use hvfs_common::{FsInfo, Result, SiteId};
use hvfs_placement::RingTx;
use std::net::{Ipv4Addr, SocketAddrV4};

/// Encoded size of [`FsInfo`]
pub const FS_INFO_LEN: usize = 48;

/// Encoded size of [`RootTx`]
pub const ROOT_TX_LEN: usize = 40;

/// Encoded size of [`SiteAddr`]
pub const SITE_ADDR_LEN: usize = 16;

pub fn encode_fs_info(info: &FsInfo, buf: &mut impl BufMut) {
    buf.put_u64_le(info.fsid);
    buf.put_u32_le(info.group);
    buf.put_u32_le(0);
    buf.put_u64_le(info.gdt_uuid);
    buf.put_u64_le(info.gdt_salt);
    buf.put_u64_le(info.root_uuid);
    buf.put_u64_le(info.root_salt);
}

pub fn decode_fs_info(buf: &mut impl Buf) -> Result<FsInfo> {
    ensure(&*buf, FS_INFO_LEN, "fs info")?;
    let fsid = buf.get_u64_le();
    let group = buf.get_u32_le();
    buf.advance(4);
    Ok(FsInfo {
        fsid,
        group,
        gdt_uuid: buf.get_u64_le(),
        gdt_salt: buf.get_u64_le(),
        root_uuid: buf.get_u64_le(),
        root_salt: buf.get_u64_le(),
    })
}

/// Root entry of a file system as tracked by the root service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RootTx {
    pub fsid: u64,
    pub gdt_uuid: u64,
    pub gdt_salt: u64,
    pub root_uuid: u64,
    pub root_salt: u64,
}

impl RootTx {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.fsid);
        buf.put_u64_le(self.gdt_uuid);
        buf.put_u64_le(self.gdt_salt);
        buf.put_u64_le(self.root_uuid);
        buf.put_u64_le(self.root_salt);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        ensure(&*buf, ROOT_TX_LEN, "root entry")?;
        Ok(Self {
            fsid: buf.get_u64_le(),
            gdt_uuid: buf.get_u64_le(),
            gdt_salt: buf.get_u64_le(),
            root_uuid: buf.get_u64_le(),
            root_salt: buf.get_u64_le(),
        })
    }
}

/// Address of a site
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SiteAddr {
    pub site: SiteId,
    pub addr: SocketAddrV4,
}

impl SiteAddr {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.site.raw());
        buf.put_u32_le(u32::from(*self.addr.ip()));
        buf.put_u16_le(self.addr.port());
        buf.put_u16_le(0);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        ensure(&*buf, SITE_ADDR_LEN, "site address")?;
        let site = SiteId::from(buf.get_u64_le());
        let ip = Ipv4Addr::from(buf.get_u32_le());
        let port = buf.get_u16_le();
        buf.advance(2);
        Ok(Self {
            site,
            addr: SocketAddrV4::new(ip, port),
        })
    }
}

/// Everything a site learns when it registers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterReply {
    pub info: FsInfo,
    pub mds_ring: RingTx,
    pub mdsl_ring: RingTx,
    pub root: RootTx,
    /// First bitmap page of the global directory table
    pub gdt_bitmap: Bytes,
    pub sites: Vec<SiteAddr>,
}

impl RegisterReply {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        encode_fs_info(&self.info, &mut buf);
        self.mds_ring.encode(&mut buf);
        self.mdsl_ring.encode(&mut buf);
        self.root.encode(&mut buf);
        buf.put_u32_le(len_u32(self.gdt_bitmap.len(), "bitmap")?);
        buf.put_slice(&self.gdt_bitmap);
        buf.put_u32_le(len_u32(self.sites.len(), "site table")?);
        for site in &self.sites {
            site.encode(&mut buf);
        }
        Ok(buf.freeze())
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        let info = decode_fs_info(&mut buf)?;
        let mds_ring = RingTx::decode(&mut buf)?;
        let mdsl_ring = RingTx::decode(&mut buf)?;
        let root = RootTx::decode(&mut buf)?;
        let gdt_bitmap = take_prefixed(&mut buf, "bitmap")?;
        ensure(&buf, 4, "site table")?;
        let count = buf.get_u32_le() as usize;
        ensure(&buf, count * SITE_ADDR_LEN, "site table")?;
        let sites = (0..count)
            .map(|_| SiteAddr::decode(&mut buf))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            info,
            mds_ring,
            mdsl_ring,
            root,
            gdt_bitmap,
            sites,
        })
    }
}

/// Ring push: the MDS ring followed by the MDSL ring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingUpdate {
    pub mds: RingTx,
    pub mdsl: RingTx,
}

impl RingUpdate {
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf =
            BytesMut::with_capacity(self.mds.encoded_len() + self.mdsl.encoded_len());
        self.mds.encode(&mut buf);
        self.mdsl.encode(&mut buf);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        let mds = RingTx::decode(&mut buf)?;
        let mdsl = RingTx::decode(&mut buf)?;
        Ok(Self { mds, mdsl })
    }
}
