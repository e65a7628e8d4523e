use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};
use zerocopy::byteorder::big_endian::{U32, U64};

use crate::error::FxfsrError;
use crate::xfs::geometry::FsGeometry;
use crate::xfs::sb::compute_crc;
use crate::xfs::types::XfsAgnumber;

/// AGF magic: "XAGF"
pub const XFS_AGF_MAGIC: u32 = 0x58414746;
/// AGI magic: "XAGI"
pub const XFS_AGI_MAGIC: u32 = 0x58414749;
/// AGFL magic: "XAFL"
pub const XFS_AGFL_MAGIC: u32 = 0x5841464c;

pub const XFS_AGF_CRC_OFF: usize = 216;
pub const XFS_AGI_CRC_OFF: usize = 312;
pub const XFS_AGFL_CRC_OFF: usize = 32;

/// Terminator for AGI unlinked buckets and AGFL slots.
pub const NULLAGBLOCK: u32 = u32::MAX;
pub const NULLAGINO: u32 = u32::MAX;

/// On-disk AG free-space header (AGF), 224 bytes.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone)]
#[repr(C)]
pub struct XfsAgf {
    pub agf_magicnum: U32,
    pub agf_versionnum: U32,
    pub agf_seqno: U32,
    pub agf_length: U32,
    pub agf_bno_root: U32,
    pub agf_cnt_root: U32,
    pub agf_rmap_root: U32,
    pub agf_bno_level: U32,
    pub agf_cnt_level: U32,
    pub agf_rmap_level: U32,
    pub agf_flfirst: U32,
    pub agf_fllast: U32,
    pub agf_flcount: U32,
    pub agf_freeblks: U32,
    pub agf_longest: U32,
    pub agf_btreeblks: U32,
    pub agf_uuid: [u8; 16],
    pub agf_rmap_blocks: U32,
    pub agf_refcount_blocks: U32,
    pub agf_refcount_root: U32,
    pub agf_refcount_level: U32,
    pub agf_spare64: [U64; 14],
    pub agf_lsn: U64,
    pub agf_crc: U32,
    pub agf_spare2: U32,
}

/// On-disk AG inode header (AGI), 344 bytes.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone)]
#[repr(C)]
pub struct XfsAgi {
    pub agi_magicnum: U32,
    pub agi_versionnum: U32,
    pub agi_seqno: U32,
    pub agi_length: U32,
    pub agi_count: U32,
    pub agi_root: U32,
    pub agi_level: U32,
    pub agi_freecount: U32,
    pub agi_newino: U32,
    pub agi_dirino: U32,
    pub agi_unlinked: [U32; 64],
    pub agi_uuid: [u8; 16],
    pub agi_crc: U32,
    pub agi_pad32: U32,
    pub agi_lsn: U64,
    pub agi_free_root: U32,
    pub agi_free_level: U32,
    pub agi_iblocks: U32,
    pub agi_fblocks: U32,
}

/// On-disk AGFL header (V5 only, 36 bytes); the slot array follows to the
/// end of the sector. V4 filesystems store the bare slot array.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone)]
#[repr(C)]
pub struct XfsAgflHdr {
    pub agfl_magicnum: U32,
    pub agfl_seqno: U32,
    pub agfl_uuid: [u8; 16],
    pub agfl_lsn: U64,
    pub agfl_crc: U32,
}

impl XfsAgf {
    pub fn from_buf(buf: &[u8], agno: XfsAgnumber) -> Result<Self, FxfsrError> {
        let agf = XfsAgf::ref_from_prefix(buf)
            .map_err(|_| FxfsrError::Parse("buffer too small for AGF"))?
            .0;
        if agf.agf_magicnum.get() != XFS_AGF_MAGIC {
            return Err(FxfsrError::BadMagic("AGF header"));
        }
        if agf.agf_seqno.get() != agno {
            return Err(FxfsrError::Parse("AGF sequence number mismatch"));
        }
        Ok(agf.clone())
    }

    pub fn write_to(&self, sector: &mut [u8], v5: bool) -> Result<(), FxfsrError> {
        write_header(self.as_bytes(), sector, v5.then_some(XFS_AGF_CRC_OFF))
    }
}

impl XfsAgi {
    pub fn from_buf(buf: &[u8], agno: XfsAgnumber) -> Result<Self, FxfsrError> {
        let agi = XfsAgi::ref_from_prefix(buf)
            .map_err(|_| FxfsrError::Parse("buffer too small for AGI"))?
            .0;
        if agi.agi_magicnum.get() != XFS_AGI_MAGIC {
            return Err(FxfsrError::BadMagic("AGI header"));
        }
        if agi.agi_seqno.get() != agno {
            return Err(FxfsrError::Parse("AGI sequence number mismatch"));
        }
        Ok(agi.clone())
    }

    pub fn write_to(&self, sector: &mut [u8], v5: bool) -> Result<(), FxfsrError> {
        write_header(self.as_bytes(), sector, v5.then_some(XFS_AGI_CRC_OFF))
    }
}

/// Number of AGFL slots in one sector.
pub fn agfl_max_slots(geo: &FsGeometry) -> usize {
    let hdr = if geo.is_v5() { std::mem::size_of::<XfsAgflHdr>() } else { 0 };
    (geo.sect_size as usize - hdr) / 4
}

/// Decode the AGFL slot array from a sector buffer.
pub fn agfl_read_slots(
    buf: &[u8],
    geo: &FsGeometry,
    agno: XfsAgnumber,
) -> Result<Vec<u32>, FxfsrError> {
    let hdr = if geo.is_v5() {
        let hdr = XfsAgflHdr::ref_from_prefix(buf)
            .map_err(|_| FxfsrError::Parse("buffer too small for AGFL"))?
            .0;
        if hdr.agfl_magicnum.get() != XFS_AGFL_MAGIC {
            return Err(FxfsrError::BadMagic("AGFL header"));
        }
        if hdr.agfl_seqno.get() != agno {
            return Err(FxfsrError::Parse("AGFL sequence number mismatch"));
        }
        std::mem::size_of::<XfsAgflHdr>()
    } else {
        0
    };

    let nslots = agfl_max_slots(geo);
    let mut slots = Vec::with_capacity(nslots);
    for i in 0..nslots {
        let off = hdr + i * 4;
        if off + 4 > buf.len() {
            return Err(FxfsrError::Parse("AGFL slot out of bounds"));
        }
        slots.push(u32::from_be_bytes(buf[off..off + 4].try_into().unwrap()));
    }
    Ok(slots)
}

/// Encode an AGFL sector: header (V5), the active slots, then NULLAGBLOCK
/// fill. Slots wrap circularly from `flfirst`; the rebuild driver always
/// writes them packed from slot 0.
pub fn agfl_write_slots(
    sector: &mut [u8],
    geo: &FsGeometry,
    agno: XfsAgnumber,
    uuid: &[u8; 16],
    slots: &[u32],
) -> Result<(), FxfsrError> {
    let nslots = agfl_max_slots(geo);
    if slots.len() > nslots {
        return Err(FxfsrError::Parse("too many AGFL slots"));
    }
    sector.fill(0);
    let hdr_len = if geo.is_v5() {
        let hdr = XfsAgflHdr {
            agfl_magicnum: XFS_AGFL_MAGIC.into(),
            agfl_seqno: agno.into(),
            agfl_uuid: *uuid,
            agfl_lsn: 0.into(),
            agfl_crc: 0.into(),
        };
        let raw = hdr.as_bytes();
        sector[..raw.len()].copy_from_slice(raw);
        raw.len()
    } else {
        0
    };

    for i in 0..nslots {
        let val = slots.get(i).copied().unwrap_or(NULLAGBLOCK);
        let off = hdr_len + i * 4;
        sector[off..off + 4].copy_from_slice(&val.to_be_bytes());
    }

    if geo.is_v5() {
        let crc = compute_crc(sector, XFS_AGFL_CRC_OFF);
        sector[XFS_AGFL_CRC_OFF..XFS_AGFL_CRC_OFF + 4].copy_from_slice(&crc.to_be_bytes());
    }
    Ok(())
}

fn write_header(raw: &[u8], sector: &mut [u8], crc_off: Option<usize>) -> Result<(), FxfsrError> {
    if sector.len() < raw.len() {
        return Err(FxfsrError::Parse("header sector too small"));
    }
    sector[..raw.len()].copy_from_slice(raw);
    sector[raw.len()..].fill(0);
    if let Some(off) = crc_off {
        let crc = compute_crc(sector, off);
        sector[off..off + 4].copy_from_slice(&crc.to_be_bytes());
    }
    Ok(())
}
