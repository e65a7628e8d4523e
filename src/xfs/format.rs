//! On-disk codecs for the per-group btrees: short-form block headers
//! (V4 and V5 CRC variants) and the record/key formats for the
//! free-space, inode, reverse-mapping, and reference-count trees.
//! Everything is encoded big-endian.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};
use zerocopy::byteorder::big_endian::{U16, U32, U64};

use crate::error::FxfsrError;
use crate::xfs::geometry::{BtreeKind, FsGeometry};
use crate::xfs::sb::compute_crc;
use crate::xfs::types::{XfsAgblock, XfsAgnumber};

// Short-form btree block magics, V4 / V5 pairs.
pub const XFS_ABTB_MAGIC: u32 = 0x41425442; // "ABTB"
pub const XFS_ABTB_CRC_MAGIC: u32 = 0x41423342; // "AB3B"
pub const XFS_ABTC_MAGIC: u32 = 0x41425443; // "ABTC"
pub const XFS_ABTC_CRC_MAGIC: u32 = 0x41423343; // "AB3C"
pub const XFS_IBT_MAGIC: u32 = 0x49414254; // "IABT"
pub const XFS_IBT_CRC_MAGIC: u32 = 0x49414233; // "IAB3"
pub const XFS_FIBT_MAGIC: u32 = 0x46494254; // "FIBT"
pub const XFS_FIBT_CRC_MAGIC: u32 = 0x46494233; // "FIB3"
pub const XFS_RMAP_CRC_MAGIC: u32 = 0x524d4233; // "RMB3"
pub const XFS_REFC_CRC_MAGIC: u32 = 0x52334643; // "R3FC"

/// Sibling terminator in short-pointer btree blocks.
pub const NULLAGBLOCK: u32 = u32::MAX;

/// Byte offset of `bb_crc` in the V5 short-form header.
pub const BTREE_SBLOCK_CRC_OFF: usize = 52;

/// V4 short-form btree block header (16 bytes).
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone)]
#[repr(C)]
pub struct XfsBtreeShortBlock {
    pub bb_magic: U32,
    pub bb_level: U16,
    pub bb_numrecs: U16,
    pub bb_leftsib: U32,
    pub bb_rightsib: U32,
}

/// V5 short-form btree block header (56 bytes).
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone)]
#[repr(C)]
pub struct XfsBtreeShortBlockCrc {
    pub bb_magic: U32,
    pub bb_level: U16,
    pub bb_numrecs: U16,
    pub bb_leftsib: U32,
    pub bb_rightsib: U32,
    pub bb_blkno: U64,
    pub bb_lsn: U64,
    pub bb_uuid: [u8; 16],
    pub bb_owner: U32,
    pub bb_crc: U32,
}

/// Magic for a btree kind, per format version.
pub fn btree_magic(kind: BtreeKind, v5: bool) -> Result<u32, FxfsrError> {
    Ok(match (kind, v5) {
        (BtreeKind::Bno, false) => XFS_ABTB_MAGIC,
        (BtreeKind::Bno, true) => XFS_ABTB_CRC_MAGIC,
        (BtreeKind::Cnt, false) => XFS_ABTC_MAGIC,
        (BtreeKind::Cnt, true) => XFS_ABTC_CRC_MAGIC,
        (BtreeKind::Ino, false) => XFS_IBT_MAGIC,
        (BtreeKind::Ino, true) => XFS_IBT_CRC_MAGIC,
        (BtreeKind::Fino, false) => XFS_FIBT_MAGIC,
        (BtreeKind::Fino, true) => XFS_FIBT_CRC_MAGIC,
        (BtreeKind::Rmap, true) => XFS_RMAP_CRC_MAGIC,
        (BtreeKind::Refc, true) => XFS_REFC_CRC_MAGIC,
        (BtreeKind::Rmap | BtreeKind::Refc, false) => {
            return Err(FxfsrError::NotSupported(
                format!("{kind:?} btree requires a V5 filesystem"),
            ));
        }
    })
}

/// Size of the short-form header for the format version.
pub fn short_hdr_size(v5: bool) -> usize {
    if v5 {
        std::mem::size_of::<XfsBtreeShortBlockCrc>()
    } else {
        std::mem::size_of::<XfsBtreeShortBlock>()
    }
}

/// Initialize a short-form btree block header in `buf`, zero-filling the
/// record area. `daddr` is the absolute 512-byte sector address of the
/// block (stored in `bb_blkno` on V5).
#[allow(clippy::too_many_arguments)]
pub fn init_short_block(
    buf: &mut [u8],
    geo: &FsGeometry,
    uuid: &[u8; 16],
    kind: BtreeKind,
    agno: XfsAgnumber,
    daddr: u64,
    level: u16,
    leftsib: XfsAgblock,
    rightsib: XfsAgblock,
) -> Result<(), FxfsrError> {
    buf.fill(0);
    let magic = btree_magic(kind, geo.is_v5())?;
    if geo.is_v5() {
        let hdr = XfsBtreeShortBlockCrc {
            bb_magic: magic.into(),
            bb_level: level.into(),
            bb_numrecs: 0.into(),
            bb_leftsib: leftsib.into(),
            bb_rightsib: rightsib.into(),
            bb_blkno: daddr.into(),
            bb_lsn: 0.into(),
            bb_uuid: *uuid,
            bb_owner: agno.into(),
            bb_crc: 0.into(),
        };
        buf[..std::mem::size_of::<XfsBtreeShortBlockCrc>()].copy_from_slice(hdr.as_bytes());
    } else {
        let hdr = XfsBtreeShortBlock {
            bb_magic: magic.into(),
            bb_level: level.into(),
            bb_numrecs: 0.into(),
            bb_leftsib: leftsib.into(),
            bb_rightsib: rightsib.into(),
        };
        buf[..std::mem::size_of::<XfsBtreeShortBlock>()].copy_from_slice(hdr.as_bytes());
    }
    Ok(())
}

/// Patch `bb_numrecs` after records have been appended.
pub fn set_numrecs(buf: &mut [u8], numrecs: u16) {
    buf[6..8].copy_from_slice(&numrecs.to_be_bytes());
}

/// Stamp the V5 block CRC. Must be the last mutation of the block.
pub fn stamp_block_crc(buf: &mut [u8]) {
    let crc = compute_crc(buf, BTREE_SBLOCK_CRC_OFF);
    buf[BTREE_SBLOCK_CRC_OFF..BTREE_SBLOCK_CRC_OFF + 4].copy_from_slice(&crc.to_be_bytes());
}

/// Parse a short-form header, validating magic and (V5) owner.
pub fn parse_short_block(
    buf: &[u8],
    geo: &FsGeometry,
    kind: BtreeKind,
    agno: XfsAgnumber,
) -> Result<(u16, u16), FxfsrError> {
    let magic = btree_magic(kind, geo.is_v5())?;
    if geo.is_v5() {
        let hdr = XfsBtreeShortBlockCrc::ref_from_prefix(buf)
            .map_err(|_| FxfsrError::Parse("buffer too small for btree header"))?
            .0;
        if hdr.bb_magic.get() != magic {
            return Err(FxfsrError::BadMagic("btree block"));
        }
        if hdr.bb_owner.get() != agno {
            return Err(FxfsrError::Parse("btree block owner mismatch"));
        }
        Ok((hdr.bb_level.get(), hdr.bb_numrecs.get()))
    } else {
        let hdr = XfsBtreeShortBlock::ref_from_prefix(buf)
            .map_err(|_| FxfsrError::Parse("buffer too small for btree header"))?
            .0;
        if hdr.bb_magic.get() != magic {
            return Err(FxfsrError::BadMagic("btree block"));
        }
        Ok((hdr.bb_level.get(), hdr.bb_numrecs.get()))
    }
}

// ---------------------------------------------------------------------------
// Record formats
// ---------------------------------------------------------------------------

/// Free-space record: one free extent (8 bytes). The bno and cnt trees
/// store the same record sorted by different fields.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C)]
pub struct XfsAllocRec {
    pub ar_startblock: U32,
    pub ar_blockcount: U32,
}

/// Inode B-tree record (16 bytes): one chunk of 64 inodes.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C)]
pub struct XfsInobtRec {
    pub ir_startino: U32,
    pub ir_holemask: U16,
    pub ir_count: u8,
    pub ir_freecount: u8,
    pub ir_free: U64,
}

impl XfsInobtRec {
    /// Check if inode at index `i` (0..63) is allocated (not free).
    pub fn is_allocated(&self, i: u32) -> bool {
        (self.ir_free.get() & (1u64 << i)) == 0
    }

    /// Check if index `i` falls in a sparse hole of the chunk.
    pub fn is_hole(&self, i: u32) -> bool {
        (self.ir_holemask.get() & (1u16 << (i / 4))) != 0
    }

    /// Starting AG-relative inode number.
    pub fn start_ino(&self) -> u32 {
        self.ir_startino.get()
    }
}

// Flag bits packed into the top of the rmap offset word.
pub const XFS_RMAP_OFF_ATTR_FORK: u64 = 1 << 63;
pub const XFS_RMAP_OFF_BMBT_BLOCK: u64 = 1 << 62;
pub const XFS_RMAP_OFF_UNWRITTEN: u64 = 1 << 61;
pub const XFS_RMAP_OFF_MASK: u64 = (1 << 54) - 1;

/// Reverse-mapping record (24 bytes). Flags live in the top bits of
/// `rm_offset`; see `crate::rmap` for the incore form.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C)]
pub struct XfsRmapRec {
    pub rm_startblock: U32,
    pub rm_blockcount: U32,
    pub rm_owner: U64,
    pub rm_offset: U64,
}

/// Reverse-mapping key (20 bytes). Node blocks of this overlapping
/// interval tree carry a low and a high key per entry.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C)]
pub struct XfsRmapKey {
    pub rm_startblock: U32,
    pub rm_owner: U64,
    pub rm_offset: U64,
}

/// Domain bit in the refcount start block: set for CoW staging records.
pub const XFS_REFC_COWFLAG: u32 = 1 << 31;

/// Reference-count record (12 bytes).
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C)]
pub struct XfsRefcountRec {
    pub rc_startblock: U32,
    pub rc_blockcount: U32,
    pub rc_refcount: U32,
}

/// Synthetic rmap owner tags. Real owners are inode numbers, which are
/// always far above this range.
pub const XFS_RMAP_OWN_NULL: u64 = u64::MAX;
pub const XFS_RMAP_OWN_UNKNOWN: u64 = u64::MAX - 1;
pub const XFS_RMAP_OWN_FS: u64 = u64::MAX - 2;
pub const XFS_RMAP_OWN_LOG: u64 = u64::MAX - 3;
pub const XFS_RMAP_OWN_AG: u64 = u64::MAX - 4;
pub const XFS_RMAP_OWN_INOBT: u64 = u64::MAX - 5;
pub const XFS_RMAP_OWN_INODES: u64 = u64::MAX - 6;
pub const XFS_RMAP_OWN_REFC: u64 = u64::MAX - 7;
pub const XFS_RMAP_OWN_COW: u64 = u64::MAX - 8;
