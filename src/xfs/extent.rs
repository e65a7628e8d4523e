use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};
use zerocopy::byteorder::big_endian::U64;

use crate::error::FxfsrError;
use crate::xfs::types::{XfsFilblks, XfsFileoff, XfsFsblock};

/// On-disk XFS extent record (packed 128-bit / 16-byte).
///
/// Bit layout (big-endian, 128 bits total):
/// - Bit 127:        extent flag (1 = unwritten)
/// - Bits 126..73:   logical file offset (54 bits)
/// - Bits 72..21:    absolute filesystem block number (52 bits)
/// - Bits 20..0:     block count (21 bits)
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C)]
pub struct XfsBmbtRec {
    pub l0: U64,
    pub l1: U64,
}

/// Unpacked extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub logical_offset: XfsFileoff,
    pub start_block: XfsFsblock,
    pub block_count: XfsFilblks,
    pub is_unwritten: bool,
}

impl XfsBmbtRec {
    pub fn unpack(&self) -> Extent {
        let l0 = self.l0.get();
        let l1 = self.l1.get();
        Extent {
            is_unwritten: (l0 >> 63) != 0,
            logical_offset: (l0 >> 9) & 0x003F_FFFF_FFFF_FFFF,
            start_block: ((l0 & 0x1FF) << 43) | (l1 >> 21),
            block_count: l1 & 0x001F_FFFF,
        }
    }

    pub fn pack(ext: &Extent) -> Self {
        let mut l0 = (ext.logical_offset & 0x003F_FFFF_FFFF_FFFF) << 9;
        l0 |= (ext.start_block >> 43) & 0x1FF;
        if ext.is_unwritten {
            l0 |= 1 << 63;
        }
        let l1 = ((ext.start_block & 0x7FF_FFFF_FFFF) << 21) | (ext.block_count & 0x001F_FFFF);
        XfsBmbtRec { l0: l0.into(), l1: l1.into() }
    }
}

/// Extract an inline extent list from an inode's data fork
/// (FMT_EXTENTS format). `nextents` is the extent count from the core.
pub fn parse_extent_list(fork_buf: &[u8], nextents: u64) -> Result<Vec<Extent>, FxfsrError> {
    let rec_size = std::mem::size_of::<XfsBmbtRec>();
    let mut extents = Vec::with_capacity(nextents as usize);

    for i in 0..nextents as usize {
        let start = i * rec_size;
        if start + rec_size > fork_buf.len() {
            return Err(FxfsrError::Parse("extent record out of bounds"));
        }
        let rec = XfsBmbtRec::ref_from_prefix(&fork_buf[start..])
            .map_err(|_| FxfsrError::Parse("failed to parse extent record"))?
            .0;
        extents.push(rec.unpack());
    }

    Ok(extents)
}
