use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};
use zerocopy::byteorder::big_endian::{U16, U32, U64};

use crate::error::FxfsrError;

/// XFS superblock magic: "XFSB"
pub const XFS_SB_MAGIC: u32 = 0x58465342;

/// Byte offset of `sb_crc` within the on-disk superblock.
pub const XFS_SB_CRC_OFF: usize = 224;

// V4 `sb_features2` bits.
pub const XFS_SB_VERSION2_LAZYSBCOUNT: u32 = 0x0002;
pub const XFS_SB_VERSION2_ATTR2: u32 = 0x0008;
pub const XFS_SB_VERSION2_PROJID32: u32 = 0x0080;
pub const XFS_SB_VERSION2_CRC: u32 = 0x0100;
pub const XFS_SB_VERSION2_FTYPE: u32 = 0x0200;

// V5 read-only compatible feature bits.
pub const XFS_SB_FEAT_RO_COMPAT_FINOBT: u32 = 1 << 0;
pub const XFS_SB_FEAT_RO_COMPAT_RMAPBT: u32 = 1 << 1;
pub const XFS_SB_FEAT_RO_COMPAT_REFLINK: u32 = 1 << 2;
pub const XFS_SB_FEAT_RO_COMPAT_INOBTCNT: u32 = 1 << 3;

// V5 incompatible feature bits.
pub const XFS_SB_FEAT_INCOMPAT_FTYPE: u32 = 1 << 0;
pub const XFS_SB_FEAT_INCOMPAT_SPINODES: u32 = 1 << 1;
pub const XFS_SB_FEAT_INCOMPAT_META_UUID: u32 = 1 << 2;
pub const XFS_SB_FEAT_INCOMPAT_BIGTIME: u32 = 1 << 3;
pub const XFS_SB_FEAT_INCOMPAT_NEEDSREPAIR: u32 = 1 << 4;
pub const XFS_SB_FEAT_INCOMPAT_NREXT64: u32 = 1 << 5;
pub const XFS_SB_FEAT_INCOMPAT_EXCHRANGE: u32 = 1 << 6;
pub const XFS_SB_FEAT_INCOMPAT_PARENT: u32 = 1 << 7;
pub const XFS_SB_FEAT_INCOMPAT_METADIR: u32 = 1 << 8;

/// On-disk XFS superblock, V4 body plus the V5 and metadir extensions
/// (288 bytes). Encoded big-endian.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone)]
#[repr(C)]
pub struct XfsDsb {
    pub sb_magicnum: U32,
    pub sb_blocksize: U32,
    pub sb_dblocks: U64,
    pub sb_rblocks: U64,
    pub sb_rextents: U64,
    pub sb_uuid: [u8; 16],
    pub sb_logstart: U64,
    pub sb_rootino: U64,
    pub sb_rbmino: U64,
    pub sb_rsumino: U64,
    pub sb_rextsize: U32,
    pub sb_agblocks: U32,
    pub sb_agcount: U32,
    pub sb_rbmblocks: U32,
    pub sb_logblocks: U32,
    pub sb_versionnum: U16,
    pub sb_sectsize: U16,
    pub sb_inodesize: U16,
    pub sb_inopblock: U16,
    pub sb_fname: [u8; 12],
    pub sb_blocklog: u8,
    pub sb_sectlog: u8,
    pub sb_inodelog: u8,
    pub sb_inopblog: u8,
    pub sb_agblklog: u8,
    pub sb_rextslog: u8,
    pub sb_inprogress: u8,
    pub sb_imax_pct: u8,
    pub sb_icount: U64,
    pub sb_ifree: U64,
    pub sb_fdblocks: U64,
    pub sb_frextents: U64,
    pub sb_uquotino: U64,
    pub sb_gquotino: U64,
    pub sb_qflags: U16,
    pub sb_flags: u8,
    pub sb_shared_vn: u8,
    pub sb_inoalignmt: U32,
    pub sb_unit: U32,
    pub sb_width: U32,
    pub sb_dirblklog: u8,
    pub sb_logsectlog: u8,
    pub sb_logsectsize: U16,
    pub sb_logsunit: U32,
    pub sb_features2: U32,
    pub sb_bad_features2: U32,
    // V5 fields.
    pub sb_features_compat: U32,
    pub sb_features_ro_compat: U32,
    pub sb_features_incompat: U32,
    pub sb_features_log_incompat: U32,
    pub sb_crc: U32,
    pub sb_spino_align: U32,
    pub sb_pquotino: U64,
    pub sb_lsn: U64,
    pub sb_meta_uuid: [u8; 16],
    // Metadir / rtgroups fields.
    pub sb_metadirino: U64,
    pub sb_rgcount: U32,
    pub sb_rgextents: U32,
    pub sb_rgblklog: u8,
    pub sb_pad: [u8; 7],
}

/// Which XFS format version we're dealing with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatVersion {
    V4,
    V5,
}

impl XfsDsb {
    /// Parse the superblock from the given buffer.
    pub fn from_buf(buf: &[u8]) -> Result<Self, FxfsrError> {
        let sb = XfsDsb::ref_from_prefix(buf)
            .map_err(|_| FxfsrError::Parse("buffer too small for superblock"))?
            .0;
        if sb.sb_magicnum.get() != XFS_SB_MAGIC {
            return Err(FxfsrError::BadMagic("superblock"));
        }
        Ok(sb.clone())
    }

    pub fn version(&self) -> FormatVersion {
        // V5 superblocks have version number 5 in the low nibble.
        if (self.sb_versionnum.get() & 0x000f) >= 5 {
            FormatVersion::V5
        } else {
            FormatVersion::V4
        }
    }

    pub fn has_crc(&self) -> bool {
        self.version() == FormatVersion::V5
    }

    pub fn has_ftype(&self) -> bool {
        self.version() == FormatVersion::V5
            || (self.sb_features2.get() & XFS_SB_VERSION2_FTYPE) != 0
    }

    pub fn has_finobt(&self) -> bool {
        (self.sb_features_ro_compat.get() & XFS_SB_FEAT_RO_COMPAT_FINOBT) != 0
    }

    pub fn has_rmapbt(&self) -> bool {
        (self.sb_features_ro_compat.get() & XFS_SB_FEAT_RO_COMPAT_RMAPBT) != 0
    }

    pub fn has_reflink(&self) -> bool {
        (self.sb_features_ro_compat.get() & XFS_SB_FEAT_RO_COMPAT_REFLINK) != 0
    }

    pub fn has_inobtcnt(&self) -> bool {
        (self.sb_features_ro_compat.get() & XFS_SB_FEAT_RO_COMPAT_INOBTCNT) != 0
    }

    pub fn has_bigtime(&self) -> bool {
        (self.sb_features_incompat.get() & XFS_SB_FEAT_INCOMPAT_BIGTIME) != 0
    }

    pub fn has_nrext64(&self) -> bool {
        (self.sb_features_incompat.get() & XFS_SB_FEAT_INCOMPAT_NREXT64) != 0
    }

    pub fn has_parent(&self) -> bool {
        (self.sb_features_incompat.get() & XFS_SB_FEAT_INCOMPAT_PARENT) != 0
    }

    pub fn has_metadir(&self) -> bool {
        (self.sb_features_incompat.get() & XFS_SB_FEAT_INCOMPAT_METADIR) != 0
    }

    pub fn has_rtgroups(&self) -> bool {
        self.has_metadir() && self.sb_rgcount.get() > 0
    }

    pub fn needs_repair(&self) -> bool {
        (self.sb_features_incompat.get() & XFS_SB_FEAT_INCOMPAT_NEEDSREPAIR) != 0
    }

    /// Verify the superblock CRC against the full sector it was read from.
    /// V4 superblocks carry no CRC and always pass.
    pub fn verify_crc(&self, sector: &[u8]) -> Result<(), FxfsrError> {
        if !self.has_crc() {
            return Ok(());
        }
        if compute_crc(sector, XFS_SB_CRC_OFF) != self.sb_crc.get() {
            return Err(FxfsrError::CrcMismatch("superblock"));
        }
        Ok(())
    }

    /// Serialize into `sector` (which must be at least one sector long and
    /// zero-filled past the struct) and stamp the CRC for V5.
    pub fn write_to(&self, sector: &mut [u8]) -> Result<(), FxfsrError> {
        let raw = self.as_bytes();
        if sector.len() < raw.len() {
            return Err(FxfsrError::Parse("superblock sector too small"));
        }
        sector[..raw.len()].copy_from_slice(raw);
        sector[raw.len()..].fill(0);
        if self.has_crc() {
            let crc = compute_crc(sector, XFS_SB_CRC_OFF);
            sector[XFS_SB_CRC_OFF..XFS_SB_CRC_OFF + 4].copy_from_slice(&crc.to_be_bytes());
        }
        Ok(())
    }
}

/// CRC32c over a metadata buffer with the 4-byte CRC field at `crc_off`
/// treated as zero. Used for both verification and stamping.
pub fn compute_crc(buf: &[u8], crc_off: usize) -> u32 {
    let mut crc = crc32c::crc32c(&buf[..crc_off]);
    crc = crc32c::crc32c_append(crc, &[0u8; 4]);
    crc32c::crc32c_append(crc, &buf[crc_off + 4..])
}
