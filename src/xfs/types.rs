/// XFS inode number (absolute, 64-bit).
pub type XfsIno = u64;

/// XFS AG number.
pub type XfsAgnumber = u32;

/// XFS AG-relative block number.
pub type XfsAgblock = u32;

/// XFS AG-relative inode number (within the AG).
pub type XfsAgino = u32;

/// XFS filesystem block number (absolute, 64-bit).
pub type XfsFsblock = u64;

/// XFS file offset in filesystem blocks.
pub type XfsFileoff = u64;

/// XFS block count.
pub type XfsFilblks = u64;

/// XFS extent length in blocks.
pub type XfsExtlen = u32;

/// XFS realtime group number.
pub type XfsRgnumber = u32;

/// XFS RTG-relative block number.
pub type XfsRgblock = u32;

/// XFS realtime device block number (absolute).
pub type XfsRtblock = u64;

/// XFS realtime extent number.
pub type XfsRtxnum = u64;

/// Disk address in 512-byte sectors.
pub type XfsDaddr = u64;

/// Longest extent a single mapping record can describe (21-bit length field).
pub const MAX_EXTENT_LEN: XfsFilblks = (1 << 21) - 1;

/// Largest value the on-disk refcount field can hold.
pub const MAX_REFCOUNT: u64 = u32::MAX as u64;

/// A group identifier in one of the two disjoint group spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GroupNo {
    /// Data-device allocation group.
    Ag(XfsAgnumber),
    /// Realtime group.
    Rtg(XfsRgnumber),
}

impl GroupNo {
    pub fn index(&self) -> u32 {
        match self {
            Self::Ag(n) | Self::Rtg(n) => *n,
        }
    }

    pub fn is_realtime(&self) -> bool {
        matches!(self, Self::Rtg(_))
    }
}

impl std::fmt::Display for GroupNo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ag(n) => write!(f, "AG {n}"),
            Self::Rtg(n) => write!(f, "rtgroup {n}"),
        }
    }
}
