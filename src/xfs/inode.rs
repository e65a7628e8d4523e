use zerocopy::{FromBytes, Immutable, KnownLayout};
use zerocopy::byteorder::big_endian::{U16, U32, U64};

use crate::error::FxfsrError;
use crate::xfs::types::{XfsFilblks, XfsFileoff, XfsFsblock, XfsIno};

/// Inode magic: "IN"
const XFS_DINODE_MAGIC: u16 = 0x494e;

/// Inode data fork format codes.
pub const XFS_DINODE_FMT_DEV: u8 = 0;
pub const XFS_DINODE_FMT_LOCAL: u8 = 1;
pub const XFS_DINODE_FMT_EXTENTS: u8 = 2;
pub const XFS_DINODE_FMT_BTREE: u8 = 3;
pub const XFS_DINODE_FMT_UUID: u8 = 4;

/// S_IFMT mask.
pub const S_IFMT: u16 = 0o170000;
pub const S_IFDIR: u16 = 0o040000;
pub const S_IFREG: u16 = 0o100000;
pub const S_IFLNK: u16 = 0o120000;

// di_flags bits we act on.
pub const XFS_DIFLAG_REALTIME: u16 = 1 << 0;
// di_flags2 bits.
pub const XFS_DIFLAG2_REFLINK: u64 = 1 << 1;

/// On-disk XFS dinode core (V4 layout). V5 extends this.
/// The V4 core is 96 bytes; V5 core is 176 bytes.
#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct XfsDinodeCore {
    pub di_magic: U16,
    pub di_mode: U16,
    pub di_version: u8,
    pub di_format: u8,
    pub di_onlink: U16,
    pub di_uid: U32,
    pub di_gid: U32,
    pub di_nlink: U32,
    pub di_projid: U16,
    pub di_projid_hi: U16,
    pub di_pad: [u8; 6],
    pub di_flushiter: U16,
    pub di_atime: XfsTimestamp,
    pub di_mtime: XfsTimestamp,
    pub di_ctime: XfsTimestamp,
    pub di_size: U64,
    pub di_nblocks: U64,
    pub di_extsize: U32,
    pub di_nextents: U32,
    pub di_anextents: U16,
    pub di_forkoff: u8,
    pub di_aformat: u8,
    pub di_dmevmask: U32,
    pub di_dmstate: U16,
    pub di_flags: U16,
    pub di_gen: U32,
}

/// On-disk XFS timestamp.
#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct XfsTimestamp {
    pub t_sec: U32,
    pub t_nsec: U32,
}

/// Size of the V4 dinode core.
pub const V4_CORE_SIZE: usize = 96;

/// Size of the V5 dinode core.
pub const V5_CORE_SIZE: usize = 176;

/// Byte offset of di_flags2 within a V5 inode (past next_unlinked,
/// crc, changecount, and lsn).
const V5_FLAGS2_OFF: usize = 120;

/// Parsed dinode summary from the scan.
pub struct DinodeInfo {
    pub ino: XfsIno,
    pub mode: u16,
    pub format: u8,
    pub aformat: u8,
    pub size: u64,
    pub nlink: u32,
    pub generation: u32,
    pub nextents: u64,
    pub anextents: u64,
    pub nblocks: u64,
    pub is_realtime: bool,
    pub is_reflink: bool,
    /// Byte offset of the data fork within the on-disk inode.
    pub data_fork_offset: usize,
    /// Byte offset of the attr fork, if present.
    pub attr_fork_offset: Option<usize>,
    pub data_fork_size: usize,
    pub attr_fork_size: usize,
}

impl DinodeInfo {
    pub fn is_dir(&self) -> bool {
        (self.mode & S_IFMT) == S_IFDIR
    }

    pub fn is_regular(&self) -> bool {
        (self.mode & S_IFMT) == S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        (self.mode & S_IFMT) == S_IFLNK
    }
}

/// Parse a dinode core from `buf` starting at byte 0.
/// `ino` is the absolute inode number. `is_v5` selects the core size;
/// `has_nrext64` selects the wide extent-counter layout.
pub fn parse_dinode(
    buf: &[u8],
    ino: XfsIno,
    is_v5: bool,
    has_nrext64: bool,
    inode_size: u16,
) -> Result<DinodeInfo, FxfsrError> {
    let core = XfsDinodeCore::ref_from_prefix(buf)
        .map_err(|_| FxfsrError::Parse("buffer too small for dinode core"))?
        .0;

    if core.di_magic.get() != XFS_DINODE_MAGIC {
        return Err(FxfsrError::BadMagic("dinode"));
    }

    let core_size = if is_v5 { V5_CORE_SIZE } else { V4_CORE_SIZE };

    // With NREXT64, di_nextents (offset 76) is zeroed; the data fork
    // extent count is the U64 at inode byte offset 24 (overlapping the
    // old di_pad + di_flushiter fields) and the attr count the U32 at 76.
    let (nextents, anextents) = if has_nrext64 {
        if buf.len() < 32 {
            return Err(FxfsrError::Parse("buffer too small for nrext64 extent count"));
        }
        let big = u64::from_be_bytes(buf[24..32].try_into().unwrap());
        let attr = u32::from_be_bytes(buf[76..80].try_into().unwrap());
        (big & 0x0000_FFFF_FFFF_FFFF, attr as u64)
    } else {
        (core.di_nextents.get() as u64, core.di_anextents.get() as u64)
    };

    let is_reflink = if is_v5 && buf.len() >= V5_FLAGS2_OFF + 8 {
        let flags2 = u64::from_be_bytes(buf[V5_FLAGS2_OFF..V5_FLAGS2_OFF + 8].try_into().unwrap());
        (flags2 & XFS_DIFLAG2_REFLINK) != 0
    } else {
        false
    };

    // Fork layout: data fork from the core to the fork offset, attr
    // fork from there to the inode end. di_forkoff is in 8-byte units.
    let literal = inode_size as usize - core_size;
    let (data_size, attr_off) = if core.di_forkoff != 0 {
        let off = core.di_forkoff as usize * 8;
        if off >= literal {
            return Err(FxfsrError::Parse("attr fork offset beyond inode"));
        }
        (off, Some(core_size + off))
    } else {
        (literal, None)
    };

    Ok(DinodeInfo {
        ino,
        mode: core.di_mode.get(),
        format: core.di_format,
        aformat: core.di_aformat,
        size: core.di_size.get(),
        nlink: core.di_nlink.get(),
        generation: core.di_gen.get(),
        nextents,
        anextents,
        nblocks: core.di_nblocks.get(),
        is_realtime: (core.di_flags.get() & XFS_DIFLAG_REALTIME) != 0,
        is_reflink,
        data_fork_offset: core_size,
        attr_fork_offset: attr_off,
        data_fork_size: data_size,
        attr_fork_size: attr_off.map_or(0, |o| inode_size as usize - o),
    })
}

// ---------------------------------------------------------------------------
// Incore model
// ---------------------------------------------------------------------------

/// Which fork of an inode an operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhichFork {
    Data,
    Attr,
    Cow,
}

/// Incore fork format after repair decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkFormat {
    Local,
    Extents,
    Btree,
}

/// A mapping returned by fork iteration. `start_block` of `None` means
/// a hole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BmapMapping {
    pub offset: XfsFileoff,
    pub start_block: Option<XfsFsblock>,
    pub block_count: XfsFilblks,
    pub unwritten: bool,
}

impl BmapMapping {
    pub fn is_hole(&self) -> bool {
        self.start_block.is_none()
    }

    pub fn is_real(&self) -> bool {
        self.start_block.is_some() && !self.unwritten
    }
}

/// One incore fork: a sorted, non-overlapping extent map.
#[derive(Debug, Clone, Default)]
pub struct InodeFork {
    pub format: Option<ForkFormat>,
    extents: Vec<crate::xfs::extent::Extent>,
}

impl InodeFork {
    pub fn new(format: ForkFormat) -> Self {
        InodeFork { format: Some(format), extents: Vec::new() }
    }

    pub fn extent_count(&self) -> u64 {
        self.extents.len() as u64
    }

    pub fn extents(&self) -> &[crate::xfs::extent::Extent] {
        &self.extents
    }

    /// Mapping state at `offset`: the extent covering it, or the hole
    /// reaching to the next extent (`block_count == 0` past EOF means an
    /// unbounded hole).
    pub fn lookup(&self, offset: XfsFileoff) -> BmapMapping {
        // First extent ending beyond the offset.
        let idx = self.extents.partition_point(|e| e.logical_offset + e.block_count <= offset);
        match self.extents.get(idx) {
            Some(e) if e.logical_offset <= offset => BmapMapping {
                offset,
                start_block: Some(e.start_block + (offset - e.logical_offset)),
                block_count: e.block_count - (offset - e.logical_offset),
                unwritten: e.is_unwritten,
            },
            Some(e) => BmapMapping {
                offset,
                start_block: None,
                block_count: e.logical_offset - offset,
                unwritten: false,
            },
            None => BmapMapping { offset, start_block: None, block_count: 0, unwritten: false },
        }
    }

    /// Remove the mapping for `[offset, offset+count)`, trimming any
    /// extents straddling the edges.
    pub fn unmap(&mut self, offset: XfsFileoff, count: XfsFilblks) {
        let end = offset + count;
        let mut out = Vec::with_capacity(self.extents.len());
        for e in self.extents.drain(..) {
            let e_end = e.logical_offset + e.block_count;
            if e_end <= offset || e.logical_offset >= end {
                out.push(e);
                continue;
            }
            if e.logical_offset < offset {
                out.push(crate::xfs::extent::Extent {
                    logical_offset: e.logical_offset,
                    start_block: e.start_block,
                    block_count: offset - e.logical_offset,
                    is_unwritten: e.is_unwritten,
                });
            }
            if e_end > end {
                out.push(crate::xfs::extent::Extent {
                    logical_offset: end,
                    start_block: e.start_block + (end - e.logical_offset),
                    block_count: e_end - end,
                    is_unwritten: e.is_unwritten,
                });
            }
        }
        self.extents = out;
    }

    /// Map `[offset, offset+count)` to the physical range at
    /// `start_block`, merging with adjacent compatible extents.
    pub fn map(
        &mut self,
        offset: XfsFileoff,
        start_block: XfsFsblock,
        count: XfsFilblks,
        unwritten: bool,
    ) {
        let idx = self.extents.partition_point(|e| e.logical_offset < offset);
        self.extents.insert(
            idx,
            crate::xfs::extent::Extent {
                logical_offset: offset,
                start_block,
                block_count: count,
                is_unwritten: unwritten,
            },
        );
        // Merge neighbors where both the logical and physical runs
        // continue and the state matches.
        let mut i = idx.saturating_sub(1);
        while i + 1 < self.extents.len() {
            let (a, b) = (self.extents[i], self.extents[i + 1]);
            if a.logical_offset + a.block_count == b.logical_offset
                && a.start_block + a.block_count == b.start_block
                && a.is_unwritten == b.is_unwritten
            {
                self.extents[i].block_count += b.block_count;
                self.extents.remove(i + 1);
            } else {
                i += 1;
            }
        }
    }
}

/// Incore inode used by the repair engine.
#[derive(Debug, Clone)]
pub struct Inode {
    pub ino: XfsIno,
    pub mode: u16,
    pub size: u64,
    pub generation: u32,
    pub nblocks: u64,
    pub is_realtime: bool,
    pub is_reflink: bool,
    pub data_fork: InodeFork,
    pub attr_fork: Option<InodeFork>,
    pub cow_fork: Option<InodeFork>,
}

impl Inode {
    pub fn new(ino: XfsIno, mode: u16) -> Self {
        Inode {
            ino,
            mode,
            size: 0,
            generation: 0,
            nblocks: 0,
            is_realtime: false,
            is_reflink: false,
            data_fork: InodeFork::new(ForkFormat::Extents),
            attr_fork: None,
            cow_fork: None,
        }
    }

    pub fn is_dir(&self) -> bool {
        (self.mode & S_IFMT) == S_IFDIR
    }

    pub fn is_regular(&self) -> bool {
        (self.mode & S_IFMT) == S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        (self.mode & S_IFMT) == S_IFLNK
    }

    pub fn fork(&self, which: WhichFork) -> Option<&InodeFork> {
        match which {
            WhichFork::Data => Some(&self.data_fork),
            WhichFork::Attr => self.attr_fork.as_ref(),
            WhichFork::Cow => self.cow_fork.as_ref(),
        }
    }

    pub fn fork_mut(&mut self, which: WhichFork) -> Option<&mut InodeFork> {
        match which {
            WhichFork::Data => Some(&mut self.data_fork),
            WhichFork::Attr => self.attr_fork.as_mut(),
            WhichFork::Cow => self.cow_fork.as_mut(),
        }
    }
}
