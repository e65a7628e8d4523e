//! Shared helpers for the integration tests: hand-built geometries and
//! synthetic filesystem images.

#![allow(dead_code)]

use std::io::Write;

use fxfsr::FsGeometry;
use fxfsr::xfs::agheaders::{XFS_AGF_MAGIC, XfsAgf};
use fxfsr::xfs::sb::{FormatVersion, XfsDsb};
use tempfile::NamedTempFile;
use zerocopy::FromZeros;

fn log2(v: u32) -> u8 {
    31 - v.leading_zeros() as u8
}

/// Small V4-style geometry with 4K blocks and 512-byte inodes.
pub fn geometry_v4(ag_count: u32, ag_blocks: u32) -> FsGeometry {
    FsGeometry {
        version: FormatVersion::V4,
        block_size: 4096,
        block_log: 12,
        sect_size: 512,
        sect_log: 9,
        ag_count,
        ag_blocks,
        ag_blk_log: log2(ag_blocks) + u8::from(!ag_blocks.is_power_of_two()),
        dblocks: ag_count as u64 * ag_blocks as u64,
        inode_size: 512,
        inode_log: 9,
        inodes_per_block: 8,
        inop_blog: 3,
        root_ino: 0,
        log_start: 0,
        log_blocks: 0,
        imax_pct: 25,
        rblocks: 0,
        rextents: 0,
        rext_size: 1,
        rext_log: 0,
        rbm_blocks: 0,
        rg_count: 0,
        rg_extents: 0,
        rg_blk_log: 0,
        has_ftype: true,
        has_finobt: false,
        has_rmapbt: false,
        has_reflink: false,
        has_nrext64: false,
        has_parent: false,
        has_metadir: false,
    }
}

/// Geometry with a realtime section for the converter tests.
pub fn geometry_rt(rbm_blocks: u32, rext_size: u32) -> FsGeometry {
    let mut geo = geometry_v4(1, 1024);
    geo.rblocks = 4096;
    geo.rextents = geo.rblocks / rext_size as u64;
    geo.rext_size = rext_size;
    geo.rbm_blocks = rbm_blocks;
    geo
}

/// A V5 superblock for upgrade tests. Counters and headers must be
/// written separately via `write_image`.
pub fn superblock_v5(ag_count: u32, ag_blocks: u32) -> XfsDsb {
    let mut sb = XfsDsb::new_zeroed();
    sb.sb_magicnum = 0x58465342.into();
    sb.sb_blocksize = 4096.into();
    sb.sb_dblocks = (ag_count as u64 * ag_blocks as u64).into();
    sb.sb_agblocks = ag_blocks.into();
    sb.sb_agcount = ag_count.into();
    sb.sb_logblocks = 8192.into();
    sb.sb_versionnum = 5.into();
    sb.sb_sectsize = 512.into();
    sb.sb_inodesize = 512.into();
    sb.sb_inopblock = 8.into();
    sb.sb_blocklog = 12;
    sb.sb_sectlog = 9;
    sb.sb_inodelog = 9;
    sb.sb_inopblog = 3;
    sb.sb_agblklog = log2(ag_blocks) + u8::from(!ag_blocks.is_power_of_two());
    sb.sb_rextsize = 1.into();
    sb.sb_imax_pct = 25;
    sb
}

/// Write a sparse image file: superblock in AG 0 plus one AGF per AG
/// carrying `freeblks`. Returns the open temp file (keeps the path
/// alive).
pub fn write_image(sb: &XfsDsb, freeblks: u32) -> NamedTempFile {
    let geo = FsGeometry::from_sb(sb).expect("test superblock is well formed");
    let mut file = NamedTempFile::new().expect("create image");
    let size = geo.dblocks * geo.block_size as u64;
    file.as_file().set_len(size).expect("size image");

    let mut sector = vec![0u8; geo.sect_size as usize];
    sb.write_to(&mut sector).expect("encode superblock");
    file.as_file_mut()
        .write_all(&sector)
        .expect("write superblock");

    for agno in 0..geo.ag_count {
        let mut agf = XfsAgf::new_zeroed();
        agf.agf_magicnum = XFS_AGF_MAGIC.into();
        agf.agf_versionnum = 1.into();
        agf.agf_seqno = agno.into();
        agf.agf_length = geo.ag_size(agno).into();
        agf.agf_freeblks = freeblks.into();
        agf.agf_longest = freeblks.into();
        let mut sector = vec![0u8; geo.sect_size as usize];
        agf.write_to(&mut sector, geo.is_v5()).expect("encode AGF");
        use std::os::unix::fs::FileExt;
        file.as_file()
            .write_all_at(&sector, geo.agf_byte_offset(agno))
            .expect("write AGF");
    }
    file
}
