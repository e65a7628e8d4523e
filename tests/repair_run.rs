mod common;

use std::os::unix::fs::FileExt;

use common::{superblock_v5, write_image};
use fxfsr::parent::{Dirent, DirentWalker, PptrAction, PptrSource};
use fxfsr::xfs::agheaders::XfsAgi;
use fxfsr::xfs::format::{NULLAGBLOCK, XFS_IBT_CRC_MAGIC, XfsBtreeShortBlockCrc, XfsInobtRec};
use fxfsr::xfs::sb::{XFS_SB_FEAT_INCOMPAT_PARENT, XfsDsb};
use fxfsr::{ExitCode, FxfsrError, ParentVerifyHooks, RepairFlags, run_repair};
use tempfile::NamedTempFile;
use zerocopy::{FromZeros, IntoBytes};

/// One AG of 256 blocks holding a single inode chunk whose first slot
/// is allocated: enough structure for the whole pipeline to run.
fn build_fs_image() -> (NamedTempFile, XfsDsb) {
    let mut sb = superblock_v5(1, 256);
    sb.sb_features_incompat = XFS_SB_FEAT_INCOMPAT_PARENT.into();
    let image = write_image(&sb, 0);
    let file = image.as_file();

    // AGI pointing at a single-block inode btree at AG block 5.
    let mut agi = XfsAgi::new_zeroed();
    agi.agi_magicnum = fxfsr::xfs::agheaders::XFS_AGI_MAGIC.into();
    agi.agi_versionnum = 1.into();
    agi.agi_seqno = 0.into();
    agi.agi_length = 256.into();
    agi.agi_root = 5.into();
    agi.agi_level = 1.into();
    let mut sector = vec![0u8; 512];
    agi.write_to(&mut sector, true).unwrap();
    file.write_all_at(&sector, 1024).unwrap();

    // Inobt leaf: one chunk at agino 64, slot 0 allocated.
    let mut hdr = XfsBtreeShortBlockCrc::new_zeroed();
    hdr.bb_magic = XFS_IBT_CRC_MAGIC.into();
    hdr.bb_level = 0.into();
    hdr.bb_numrecs = 1.into();
    hdr.bb_leftsib = NULLAGBLOCK.into();
    hdr.bb_rightsib = NULLAGBLOCK.into();
    let rec = XfsInobtRec {
        ir_startino: 64.into(),
        ir_holemask: 0.into(),
        ir_count: 64,
        ir_freecount: 63,
        ir_free: (!1u64).into(),
    };
    let mut block = vec![0u8; 4096];
    block[..hdr.as_bytes().len()].copy_from_slice(hdr.as_bytes());
    block[56..72].copy_from_slice(rec.as_bytes());
    file.write_all_at(&block, 5 * 4096).unwrap();

    // The allocated dinode: a regular file in extents format with no
    // mappings, at slot 0 of the chunk's first block.
    let mut dinode = vec![0u8; 512];
    dinode[0..2].copy_from_slice(&0x494eu16.to_be_bytes());
    dinode[2..4].copy_from_slice(&0o100644u16.to_be_bytes());
    dinode[4] = 3; // version
    dinode[5] = 2; // extents format
    file.write_all_at(&dinode, 8 * 4096).unwrap();

    (image, sb)
}

/// Dirent walker fed from a fixed list.
struct VecWalker {
    ents: Vec<(u64, u32, u64, Vec<u8>)>,
}

impl DirentWalker for VecWalker {
    fn walk(
        &mut self,
        visit: &mut dyn FnMut(&Dirent<'_>) -> Result<(), FxfsrError>,
    ) -> Result<(), FxfsrError> {
        for (dir_ino, dir_gen, child_ino, name) in &self.ents {
            visit(&Dirent {
                dir_ino: *dir_ino,
                dir_gen: *dir_gen,
                child_ino: *child_ino,
                name,
            })?;
        }
        Ok(())
    }
}

/// Attr reader for files with no parent pointers at all.
struct EmptySource;

impl PptrSource for EmptySource {
    fn pptrs(&mut self, _ino: u64) -> Result<Vec<fxfsr::parent::RawPptr>, FxfsrError> {
        Ok(Vec::new())
    }
}

#[test]
fn repair_run_reaches_the_parent_pointer_phase() {
    let (image, _sb) = build_fs_image();

    let mut walker = VecWalker {
        ents: vec![(100, 5, 64, b"kid".to_vec())],
    };
    let source_factory =
        || -> Box<dyn PptrSource + Send> { Box::new(EmptySource) };
    let mut applied: Vec<PptrAction> = Vec::new();
    let mut apply = |action: &PptrAction| {
        applied.push(action.clone());
        Ok(())
    };

    let exit = run_repair(
        image.path().to_str().unwrap(),
        &RepairFlags::default(),
        Some(ParentVerifyHooks {
            walker: &mut walker,
            pptr_source: &source_factory,
            apply: &mut apply,
        }),
    )
    .unwrap();

    assert_eq!(exit, ExitCode::Repaired);
    assert_eq!(applied.len(), 1);
    assert!(matches!(
        &applied[0],
        PptrAction::Add { ino: 64, parent_ino: 100, parent_gen: 5, name } if name == b"kid"
    ));

    // The rebuilt AGI reflects the chunk the scan found.
    let mut sector = vec![0u8; 512];
    image.as_file().read_exact_at(&mut sector, 1024).unwrap();
    let agi = XfsAgi::from_buf(&sector, 0).unwrap();
    assert_eq!(agi.agi_count.get(), 64);
    assert_eq!(agi.agi_freecount.get(), 63);
}

#[test]
fn no_modify_run_reports_without_touching_the_image() {
    let (image, _sb) = build_fs_image();
    let mut before = vec![0u8; 256 * 4096];
    image.as_file().read_exact_at(&mut before, 0).unwrap();

    let mut walker = VecWalker {
        ents: vec![(100, 5, 64, b"kid".to_vec())],
    };
    let source_factory =
        || -> Box<dyn PptrSource + Send> { Box::new(EmptySource) };
    let mut applied = 0usize;
    let mut apply = |_: &PptrAction| {
        applied += 1;
        Ok(())
    };

    let flags = RepairFlags { no_modify: true, ..Default::default() };
    let exit = run_repair(
        image.path().to_str().unwrap(),
        &flags,
        Some(ParentVerifyHooks {
            walker: &mut walker,
            pptr_source: &source_factory,
            apply: &mut apply,
        }),
    )
    .unwrap();

    assert_eq!(exit, ExitCode::Clean);
    assert_eq!(applied, 0);
    let mut after = vec![0u8; 256 * 4096];
    image.as_file().read_exact_at(&mut after, 0).unwrap();
    assert_eq!(before, after, "verify-only run wrote to the image");
}
