mod common;

use common::{geometry_rt, geometry_v4};
use fxfsr::FxfsrError;
use fxfsr::xfs::addr::{AddrInput, AddrType, convert};

fn input(ty: AddrType, value: u64) -> AddrInput {
    AddrInput::new(ty, value)
}

#[test]
fn ag_components_compose_into_an_inode_number() {
    let geo = geometry_v4(4, 1024);
    let ino = convert(
        &geo,
        &[
            input(AddrType::Agnumber, 2),
            input(AddrType::Agblock, 5),
            input(AddrType::Inoidx, 3),
        ],
        AddrType::Ino,
    )
    .unwrap();
    // (2 * 1024 + 5) inode-bearing blocks of 8 inodes each, slot 3.
    assert_eq!(ino, (2 * 1024 + 5) * 8 + 3);
}

#[test]
fn inode_number_round_trips_through_bytes() {
    let geo = geometry_v4(4, 1024);
    let ino = 16427u64;
    let bytes = convert(&geo, &[input(AddrType::Ino, ino)], AddrType::Byte).unwrap();
    let back = convert(&geo, &[input(AddrType::Byte, bytes)], AddrType::Ino).unwrap();
    assert_eq!(back, ino);
}

#[test]
fn fsblock_round_trips_for_every_ag() {
    let geo = geometry_v4(4, 1000); // deliberately not a power of two
    for agno in 0..4u64 {
        let fsb = convert(
            &geo,
            &[input(AddrType::Agnumber, agno), input(AddrType::Agblock, 37)],
            AddrType::Fsblock,
        )
        .unwrap();
        let back_ag = convert(&geo, &[input(AddrType::Fsblock, fsb)], AddrType::Agnumber).unwrap();
        let back_blk = convert(&geo, &[input(AddrType::Fsblock, fsb)], AddrType::Agblock).unwrap();
        assert_eq!(back_ag, agno);
        assert_eq!(back_blk, 37);
    }
}

#[test]
fn byte_to_daddr_is_a_sector_shift() {
    let geo = geometry_v4(1, 1024);
    assert_eq!(
        convert(&geo, &[input(AddrType::Byte, 4096)], AddrType::Daddr).unwrap(),
        8
    );
}

#[test]
fn realtime_extent_to_block() {
    let geo = geometry_rt(8, 4);
    assert_eq!(
        convert(&geo, &[input(AddrType::Rtx, 3)], AddrType::Rtblock).unwrap(),
        12
    );
    assert_eq!(
        convert(&geo, &[input(AddrType::Rtblock, 13)], AddrType::Rtx).unwrap(),
        3
    );
}

#[test]
fn bitmap_block_and_word_compose() {
    let geo = geometry_rt(8, 4);
    let word = convert(
        &geo,
        &[input(AddrType::Rbmblock, 2), input(AddrType::Rbmword, 7)],
        AddrType::Rbmword,
    )
    .unwrap();
    assert_eq!(word, 7);
    let block = convert(
        &geo,
        &[input(AddrType::Rbmblock, 2), input(AddrType::Rbmword, 7)],
        AddrType::Rbmblock,
    )
    .unwrap();
    assert_eq!(block, 2);
}

#[test]
fn summary_level_zero_takes_the_direct_path() {
    let geo = geometry_rt(8, 4);
    let block = convert(
        &geo,
        &[input(AddrType::Rsumlog, 0), input(AddrType::Rsumblock, 5)],
        AddrType::Rsumblock,
    )
    .unwrap();
    assert_eq!(block, 5);

    // At higher levels the block index wraps within the bitmap length.
    let block = convert(
        &geo,
        &[input(AddrType::Rsumlog, 1), input(AddrType::Rsumblock, 5)],
        AddrType::Rsumblock,
    )
    .unwrap();
    assert_eq!(block, 5);
}

#[test]
fn summary_components_must_arrive_level_first() {
    let geo = geometry_rt(8, 4);
    let err = convert(
        &geo,
        &[input(AddrType::Rsumblock, 5), input(AddrType::Rsumlog, 1)],
        AddrType::Rsumblock,
    )
    .unwrap_err();
    assert!(matches!(err, FxfsrError::InvalidArgument(_)));
}

#[test]
fn incompatible_components_are_rejected() {
    let geo = geometry_v4(4, 1024);
    let err = convert(
        &geo,
        &[input(AddrType::Byte, 100), input(AddrType::Agblock, 5)],
        AddrType::Byte,
    )
    .unwrap_err();
    assert!(matches!(err, FxfsrError::InvalidArgument(_)));
}

#[test]
fn duplicate_components_are_rejected() {
    let geo = geometry_v4(4, 1024);
    let err = convert(
        &geo,
        &[input(AddrType::Agnumber, 1), input(AddrType::Agnumber, 2)],
        AddrType::Byte,
    )
    .unwrap_err();
    assert!(matches!(err, FxfsrError::InvalidArgument(_)));
}

#[test]
fn devices_cannot_be_mixed() {
    let geo = geometry_rt(8, 4);
    let err = convert(
        &geo,
        &[input(AddrType::Agblock, 5), input(AddrType::Rtblock, 9)],
        AddrType::Byte,
    )
    .unwrap_err();
    assert!(matches!(err, FxfsrError::InvalidArgument(_)));

    let err = convert(&geo, &[input(AddrType::Rtblock, 9)], AddrType::Agblock).unwrap_err();
    assert!(matches!(err, FxfsrError::InvalidArgument(_)));
}
