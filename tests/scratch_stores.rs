use fxfsr::FxfsrError;
use fxfsr::io::bufcache::{BufCache, MemBufTarget};
use fxfsr::io::xfile::XFile;
use fxfsr::mem::bitmap::ExtentBitmap;
use fxfsr::mem::slab::{NameStore, Slab};
use fxfsr::parent::da_hashname;
use fxfsr::xfs::format::XfsRefcountRec;

fn refc(start: u32, len: u32, count: u32) -> XfsRefcountRec {
    XfsRefcountRec {
        rc_startblock: start.into(),
        rc_blockcount: len.into(),
        rc_refcount: count.into(),
    }
}

// ---------------------------------------------------------------------------
// XFile
// ---------------------------------------------------------------------------

#[test]
fn xfile_reads_back_what_was_written() {
    let mut xf = XFile::create("test payload").unwrap();
    xf.pwrite(b"hello scratch", 1 << 20).unwrap();
    let mut buf = [0u8; 13];
    xf.pread(&mut buf, 1 << 20).unwrap();
    assert_eq!(&buf, b"hello scratch");
}

#[test]
fn xfile_holes_read_as_zeroes() {
    let mut xf = XFile::create("test holes").unwrap();
    xf.pwrite(b"x", 1 << 20).unwrap();
    let mut buf = [0xffu8; 16];
    xf.pread(&mut buf, 1000).unwrap();
    assert_eq!(buf, [0u8; 16]);

    // Reads past the written size are also zero.
    let mut buf = [0xffu8; 16];
    xf.pread(&mut buf, 1 << 30).unwrap();
    assert_eq!(buf, [0u8; 16]);
}

#[test]
fn xfile_is_sparse() {
    let mut xf = XFile::create("test sparse").unwrap();
    xf.pwrite(b"end", 1 << 28).unwrap();
    let stat = xf.stat().unwrap();
    assert!(stat.size >= 1 << 28);
    assert!(stat.bytes_used < 1 << 20, "sparse file uses {} bytes", stat.bytes_used);
}

#[test]
fn punched_ranges_read_back_zero() {
    let mut xf = XFile::create("test punch").unwrap();
    xf.pwrite(&[0xaa; 8192], 0).unwrap();
    xf.punch_hole(0, 4096).unwrap();

    let mut buf = [0u8; 4096];
    xf.pread(&mut buf, 0).unwrap();
    assert_eq!(buf, [0u8; 4096]);
    xf.pread(&mut buf, 4096).unwrap();
    assert_eq!(buf, [0xaa; 4096]);
}

// ---------------------------------------------------------------------------
// Buffer cache
// ---------------------------------------------------------------------------

fn first_byte_is_magic(buf: &[u8]) -> Result<(), FxfsrError> {
    if buf.first() == Some(&0xa5) {
        Ok(())
    } else {
        Err(FxfsrError::BadMagic("test block"))
    }
}

#[test]
fn dirty_buffers_survive_writeback() {
    let mut cache = BufCache::new(MemBufTarget::create("test cache").unwrap());
    {
        let buf = cache.get_buf(8, 512).unwrap();
        buf.data_mut()[0] = 0xa5;
        buf.data_mut()[511] = 0x5a;
    }
    cache.mark_dirty(8);
    cache.relse(8);
    cache.flush().unwrap();

    // Evict and read back through the backing store.
    cache.forget(8);
    let buf = cache.read_buf(8, 512, None).unwrap();
    assert_eq!(buf.data()[0], 0xa5);
    assert_eq!(buf.data()[511], 0x5a);
}

#[test]
fn clean_unreferenced_buffers_are_evicted() {
    let mut cache = BufCache::new(MemBufTarget::create("test cache").unwrap());
    cache.get_buf(8, 512).unwrap();
    assert!(cache.contains(8));
    cache.relse(8);
    assert!(!cache.contains(8));
}

#[test]
fn verifier_failure_reports_but_keeps_the_buffer() {
    let mut cache = BufCache::new(MemBufTarget::create("test cache").unwrap());
    // Back the range with bytes that fail the verifier.
    {
        let buf = cache.get_buf(16, 512).unwrap();
        buf.data_mut()[0] = 0x00;
    }
    cache.mark_dirty(16);
    cache.write_buf(16).unwrap();
    cache.relse(16);
    cache.forget(16);

    let err = cache.read_buf(16, 512, Some(first_byte_is_magic)).unwrap_err();
    assert!(matches!(err, FxfsrError::BadMagic(_)));
    // The bad bytes stay cached for inspection.
    assert!(cache.contains(16));
    let buf = cache.get_buf(16, 512).unwrap();
    assert_eq!(buf.data()[0], 0x00);
}

#[test]
fn writeback_runs_the_verifier() {
    let mut cache = BufCache::new(MemBufTarget::create("test cache").unwrap());
    {
        let buf = cache.get_buf(24, 512).unwrap();
        buf.data_mut()[0] = 0x00;
        buf.set_verifier(first_byte_is_magic);
    }
    cache.mark_dirty(24);
    assert!(cache.write_buf(24).is_err());

    let buf = cache.get_buf(24, 512).unwrap();
    buf.data_mut()[0] = 0xa5;
    cache.mark_dirty(24);
    cache.write_buf(24).unwrap();
}

// ---------------------------------------------------------------------------
// Slab
// ---------------------------------------------------------------------------

#[test]
fn slab_preserves_append_order() {
    let mut slab: Slab<XfsRefcountRec> = Slab::create("test slab").unwrap();
    for i in 0..100u32 {
        slab.push(&refc(i, 1, 2)).unwrap();
    }
    assert_eq!(slab.len(), 100);
    assert_eq!(slab.get(42).unwrap().rc_startblock.get(), 42);

    let mut cur = slab.cursor();
    let mut expect = 0u32;
    while let Some(rec) = cur.next().unwrap() {
        assert_eq!(rec.rc_startblock.get(), expect);
        expect += 1;
    }
    assert_eq!(expect, 100);
}

#[test]
fn slab_sorts_past_the_in_memory_run_size() {
    // Enough records to force spilled runs and a merge.
    const N: u32 = 100_000;
    let mut slab: Slab<XfsRefcountRec> = Slab::create("test big sort").unwrap();
    for i in 0..N {
        slab.push(&refc(N - 1 - i, 1, 2)).unwrap();
    }
    slab.sort(|a, b| a.rc_startblock.get().cmp(&b.rc_startblock.get()))
        .unwrap();

    let mut cur = slab.cursor();
    let mut expect = 0u32;
    while let Some(rec) = cur.next().unwrap() {
        assert_eq!(rec.rc_startblock.get(), expect);
        expect += 1;
    }
    assert_eq!(expect, N);
}

#[test]
fn slab_cursor_peek_does_not_consume() {
    let mut slab: Slab<XfsRefcountRec> = Slab::create("test peek").unwrap();
    slab.push(&refc(1, 1, 2)).unwrap();
    slab.push(&refc(2, 1, 2)).unwrap();

    let mut cur = slab.cursor();
    assert_eq!(cur.peek().unwrap().unwrap().rc_startblock.get(), 1);
    assert_eq!(cur.peek().unwrap().unwrap().rc_startblock.get(), 1);
    assert_eq!(cur.next().unwrap().unwrap().rc_startblock.get(), 1);
    assert_eq!(cur.next().unwrap().unwrap().rc_startblock.get(), 2);
    assert!(cur.next().unwrap().is_none());
}

// ---------------------------------------------------------------------------
// Name store
// ---------------------------------------------------------------------------

#[test]
fn identical_names_share_a_cookie() {
    let mut names = NameStore::create("test names").unwrap();
    let h = da_hashname(b"motd");
    let a = names.insert_or_lookup(h, b"motd").unwrap();
    let b = names.insert_or_lookup(h, b"motd").unwrap();
    assert_eq!(a, b);
    assert_eq!(names.name(a).unwrap(), b"motd");
}

#[test]
fn distinct_names_get_distinct_cookies() {
    let mut names = NameStore::create("test names").unwrap();
    let a = names
        .insert_or_lookup(da_hashname(b"alpha"), b"alpha")
        .unwrap();
    let b = names
        .insert_or_lookup(da_hashname(b"beta"), b"beta")
        .unwrap();
    assert_ne!(a, b);
    assert_eq!(names.name(a).unwrap(), b"alpha");
    assert_eq!(names.name(b).unwrap(), b"beta");
}

#[test]
fn colliding_hashes_still_resolve_by_bytes() {
    let mut names = NameStore::create("test collisions").unwrap();
    // Force both names under the same hash bucket.
    let a = names.insert_or_lookup(7, b"one").unwrap();
    let b = names.insert_or_lookup(7, b"two").unwrap();
    assert_ne!(a, b);
    assert_eq!(names.lookup(7, b"one").unwrap(), Some(a));
    assert_eq!(names.lookup(7, b"two").unwrap(), Some(b));
    assert_eq!(names.lookup(7, b"three").unwrap(), None);
}

// ---------------------------------------------------------------------------
// Extent bitmap
// ---------------------------------------------------------------------------

#[test]
fn bitmap_coalesces_adjacent_ranges() {
    let mut bm = ExtentBitmap::new();
    bm.set_range(10, 5);
    bm.set_range(15, 5);
    bm.set_range(30, 2);
    assert_eq!(bm.extent_count(), 2);
    assert_eq!(bm.weight(), 12);
    assert!(bm.contains_range(10, 10));
    assert!(!bm.contains_range(10, 21));
}

#[test]
fn bitmap_clear_splits_ranges() {
    let mut bm = ExtentBitmap::new();
    bm.set_range(0, 100);
    bm.clear_range(40, 20);
    assert_eq!(bm.extent_count(), 2);
    assert!(bm.contains_range(0, 40));
    assert!(bm.contains_range(60, 40));
    assert!(!bm.overlaps_range(40, 20));
}

#[test]
fn bitmap_pop_first_walks_ascending() {
    let mut bm = ExtentBitmap::new();
    bm.set_range(5, 2);
    bm.set_range(1, 1);
    assert_eq!(bm.pop_first(), Some(1));
    assert_eq!(bm.pop_first(), Some(5));
    assert_eq!(bm.pop_first(), Some(6));
    assert_eq!(bm.pop_first(), None);
}

#[test]
fn bitmap_union_and_subtract() {
    let mut a = ExtentBitmap::new();
    a.set_range(0, 10);
    let mut b = ExtentBitmap::new();
    b.set_range(5, 10);

    a.union(&b);
    assert!(a.contains_range(0, 15));

    a.subtract(&b);
    assert!(a.contains_range(0, 5));
    assert!(!a.overlaps_range(5, 10));
}

#[test]
fn bitmap_overlap_queries() {
    let mut bm = ExtentBitmap::new();
    bm.set_range(10, 10);
    assert!(bm.overlaps_range(0, 11));
    assert!(!bm.overlaps_range(0, 10));
    assert!(bm.overlaps_range(19, 5));
    assert!(!bm.overlaps_range(20, 5));
    assert!(bm.contains(15));
    assert!(!bm.contains(20));
}
