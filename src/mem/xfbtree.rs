//! In-memory B+tree whose blocks live in a [`MemBufTarget`]. Used for
//! scratch indexes that may exceed RAM: the incore reverse-mapping
//! index and the refcount bag.
//!
//! Blocks are laid out like the on-disk short-form trees: a fixed
//! header, then records (leaves) or `keys[maxrecs]` followed by
//! `ptrs[maxrecs]` (nodes). Uncommitted mutations live only in the
//! buffer cache; `trans_commit` verifies and writes them through to the
//! backing pages, `trans_cancel` discards them.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};
use zerocopy::byteorder::big_endian::{U16, U32, U64};

use crate::error::FxfsrError;
use crate::io::bufcache::{BufCache, MemBufTarget, SECTOR_SIZE};
use crate::mem::bitmap::ExtentBitmap;

/// Fixed block size of an in-memory btree.
pub const XFB_BLOCK_SIZE: usize = 4096;

/// In-memory btree block magic: "XFBT"
const XFB_MAGIC: u32 = 0x58464254;

/// Null sibling / null root.
pub const XFB_NULLBLK: u64 = u64::MAX;

const SECTORS_PER_BLOCK: u64 = XFB_BLOCK_SIZE as u64 / SECTOR_SIZE;

/// Pointer width of a tree. Short-pointer trees address at most
/// 2^31 - 1 blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtrWidth {
    Short,
    Long,
}

impl PtrWidth {
    fn size(self) -> usize {
        match self {
            Self::Short => 4,
            Self::Long => 8,
        }
    }
}

/// Record stored in an in-memory btree. Keys must order the records.
pub trait XfbRecord: FromBytes + IntoBytes + Immutable + KnownLayout + Copy {
    type Key: FromBytes + IntoBytes + Immutable + KnownLayout + Copy + Ord;
    fn key(&self) -> Self::Key;
}

/// Lookup modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupOp {
    /// Exact key match.
    Eq,
    /// Greatest record with key <= target.
    Le,
    /// Least record with key >= target.
    Ge,
}

/// What `visit_blocks` hands to the visitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitWhat {
    Records,
    Keys,
}

/// Block header (32 bytes), big-endian like its on-disk cousins.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone)]
#[repr(C)]
struct XfbBlockHdr {
    magic: U32,
    level: U16,
    numrecs: U16,
    leftsib: U64,
    rightsib: U64,
    owner: U64,
}

const HDR_SIZE: usize = std::mem::size_of::<XfbBlockHdr>();

/// Header sanity check used as the buffer-cache verifier.
fn xfb_block_verifier(buf: &[u8]) -> Result<(), FxfsrError> {
    let hdr = XfbBlockHdr::ref_from_prefix(buf)
        .map_err(|_| FxfsrError::Parse("buffer too small for xfbtree header"))?
        .0;
    if hdr.magic.get() != XFB_MAGIC {
        return Err(FxfsrError::BadMagic("in-memory btree block"));
    }
    Ok(())
}

/// Cursor: a root-to-leaf path of (block, entry index).
#[derive(Debug, Clone)]
pub struct XfbCursor {
    path: Vec<(u64, usize)>,
}

impl XfbCursor {
    fn leaf(&self) -> (u64, usize) {
        *self.path.last().expect("cursor path is never empty")
    }
}

/// An in-memory B+tree of `R` records.
pub struct XfBtree<R: XfbRecord> {
    cache: BufCache<MemBufTarget>,
    freespace: ExtentBitmap,
    highest_block: u64,
    owner_tag: u64,
    root: u64,
    height: usize,
    nrecords: u64,
    ptr_width: PtrWidth,
    leaf_maxrecs: usize,
    node_maxrecs: usize,
    trans_touched: Vec<u64>,
    _marker: std::marker::PhantomData<R>,
}

impl<R: XfbRecord> XfBtree<R> {
    /// Create an empty tree. `owner_tag` is stamped into every block and
    /// validated on read.
    pub fn create(
        descr: &'static str,
        owner_tag: u64,
        ptr_width: PtrWidth,
    ) -> Result<Self, FxfsrError> {
        let rec_size = std::mem::size_of::<R>();
        let key_size = std::mem::size_of::<R::Key>();
        let body = XFB_BLOCK_SIZE - HDR_SIZE;
        let leaf_maxrecs = body / rec_size;
        let node_maxrecs = body / (key_size + ptr_width.size());
        if leaf_maxrecs < 2 || node_maxrecs < 4 {
            return Err(FxfsrError::Parse("record too large for xfbtree block"));
        }
        Ok(XfBtree {
            cache: BufCache::new(MemBufTarget::create(descr)?),
            freespace: ExtentBitmap::new(),
            highest_block: 0,
            owner_tag,
            root: XFB_NULLBLK,
            height: 0,
            nrecords: 0,
            ptr_width,
            leaf_maxrecs,
            node_maxrecs,
            trans_touched: Vec::new(),
            _marker: std::marker::PhantomData,
        })
    }

    pub fn len(&self) -> u64 {
        self.nrecords
    }

    pub fn is_empty(&self) -> bool {
        self.nrecords == 0
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn owner_tag(&self) -> u64 {
        self.owner_tag
    }

    // ---- block allocation -------------------------------------------------

    /// Allocate a block: pop the free bitmap, else extend the file.
    pub fn alloc_block(&mut self) -> Result<u64, FxfsrError> {
        let blkno = match self.freespace.pop_first() {
            Some(b) => b,
            None => {
                let b = self.highest_block;
                self.highest_block += 1;
                b
            }
        };
        if self.ptr_width == PtrWidth::Short && blkno > (i32::MAX as u64) {
            return Err(FxfsrError::NoSpace("short-pointer btree exhausted its address space"));
        }
        Ok(blkno)
    }

    /// Return a block to the free bitmap and drop its backing pages.
    pub fn free_block(&mut self, blkno: u64) -> Result<(), FxfsrError> {
        self.cache.forget(blkno * SECTORS_PER_BLOCK);
        self.cache
            .target_mut()
            .discard(blkno * XFB_BLOCK_SIZE as u64, XFB_BLOCK_SIZE as u64)?;
        self.freespace.set_range(blkno, 1);
        Ok(())
    }

    // ---- raw block access -------------------------------------------------

    fn load_block(&mut self, blkno: u64) -> Result<Vec<u8>, FxfsrError> {
        let daddr = blkno * SECTORS_PER_BLOCK;
        let buf = self.cache.read_buf(daddr, XFB_BLOCK_SIZE, Some(xfb_block_verifier))?;
        let data = buf.data().to_vec();
        self.cache.relse(daddr);
        let hdr = self.hdr(&data)?;
        if hdr.owner.get() != self.owner_tag {
            return Err(FxfsrError::Parse("xfbtree block owner mismatch"));
        }
        Ok(data)
    }

    fn store_block(&mut self, blkno: u64, data: &[u8]) -> Result<(), FxfsrError> {
        let daddr = blkno * SECTORS_PER_BLOCK;
        let buf = self.cache.get_buf(daddr, XFB_BLOCK_SIZE)?;
        buf.data_mut().copy_from_slice(data);
        buf.set_verifier(xfb_block_verifier);
        self.cache.mark_dirty(daddr);
        self.cache.relse(daddr);
        if !self.trans_touched.contains(&blkno) {
            self.trans_touched.push(blkno);
        }
        Ok(())
    }

    fn hdr<'b>(&self, data: &'b [u8]) -> Result<&'b XfbBlockHdr, FxfsrError> {
        Ok(XfbBlockHdr::ref_from_prefix(data)
            .map_err(|_| FxfsrError::Parse("xfbtree header decode failed"))?
            .0)
    }

    fn init_block(&self, data: &mut [u8], level: u16) {
        data.fill(0);
        let hdr = XfbBlockHdr {
            magic: XFB_MAGIC.into(),
            level: level.into(),
            numrecs: 0.into(),
            leftsib: XFB_NULLBLK.into(),
            rightsib: XFB_NULLBLK.into(),
            owner: self.owner_tag.into(),
        };
        data[..HDR_SIZE].copy_from_slice(hdr.as_bytes());
    }

    fn set_hdr_field(data: &mut [u8], off: usize, val: u64, len: usize) {
        match len {
            2 => data[off..off + 2].copy_from_slice(&(val as u16).to_be_bytes()),
            8 => data[off..off + 8].copy_from_slice(&val.to_be_bytes()),
            _ => unreachable!(),
        }
    }

    fn set_numrecs(data: &mut [u8], n: usize) {
        Self::set_hdr_field(data, 6, n as u64, 2);
    }

    fn set_leftsib(data: &mut [u8], b: u64) {
        Self::set_hdr_field(data, 8, b, 8);
    }

    fn set_rightsib(data: &mut [u8], b: u64) {
        Self::set_hdr_field(data, 16, b, 8);
    }

    // ---- record / key / pointer layout ------------------------------------

    fn rec_size(&self) -> usize {
        std::mem::size_of::<R>()
    }

    fn key_size(&self) -> usize {
        std::mem::size_of::<R::Key>()
    }

    fn rec_off(&self, i: usize) -> usize {
        HDR_SIZE + i * self.rec_size()
    }

    fn key_off(&self, i: usize) -> usize {
        HDR_SIZE + i * self.key_size()
    }

    fn ptr_off(&self, i: usize) -> usize {
        HDR_SIZE + self.node_maxrecs * self.key_size() + i * self.ptr_width.size()
    }

    fn read_rec(&self, data: &[u8], i: usize) -> Result<R, FxfsrError> {
        let off = self.rec_off(i);
        R::read_from_bytes(&data[off..off + self.rec_size()])
            .map_err(|_| FxfsrError::Parse("xfbtree record decode failed"))
    }

    fn write_rec(&self, data: &mut [u8], i: usize, rec: &R) {
        let off = self.rec_off(i);
        data[off..off + self.rec_size()].copy_from_slice(rec.as_bytes());
    }

    fn read_key(&self, data: &[u8], i: usize) -> Result<R::Key, FxfsrError> {
        let off = self.key_off(i);
        R::Key::read_from_bytes(&data[off..off + self.key_size()])
            .map_err(|_| FxfsrError::Parse("xfbtree key decode failed"))
    }

    fn write_key(&self, data: &mut [u8], i: usize, key: &R::Key) {
        let off = self.key_off(i);
        data[off..off + self.key_size()].copy_from_slice(key.as_bytes());
    }

    fn read_ptr(&self, data: &[u8], i: usize) -> u64 {
        let off = self.ptr_off(i);
        match self.ptr_width {
            PtrWidth::Short => {
                u32::from_be_bytes(data[off..off + 4].try_into().unwrap()) as u64
            }
            PtrWidth::Long => u64::from_be_bytes(data[off..off + 8].try_into().unwrap()),
        }
    }

    fn write_ptr(&self, data: &mut [u8], i: usize, ptr: u64) {
        let off = self.ptr_off(i);
        match self.ptr_width {
            PtrWidth::Short => {
                data[off..off + 4].copy_from_slice(&(ptr as u32).to_be_bytes())
            }
            PtrWidth::Long => data[off..off + 8].copy_from_slice(&ptr.to_be_bytes()),
        }
    }

    /// Shift records/entries [from..numrecs) right by one.
    fn shift_right(&self, data: &mut [u8], numrecs: usize, from: usize, leaf: bool) {
        if leaf {
            let size = self.rec_size();
            data.copy_within(self.rec_off(from)..self.rec_off(numrecs), self.rec_off(from) + size);
        } else {
            let ksize = self.key_size();
            data.copy_within(self.key_off(from)..self.key_off(numrecs), self.key_off(from) + ksize);
            let psize = self.ptr_width.size();
            data.copy_within(self.ptr_off(from)..self.ptr_off(numrecs), self.ptr_off(from) + psize);
        }
    }

    /// Shift records/entries [from..numrecs) left by one, erasing entry from-1.
    fn shift_left(&self, data: &mut [u8], numrecs: usize, from: usize, leaf: bool) {
        if leaf {
            let size = self.rec_size();
            data.copy_within(self.rec_off(from)..self.rec_off(numrecs), self.rec_off(from) - size);
        } else {
            let ksize = self.key_size();
            data.copy_within(self.key_off(from)..self.key_off(numrecs), self.key_off(from) - ksize);
            let psize = self.ptr_width.size();
            data.copy_within(self.ptr_off(from)..self.ptr_off(numrecs), self.ptr_off(from) - psize);
        }
    }

    // ---- search -----------------------------------------------------------

    /// Index of the last key <= target in a node block, if any.
    fn node_find(&self, data: &[u8], numrecs: usize, key: &R::Key) -> Result<Option<usize>, FxfsrError> {
        let mut found = None;
        for i in 0..numrecs {
            if self.read_key(data, i)? <= *key {
                found = Some(i);
            } else {
                break;
            }
        }
        Ok(found)
    }

    /// Index of the first record with key >= target in a leaf block.
    fn leaf_find_ge(&self, data: &[u8], numrecs: usize, key: &R::Key) -> Result<usize, FxfsrError> {
        for i in 0..numrecs {
            if self.read_rec(data, i)?.key() >= *key {
                return Ok(i);
            }
        }
        Ok(numrecs)
    }

    /// Walk from the root toward `key`, returning the path. In each node
    /// the child with the greatest key <= target is taken (child 0 when
    /// every key is greater).
    fn descend(&mut self, key: &R::Key) -> Result<Option<XfbCursor>, FxfsrError> {
        if self.root == XFB_NULLBLK {
            return Ok(None);
        }
        let mut path = Vec::with_capacity(self.height);
        let mut blkno = self.root;
        for _ in (1..self.height).rev() {
            let data = self.load_block(blkno)?;
            let numrecs = self.hdr(&data)?.numrecs.get() as usize;
            let idx = self.node_find(&data, numrecs, key)?.unwrap_or(0);
            path.push((blkno, idx));
            blkno = self.read_ptr(&data, idx);
        }
        let data = self.load_block(blkno)?;
        let numrecs = self.hdr(&data)?.numrecs.get() as usize;
        let idx = self.leaf_find_ge(&data, numrecs, key)?;
        path.push((blkno, idx));
        Ok(Some(XfbCursor { path }))
    }

    /// Find a record. Returns a cursor positioned on the matched record,
    /// or `None` when no record satisfies the operation.
    pub fn lookup(&mut self, op: LookupOp, key: &R::Key) -> Result<Option<XfbCursor>, FxfsrError> {
        let Some(mut cur) = self.descend(key)? else {
            return Ok(None);
        };
        // The cursor now points at the first record >= key within the
        // leaf, which may be one past the end.
        let (blkno, idx) = cur.leaf();
        let data = self.load_block(blkno)?;
        let numrecs = self.hdr(&data)?.numrecs.get() as usize;
        match op {
            LookupOp::Eq => {
                if idx < numrecs && self.read_rec(&data, idx)?.key() == *key {
                    Ok(Some(cur))
                } else {
                    Ok(None)
                }
            }
            LookupOp::Ge => {
                if idx < numrecs {
                    return Ok(Some(cur));
                }
                // Walk right for the next record.
                if self.step_right(&mut cur)? { Ok(Some(cur)) } else { Ok(None) }
            }
            LookupOp::Le => {
                if idx < numrecs && self.read_rec(&data, idx)?.key() == *key {
                    return Ok(Some(cur));
                }
                // First record >= key; the answer is its predecessor.
                if self.decrement(&mut cur)? { Ok(Some(cur)) } else { Ok(None) }
            }
        }
    }

    /// Read the record under the cursor.
    pub fn get_rec(&mut self, cur: &XfbCursor) -> Result<R, FxfsrError> {
        let (blkno, idx) = cur.leaf();
        let data = self.load_block(blkno)?;
        let numrecs = self.hdr(&data)?.numrecs.get() as usize;
        if idx >= numrecs {
            return Err(FxfsrError::Parse("xfbtree cursor out of range"));
        }
        self.read_rec(&data, idx)
    }

    /// Overwrite the record under the cursor. The replacement must carry
    /// the same key.
    pub fn update(&mut self, cur: &XfbCursor, rec: &R) -> Result<(), FxfsrError> {
        let (blkno, idx) = cur.leaf();
        let mut data = self.load_block(blkno)?;
        let old = self.read_rec(&data, idx)?;
        if old.key() != rec.key() {
            return Err(FxfsrError::Parse("xfbtree update would change the record key"));
        }
        self.write_rec(&mut data, idx, rec);
        self.store_block(blkno, &data)
    }

    // ---- cursor movement --------------------------------------------------

    /// Advance past the current record. Returns false at the right edge.
    pub fn increment(&mut self, cur: &mut XfbCursor) -> Result<bool, FxfsrError> {
        let (blkno, idx) = cur.leaf();
        let data = self.load_block(blkno)?;
        let numrecs = self.hdr(&data)?.numrecs.get() as usize;
        if idx + 1 < numrecs {
            cur.path.last_mut().unwrap().1 = idx + 1;
            return Ok(true);
        }
        cur.path.last_mut().unwrap().1 = numrecs;
        self.step_right(cur)
    }

    /// Move the cursor onto the first record of the next leaf.
    fn step_right(&mut self, cur: &mut XfbCursor) -> Result<bool, FxfsrError> {
        let (blkno, _) = cur.leaf();
        let data = self.load_block(blkno)?;
        let mut right = self.hdr(&data)?.rightsib.get();
        while right != XFB_NULLBLK {
            let rdata = self.load_block(right)?;
            let rnum = self.hdr(&rdata)?.numrecs.get() as usize;
            if rnum > 0 {
                *cur.path.last_mut().unwrap() = (right, 0);
                return Ok(true);
            }
            right = self.hdr(&rdata)?.rightsib.get();
        }
        Ok(false)
    }

    /// Step back one record. Returns false at the left edge.
    pub fn decrement(&mut self, cur: &mut XfbCursor) -> Result<bool, FxfsrError> {
        let (blkno, idx) = cur.leaf();
        if idx > 0 {
            cur.path.last_mut().unwrap().1 = idx - 1;
            return Ok(true);
        }
        let data = self.load_block(blkno)?;
        let mut left = self.hdr(&data)?.leftsib.get();
        while left != XFB_NULLBLK {
            let ldata = self.load_block(left)?;
            let lnum = self.hdr(&ldata)?.numrecs.get() as usize;
            if lnum > 0 {
                *cur.path.last_mut().unwrap() = (left, lnum - 1);
                return Ok(true);
            }
            left = self.hdr(&ldata)?.leftsib.get();
        }
        Ok(false)
    }

    /// Cursor on the leftmost record, or `None` for an empty tree.
    pub fn goto_left_edge(&mut self) -> Result<Option<XfbCursor>, FxfsrError> {
        if self.root == XFB_NULLBLK || self.nrecords == 0 {
            return Ok(None);
        }
        let mut path = Vec::with_capacity(self.height);
        let mut blkno = self.root;
        for _ in (1..self.height).rev() {
            path.push((blkno, 0));
            let data = self.load_block(blkno)?;
            blkno = self.read_ptr(&data, 0);
        }
        path.push((blkno, 0));
        let mut cur = XfbCursor { path };
        let data = self.load_block(blkno)?;
        if self.hdr(&data)?.numrecs.get() == 0 && !self.step_right(&mut cur)? {
            return Ok(None);
        }
        Ok(Some(cur))
    }

    /// Does the cursor sit on a readable record?
    pub fn has_more_records(&mut self, cur: &XfbCursor) -> Result<bool, FxfsrError> {
        let (blkno, idx) = cur.leaf();
        let data = self.load_block(blkno)?;
        Ok(idx < self.hdr(&data)?.numrecs.get() as usize)
    }

    // ---- insert -----------------------------------------------------------

    /// Insert a record. Duplicate keys are rejected.
    pub fn insert(&mut self, rec: &R) -> Result<(), FxfsrError> {
        if self.root == XFB_NULLBLK {
            let blkno = self.alloc_block()?;
            let mut data = vec![0u8; XFB_BLOCK_SIZE];
            self.init_block(&mut data, 0);
            self.write_rec(&mut data, 0, rec);
            Self::set_numrecs(&mut data, 1);
            self.store_block(blkno, &data)?;
            self.root = blkno;
            self.height = 1;
            self.nrecords = 1;
            return Ok(());
        }

        let promoted = self.insert_into(self.root, self.height - 1, rec)?;
        if let Some((key, newblk)) = promoted {
            // Grow the tree by one level.
            let old_root = self.root;
            let old_low = self.lowest_key(old_root, self.height - 1)?;
            let rootblk = self.alloc_block()?;
            let mut data = vec![0u8; XFB_BLOCK_SIZE];
            self.init_block(&mut data, self.height as u16);
            self.write_key(&mut data, 0, &old_low);
            self.write_ptr(&mut data, 0, old_root);
            self.write_key(&mut data, 1, &key);
            self.write_ptr(&mut data, 1, newblk);
            Self::set_numrecs(&mut data, 2);
            self.store_block(rootblk, &data)?;
            self.root = rootblk;
            self.height += 1;
        }
        self.nrecords += 1;
        Ok(())
    }

    /// Lowest key reachable under `blkno` at `level`.
    fn lowest_key(&mut self, blkno: u64, level: usize) -> Result<R::Key, FxfsrError> {
        let data = self.load_block(blkno)?;
        if level == 0 {
            Ok(self.read_rec(&data, 0)?.key())
        } else {
            self.read_key(&data, 0)
        }
    }

    /// Recursive insert. Returns the separator (key, block) when the
    /// child split and the caller must add an entry.
    fn insert_into(
        &mut self,
        blkno: u64,
        level: usize,
        rec: &R,
    ) -> Result<Option<(R::Key, u64)>, FxfsrError> {
        let mut data = self.load_block(blkno)?;
        let numrecs = self.hdr(&data)?.numrecs.get() as usize;

        if level == 0 {
            let key = rec.key();
            let idx = self.leaf_find_ge(&data, numrecs, &key)?;
            if idx < numrecs && self.read_rec(&data, idx)?.key() == key {
                return Err(FxfsrError::Parse("duplicate key in xfbtree insert"));
            }
            if numrecs < self.leaf_maxrecs {
                self.shift_right(&mut data, numrecs, idx, true);
                self.write_rec(&mut data, idx, rec);
                Self::set_numrecs(&mut data, numrecs + 1);
                self.store_block(blkno, &data)?;
                return Ok(None);
            }
            // Split, then insert into the proper half.
            let (rkey, rblk) = self.split_block(blkno, &mut data, true)?;
            if key >= rkey {
                let mut rdata = self.load_block(rblk)?;
                let rnum = self.hdr(&rdata)?.numrecs.get() as usize;
                let ridx = self.leaf_find_ge(&rdata, rnum, &key)?;
                self.shift_right(&mut rdata, rnum, ridx, true);
                self.write_rec(&mut rdata, ridx, rec);
                Self::set_numrecs(&mut rdata, rnum + 1);
                self.store_block(rblk, &rdata)?;
            } else {
                let lnum = self.hdr(&data)?.numrecs.get() as usize;
                let lidx = self.leaf_find_ge(&data, lnum, &key)?;
                self.shift_right(&mut data, lnum, lidx, true);
                self.write_rec(&mut data, lidx, rec);
                Self::set_numrecs(&mut data, lnum + 1);
                self.store_block(blkno, &data)?;
            }
            // The new right block's low key may have changed if the new
            // record landed at its front.
            let rdata = self.load_block(rblk)?;
            let low = self.read_rec(&rdata, 0)?.key();
            return Ok(Some((low, rblk)));
        }

        // Interior node.
        let key = rec.key();
        let idx = self.node_find(&data, numrecs, &key)?.unwrap_or(0);
        let child = self.read_ptr(&data, idx);
        let Some((sep_key, sep_blk)) = self.insert_into(child, level - 1, rec)? else {
            return Ok(None);
        };

        // Reload: the recursion may have rewritten this block's bytes.
        let mut data = self.load_block(blkno)?;
        let numrecs = self.hdr(&data)?.numrecs.get() as usize;
        let at = self.node_find(&data, numrecs, &sep_key)?.map_or(0, |i| i + 1);
        if numrecs < self.node_maxrecs {
            self.shift_right(&mut data, numrecs, at, false);
            self.write_key(&mut data, at, &sep_key);
            self.write_ptr(&mut data, at, sep_blk);
            Self::set_numrecs(&mut data, numrecs + 1);
            self.store_block(blkno, &data)?;
            return Ok(None);
        }

        let (rkey, rblk) = self.split_block(blkno, &mut data, false)?;
        let (target, mut tdata) = if sep_key >= rkey {
            (rblk, self.load_block(rblk)?)
        } else {
            (blkno, data)
        };
        let tnum = self.hdr(&tdata)?.numrecs.get() as usize;
        let tat = self.node_find(&tdata, tnum, &sep_key)?.map_or(0, |i| i + 1);
        self.shift_right(&mut tdata, tnum, tat, false);
        self.write_key(&mut tdata, tat, &sep_key);
        self.write_ptr(&mut tdata, tat, sep_blk);
        Self::set_numrecs(&mut tdata, tnum + 1);
        self.store_block(target, &tdata)?;

        let rdata = self.load_block(rblk)?;
        let low = self.read_key(&rdata, 0)?;
        Ok(Some((low, rblk)))
    }

    /// Split `blkno` in half; the upper half moves into a fresh right
    /// sibling. Returns the right block's low key and number. `data` is
    /// left holding the updated left block.
    fn split_block(
        &mut self,
        blkno: u64,
        data: &mut [u8],
        leaf: bool,
    ) -> Result<(R::Key, u64), FxfsrError> {
        let numrecs = self.hdr(data)?.numrecs.get() as usize;
        let keep = numrecs / 2;
        let moved = numrecs - keep;
        let level = self.hdr(data)?.level.get();
        let old_right = self.hdr(data)?.rightsib.get();

        let newblk = self.alloc_block()?;
        let mut newdata = vec![0u8; XFB_BLOCK_SIZE];
        self.init_block(&mut newdata, level);
        if leaf {
            for i in 0..moved {
                let rec = self.read_rec(data, keep + i)?;
                self.write_rec(&mut newdata, i, &rec);
            }
        } else {
            for i in 0..moved {
                let k = self.read_key(data, keep + i)?;
                let p = self.read_ptr(data, keep + i);
                self.write_key(&mut newdata, i, &k);
                self.write_ptr(&mut newdata, i, p);
            }
        }
        Self::set_numrecs(&mut newdata, moved);
        Self::set_leftsib(&mut newdata, blkno);
        Self::set_rightsib(&mut newdata, old_right);
        self.store_block(newblk, &newdata)?;

        Self::set_numrecs(data, keep);
        Self::set_rightsib(data, newblk);
        self.store_block(blkno, data)?;

        if old_right != XFB_NULLBLK {
            let mut rdata = self.load_block(old_right)?;
            Self::set_leftsib(&mut rdata, newblk);
            self.store_block(old_right, &rdata)?;
        }

        let low = if leaf {
            self.read_rec(&newdata, 0)?.key()
        } else {
            self.read_key(&newdata, 0)?
        };
        Ok((low, newblk))
    }

    // ---- delete -----------------------------------------------------------

    /// Delete the record with exactly `key`. Returns false if absent.
    /// Blocks may go underfull; emptied blocks are unlinked and freed.
    pub fn delete(&mut self, key: &R::Key) -> Result<bool, FxfsrError> {
        let Some(cur) = self.descend(key)? else {
            return Ok(false);
        };
        let (blkno, idx) = cur.leaf();
        let mut data = self.load_block(blkno)?;
        let numrecs = self.hdr(&data)?.numrecs.get() as usize;
        if idx >= numrecs || self.read_rec(&data, idx)?.key() != *key {
            return Ok(false);
        }
        self.shift_left(&mut data, numrecs, idx + 1, true);
        Self::set_numrecs(&mut data, numrecs - 1);
        self.store_block(blkno, &data)?;
        self.nrecords -= 1;

        if numrecs - 1 == 0 {
            self.remove_empty_block(&cur.path, cur.path.len() - 1)?;
        }
        if self.nrecords == 0 {
            // Tree is empty; release whatever skeleton remains.
            if self.root != XFB_NULLBLK {
                self.free_subtree(self.root, self.height - 1)?;
            }
            self.root = XFB_NULLBLK;
            self.height = 0;
        }
        Ok(true)
    }

    /// Unlink the emptied block at `path[depth]` from its siblings and
    /// parent, freeing it. Recurses if the parent empties too.
    fn remove_empty_block(&mut self, path: &[(u64, usize)], depth: usize) -> Result<(), FxfsrError> {
        let (blkno, _) = path[depth];
        if depth == 0 {
            // Emptied root: collapse handled by the caller via nrecords.
            return Ok(());
        }

        let data = self.load_block(blkno)?;
        let left = self.hdr(&data)?.leftsib.get();
        let right = self.hdr(&data)?.rightsib.get();
        if left != XFB_NULLBLK {
            let mut ldata = self.load_block(left)?;
            Self::set_rightsib(&mut ldata, right);
            self.store_block(left, &ldata)?;
        }
        if right != XFB_NULLBLK {
            let mut rdata = self.load_block(right)?;
            Self::set_leftsib(&mut rdata, left);
            self.store_block(right, &rdata)?;
        }

        let (parent, pidx) = path[depth - 1];
        let mut pdata = self.load_block(parent)?;
        let pnum = self.hdr(&pdata)?.numrecs.get() as usize;
        self.shift_left(&mut pdata, pnum, pidx + 1, false);
        Self::set_numrecs(&mut pdata, pnum - 1);
        self.store_block(parent, &pdata)?;
        self.free_block(blkno)?;

        if pnum - 1 == 0 {
            self.remove_empty_block(path, depth - 1)?;
        } else if depth == 1 && pnum - 1 == 1 && self.height > 1 {
            // Root with a single child: drop a level.
            let pdata = self.load_block(parent)?;
            let only = self.read_ptr(&pdata, 0);
            self.free_block(parent)?;
            self.root = only;
            self.height -= 1;
        }
        Ok(())
    }

    fn free_subtree(&mut self, blkno: u64, level: usize) -> Result<(), FxfsrError> {
        if level > 0 {
            let data = self.load_block(blkno)?;
            let numrecs = self.hdr(&data)?.numrecs.get() as usize;
            for i in 0..numrecs {
                let child = self.read_ptr(&data, i);
                self.free_subtree(child, level - 1)?;
            }
        }
        self.free_block(blkno)
    }

    // ---- whole-tree visitors ----------------------------------------------

    /// Visit every record (leaf level) or every key (interior levels)
    /// left-to-right, bottom level first.
    pub fn visit_blocks<F>(&mut self, what: VisitWhat, mut f: F) -> Result<(), FxfsrError>
    where
        F: FnMut(&[u8]) -> Result<(), FxfsrError>,
    {
        if self.root == XFB_NULLBLK {
            return Ok(());
        }
        // Find the leftmost block of each level.
        let mut level_heads = Vec::with_capacity(self.height);
        let mut blkno = self.root;
        for level in (0..self.height).rev() {
            level_heads.push((level, blkno));
            if level > 0 {
                let data = self.load_block(blkno)?;
                blkno = self.read_ptr(&data, 0);
            }
        }
        level_heads.reverse();

        for (level, head) in level_heads {
            if (level == 0) != (what == VisitWhat::Records) {
                continue;
            }
            let mut blkno = head;
            while blkno != XFB_NULLBLK {
                let data = self.load_block(blkno)?;
                let numrecs = self.hdr(&data)?.numrecs.get() as usize;
                for i in 0..numrecs {
                    if level == 0 {
                        let off = self.rec_off(i);
                        f(&data[off..off + self.rec_size()])?;
                    } else {
                        let off = self.key_off(i);
                        f(&data[off..off + self.key_size()])?;
                    }
                }
                blkno = self.hdr(&data)?.rightsib.get();
            }
        }
        Ok(())
    }

    // ---- transactions -----------------------------------------------------

    /// Commit buffered mutations: verify and write through every block
    /// touched since the last commit. A verification failure is logged
    /// and reported without tearing down the remaining buffers.
    pub fn trans_commit(&mut self) -> Result<(), FxfsrError> {
        let touched = std::mem::take(&mut self.trans_touched);
        let mut first_err = None;
        for blkno in touched {
            // Blocks freed after they were touched have nothing to
            // write back.
            if !self.cache.contains(blkno * SECTORS_PER_BLOCK) {
                continue;
            }
            match self.cache.write_buf(blkno * SECTORS_PER_BLOCK) {
                Ok(()) => {
                    // Clean now; let the cache drop it so the tree's
                    // memory footprint stays bounded by its dirty set.
                    self.cache.relse(blkno * SECTORS_PER_BLOCK);
                }
                Err(e) => {
                    log::warn!("xfbtree block {blkno} failed commit verification: {e}");
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Discard buffered mutations since the last commit.
    pub fn trans_cancel(&mut self) {
        for blkno in std::mem::take(&mut self.trans_touched) {
            self.cache.forget(blkno * SECTORS_PER_BLOCK);
        }
    }

    /// Blocks this tree has ever allocated minus those freed.
    pub fn live_blocks(&self) -> u64 {
        self.highest_block - self.freespace.weight()
    }
}
