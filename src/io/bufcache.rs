//! Block buffer cache layered over a backing target (a scratch XFile or
//! a real block device). Buffers are keyed by sector address, carry a
//! dirty bit and an optional verifier, and are written back explicitly.

use std::collections::HashMap;

use crate::error::FxfsrError;
use crate::io::device::BlockDev;
use crate::io::xfile::XFile;
use crate::xfs::types::XfsDaddr;

/// Sector size the cache addresses buffers in.
pub const SECTOR_SIZE: u64 = 512;

/// Verification callback run against buffer contents on read and before
/// writeback.
pub type VerifierFn = fn(&[u8]) -> Result<(), FxfsrError>;

/// Backing store for a buffer cache.
pub trait BufTarget {
    fn read(&mut self, buf: &mut [u8], byte_off: u64) -> Result<(), FxfsrError>;
    fn write(&mut self, buf: &[u8], byte_off: u64) -> Result<(), FxfsrError>;
}

/// An XFile as a buffer-cache target: the in-memory side.
pub struct MemBufTarget {
    xfile: XFile,
}

impl MemBufTarget {
    pub fn create(descr: &'static str) -> Result<Self, FxfsrError> {
        Ok(MemBufTarget { xfile: XFile::create(descr)? })
    }

    pub fn xfile(&self) -> &XFile {
        &self.xfile
    }

    /// Punch the backing pages for a discarded block range.
    pub fn discard(&mut self, byte_off: u64, len: u64) -> Result<(), FxfsrError> {
        self.xfile.punch_hole(byte_off, len)
    }
}

impl BufTarget for MemBufTarget {
    fn read(&mut self, buf: &mut [u8], byte_off: u64) -> Result<(), FxfsrError> {
        self.xfile.pread(buf, byte_off)
    }

    fn write(&mut self, buf: &[u8], byte_off: u64) -> Result<(), FxfsrError> {
        self.xfile.pwrite(buf, byte_off)
    }
}

impl BufTarget for BlockDev {
    fn read(&mut self, buf: &mut [u8], byte_off: u64) -> Result<(), FxfsrError> {
        BlockDev::read_at(self, buf, byte_off)
    }

    fn write(&mut self, buf: &[u8], byte_off: u64) -> Result<(), FxfsrError> {
        BlockDev::write_at(self, buf, byte_off)
    }
}

/// One cached buffer.
#[derive(Debug)]
pub struct BufRecord {
    pub daddr: XfsDaddr,
    data: Vec<u8>,
    dirty: bool,
    nref: u32,
    verifier: Option<VerifierFn>,
}

impl BufRecord {
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable access; the caller must `mark_dirty` afterwards for the
    /// change to survive writeback.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn set_verifier(&mut self, verifier: VerifierFn) {
        self.verifier = Some(verifier);
    }
}

/// Buffer cache over one backing target.
pub struct BufCache<T: BufTarget> {
    target: T,
    bufs: HashMap<XfsDaddr, BufRecord>,
}

impl<T: BufTarget> BufCache<T> {
    pub fn new(target: T) -> Self {
        BufCache { target, bufs: HashMap::new() }
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn target_mut(&mut self) -> &mut T {
        &mut self.target
    }

    /// Find or allocate a buffer of `len` bytes at `daddr` without
    /// reading the backing store. New buffers come back zeroed.
    pub fn get_buf(&mut self, daddr: XfsDaddr, len: usize) -> Result<&mut BufRecord, FxfsrError> {
        let buf = self.bufs.entry(daddr).or_insert_with(|| BufRecord {
            daddr,
            data: vec![0u8; len],
            dirty: false,
            nref: 0,
            verifier: None,
        });
        if buf.data.len() != len {
            return Err(FxfsrError::Parse("buffer length conflict at sector address"));
        }
        buf.nref += 1;
        Ok(buf)
    }

    /// Read a buffer through the cache, validating with `verifier`.
    ///
    /// On verifier failure the buffer stays cached (fetch it with
    /// `get_buf` to inspect the bad contents) and a corruption-class
    /// error is returned.
    pub fn read_buf(
        &mut self,
        daddr: XfsDaddr,
        len: usize,
        verifier: Option<VerifierFn>,
    ) -> Result<&mut BufRecord, FxfsrError> {
        if !self.bufs.contains_key(&daddr) {
            let mut data = vec![0u8; len];
            self.target.read(&mut data, daddr * SECTOR_SIZE)?;
            self.bufs.insert(
                daddr,
                BufRecord { daddr, data, dirty: false, nref: 0, verifier },
            );
        }
        let buf = self.bufs.get_mut(&daddr).unwrap();
        if buf.data.len() != len {
            return Err(FxfsrError::Parse("buffer length conflict at sector address"));
        }
        if let Some(v) = verifier {
            buf.verifier = Some(v);
            v(&buf.data)?;
        }
        buf.nref += 1;
        Ok(buf)
    }

    /// Set the dirty bit on a cached buffer.
    pub fn mark_dirty(&mut self, daddr: XfsDaddr) {
        if let Some(buf) = self.bufs.get_mut(&daddr) {
            buf.dirty = true;
        }
    }

    /// Drop one reference. Clean, unreferenced buffers are evicted.
    pub fn relse(&mut self, daddr: XfsDaddr) {
        if let Some(buf) = self.bufs.get_mut(&daddr) {
            buf.nref = buf.nref.saturating_sub(1);
            if buf.nref == 0 && !buf.dirty {
                self.bufs.remove(&daddr);
            }
        }
    }

    /// Write one buffer through to the backing store, clearing its
    /// dirty bit. The verifier, if set, gates the write.
    pub fn write_buf(&mut self, daddr: XfsDaddr) -> Result<(), FxfsrError> {
        let Some(buf) = self.bufs.get_mut(&daddr) else {
            return Err(FxfsrError::Parse("writeback of uncached buffer"));
        };
        if let Some(v) = buf.verifier {
            v(&buf.data)?;
        }
        self.target.write(&buf.data, daddr * SECTOR_SIZE)?;
        buf.dirty = false;
        Ok(())
    }

    /// Write back every dirty buffer. Buffers failing verification are
    /// logged and reported after the rest have been flushed.
    pub fn flush(&mut self) -> Result<(), FxfsrError> {
        let mut dirty: Vec<XfsDaddr> = self
            .bufs
            .values()
            .filter(|b| b.dirty)
            .map(|b| b.daddr)
            .collect();
        dirty.sort_unstable();

        let mut first_err = None;
        for daddr in dirty {
            if let Err(e) = self.write_buf(daddr) {
                log::warn!("buffer at daddr {daddr} failed writeback: {e}");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Discard a buffer without writeback.
    pub fn forget(&mut self, daddr: XfsDaddr) {
        self.bufs.remove(&daddr);
    }

    /// Is a buffer cached at this sector address?
    pub fn contains(&self, daddr: XfsDaddr) -> bool {
        self.bufs.contains_key(&daddr)
    }

    /// Number of buffers currently cached.
    pub fn len(&self) -> usize {
        self.bufs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bufs.is_empty()
    }
}
