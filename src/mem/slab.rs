//! External-memory record bag: an append-only array of fixed-size
//! records in an XFile, sortable by external merge sort, iterated with
//! forward cursors. A deduplicated name store rides alongside for
//! variable-length byte strings addressed by cookie.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::marker::PhantomData;

use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::error::FxfsrError;
use crate::io::xfile::XFile;

/// Records per in-memory sort run.
const SORT_RUN_RECORDS: usize = 64 * 1024;

/// Records per cursor read-ahead chunk.
const CURSOR_CHUNK_RECORDS: usize = 4096;

/// An append-only array of `T` backed by scratch-file pages.
pub struct Slab<T> {
    xfile: XFile,
    count: u64,
    _marker: PhantomData<T>,
}

impl<T> Slab<T>
where
    T: FromBytes + IntoBytes + Immutable + Copy,
{
    pub fn create(descr: &'static str) -> Result<Self, FxfsrError> {
        Ok(Slab {
            xfile: XFile::create(descr)?,
            count: 0,
            _marker: PhantomData,
        })
    }

    fn rec_size() -> u64 {
        std::mem::size_of::<T>() as u64
    }

    pub fn len(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Append one record.
    pub fn push(&mut self, rec: &T) -> Result<(), FxfsrError> {
        self.xfile.pwrite(rec.as_bytes(), self.count * Self::rec_size())?;
        self.count += 1;
        Ok(())
    }

    /// Read the record at `idx`.
    pub fn get(&self, idx: u64) -> Result<T, FxfsrError> {
        if idx >= self.count {
            return Err(FxfsrError::Parse("slab index out of bounds"));
        }
        let mut buf = vec![0u8; Self::rec_size() as usize];
        self.xfile.pread(&mut buf, idx * Self::rec_size())?;
        T::read_from_bytes(&buf).map_err(|_| FxfsrError::Parse("slab record decode failed"))
    }

    fn read_run(&self, start: u64, nrecs: usize) -> Result<Vec<T>, FxfsrError> {
        let nrecs = nrecs.min((self.count - start) as usize);
        let size = Self::rec_size() as usize;
        let mut buf = vec![0u8; nrecs * size];
        self.xfile.pread(&mut buf, start * Self::rec_size())?;
        let mut out = Vec::with_capacity(nrecs);
        for i in 0..nrecs {
            out.push(
                T::read_from_bytes(&buf[i * size..(i + 1) * size])
                    .map_err(|_| FxfsrError::Parse("slab record decode failed"))?,
            );
        }
        Ok(out)
    }

    fn write_run(xfile: &mut XFile, start: u64, recs: &[T]) -> Result<(), FxfsrError> {
        let size = Self::rec_size() as usize;
        let mut buf = vec![0u8; recs.len() * size];
        for (i, rec) in recs.iter().enumerate() {
            buf[i * size..(i + 1) * size].copy_from_slice(rec.as_bytes());
        }
        xfile.pwrite(&buf, start * size as u64)
    }

    /// Sort the slab with `cmp` using an external merge sort: in-memory
    /// runs are sorted and spilled, then merged back in one pass.
    pub fn sort(&mut self, cmp: fn(&T, &T) -> Ordering) -> Result<(), FxfsrError> {
        if self.count <= 1 {
            return Ok(());
        }

        // Small slabs sort entirely in memory.
        if self.count as usize <= SORT_RUN_RECORDS {
            let mut recs = self.read_run(0, self.count as usize)?;
            recs.sort_by(cmp);
            Self::write_run(&mut self.xfile, 0, &recs)?;
            return Ok(());
        }

        // Spill sorted runs to a scratch file.
        let mut runs: Vec<(u64, u64)> = Vec::new();
        let mut spill = XFile::create("slab sort spill")?;
        let mut pos = 0u64;
        while pos < self.count {
            let mut recs = self.read_run(pos, SORT_RUN_RECORDS)?;
            recs.sort_by(cmp);
            Self::write_run(&mut spill, pos, &recs)?;
            runs.push((pos, recs.len() as u64));
            pos += recs.len() as u64;
        }

        // Merge the runs back into our own pages.
        let spill_slab = Slab::<T> { xfile: spill, count: self.count, _marker: PhantomData };
        let mut cursors: Vec<SlabCursor<'_, T>> = runs
            .iter()
            .map(|&(start, len)| SlabCursor::with_range(&spill_slab, start, start + len))
            .collect();
        let mut heads: Vec<Option<T>> = Vec::with_capacity(cursors.len());
        for cur in &mut cursors {
            heads.push(cur.next()?);
        }

        let mut out = Vec::with_capacity(CURSOR_CHUNK_RECORDS);
        let mut written = 0u64;
        loop {
            let mut best: Option<usize> = None;
            for (i, head) in heads.iter().enumerate() {
                if let Some(rec) = head {
                    match best {
                        None => best = Some(i),
                        Some(b) => {
                            if cmp(rec, heads[b].as_ref().unwrap()) == Ordering::Less {
                                best = Some(i);
                            }
                        }
                    }
                }
            }
            let Some(b) = best else { break };
            out.push(heads[b].take().unwrap());
            heads[b] = cursors[b].next()?;

            if out.len() == CURSOR_CHUNK_RECORDS {
                Self::write_run(&mut self.xfile, written, &out)?;
                written += out.len() as u64;
                out.clear();
            }
        }
        if !out.is_empty() {
            Self::write_run(&mut self.xfile, written, &out)?;
        }
        Ok(())
    }

    /// Forward cursor over the whole slab.
    pub fn cursor(&self) -> SlabCursor<'_, T> {
        SlabCursor::with_range(self, 0, self.count)
    }
}

/// Buffered forward cursor over a record range of a slab.
pub struct SlabCursor<'a, T> {
    slab: &'a Slab<T>,
    next_idx: u64,
    end_idx: u64,
    chunk: Vec<T>,
    chunk_pos: usize,
    peeked: Option<T>,
}

impl<'a, T> SlabCursor<'a, T>
where
    T: FromBytes + IntoBytes + Immutable + Copy,
{
    fn with_range(slab: &'a Slab<T>, start: u64, end: u64) -> Self {
        SlabCursor {
            slab,
            next_idx: start,
            end_idx: end,
            chunk: Vec::new(),
            chunk_pos: 0,
            peeked: None,
        }
    }

    /// Next record, or `None` at end of range.
    pub fn next(&mut self) -> Result<Option<T>, FxfsrError> {
        if let Some(rec) = self.peeked.take() {
            return Ok(Some(rec));
        }
        if self.chunk_pos == self.chunk.len() {
            if self.next_idx >= self.end_idx {
                return Ok(None);
            }
            let want = CURSOR_CHUNK_RECORDS.min((self.end_idx - self.next_idx) as usize);
            self.chunk = self.slab.read_run(self.next_idx, want)?;
            self.next_idx += self.chunk.len() as u64;
            self.chunk_pos = 0;
        }
        let rec = self.chunk[self.chunk_pos];
        self.chunk_pos += 1;
        Ok(Some(rec))
    }

    /// Look at the next record without consuming it.
    pub fn peek(&mut self) -> Result<Option<T>, FxfsrError> {
        if self.peeked.is_none() {
            self.peeked = self.next()?;
        }
        Ok(self.peeked)
    }
}

/// Opaque handle into a [`NameStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NameCookie(pub u64);

/// Deduplicated byte-string store. Identical names yield identical
/// cookies; bytes live in scratch-file pages, the hash index in memory.
pub struct NameStore {
    xfile: XFile,
    tail: u64,
    index: HashMap<u32, Vec<(u64, u16)>>,
}

impl NameStore {
    pub fn create(descr: &'static str) -> Result<Self, FxfsrError> {
        Ok(NameStore {
            xfile: XFile::create(descr)?,
            tail: 0,
            index: HashMap::new(),
        })
    }

    /// Look up `name` under `hash`, inserting it if absent.
    pub fn insert_or_lookup(&mut self, hash: u32, name: &[u8]) -> Result<NameCookie, FxfsrError> {
        if name.is_empty() || name.len() > u16::MAX as usize {
            return Err(FxfsrError::Parse("name length out of range"));
        }
        if let Some(candidates) = self.index.get(&hash) {
            for &(off, len) in candidates {
                if len as usize == name.len() && self.read_bytes(off, len)? == name {
                    return Ok(NameCookie(off));
                }
            }
        }
        let off = self.tail;
        let len = name.len() as u16;
        self.xfile.pwrite(&len.to_be_bytes(), off)?;
        self.xfile.pwrite(name, off + 2)?;
        self.tail = off + 2 + name.len() as u64;
        self.index.entry(hash).or_default().push((off, len));
        Ok(NameCookie(off))
    }

    /// Look up `name` without inserting. Safe concurrently once the
    /// store is frozen.
    pub fn lookup(&self, hash: u32, name: &[u8]) -> Result<Option<NameCookie>, FxfsrError> {
        if let Some(candidates) = self.index.get(&hash) {
            for &(off, len) in candidates {
                if len as usize == name.len() && self.read_bytes(off, len)? == name {
                    return Ok(Some(NameCookie(off)));
                }
            }
        }
        Ok(None)
    }

    /// Retrieve the bytes behind a cookie.
    pub fn name(&self, cookie: NameCookie) -> Result<Vec<u8>, FxfsrError> {
        let mut len_buf = [0u8; 2];
        self.xfile.pread(&mut len_buf, cookie.0)?;
        let len = u16::from_be_bytes(len_buf);
        self.read_bytes(cookie.0, len)
    }

    fn read_bytes(&self, off: u64, len: u16) -> Result<Vec<u8>, FxfsrError> {
        let mut buf = vec![0u8; len as usize];
        self.xfile.pread(&mut buf, off + 2)?;
        Ok(buf)
    }
}
