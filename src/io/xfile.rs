//! Sparse, growable, byte-addressable scratch store backed by an
//! anonymous temp file. Callers treat an XFile as extended RAM: any
//! short or failed I/O is reported as out-of-memory.

use std::fs::File;
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileExt;

use crate::error::FxfsrError;

/// Page granularity of an XFile. Hole punches round to this.
pub const XFILE_BLOCK_SIZE: u64 = 4096;

/// A paged scratch file. Sparse: unwritten ranges read back as zeroes
/// and consume no storage.
pub struct XFile {
    file: File,
    descr: &'static str,
}

/// Usage statistics for an XFile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XFileStat {
    /// Logical size (highest written offset rounds up to this).
    pub size: u64,
    /// Bytes actually backed by storage.
    pub bytes_used: u64,
}

impl XFile {
    /// Create an anonymous scratch file. `descr` labels diagnostics.
    pub fn create(descr: &'static str) -> Result<Self, FxfsrError> {
        let file = tempfile::tempfile().map_err(|_| FxfsrError::OutOfMemory)?;
        log::trace!("xfile create: {descr}");
        Ok(XFile { file, descr })
    }

    pub fn descr(&self) -> &'static str {
        self.descr
    }

    /// Read `buf.len()` bytes at `pos`. Reads past the written size
    /// return zeroes, matching sparse-file semantics.
    pub fn pread(&self, buf: &mut [u8], pos: u64) -> Result<(), FxfsrError> {
        let size = self.file.metadata().map_err(|_| FxfsrError::OutOfMemory)?.len();
        if pos >= size {
            buf.fill(0);
            return Ok(());
        }
        let avail = (size - pos).min(buf.len() as u64) as usize;
        self.file
            .read_exact_at(&mut buf[..avail], pos)
            .map_err(|_| FxfsrError::OutOfMemory)?;
        buf[avail..].fill(0);
        Ok(())
    }

    /// Write `buf` at `pos`, growing the file as needed.
    pub fn pwrite(&mut self, buf: &[u8], pos: u64) -> Result<(), FxfsrError> {
        self.file.write_all_at(buf, pos).map_err(|_| FxfsrError::OutOfMemory)
    }

    /// Deallocate the byte range, leaving a hole that reads as zeroes.
    pub fn punch_hole(&mut self, pos: u64, len: u64) -> Result<(), FxfsrError> {
        if len == 0 {
            return Ok(());
        }
        #[cfg(target_os = "linux")]
        {
            let ret = unsafe {
                libc::fallocate(
                    self.file.as_raw_fd(),
                    libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                    pos as libc::off_t,
                    len as libc::off_t,
                )
            };
            if ret == 0 {
                return Ok(());
            }
            // Filesystems without punch-hole support fall through to
            // explicit zeroing.
        }
        let zeroes = vec![0u8; XFILE_BLOCK_SIZE as usize];
        let mut off = pos;
        let end = pos + len;
        while off < end {
            let chunk = (end - off).min(XFILE_BLOCK_SIZE) as usize;
            self.pwrite(&zeroes[..chunk], off)?;
            off += chunk as u64;
        }
        Ok(())
    }

    /// Logical size and physically backed bytes.
    pub fn stat(&self) -> Result<XFileStat, FxfsrError> {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(self.file.as_raw_fd(), &mut st) } != 0 {
            return Err(FxfsrError::OutOfMemory);
        }
        Ok(XFileStat {
            size: st.st_size as u64,
            bytes_used: st.st_blocks as u64 * 512,
        })
    }

    /// Log a usage summary for diagnostics.
    pub fn dump(&self) {
        match self.stat() {
            Ok(st) => log::debug!(
                "xfile {}: size {} bytes, {} in use",
                self.descr,
                st.size,
                st.bytes_used
            ),
            Err(_) => log::debug!("xfile {}: stat failed", self.descr),
        }
    }
}
