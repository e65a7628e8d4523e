//! Raw block-device access: sector-aligned reads and writes, cache
//! flushing, and deterministic write-crash injection for recovery tests.

use std::ffi::CString;
use std::os::fd::RawFd;

use crate::error::FxfsrError;

/// Which device of the filesystem a handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevKind {
    Data,
    Log,
    Rt,
}

impl DevKind {
    fn crash_key(self) -> &'static str {
        match self {
            Self::Data => "ddev",
            Self::Log => "logdev",
            Self::Rt => "rtdev",
        }
    }
}

/// Parse `LIBXFS_DEBUG_WRITE_CRASH=ddev=N,logdev=M,rtdev=K` for one device.
/// Returns the number of writes to allow before simulating a crash.
fn crash_budget_from_env(kind: DevKind) -> Option<u64> {
    let spec = std::env::var("LIBXFS_DEBUG_WRITE_CRASH").ok()?;
    for part in spec.split(',') {
        let (dev, count) = part.split_once('=')?;
        if dev == kind.crash_key() {
            return count.parse::<u64>().ok();
        }
    }
    None
}

/// A block device (or image file) opened for repair.
pub struct BlockDev {
    fd: RawFd,
    kind: DevKind,
    size: u64,
    writes_until_crash: Option<u64>,
}

impl BlockDev {
    /// Open `path` read-write. Failure to open a named device is fatal.
    pub fn open(path: &str, kind: DevKind) -> Result<Self, FxfsrError> {
        let c_path =
            CString::new(path).map_err(|_| FxfsrError::Parse("invalid path (contains NUL)"))?;
        let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDWR) };
        if fd < 0 {
            return Err(FxfsrError::Io(std::io::Error::last_os_error()));
        }

        // Device/file size via lseek to end.
        let size = unsafe { libc::lseek(fd, 0, libc::SEEK_END) };
        if size < 0 {
            unsafe {
                libc::close(fd);
            }
            return Err(FxfsrError::Io(std::io::Error::last_os_error()));
        }

        Ok(Self {
            fd,
            kind,
            size: size as u64,
            writes_until_crash: crash_budget_from_env(kind),
        })
    }

    /// Device/file size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn kind(&self) -> DevKind {
        self.kind
    }

    /// Read exactly `buf.len()` bytes at byte offset `offset`.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<(), FxfsrError> {
        if offset + buf.len() as u64 > self.size {
            return Err(FxfsrError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "read beyond device boundary",
            )));
        }
        let mut total = 0usize;
        while total < buf.len() {
            let ret = unsafe {
                libc::pread(
                    self.fd,
                    buf[total..].as_mut_ptr() as *mut libc::c_void,
                    buf.len() - total,
                    (offset + total as u64) as libc::off_t,
                )
            };
            if ret < 0 {
                return Err(FxfsrError::Io(std::io::Error::last_os_error()));
            }
            if ret == 0 {
                return Err(FxfsrError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "unexpected EOF during pread",
                )));
            }
            total += ret as usize;
        }
        Ok(())
    }

    /// Write `buf` at byte offset `offset`.
    ///
    /// Honors the `LIBXFS_DEBUG_WRITE_CRASH` budget: once the configured
    /// number of writes has completed, the process aborts as if the
    /// machine lost power.
    pub fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<(), FxfsrError> {
        if offset + buf.len() as u64 > self.size {
            return Err(FxfsrError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "write beyond device boundary",
            )));
        }
        if let Some(budget) = self.writes_until_crash.as_mut() {
            if *budget == 0 {
                log::error!("simulated write crash on {:?} device", self.kind);
                std::process::abort();
            }
            *budget -= 1;
        }
        let mut total = 0usize;
        while total < buf.len() {
            let ret = unsafe {
                libc::pwrite(
                    self.fd,
                    buf[total..].as_ptr() as *const libc::c_void,
                    buf.len() - total,
                    (offset + total as u64) as libc::off_t,
                )
            };
            if ret < 0 {
                return Err(FxfsrError::Io(std::io::Error::last_os_error()));
            }
            if ret == 0 {
                return Err(FxfsrError::Io(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "short pwrite",
                )));
            }
            total += ret as usize;
        }
        Ok(())
    }

    /// Force the device write cache to stable storage.
    pub fn flush(&self) -> Result<(), FxfsrError> {
        if unsafe { libc::fsync(self.fd) } != 0 {
            return Err(FxfsrError::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl Drop for BlockDev {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
