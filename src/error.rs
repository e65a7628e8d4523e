use thiserror::Error;

use crate::xfs::types::XfsAgnumber;

#[derive(Error, Debug)]
pub enum FxfsrError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Bad magic number in {0}")]
    BadMagic(&'static str),
    #[error("Parse error: {0}")]
    Parse(&'static str),
    #[error("CRC mismatch in {0}")]
    CrcMismatch(&'static str),
    #[error("corrupt {what} (group {agno}, block {bno})")]
    Corrupt {
        what: &'static str,
        agno: XfsAgnumber,
        bno: u64,
    },
    #[error("out of space: {0}")]
    NoSpace(&'static str),
    #[error("no free space in AG {0}")]
    AgFull(XfsAgnumber),
    #[error("out of memory")]
    OutOfMemory,
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("too many extents in fork")]
    TooManyExtents,
    /// Deferred-op requeue signal. Consumed by the defer engine,
    /// never surfaced to a caller.
    #[error("operation must be requeued")]
    Again,
}

impl FxfsrError {
    /// Errors that abort the whole run rather than the current group.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Io(_) | Self::OutOfMemory)
    }
}
