//! Device contexts for the I/O exerciser.
//!
//! A [`DeviceContext`] is one device participant inside one worker thread:
//! an open handle, its geometry and range, per-pass counters, the buffers
//! I/O goes through, and the per-thread random stream that chooses sizes
//! and offsets. The read/write operations speak the engine's completion
//! contract: transient failures surface as `Retryable` and are reissued
//! without counting, EOF surfaces as a flagged zero-transfer, and short
//! writes on regular files latch a premature-EOF state that excludes the
//! context from further writes in the pass.

pub mod clock;
mod context;
mod history;

pub use context::{Completion, Counters, DeviceContext, DeviceSpec, LockMode};
pub use history::{History, HistoryEntry};

use bitflags::bitflags;
use thiserror::Error;

/// What the path refers to.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum DeviceKind {
    /// Raw block device addressed by LBA.
    Disk,
    /// Regular file addressed by byte offset.
    #[default]
    File,
}

/// Which half of the exerciser this context serves.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum IoMode {
    Read,
    #[default]
    Write,
    /// Read-after-write on the same device within the pass.
    Raw,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum IoDirection {
    #[default]
    Forward,
    Reverse,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum IoType {
    #[default]
    Sequential,
    Random,
}

bitflags! {
    /// Open-time behavior requested for the handle.
    #[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
    pub struct OpenFlags: u32 {
        const READ     = 1 << 0;
        const WRITE    = 1 << 1;
        const CREATE   = 1 << 2;
        const TRUNC    = 1 << 3;
        const DIRECT   = 1 << 4;
        const SYNC     = 1 << 5;
        const EXCL     = 1 << 6;
    }
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}: device is not open")]
    NotOpen(String),
    #[error("offset {offset} is not a multiple of the {dsize}-byte block size")]
    Misaligned { offset: u64, dsize: u32 },
    #[error("random data limit {limit} does not reach past the file position {base}")]
    InvalidRandomRange { limit: u64, base: u64 },
    #[error("transfer of {size} bytes cannot fit the random range of {span} bytes")]
    RandomTransferTooLarge { size: u64, span: u64 },
}

impl DeviceError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        DeviceError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}
