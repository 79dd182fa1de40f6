//! Block tag (BTAG) codec.
//!
//! Every record the exerciser writes begins with a 128-byte little-endian
//! header followed, when the device opts in, by a 28-byte write-order
//! extension and then the block payload. The header is self-describing
//! enough to survive random overwrites: a reader can check identity,
//! generation, timestamps and a CRC over the whole record without knowing
//! which pass wrote it.

mod codec;
mod order;
mod verify;

pub use codec::{encode, record_crc, update, Btag, TemplateInit, WriteStamp};
pub use order::{OrderSlot, RawWriteOrder, WriteOrder, WriteOrderRing};
pub use verify::{verify, FieldMismatch, VerifyFlags, VerifyInput, VerifyReport};

use bitflags::bitflags;
use crc::{Crc, CRC_32_ISO_HDLC};
use thiserror::Error;

/// Size of the fixed header on disk.
pub const BTAG_SIZE: usize = 128;
/// Size of the write-order extension on disk.
pub const WRITE_ORDER_SIZE: usize = 28;
/// Value of the `signature` field at byte 56.
pub const SIGNATURE: u32 = 0xBADC_AFEE;
/// Current header version.
pub const VERSION: u8 = 1;

/// `opaque_data_type` values.
pub const OPAQUE_NONE: u8 = 0;
pub const OPAQUE_WRITE_ORDER: u8 = 1;

/// Wire sentinel for "no prior write" in a write-order entry.
pub const NO_DEVICE_INDEX: u8 = 0xFF;

pub(crate) const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

bitflags! {
    /// The 16-bit `flags` field at byte 62.
    #[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
    pub struct BtagFlags: u16 {
        const FILE    = 1 << 0;
        const OPAQUE  = 1 << 1;
        const PREFIX  = 1 << 2;
        const RANDOM  = 1 << 3;
        const REVERSE = 1 << 4;
    }
}

/// Low bits of the `pattern_type` byte.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
#[repr(u8)]
pub enum PatternKind {
    #[default]
    Iot = 0x01,
    Incr = 0x02,
    Pattern = 0x03,
    PatternFile = 0x04,
}

impl PatternKind {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b & 0x0F {
            0x01 => Some(PatternKind::Iot),
            0x02 => Some(PatternKind::Incr),
            0x03 => Some(PatternKind::Pattern),
            0x04 => Some(PatternKind::PatternFile),
            _ => None,
        }
    }
}

bitflags! {
    /// High bits of the `pattern_type` byte.
    #[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
    pub struct PatternModifiers: u8 {
        const LBDATA    = 0x40;
        const TIMESTAMP = 0x80;
    }
}

/// Packs kind + modifiers into the on-disk `pattern_type` byte.
pub fn pattern_type_byte(kind: PatternKind, modifiers: PatternModifiers) -> u8 {
    kind as u8 | modifiers.bits()
}

#[derive(Debug, Error)]
pub enum BtagError {
    #[error("record of {0} bytes is too small for a block tag")]
    ShortRecord(usize),
    #[error("invalid opaque descriptor: type {dtype}, size {size}")]
    InvalidOpaque { dtype: u8, size: u16 },
    #[error("bad block tag signature {found:#010x}")]
    BadSignature { found: u32 },
}
