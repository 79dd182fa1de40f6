//! Per-thread circular record of the most recent writes.
//!
//! The ring holds one slot per output device, so at any moment each device
//! has at most one in-flight "previous write" reference. The entry recorded
//! for a write is embedded into the *next* record's opaque area; on read it
//! tells the verifier exactly which earlier record to re-read and what that
//! record's header must still look like.

use zerocopy::byteorder::{LittleEndian, U32, U64};
use zerocopy::{AsBytes, FromBytes, Unaligned};

use crate::codec::Btag;
use crate::{NO_DEVICE_INDEX, WRITE_ORDER_SIZE};

type Le32 = U32<LittleEndian>;
type Le64 = U64<LittleEndian>;

/// The 28-byte extension as written to disk.
#[derive(Copy, Clone, Default, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct RawWriteOrder {
    device_index: u8,
    reserved: [u8; 3],
    write_size: Le32,
    write_offset: Le64,
    write_secs: Le32,
    write_usecs: Le32,
    crc32: Le32,
}

const _: () = assert!(std::mem::size_of::<RawWriteOrder>() == WRITE_ORDER_SIZE);

/// Decoded write-order entry.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct WriteOrder {
    pub device_index: u8,
    pub size: u32,
    pub offset: u64,
    pub secs: u32,
    pub usecs: u32,
    /// CRC of the BTAG header this entry describes, for chaining.
    pub btag_crc: u32,
}

impl WriteOrder {
    /// Capture the entry for a just-written record. Raw disks record
    /// `lba * dsize`; files carry the byte offset in the tag verbatim.
    pub fn capture(tag: &Btag, device_index: u8, dsize: u32, raw_disk: bool) -> WriteOrder {
        let offset = if raw_disk {
            tag.lba() * dsize as u64
        } else {
            tag.lba()
        };
        WriteOrder {
            device_index,
            size: tag.record_size(),
            offset,
            secs: tag.write_secs(),
            usecs: tag.write_usecs(),
            btag_crc: tag.crc32(),
        }
    }
}

/// One ring slot. The sentinel ("no prior write") is a concrete variant
/// here; the 0xFF device index exists only on the wire.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub enum OrderSlot {
    #[default]
    Empty,
    Written(WriteOrder),
}

impl OrderSlot {
    pub fn to_wire(self) -> RawWriteOrder {
        match self {
            OrderSlot::Empty => RawWriteOrder {
                device_index: NO_DEVICE_INDEX,
                ..RawWriteOrder::default()
            },
            OrderSlot::Written(entry) => RawWriteOrder {
                device_index: entry.device_index,
                reserved: [0; 3],
                write_size: Le32::new(entry.size),
                write_offset: Le64::new(entry.offset),
                write_secs: Le32::new(entry.secs),
                write_usecs: Le32::new(entry.usecs),
                crc32: Le32::new(entry.btag_crc),
            },
        }
    }

    pub fn from_wire(raw: &RawWriteOrder) -> OrderSlot {
        if raw.device_index == NO_DEVICE_INDEX {
            OrderSlot::Empty
        } else {
            OrderSlot::Written(WriteOrder {
                device_index: raw.device_index,
                size: raw.write_size.get(),
                offset: raw.write_offset.get(),
                secs: raw.write_secs.get(),
                usecs: raw.write_usecs.get(),
                btag_crc: raw.crc32.get(),
            })
        }
    }

    /// Decode a slot from the opaque area of a record.
    pub fn decode(opaque: &[u8]) -> Option<OrderSlot> {
        RawWriteOrder::read_from_prefix(opaque).map(|raw| OrderSlot::from_wire(&raw))
    }
}

/// Fixed-capacity ring of write-order entries, one per output device.
#[derive(Debug, Default, Clone)]
pub struct WriteOrderRing {
    slots: Vec<OrderSlot>,
    index: usize,
    last: Option<usize>,
}

impl WriteOrderRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear and size the ring for a pass with `entries` output devices.
    pub fn setup(&mut self, entries: usize) {
        self.slots.clear();
        self.slots.resize(entries, OrderSlot::Empty);
        self.index = 0;
        self.last = None;
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Insert the entry for a just-completed write. `last` always points at
    /// the newest entry afterwards.
    pub fn record(&mut self, entry: WriteOrder) {
        debug_assert!(!self.slots.is_empty(), "ring used before setup");
        self.slots[self.index] = OrderSlot::Written(entry);
        self.last = Some(self.index);
        self.index = (self.index + 1) % self.slots.len();
    }

    /// The most recently inserted entry, or the sentinel before any write.
    pub fn last(&self) -> OrderSlot {
        match self.last {
            Some(at) => self.slots[at],
            None => OrderSlot::Empty,
        }
    }

    /// Slot that the next insert will overwrite (the oldest live entry once
    /// the ring has wrapped).
    pub fn oldest(&self) -> OrderSlot {
        if self.slots.is_empty() {
            OrderSlot::Empty
        } else {
            self.slots[self.index]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u32) -> WriteOrder {
        WriteOrder {
            device_index: (id % 4) as u8,
            size: 4096,
            offset: id as u64 * 4096,
            secs: 1_000 + id,
            usecs: id,
            btag_crc: id,
        }
    }

    #[test]
    fn sentinel_before_first_write() {
        let mut ring = WriteOrderRing::new();
        ring.setup(2);
        assert_eq!(ring.last(), OrderSlot::Empty);
        assert_eq!(ring.last().to_wire().device_index, NO_DEVICE_INDEX);
    }

    #[test]
    fn last_and_oldest_track_inserts() {
        let mut ring = WriteOrderRing::new();
        ring.setup(3);
        for id in 0..5 {
            ring.record(entry(id));
        }
        // After N inserts into capacity C, last is entry (N-1) and the
        // slot at N mod C holds the oldest live entry.
        assert_eq!(ring.last(), OrderSlot::Written(entry(4)));
        assert_eq!(ring.oldest(), OrderSlot::Written(entry(2)));
    }

    #[test]
    fn wire_round_trip_preserves_entry() {
        let slot = OrderSlot::Written(entry(9));
        let raw = slot.to_wire();
        assert_eq!(OrderSlot::from_wire(&raw), slot);

        let empty = OrderSlot::Empty.to_wire();
        assert_eq!(empty.device_index, NO_DEVICE_INDEX);
        assert_eq!(OrderSlot::from_wire(&empty), OrderSlot::Empty);
    }

    #[test]
    fn setup_resets_state() {
        let mut ring = WriteOrderRing::new();
        ring.setup(2);
        ring.record(entry(1));
        ring.setup(4);
        assert_eq!(ring.capacity(), 4);
        assert_eq!(ring.last(), OrderSlot::Empty);
    }
}
