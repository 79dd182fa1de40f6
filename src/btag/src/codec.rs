use std::fmt;

use zerocopy::byteorder::{LittleEndian, U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, Unaligned};

use crate::order::OrderSlot;
use crate::{
    BtagError, BtagFlags, PatternKind, PatternModifiers, BTAG_SIZE, CRC32, OPAQUE_NONE,
    OPAQUE_WRITE_ORDER, SIGNATURE, VERSION, WRITE_ORDER_SIZE,
};

type Le16 = U16<LittleEndian>;
type Le32 = U32<LittleEndian>;
type Le64 = U64<LittleEndian>;

/// The 128-byte record header, bit-exact as written to disk.
///
/// The same struct serves as the per-device template (constant fields filled
/// once per pass) and as the decoded form of a header read back from media.
/// All multi-byte fields are little-endian regardless of host order.
#[derive(Copy, Clone, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct Btag {
    /// LBA for raw disks, byte offset for files.
    lba: Le64,
    /// Device id for raw disks, inode for files.
    devid: Le64,
    serial: [u8; 16],
    hostname: [u8; 24],
    signature: Le32,
    version: u8,
    pattern_type: u8,
    flags: Le16,
    write_start: Le32,
    write_secs: Le32,
    write_usecs: Le32,
    pattern: Le32,
    generation: Le32,
    process_id: Le32,
    job_id: Le32,
    thread_number: Le32,
    device_size: Le32,
    record_index: Le32,
    record_size: Le32,
    record_number: Le32,
    step_offset: Le64,
    opaque_data_type: u8,
    opaque_data_size: Le16,
    reserved: u8,
    crc32: Le32,
}

const _: () = assert!(std::mem::size_of::<Btag>() == BTAG_SIZE);

/// Constant (per-pass) template fields.
pub struct TemplateInit<'a> {
    pub serial: &'a [u8],
    pub hostname: &'a [u8],
    pub devid_or_inode: u64,
    pub pattern_kind: PatternKind,
    pub pattern_modifiers: PatternModifiers,
    pub flags: BtagFlags,
    /// Epoch seconds at pass start.
    pub write_pass_start: u32,
    pub process_id: u32,
    pub job_id: u32,
    pub thread_number: u32,
    pub device_size: u32,
    /// True when records carry the write-order extension.
    pub opaque: bool,
}

/// Per-record fields refreshed on every write.
#[derive(Debug, Copy, Clone, Default)]
pub struct WriteStamp {
    pub lba_or_offset: u64,
    pub secs: u32,
    pub usecs: u32,
    pub pattern: u32,
    pub generation: u32,
    pub record_index: u32,
    pub record_size: u32,
    pub record_number: u32,
    pub step_offset: u64,
}

fn pad_copy<const N: usize>(src: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    let n = src.len().min(N);
    out[..n].copy_from_slice(&src[..n]);
    out
}

impl Btag {
    pub fn template(init: &TemplateInit<'_>) -> Btag {
        let (opaque_type, opaque_size, flags) = if init.opaque {
            (
                OPAQUE_WRITE_ORDER,
                WRITE_ORDER_SIZE as u16,
                init.flags | BtagFlags::OPAQUE,
            )
        } else {
            (OPAQUE_NONE, 0, init.flags)
        };

        Btag {
            lba: Le64::new(0),
            devid: Le64::new(init.devid_or_inode),
            serial: pad_copy(init.serial),
            hostname: pad_copy(init.hostname),
            signature: Le32::new(SIGNATURE),
            version: VERSION,
            pattern_type: crate::pattern_type_byte(init.pattern_kind, init.pattern_modifiers),
            flags: Le16::new(flags.bits()),
            write_start: Le32::new(init.write_pass_start),
            write_secs: Le32::new(0),
            write_usecs: Le32::new(0),
            pattern: Le32::new(0),
            generation: Le32::new(0),
            process_id: Le32::new(init.process_id),
            job_id: Le32::new(init.job_id),
            thread_number: Le32::new(init.thread_number),
            device_size: Le32::new(init.device_size),
            record_index: Le32::new(0),
            record_size: Le32::new(0),
            record_number: Le32::new(0),
            step_offset: Le64::new(0),
            opaque_data_type: opaque_type,
            opaque_data_size: Le16::new(opaque_size),
            reserved: 0,
            crc32: Le32::new(0),
        }
    }

    /// Decode a header from the front of a record buffer.
    pub fn decode(record: &[u8]) -> Result<Btag, BtagError> {
        let tag =
            Btag::read_from_prefix(record).ok_or(BtagError::ShortRecord(record.len()))?;
        Ok(tag)
    }

    /// Like [`Btag::decode`] but also insists on the signature.
    pub fn decode_checked(record: &[u8]) -> Result<Btag, BtagError> {
        let tag = Btag::decode(record)?;
        if tag.signature() != SIGNATURE {
            return Err(BtagError::BadSignature {
                found: tag.signature(),
            });
        }
        Ok(tag)
    }

    /// Refresh the per-record fields from a write stamp (CRC cleared).
    pub fn apply_stamp(&mut self, stamp: &WriteStamp) {
        self.lba = Le64::new(stamp.lba_or_offset);
        self.write_secs = Le32::new(stamp.secs);
        self.write_usecs = Le32::new(stamp.usecs);
        self.pattern = Le32::new(stamp.pattern);
        self.generation = Le32::new(stamp.generation);
        self.record_index = Le32::new(stamp.record_index);
        self.record_size = Le32::new(stamp.record_size);
        self.record_number = Le32::new(stamp.record_number);
        self.step_offset = Le64::new(stamp.step_offset);
        self.crc32 = Le32::new(0);
    }

    /// Total bytes of header + opaque area for this template.
    pub fn header_span(&self) -> usize {
        BTAG_SIZE + self.opaque_data_size.get() as usize
    }

    pub fn carries_write_order(&self) -> bool {
        self.opaque_data_type == OPAQUE_WRITE_ORDER
    }

    pub fn lba(&self) -> u64 {
        self.lba.get()
    }
    pub fn devid(&self) -> u64 {
        self.devid.get()
    }
    pub fn serial(&self) -> &[u8; 16] {
        &self.serial
    }
    pub fn hostname(&self) -> &[u8; 24] {
        &self.hostname
    }
    pub fn signature(&self) -> u32 {
        self.signature.get()
    }
    pub fn version(&self) -> u8 {
        self.version
    }
    pub fn pattern_type(&self) -> u8 {
        self.pattern_type
    }
    pub fn flags(&self) -> BtagFlags {
        BtagFlags::from_bits_retain(self.flags.get())
    }
    pub fn write_start(&self) -> u32 {
        self.write_start.get()
    }
    pub fn write_secs(&self) -> u32 {
        self.write_secs.get()
    }
    pub fn write_usecs(&self) -> u32 {
        self.write_usecs.get()
    }
    pub fn pattern(&self) -> u32 {
        self.pattern.get()
    }
    pub fn generation(&self) -> u32 {
        self.generation.get()
    }
    pub fn process_id(&self) -> u32 {
        self.process_id.get()
    }
    pub fn job_id(&self) -> u32 {
        self.job_id.get()
    }
    pub fn thread_number(&self) -> u32 {
        self.thread_number.get()
    }
    pub fn device_size(&self) -> u32 {
        self.device_size.get()
    }
    pub fn record_index(&self) -> u32 {
        self.record_index.get()
    }
    pub fn record_size(&self) -> u32 {
        self.record_size.get()
    }
    pub fn record_number(&self) -> u32 {
        self.record_number.get()
    }
    pub fn step_offset(&self) -> u64 {
        self.step_offset.get()
    }
    pub fn opaque_data_type(&self) -> u8 {
        self.opaque_data_type
    }
    pub fn opaque_data_size(&self) -> u16 {
        self.opaque_data_size.get()
    }
    pub fn crc32(&self) -> u32 {
        self.crc32.get()
    }

    pub fn set_flags(&mut self, flags: BtagFlags) {
        self.flags = Le16::new(flags.bits());
    }

    pub fn set_pattern_type(&mut self, kind: PatternKind, modifiers: PatternModifiers) {
        self.pattern_type = crate::pattern_type_byte(kind, modifiers);
    }

    pub fn set_write_start(&mut self, epoch_secs: u32) {
        self.write_start = Le32::new(epoch_secs);
    }

    pub fn set_device_size(&mut self, dsize: u32) {
        self.device_size = Le32::new(dsize);
    }
}

/// CRC coverage: every byte of the record except the `crc32` field and,
/// when the opaque region is the ordering extension, that region (it is
/// chained through its own crc32 slot instead).
fn coverage_crc(record: &[u8], opaque_type: u8, opaque_size: u16) -> u32 {
    let mut digest = CRC32.digest();
    digest.update(&record[..BTAG_SIZE - 4]);
    let tail = &record[BTAG_SIZE..];
    if opaque_type == OPAQUE_WRITE_ORDER {
        let skip = (opaque_size as usize).min(tail.len());
        digest.update(&tail[skip..]);
    } else {
        digest.update(tail);
    }
    digest.finalize()
}

/// Recompute the CRC a record should carry, from its own descriptor.
pub fn record_crc(record: &[u8]) -> Result<u32, BtagError> {
    let tag = Btag::decode(record)?;
    Ok(coverage_crc(record, tag.opaque_data_type(), tag.opaque_data_size()))
}

/// Lay down a freshly stamped header (and write-order entry) at the front
/// of `record` and seal the CRC. `record` must span the whole block.
pub fn encode(
    record: &mut [u8],
    template: &Btag,
    stamp: &WriteStamp,
    order: &OrderSlot,
) -> Result<(), BtagError> {
    let span = template.header_span();
    if record.len() < span {
        return Err(BtagError::ShortRecord(record.len()));
    }

    let mut tag = *template;
    tag.apply_stamp(stamp);
    record[..BTAG_SIZE].copy_from_slice(tag.as_bytes());

    if tag.carries_write_order() {
        let wire = order.to_wire();
        record[BTAG_SIZE..span].copy_from_slice(wire.as_bytes());
    }

    let crc = coverage_crc(record, tag.opaque_data_type(), tag.opaque_data_size());
    record[BTAG_SIZE - 4..BTAG_SIZE].copy_from_slice(&crc.to_le_bytes());
    Ok(())
}

/// Refresh a record that already carries a header: the existing opaque
/// descriptor must agree with the template's expectation, then the header,
/// the carried-forward write-order entry, and the CRC are rewritten.
pub fn update(
    record: &mut [u8],
    template: &Btag,
    stamp: &WriteStamp,
    order: &OrderSlot,
) -> Result<(), BtagError> {
    let existing = Btag::decode(record)?;
    if existing.opaque_data_type() != template.opaque_data_type()
        || existing.opaque_data_size() != template.opaque_data_size()
    {
        return Err(BtagError::InvalidOpaque {
            dtype: existing.opaque_data_type(),
            size: existing.opaque_data_size(),
        });
    }
    encode(record, template, stamp, order)
}

impl fmt::Debug for Btag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Btag")
            .field("lba", &self.lba())
            .field("generation", &self.generation())
            .field("record_number", &self.record_number())
            .field("crc32", &format_args!("{:#010x}", self.crc32()))
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Btag {
    /// Multi-line field dump used in corruption diagnostics.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let serial = String::from_utf8_lossy(self.serial());
        let host = String::from_utf8_lossy(self.hostname());
        writeln!(f, "    lba/offset:    {}", self.lba())?;
        writeln!(f, "    devid/inode:   {}", self.devid())?;
        writeln!(f, "    serial:        {:?}", serial.trim_end_matches('\0'))?;
        writeln!(f, "    hostname:      {:?}", host.trim_end_matches('\0'))?;
        writeln!(f, "    signature:     {:#010x}", self.signature())?;
        writeln!(f, "    version:       {}", self.version())?;
        writeln!(f, "    pattern_type:  {:#04x}", self.pattern_type())?;
        writeln!(f, "    flags:         {:?}", self.flags())?;
        writeln!(f, "    write_start:   {}", self.write_start())?;
        writeln!(
            f,
            "    write time:    {}.{:06}",
            self.write_secs(),
            self.write_usecs()
        )?;
        writeln!(f, "    pattern:       {:#010x}", self.pattern())?;
        writeln!(f, "    generation:    {}", self.generation())?;
        writeln!(
            f,
            "    pid/job/thread: {}/{}/{}",
            self.process_id(),
            self.job_id(),
            self.thread_number()
        )?;
        writeln!(f, "    device_size:   {}", self.device_size())?;
        writeln!(
            f,
            "    record i/s/n:  {}/{}/{}",
            self.record_index(),
            self.record_size(),
            self.record_number()
        )?;
        writeln!(f, "    step_offset:   {}", self.step_offset())?;
        writeln!(
            f,
            "    opaque:        type {} size {}",
            self.opaque_data_type(),
            self.opaque_data_size()
        )?;
        write!(f, "    crc32:         {:#010x}", self.crc32())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::{OrderSlot, WriteOrder};
    use crate::{BtagFlags, PatternKind, PatternModifiers, NO_DEVICE_INDEX};

    fn template(opaque: bool) -> Btag {
        Btag::template(&TemplateInit {
            serial: b"SN123456",
            hostname: b"corruption-hunter",
            devid_or_inode: 0x1122334455667788,
            pattern_kind: PatternKind::Iot,
            pattern_modifiers: PatternModifiers::LBDATA,
            flags: BtagFlags::FILE | BtagFlags::PREFIX,
            write_pass_start: 1_699_999_999,
            process_id: 1234,
            job_id: 7,
            thread_number: 2,
            device_size: 512,
            opaque,
        })
    }

    fn stamp() -> WriteStamp {
        WriteStamp {
            lba_or_offset: 0x0000_0000_0001_0000,
            secs: 1_700_000_000,
            usecs: 123_456,
            pattern: 0xDEAD_BEEF,
            generation: 1,
            record_index: 4,
            record_size: 8192,
            record_number: 5,
            step_offset: 65536,
        }
    }

    #[test]
    fn on_disk_layout_is_bit_exact() {
        let mut record = vec![0u8; 8192];
        encode(&mut record, &template(true), &stamp(), &OrderSlot::Empty).unwrap();

        // Signature 0xBADCAFEE, little-endian at byte 56.
        assert_eq!(&record[56..60], &[0xEE, 0xAF, 0xDC, 0xBA]);
        // Version at 60.
        assert_eq!(record[60], crate::VERSION);
        // LBA at 0.
        assert_eq!(&record[0..8], &0x0001_0000u64.to_le_bytes());
        // Opaque descriptor: type 1, size 28 at 120..123.
        assert_eq!(record[120], crate::OPAQUE_WRITE_ORDER);
        assert_eq!(&record[121..123], &28u16.to_le_bytes());
        // Sentinel write-order entry directly after the header.
        assert_eq!(record[128], NO_DEVICE_INDEX);
        // Stored CRC matches a recomputation over the defined coverage.
        let stored = u32::from_le_bytes(record[124..128].try_into().unwrap());
        assert_eq!(stored, record_crc(&record).unwrap());
    }

    #[test]
    fn decode_round_trips_every_field() {
        let mut record = vec![0u8; 4096];
        let tmpl = template(true);
        encode(&mut record, &tmpl, &stamp(), &OrderSlot::Empty).unwrap();
        let tag = Btag::decode_checked(&record).unwrap();

        assert_eq!(tag.lba(), 0x0001_0000);
        assert_eq!(tag.devid(), 0x1122334455667788);
        assert_eq!(&tag.serial()[..8], b"SN123456");
        assert_eq!(&tag.hostname()[..17], b"corruption-hunter");
        assert_eq!(tag.signature(), crate::SIGNATURE);
        assert_eq!(tag.version(), crate::VERSION);
        assert_eq!(
            tag.pattern_type(),
            crate::pattern_type_byte(PatternKind::Iot, PatternModifiers::LBDATA)
        );
        assert!(tag.flags().contains(BtagFlags::FILE | BtagFlags::PREFIX | BtagFlags::OPAQUE));
        assert_eq!(tag.write_start(), 1_699_999_999);
        assert_eq!(tag.write_secs(), 1_700_000_000);
        assert_eq!(tag.write_usecs(), 123_456);
        assert_eq!(tag.pattern(), 0xDEAD_BEEF);
        assert_eq!(tag.generation(), 1);
        assert_eq!(tag.process_id(), 1234);
        assert_eq!(tag.job_id(), 7);
        assert_eq!(tag.thread_number(), 2);
        assert_eq!(tag.device_size(), 512);
        assert_eq!(tag.record_index(), 4);
        assert_eq!(tag.record_size(), 8192);
        assert_eq!(tag.record_number(), 5);
        assert_eq!(tag.step_offset(), 65536);
        assert_eq!(tag.header_span(), 156);
    }

    #[test]
    fn crc_ignores_ordering_extension() {
        let tmpl = template(true);
        let mut a = vec![0u8; 4096];
        let mut b = vec![0u8; 4096];
        encode(&mut a, &tmpl, &stamp(), &OrderSlot::Empty).unwrap();
        let prior = OrderSlot::Written(WriteOrder {
            device_index: 0,
            size: 4096,
            offset: 0,
            secs: 9,
            usecs: 9,
            btag_crc: 9,
        });
        encode(&mut b, &tmpl, &stamp(), &prior).unwrap();
        // The ordering extension chains through its own crc32 slot; the
        // record CRC must not depend on it.
        assert_eq!(record_crc(&a).unwrap(), record_crc(&b).unwrap());
        assert_ne!(a[128..156], b[128..156]);
    }

    #[test]
    fn update_requires_matching_opaque_descriptor() {
        let with_order = template(true);
        let without = template(false);

        let mut record = vec![0u8; 4096];
        encode(&mut record, &without, &stamp(), &OrderSlot::Empty).unwrap();

        let err = update(&mut record, &with_order, &stamp(), &OrderSlot::Empty).unwrap_err();
        assert!(matches!(err, BtagError::InvalidOpaque { dtype: 0, size: 0 }));

        // A record written with the extension updates cleanly.
        encode(&mut record, &with_order, &stamp(), &OrderSlot::Empty).unwrap();
        update(&mut record, &with_order, &stamp(), &OrderSlot::Empty).unwrap();
    }

    #[test]
    fn short_record_is_rejected() {
        let mut record = vec![0u8; 64];
        let err = encode(&mut record, &template(false), &stamp(), &OrderSlot::Empty).unwrap_err();
        assert!(matches!(err, BtagError::ShortRecord(64)));
    }

    #[test]
    fn bad_signature_is_rejected() {
        let mut record = vec![0u8; 4096];
        encode(&mut record, &template(false), &stamp(), &OrderSlot::Empty).unwrap();
        record[57] ^= 0xFF;
        assert!(matches!(
            Btag::decode_checked(&record),
            Err(BtagError::BadSignature { .. })
        ));
    }
}
