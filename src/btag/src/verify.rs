//! Field-by-field BTAG verification.
//!
//! Two tiers: Quick Verify covers the fields that distinguish one record
//! from another; Full Verify adds the structural fields. Callers subtract
//! the fields that random overwrites or read-only runs make stale. Every
//! failing field is reported; `eindex` is the byte offset of the first
//! (lowest-offset) mismatch so a hex dump can be pinpointed.

use bitflags::bitflags;

use crate::codec::{record_crc, Btag};
use crate::order::OrderSlot;
use crate::{BTAG_SIZE, OPAQUE_WRITE_ORDER, WRITE_ORDER_SIZE};

bitflags! {
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct VerifyFlags: u32 {
        const LBA           = 1 << 0;
        const INODE         = 1 << 1;
        const SERIAL        = 1 << 2;
        const HOSTNAME      = 1 << 3;
        const SIGNATURE     = 1 << 4;
        const PATTERN_TYPE  = 1 << 5;
        const FLAGS         = 1 << 6;
        const WRITE_START   = 1 << 7;
        const WRITE_SECS    = 1 << 8;
        const WRITE_USECS   = 1 << 9;
        const PATTERN       = 1 << 10;
        const GENERATION    = 1 << 11;
        const PID           = 1 << 12;
        const JOB           = 1 << 13;
        const THREAD        = 1 << 14;
        const CRC           = 1 << 15;
        const OPAQUE_DATA   = 1 << 16;
        // Full-verify additions.
        const DEVID         = 1 << 17;
        const VERSION       = 1 << 18;
        const DEVICE_SIZE   = 1 << 19;
        const RECORD_INDEX  = 1 << 20;
        const RECORD_SIZE   = 1 << 21;
        const RECORD_NUMBER = 1 << 22;
        const STEP_OFFSET   = 1 << 23;
        const OPAQUE_DESC   = 1 << 24;
    }
}

impl VerifyFlags {
    /// Quick Verify tier.
    pub fn quick() -> VerifyFlags {
        VerifyFlags::LBA
            | VerifyFlags::INODE
            | VerifyFlags::SERIAL
            | VerifyFlags::HOSTNAME
            | VerifyFlags::SIGNATURE
            | VerifyFlags::PATTERN_TYPE
            | VerifyFlags::FLAGS
            | VerifyFlags::WRITE_START
            | VerifyFlags::WRITE_SECS
            | VerifyFlags::WRITE_USECS
            | VerifyFlags::PATTERN
            | VerifyFlags::GENERATION
            | VerifyFlags::PID
            | VerifyFlags::JOB
            | VerifyFlags::THREAD
            | VerifyFlags::CRC
            | VerifyFlags::OPAQUE_DATA
    }

    /// Full Verify tier (quick plus structural fields).
    pub fn full() -> VerifyFlags {
        VerifyFlags::quick()
            | VerifyFlags::DEVID
            | VerifyFlags::VERSION
            | VerifyFlags::DEVICE_SIZE
            | VerifyFlags::RECORD_INDEX
            | VerifyFlags::RECORD_SIZE
            | VerifyFlags::RECORD_NUMBER
            | VerifyFlags::STEP_OFFSET
            | VerifyFlags::OPAQUE_DESC
    }

    /// Fields that overwrites make stale under random I/O.
    pub fn random_io_stale() -> VerifyFlags {
        VerifyFlags::WRITE_SECS
            | VerifyFlags::WRITE_USECS
            | VerifyFlags::RECORD_INDEX
            | VerifyFlags::RECORD_SIZE
            | VerifyFlags::RECORD_NUMBER
    }

    /// Fields a read-only run has no expectations for.
    pub fn read_only_stale() -> VerifyFlags {
        VerifyFlags::GENERATION
            | VerifyFlags::FLAGS
            | VerifyFlags::WRITE_START
            | VerifyFlags::WRITE_SECS
            | VerifyFlags::WRITE_USECS
            | VerifyFlags::PID
            | VerifyFlags::JOB
            | VerifyFlags::THREAD
            | VerifyFlags::RECORD_INDEX
            | VerifyFlags::RECORD_SIZE
            | VerifyFlags::RECORD_NUMBER
    }
}

/// One failing field, with display-ready values.
#[derive(Debug, Clone)]
pub struct FieldMismatch {
    pub field: &'static str,
    /// Byte offset of the field inside the BTAG.
    pub offset: usize,
    pub expected: String,
    pub actual: String,
}

#[derive(Debug, Default, Clone)]
pub struct VerifyReport {
    pub mismatches: Vec<FieldMismatch>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.mismatches.is_empty()
    }

    /// Byte offset of the first mismatching field.
    pub fn eindex(&self) -> Option<usize> {
        self.mismatches.iter().map(|m| m.offset).min()
    }

    fn push(&mut self, field: &'static str, offset: usize, expected: String, actual: String) {
        self.mismatches.push(FieldMismatch {
            field,
            offset,
            expected,
            actual,
        });
    }

    fn check_u64(
        &mut self,
        field: &'static str,
        offset: usize,
        expected: u64,
        actual: u64,
    ) {
        if expected != actual {
            self.push(field, offset, expected.to_string(), actual.to_string());
        }
    }

    fn check_hex(
        &mut self,
        field: &'static str,
        offset: usize,
        expected: u64,
        actual: u64,
    ) {
        if expected != actual {
            self.push(
                field,
                offset,
                format!("{expected:#x}"),
                format!("{actual:#x}"),
            );
        }
    }

    fn check_bytes(&mut self, field: &'static str, offset: usize, expected: &[u8], actual: &[u8]) {
        if expected != actual {
            self.push(
                field,
                offset,
                format!("{:02x?}", expected),
                format!("{:02x?}", actual),
            );
        }
    }
}

pub struct VerifyInput<'a> {
    /// The header this device would have written at this location.
    pub expected: &'a Btag,
    /// The full record as read back, from BTAG offset 0 to end of block.
    pub record: &'a [u8],
    pub flags: VerifyFlags,
    /// Expected opaque contents, when the caller can know them.
    pub expected_opaque: Option<OrderSlot>,
}

/// Compare a re-read record against expectations. Reports every failing
/// field rather than stopping at the first.
pub fn verify(input: &VerifyInput<'_>) -> VerifyReport {
    let mut report = VerifyReport::default();
    let flags = input.flags;
    let expected = input.expected;

    let actual = match Btag::decode(input.record) {
        Ok(tag) => tag,
        Err(_) => {
            report.push(
                "record",
                0,
                format!("at least {BTAG_SIZE} bytes"),
                format!("{} bytes", input.record.len()),
            );
            return report;
        }
    };

    if flags.contains(VerifyFlags::LBA) {
        report.check_u64("lba/offset", 0, expected.lba(), actual.lba());
    }
    if flags.intersects(VerifyFlags::INODE | VerifyFlags::DEVID) {
        let field = if flags.contains(VerifyFlags::DEVID) {
            "devid"
        } else {
            "inode"
        };
        report.check_u64(field, 8, expected.devid(), actual.devid());
    }
    if flags.contains(VerifyFlags::SERIAL) {
        report.check_bytes("serial", 16, expected.serial(), actual.serial());
    }
    if flags.contains(VerifyFlags::HOSTNAME) {
        report.check_bytes("hostname", 32, expected.hostname(), actual.hostname());
    }
    if flags.contains(VerifyFlags::SIGNATURE) {
        report.check_hex(
            "signature",
            56,
            expected.signature() as u64,
            actual.signature() as u64,
        );
    }
    if flags.contains(VerifyFlags::VERSION) {
        report.check_u64("version", 60, expected.version() as u64, actual.version() as u64);
    }
    if flags.contains(VerifyFlags::PATTERN_TYPE) {
        report.check_hex(
            "pattern_type",
            61,
            expected.pattern_type() as u64,
            actual.pattern_type() as u64,
        );
    }
    if flags.contains(VerifyFlags::FLAGS) {
        report.check_hex(
            "flags",
            62,
            expected.flags().bits() as u64,
            actual.flags().bits() as u64,
        );
    }
    if flags.contains(VerifyFlags::WRITE_START) {
        report.check_u64(
            "write_pass_start",
            64,
            expected.write_start() as u64,
            actual.write_start() as u64,
        );
    }
    if flags.contains(VerifyFlags::WRITE_SECS) {
        report.check_u64(
            "write_secs",
            68,
            expected.write_secs() as u64,
            actual.write_secs() as u64,
        );
    }
    if flags.contains(VerifyFlags::WRITE_USECS) {
        report.check_u64(
            "write_usecs",
            72,
            expected.write_usecs() as u64,
            actual.write_usecs() as u64,
        );
    }
    if flags.contains(VerifyFlags::PATTERN) {
        report.check_hex(
            "pattern",
            76,
            expected.pattern() as u64,
            actual.pattern() as u64,
        );
    }
    if flags.contains(VerifyFlags::GENERATION) {
        report.check_u64(
            "generation",
            80,
            expected.generation() as u64,
            actual.generation() as u64,
        );
    }
    if flags.contains(VerifyFlags::PID) {
        report.check_u64(
            "process_id",
            84,
            expected.process_id() as u64,
            actual.process_id() as u64,
        );
    }
    if flags.contains(VerifyFlags::JOB) {
        report.check_u64("job_id", 88, expected.job_id() as u64, actual.job_id() as u64);
    }
    if flags.contains(VerifyFlags::THREAD) {
        report.check_u64(
            "thread_number",
            92,
            expected.thread_number() as u64,
            actual.thread_number() as u64,
        );
    }
    if flags.contains(VerifyFlags::DEVICE_SIZE) {
        report.check_u64(
            "device_size",
            96,
            expected.device_size() as u64,
            actual.device_size() as u64,
        );
    }
    if flags.contains(VerifyFlags::RECORD_INDEX) {
        report.check_u64(
            "record_index",
            100,
            expected.record_index() as u64,
            actual.record_index() as u64,
        );
    }
    if flags.contains(VerifyFlags::RECORD_SIZE) {
        report.check_u64(
            "record_size",
            104,
            expected.record_size() as u64,
            actual.record_size() as u64,
        );
    }
    if flags.contains(VerifyFlags::RECORD_NUMBER) {
        report.check_u64(
            "record_number",
            108,
            expected.record_number() as u64,
            actual.record_number() as u64,
        );
    }
    if flags.contains(VerifyFlags::STEP_OFFSET) {
        report.check_u64(
            "step_offset",
            112,
            expected.step_offset(),
            actual.step_offset(),
        );
    }
    if flags.contains(VerifyFlags::OPAQUE_DESC) {
        report.check_u64(
            "opaque_data_type",
            120,
            expected.opaque_data_type() as u64,
            actual.opaque_data_type() as u64,
        );
        report.check_u64(
            "opaque_data_size",
            121,
            expected.opaque_data_size() as u64,
            actual.opaque_data_size() as u64,
        );
    }
    if flags.contains(VerifyFlags::CRC) {
        match record_crc(input.record) {
            Ok(computed) => {
                report.check_hex("crc32", 124, computed as u64, actual.crc32() as u64)
            }
            Err(_) => report.push(
                "crc32",
                124,
                "computable".into(),
                "record too short".into(),
            ),
        }
    }
    if flags.contains(VerifyFlags::OPAQUE_DATA)
        && actual.opaque_data_type() == OPAQUE_WRITE_ORDER
    {
        let span = BTAG_SIZE + WRITE_ORDER_SIZE;
        if input.record.len() < span {
            report.push(
                "opaque_data",
                BTAG_SIZE,
                format!("{WRITE_ORDER_SIZE} bytes"),
                "truncated".into(),
            );
        } else if let Some(expected_slot) = input.expected_opaque {
            let actual_slot = OrderSlot::decode(&input.record[BTAG_SIZE..span]);
            if actual_slot != Some(expected_slot) {
                report.push(
                    "opaque_data",
                    BTAG_SIZE,
                    format!("{expected_slot:?}"),
                    format!("{actual_slot:?}"),
                );
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode, TemplateInit, WriteStamp};
    use crate::order::{OrderSlot, WriteOrder};
    use crate::{BtagFlags, PatternKind, PatternModifiers};

    fn template() -> Btag {
        Btag::template(&TemplateInit {
            serial: b"SAN0001",
            hostname: b"testhost",
            devid_or_inode: 77,
            pattern_kind: PatternKind::Iot,
            pattern_modifiers: PatternModifiers::empty(),
            flags: BtagFlags::FILE,
            write_pass_start: 1_700_000_000,
            process_id: 4242,
            job_id: 1,
            thread_number: 0,
            device_size: 512,
            opaque: true,
        })
    }

    fn stamp() -> WriteStamp {
        WriteStamp {
            lba_or_offset: 8192,
            secs: 1_700_000_100,
            usecs: 250_000,
            pattern: 0x01010101,
            generation: 3,
            record_index: 2,
            record_size: 4096,
            record_number: 3,
            step_offset: 0,
        }
    }

    fn written_record() -> Vec<u8> {
        let mut record = vec![0u8; 4096];
        encode(&mut record, &template(), &stamp(), &OrderSlot::Empty).unwrap();
        record
    }

    fn expected_tag() -> Btag {
        let record = written_record();
        Btag::decode(&record).unwrap()
    }

    #[test]
    fn clean_record_passes_full_verify() {
        let record = written_record();
        let expected = expected_tag();
        let report = verify(&VerifyInput {
            expected: &expected,
            record: &record,
            flags: VerifyFlags::full(),
            expected_opaque: Some(OrderSlot::Empty),
        });
        assert!(report.is_ok(), "mismatches: {:?}", report.mismatches);
    }

    #[test]
    fn payload_flip_breaks_only_crc() {
        let mut record = written_record();
        let expected = expected_tag();
        record[2048] ^= 0x01;
        let report = verify(&VerifyInput {
            expected: &expected,
            record: &record,
            flags: VerifyFlags::full(),
            expected_opaque: Some(OrderSlot::Empty),
        });
        assert_eq!(report.mismatches.len(), 1);
        assert_eq!(report.eindex(), Some(124));
        assert_eq!(report.mismatches[0].field, "crc32");
    }

    #[test]
    fn eindex_is_lowest_offset() {
        let mut record = written_record();
        let expected = expected_tag();
        // Corrupt generation (offset 80) and thread_number (offset 92);
        // the CRC breaks too, but eindex must name the earliest field.
        record[80] ^= 0xFF;
        record[92] ^= 0xFF;
        let report = verify(&VerifyInput {
            expected: &expected,
            record: &record,
            flags: VerifyFlags::full(),
            expected_opaque: Some(OrderSlot::Empty),
        });
        assert!(report.mismatches.len() >= 3);
        assert_eq!(report.eindex(), Some(80));
    }

    #[test]
    fn random_io_skips_stale_fields() {
        let mut record = written_record();
        let expected = expected_tag();
        // A random pass may legitimately see an older record_number; that
        // field must not be checked once the stale set is removed.
        record[108] = 0x99;
        let flags = VerifyFlags::full() - VerifyFlags::random_io_stale() - VerifyFlags::CRC;
        let report = verify(&VerifyInput {
            expected: &expected,
            record: &record,
            flags,
            expected_opaque: Some(OrderSlot::Empty),
        });
        assert!(report.is_ok(), "mismatches: {:?}", report.mismatches);
    }

    #[test]
    fn opaque_entry_mismatch_is_reported() {
        let template = template();
        let mut record = vec![0u8; 4096];
        let prior = OrderSlot::Written(WriteOrder {
            device_index: 1,
            size: 4096,
            offset: 0,
            secs: 1_700_000_050,
            usecs: 1,
            btag_crc: 0xABCD,
        });
        encode(&mut record, &template, &stamp(), &prior).unwrap();
        let expected = Btag::decode(&record).unwrap();

        let report = verify(&VerifyInput {
            expected: &expected,
            record: &record,
            flags: VerifyFlags::full(),
            expected_opaque: Some(OrderSlot::Empty),
        });
        assert!(!report.is_ok());
        assert_eq!(report.eindex(), Some(BTAG_SIZE));
    }
}
