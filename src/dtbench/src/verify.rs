//! The write-order verification protocol.
//!
//! A record's write-order extension names the previous write this thread
//! issued: which device, where, how big, when, and the CRC its block tag
//! carried. On every read the engine re-reads that referenced range and
//! proves the array still has it: every sub-block tag must pass CRC and
//! field checks, the first must match the recorded timestamps and CRC
//! exactly, and no sub-block may be newer than the record that references
//! it. This catches lost and reordered writes whose individual records are
//! otherwise self-consistent.

use btag::{
    verify as verify_tag, Btag, OrderSlot, VerifyFlags, VerifyInput, VerifyReport, WriteOrder,
    WriteStamp,
};
use devices::{Completion, DeviceKind};
use tracing::{error, warn};

use crate::info::DtappInfo;
use crate::options::DtOptions;
use crate::pattern::pattern_word;

#[derive(Debug)]
pub enum WriteOrderVerdict {
    /// The referenced previous write checked out.
    Clean,
    /// No prior write recorded (sentinel entry).
    NoPrior,
    /// Non-fatal: the reference could not be checked.
    Warning(String),
    /// The previous write is missing, stale, or corrupt.
    Failure(String),
}

impl WriteOrderVerdict {
    pub fn is_failure(&self) -> bool {
        matches!(self, WriteOrderVerdict::Failure(_))
    }
}

/// Field set for re-read verification: the per-record stamps the reader
/// cannot reconstruct are left to the explicit write-order comparisons.
fn reread_flags() -> VerifyFlags {
    VerifyFlags::full()
        - VerifyFlags::WRITE_SECS
        - VerifyFlags::WRITE_USECS
        - VerifyFlags::RECORD_INDEX
        - VerifyFlags::RECORD_NUMBER
        - VerifyFlags::RECORD_SIZE
        - VerifyFlags::OPAQUE_DATA
}

/// Validate every block tag inside a re-read buffer against the writing
/// device's expectations. Returns the first offending sub-block and its
/// report.
pub fn verify_buffer_btags(
    buffer: &[u8],
    dsize: u32,
    template: &Btag,
    generation: u32,
    entry: &WriteOrder,
    raw_disk: bool,
    opts: &DtOptions,
) -> Result<(), (usize, VerifyReport)> {
    let dsize_bytes = dsize as usize;
    let blocks = buffer.len() / dsize_bytes;

    for sub in 0..blocks {
        let block = &buffer[sub * dsize_bytes..(sub + 1) * dsize_bytes];
        let lba = if raw_disk {
            entry.offset / dsize as u64 + sub as u64
        } else {
            entry.offset + (sub * dsize_bytes) as u64
        };

        let mut expected = *template;
        expected.apply_stamp(&WriteStamp {
            lba_or_offset: lba,
            pattern: pattern_word(&opts.pattern, lba),
            generation,
            record_size: entry.size,
            step_offset: opts.step,
            ..WriteStamp::default()
        });

        let report = verify_tag(&VerifyInput {
            expected: &expected,
            record: block,
            flags: reread_flags(),
            expected_opaque: None,
        });
        if !report.is_ok() {
            return Err((sub, report));
        }
    }
    Ok(())
}

/// Run the full protocol for one just-read record.
///
/// `current` is the first sub-block tag of the record that was read;
/// `slot` is the write-order entry decoded from its opaque area.
/// `random_io` relaxes the newer-than-recorded cases: under random I/O a
/// later write may legitimately overwrite the referenced range, so only a
/// *stale* reference (older than recorded) stays a hard failure.
pub fn verify_write_order(
    info: &mut DtappInfo,
    current: &Btag,
    slot: OrderSlot,
    random_io: bool,
    opts: &DtOptions,
) -> WriteOrderVerdict {
    let entry = match slot {
        OrderSlot::Empty => return WriteOrderVerdict::NoPrior,
        OrderSlot::Written(entry) => entry,
    };

    let Some(referenced) = info.output_by_device_index(entry.device_index) else {
        warn!(
            device_index = entry.device_index,
            "write-order entry references an unknown device"
        );
        return WriteOrderVerdict::Warning(format!(
            "write-order device index {} out of range",
            entry.device_index
        ));
    };

    let size = entry.size as usize;
    {
        let dip = &mut info.devices[referenced];
        match dip.read_verify(size, entry.offset) {
            Ok(Completion::Transferred(n)) if n >= size => {}
            Ok(done) => {
                return fail(
                    info,
                    referenced,
                    current,
                    &entry,
                    format!(
                        "referenced range {}+{} unreadable ({done:?})",
                        entry.offset, entry.size
                    ),
                );
            }
            Err(e) => {
                return fail(
                    info,
                    referenced,
                    current,
                    &entry,
                    format!("re-read of previous write failed: {e}"),
                );
            }
        }
    }

    let dip = &info.devices[referenced];
    let raw_disk = dip.kind == DeviceKind::Disk;
    let template = dip
        .btag_template
        .expect("template installed before verification");
    let buffer = &dip.verify_data()[..size];

    if let Err((sub, report)) = verify_buffer_btags(
        buffer,
        dip.dsize,
        &template,
        current.generation(),
        &entry,
        raw_disk,
        opts,
    ) {
        let eindex = report.eindex().unwrap_or(0);
        return fail(
            info,
            referenced,
            current,
            &entry,
            format!(
                "previous write sub-block {sub} fails verification at byte {eindex}: {:?}",
                report.mismatches.first().map(|m| m.field)
            ),
        );
    }

    let dsize_bytes = dip.dsize as usize;
    for sub in 0..size / dsize_bytes {
        let block = &buffer[sub * dsize_bytes..(sub + 1) * dsize_bytes];
        let tag = match Btag::decode_checked(block) {
            Ok(tag) => tag,
            Err(e) => {
                return fail(
                    info,
                    referenced,
                    current,
                    &entry,
                    format!("previous write sub-block {sub}: {e}"),
                );
            }
        };

        let expected_offset = entry.offset + (sub * dsize_bytes) as u64;
        let tag_offset = if raw_disk {
            tag.lba() * dip.dsize as u64
        } else {
            tag.lba()
        };
        if tag_offset != expected_offset {
            return fail(
                info,
                referenced,
                current,
                &entry,
                format!(
                    "previous write offset mismatch: expected {expected_offset}, on-disk {tag_offset}"
                ),
            );
        }

        if sub == 0 {
            if tag.record_size() != entry.size {
                return fail(
                    info,
                    referenced,
                    current,
                    &entry,
                    format!(
                        "previous write size mismatch: expected {}, on-disk {}",
                        entry.size,
                        tag.record_size()
                    ),
                );
            }
            // The first sub-block must carry exactly the recorded stamp;
            // later sub-blocks share it by construction.
            if (tag.write_secs(), tag.write_usecs()) != (entry.secs, entry.usecs)
                || tag.crc32() != entry.btag_crc
            {
                let newer = (tag.write_secs(), tag.write_usecs()) > (entry.secs, entry.usecs);
                if newer && random_io {
                    // A later random write legitimately claimed the range.
                    return WriteOrderVerdict::Warning(
                        "referenced range overwritten by a later random write".to_string(),
                    );
                }
                return fail(
                    info,
                    referenced,
                    current,
                    &entry,
                    format!(
                        "stale previous write: expected {}.{:06} crc {:#010x}, \
                         on-disk {}.{:06} crc {:#010x}",
                        entry.secs,
                        entry.usecs,
                        entry.btag_crc,
                        tag.write_secs(),
                        tag.write_usecs(),
                        tag.crc32()
                    ),
                );
            }
        }

        // Strict ordering: a previous write can never be newer than the
        // record that references it.
        if (tag.write_secs(), tag.write_usecs())
            > (current.write_secs(), current.write_usecs())
        {
            if random_io {
                return WriteOrderVerdict::Warning(
                    "referenced range overwritten by a later random write".to_string(),
                );
            }
            return fail(
                info,
                referenced,
                current,
                &entry,
                format!(
                    "previous write is newer than its referrer: {}.{:06} > {}.{:06}",
                    tag.write_secs(),
                    tag.write_usecs(),
                    current.write_secs(),
                    current.write_usecs()
                ),
            );
        }
    }

    WriteOrderVerdict::Clean
}

/// Emit the post-mortem and build the failure verdict: the current tag,
/// the referenced entry, the on-disk previous tag, and the referenced
/// device's request history.
fn fail(
    info: &DtappInfo,
    referenced: usize,
    current: &Btag,
    entry: &WriteOrder,
    reason: String,
) -> WriteOrderVerdict {
    let dip = &info.devices[referenced];
    error!(
        device = %dip.path.display(),
        device_index = entry.device_index,
        offset = entry.offset,
        size = entry.size,
        "write-order verification failure: {reason}"
    );
    error!("current record's block tag:\n{current}");
    if let Ok(previous) = Btag::decode(dip.verify_data()) {
        error!("referenced previous write's block tag:\n{previous}");
    }
    if dip.history.enabled() {
        error!(
            "request history for {}:\n{}",
            dip.path.display(),
            dip.history.dump()
        );
    }
    WriteOrderVerdict::Failure(reason)
}
