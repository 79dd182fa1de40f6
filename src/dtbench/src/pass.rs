//! The pass engine: one write or read sweep over a thread's devices.
//!
//! Each iteration picks one output (or input) device, draws a record size,
//! computes the offset for the pass direction, fills or checks the buffer
//! sub-block by sub-block, and issues the positioned I/O with a bounded
//! retry loop. Reads verify the pattern, the block tags, and the
//! write-order chain. The loop gates on pause/stop at its head, honors the
//! per-pass byte/record/error limits, and paces itself when an exact IOPS
//! target is set.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use btag::{
    encode as encode_tag, update as update_tag, verify as verify_tag, Btag, BtagError, BtagFlags,
    OrderSlot, PatternModifiers, VerifyFlags, VerifyInput, WriteOrder, WriteStamp,
};
use devices::clock::{epoch_micros, epoch_secs};
use devices::{
    Completion, DeviceContext, DeviceError, DeviceKind, HistoryEntry, IoDirection, IoMode, IoType,
    LockMode,
};
use jobs::{ExitStatus, ThreadControl};
use mtwist::Mt64;
use stencil::{expand, Env};
use tracing::{debug, error, info, warn};

use crate::info::{DtappInfo, Side};
use crate::options::{BlockSize, DirMode, DtOptions, EnableFlags, SizeIncrement, TypeMode};
use crate::pattern::{
    fill_payload, pattern_word, verify_pad, verify_payload, BlockLayout, PAD_BYTE,
};
use crate::trigger::Trigger;
use crate::verify::{verify_write_order, WriteOrderVerdict};

/// Window the data pointer rotates through for unaligned-buffer testing.
pub const ROTATE_SIZE: usize = 64;

/// How often the loop polls the stop-on file and the wall clock.
const CHECK_INTERVAL: u64 = 64;

pub struct PassEngine<'a> {
    pub info: &'a mut DtappInfo,
    opts: &'a DtOptions,
    control: &'a ThreadControl,
    trigger: Option<&'a Trigger>,
    pattern_file: Option<&'a [u8]>,
    run_start: Instant,
    pass_start: Instant,
    rng: Mt64,
    /// Seed for this thread's streams: the user seed, or one drawn at
    /// thread start so both pass halves still replay the same offsets.
    base_seed: u64,
    generation: u32,
    io_type: IoType,
    io_dir: IoDirection,
    rotate_offset: usize,
    last_keepalive: Instant,
    /// Accumulated pacing target in microseconds.
    pace_target_usecs: u64,
}

fn fire(trigger: Option<&Trigger>) {
    if let Some(trigger) = trigger {
        trigger.fire();
    }
}

impl<'a> PassEngine<'a> {
    pub fn new(
        info: &'a mut DtappInfo,
        opts: &'a DtOptions,
        control: &'a ThreadControl,
        trigger: Option<&'a Trigger>,
        pattern_file: Option<&'a [u8]>,
        run_start: Instant,
        base_seed: u64,
    ) -> PassEngine<'a> {
        PassEngine {
            info,
            opts,
            control,
            trigger,
            pattern_file,
            run_start,
            pass_start: Instant::now(),
            rng: Mt64::default(),
            base_seed,
            generation: 0,
            io_type: IoType::Sequential,
            io_dir: IoDirection::Forward,
            rotate_offset: 0,
            last_keepalive: Instant::now(),
            pace_target_usecs: 0,
        }
    }

    fn thread_seed(&self, pass_number: u64) -> u64 {
        // The read half of a pass must replay the write half's offsets, so
        // the salt uses only stable identity plus the pass number.
        self.base_seed
            .wrapping_add(self.info.devices[0].thread_number as u64)
            .wrapping_add(pass_number.wrapping_mul(0x9E37_79B9))
    }

    /// Common pre-pass work: reseed, vary type/direction, position devices,
    /// refresh tag templates, size the write-order ring.
    fn prepare(&mut self, pass_number: u64, side: Side, writing: bool) {
        self.pass_start = Instant::now();
        self.pace_target_usecs = 0;
        self.generation = pass_number as u32 + 1;

        let seed = self.thread_seed(pass_number);
        self.rng.reseed(seed);
        for dip in &mut self.info.devices {
            dip.rng.reseed(seed.wrapping_add(dip.index as u64 + 1));
        }

        // Both halves make the same draws so their streams stay aligned;
        // the read half then inherits the write half's vary decisions.
        let drawn_type = match self.opts.io_type {
            TypeMode::Sequential => IoType::Sequential,
            TypeMode::Random => IoType::Random,
            TypeMode::Vary => {
                if self.rng.next_u64() & 1 == 0 {
                    IoType::Sequential
                } else {
                    IoType::Random
                }
            }
        };
        let drawn_dir = match self.opts.io_dir {
            DirMode::Forward => IoDirection::Forward,
            DirMode::Reverse => IoDirection::Reverse,
            DirMode::Vary => {
                if self.rng.next_u64() & 1 == 0 {
                    IoDirection::Forward
                } else {
                    IoDirection::Reverse
                }
            }
        };
        if writing
            || self.info.outputs.is_empty()
            || !matches!(self.opts.io_type, TypeMode::Vary)
        {
            self.io_type = drawn_type;
        }
        if writing
            || self.info.outputs.is_empty()
            || !matches!(self.opts.io_dir, DirMode::Vary)
        {
            self.io_dir = drawn_dir;
        }

        let list: Vec<usize> = match side {
            Side::Input => self.info.inputs.clone(),
            Side::Output => self.info.outputs.clone(),
        };
        for &at in &list {
            let dip = &mut self.info.devices[at];
            dip.io_type = self.io_type;
            dip.direction = self.io_dir;
            dip.buffer_shift = 0;
            dip.start_pass();
            if self.io_dir == IoDirection::Reverse {
                let end = effective_end(dip);
                dip.offset = end / dip.dsize as u64 * dip.dsize as u64;
            }

            if let Some(template) = dip.btag_template.as_mut() {
                let mut flags = template.flags();
                flags.set(BtagFlags::RANDOM, self.io_type == IoType::Random);
                flags.set(BtagFlags::REVERSE, self.io_dir == IoDirection::Reverse);
                template.set_flags(flags);
                if writing {
                    template.set_write_start(epoch_secs());
                }
            }
        }

        if writing {
            self.info.order.setup(self.info.outputs.len());
        }
    }

    /// Draw the next record size for a device, honoring the size limits
    /// and the remaining per-pass budget. `None` means the device is done.
    fn draw_size(&mut self, at: usize, writing: bool) -> Option<usize> {
        let dsize = self.info.devices[at].dsize as usize;
        let mut size = match self.opts.block_size {
            BlockSize::Fixed(n) => n,
            BlockSize::Random => {
                let step = match self.opts.incr {
                    SizeIncrement::Fixed(n) => n.max(dsize),
                    SizeIncrement::Vary => dsize,
                };
                let lo = self.opts.min_size.max(dsize);
                let hi = self.opts.max_size.max(lo);
                let slots = ((hi - lo) / step) as u64;
                lo + (self.rng.range(0, slots) as usize) * step
            }
        };
        size = size / dsize * dsize;
        if size == 0 {
            return None;
        }

        let dip = &self.info.devices[at];
        if dip.data_limit > 0 {
            let moved = if writing {
                dip.counters.pass_bytes_written
            } else {
                dip.counters.pass_bytes_read
            };
            if moved >= dip.data_limit {
                return None;
            }
            let remaining = (dip.data_limit - moved) as usize;
            size = size.min(remaining / dsize * dsize);
            if size == 0 {
                return None;
            }
        }
        Some(size)
    }

    /// Offset and clamped size for this record per I/O direction. `None`
    /// means the range is exhausted in that direction (EOF latched).
    fn place(
        &mut self,
        at: usize,
        size: usize,
    ) -> Option<Result<(u64, usize), DeviceError>> {
        let dip = &mut self.info.devices[at];
        let dsize = dip.dsize as usize;
        match dip.io_type {
            IoType::Random => Some(dip.random_offset(size as u64).map(|off| (off, size))),
            IoType::Sequential => match dip.direction {
                IoDirection::Forward => {
                    let end = effective_end(dip);
                    if dip.offset + dsize as u64 > end {
                        dip.eof = true;
                        return None;
                    }
                    let fit = ((end - dip.offset) as usize / dsize) * dsize;
                    Some(Ok((dip.offset, size.min(fit))))
                }
                IoDirection::Reverse => {
                    // Stops exactly when the offset reaches the range start.
                    if dip.offset <= dip.file_position {
                        dip.eof = true;
                        return None;
                    }
                    let avail = (dip.offset - dip.file_position) as usize;
                    let take = size.min(avail);
                    Some(Ok((dip.offset - take as u64, take)))
                }
            },
        }
    }

    fn sub_lba(dip: &DeviceContext, offset: u64, sub: usize) -> u64 {
        // Raw disks address by LBA; files carry the byte offset verbatim.
        if dip.kind == DeviceKind::Disk {
            (dip.volume_base + offset) / dip.dsize as u64 + sub as u64
        } else {
            offset + (sub * dip.dsize as usize) as u64
        }
    }

    fn layout(dip: &DeviceContext) -> BlockLayout {
        let header = dip
            .btag_template
            .map(|t| t.header_span())
            .unwrap_or(btag::BTAG_SIZE);
        BlockLayout {
            header,
            prefix: dip.prefix.len(),
        }
    }

    /// Fill the data buffer for one record: pattern, prefix, and a block
    /// tag in every device-sized sub-block, all carrying the previous
    /// write's order entry.
    fn fill_record(&mut self, at: usize, offset: u64, size: usize, rot: usize) -> ExitStatus {
        let order = self.info.order.last();
        let generation = self.generation;
        let step = self.opts.step;
        let pattern = self.opts.pattern.clone();
        let pattern_file = self.pattern_file;

        let mut encode_err: Option<BtagError> = None;
        {
            let dip = &mut self.info.devices[at];
            let dsize = dip.dsize as usize;
            let layout = Self::layout(dip);
            let template = dip.btag_template.expect("template installed before writes");
            let modifiers = template_modifiers(&template);
            let (secs, usecs) = epoch_micros();
            let record_index = dip.counters.pass_records_written as u32;
            let record_number = record_index + 1;
            let raw_disk = dip.kind == DeviceKind::Disk;
            let volume_base = dip.volume_base;
            let prefix = std::mem::take(&mut dip.prefix);

            let buffer = &mut dip.data_mut()[rot..rot + size];
            for sub in 0..size / dsize {
                let lba = if raw_disk {
                    (volume_base + offset) / dsize as u64 + sub as u64
                } else {
                    offset + (sub * dsize) as u64
                };
                let block = &mut buffer[sub * dsize..(sub + 1) * dsize];

                fill_payload(block, layout, lba, &pattern, pattern_file, modifiers, secs);
                block[layout.header..layout.header + prefix.len()].copy_from_slice(&prefix);

                let stamp = WriteStamp {
                    lba_or_offset: lba,
                    secs,
                    usecs,
                    pattern: pattern_word(&pattern, lba),
                    generation,
                    record_index,
                    record_size: size as u32,
                    record_number,
                    step_offset: step,
                };
                // After the first record the buffer still carries the
                // previous header; update insists its opaque descriptor is
                // intact before overwriting it.
                let sealed = if block[56..60] == btag::SIGNATURE.to_le_bytes() {
                    update_tag(block, &template, &stamp, &order)
                } else {
                    encode_tag(block, &template, &stamp, &order)
                };
                if let Err(e) = sealed {
                    encode_err = Some(e);
                    break;
                }
            }
            dip.prefix = prefix;
        }

        if let Some(e) = encode_err {
            error!(
                device = %self.info.devices[at].path.display(),
                "block tag encode failed: {e}"
            );
            return ExitStatus::Failure;
        }
        ExitStatus::Success
    }

    /// Issue one I/O with the retry protocol: transient completions are
    /// reissued without counting, up to the recovery limit.
    fn submit(
        &mut self,
        at: usize,
        writing: bool,
        size: usize,
        offset: u64,
    ) -> Result<Completion, DeviceError> {
        let recovery_limit = self.control.tuning.recovery_limit.load(Ordering::Relaxed);
        let recovery_delay = self
            .control
            .tuning
            .recovery_delay_secs
            .load(Ordering::Relaxed);
        let mut attempts = 0;
        loop {
            if self.control.should_stop() {
                return Ok(Completion::Eof);
            }
            let dip = &mut self.info.devices[at];
            let outcome = if writing {
                dip.write_record(size, size, offset)
            } else {
                dip.read_record(size, size, offset)
            };
            match outcome {
                Ok(Completion::Retryable) => {
                    attempts += 1;
                    if attempts > recovery_limit {
                        warn!(
                            device = %self.info.devices[at].path.display(),
                            attempts, "transient errors exceeded the recovery limit"
                        );
                        return Ok(Completion::Eof);
                    }
                    std::thread::sleep(Duration::from_secs(recovery_delay));
                }
                other => {
                    let (secs, usecs) = epoch_micros();
                    let transferred = match &other {
                        Ok(Completion::Transferred(n)) => *n,
                        _ => 0,
                    };
                    let dip = &mut self.info.devices[at];
                    dip.history.push(HistoryEntry {
                        mode: if writing { IoMode::Write } else { IoMode::Read },
                        direction: dip.direction,
                        offset,
                        size,
                        transferred,
                        secs,
                        usecs,
                    });
                    return other;
                }
            }
        }
    }

    fn advance(&mut self, at: usize, offset: u64, moved: usize) {
        let step = self.opts.step;
        let dip = &mut self.info.devices[at];
        match dip.io_type {
            IoType::Random => {}
            IoType::Sequential => match dip.direction {
                IoDirection::Forward => {
                    dip.offset = offset + moved as u64 + step;
                    let end = effective_end(dip);
                    if dip.offset + dip.dsize as u64 > end {
                        dip.eof = true;
                    }
                }
                IoDirection::Reverse => {
                    dip.offset = offset.saturating_sub(step);
                    if dip.offset <= dip.file_position {
                        dip.offset = dip.file_position;
                        dip.eof = true;
                    }
                }
            },
        }
    }

    fn stop_file_present(&self) -> bool {
        self.opts
            .stop_on
            .as_ref()
            .map(|path| path.exists())
            .unwrap_or(false)
    }

    fn out_of_time(&self) -> bool {
        self.opts
            .runtime
            .map(|bound| self.run_start.elapsed() >= bound)
            .unwrap_or(false)
    }

    fn keepalive(&mut self, at: usize) {
        let period = {
            let tuned = self.control.tuning.keepalive_secs.load(Ordering::Relaxed);
            if tuned > 0 {
                tuned
            } else {
                self.opts.keepalive_secs
            }
        };
        if period == 0 || self.last_keepalive.elapsed().as_secs() < period {
            return;
        }
        self.last_keepalive = Instant::now();
        let Some(template) = self.opts.keepalive.as_deref() else {
            return;
        };
        let dip = &self.info.devices[at];
        let env = Env {
            dip: Some(dip),
            pass_start: Some(self.pass_start),
            run_start: Some(self.run_start),
            pass_limit: Some(self.opts.passes),
            error_limit: Some(self.opts.error_limit),
            ..Env::default()
        };
        info!("{}", expand(template, &env));
    }

    /// Exact-IOPS pacing: accumulate the per-loop budget and sleep off any
    /// surplus. Read-after-write counts double.
    fn pace(&mut self, ios: u64) {
        let Some(iops) = self.opts.iops else {
            return;
        };
        if iops == 0 {
            return;
        }
        self.pace_target_usecs += ios * 1_000_000 / iops as u64;
        let actual = self.pass_start.elapsed().as_micros() as u64;
        if actual < self.pace_target_usecs {
            std::thread::sleep(Duration::from_micros(self.pace_target_usecs - actual));
        }
    }

    /// One write pass over the output devices.
    pub fn write_pass(&mut self, pass_number: u64) -> ExitStatus {
        self.prepare(pass_number, Side::Output, true);
        let outputs = self.info.outputs.clone();
        if outputs.is_empty() {
            return ExitStatus::Success;
        }
        let trigger = self.trigger;

        if self.opts.enabled.contains(EnableFlags::FULL_LOCK) {
            for &at in &outputs {
                let dip = &self.info.devices[at];
                let end = effective_end(dip);
                if let Err(e) = dip.lock_range(dip.file_position, end, LockMode::Exclusive) {
                    warn!("full-range lock failed: {e}");
                }
            }
        }

        let mut status = ExitStatus::Success;
        let mut budget_done = vec![false; self.info.devices.len()];
        let mut iterations: u64 = 0;
        loop {
            if self.control.pause_point() {
                status = status.worst(ExitStatus::Warning);
                break;
            }
            iterations += 1;
            if iterations % CHECK_INTERVAL == 0
                && (self.stop_file_present() || self.out_of_time())
            {
                break;
            }
            if self.info.total_errors() >= self.opts.error_limit {
                status = ExitStatus::Failure;
                break;
            }
            if self.opts.record_limit > 0 {
                let records: u64 = outputs
                    .iter()
                    .map(|&at| self.info.devices[at].counters.pass_records_written)
                    .sum();
                if records >= self.opts.record_limit {
                    break;
                }
            }
            if outputs.iter().all(|&at| {
                budget_done[at]
                    || self.info.devices[at].eof
                    || self.info.devices[at].premature_eof
            }) {
                // A pass that only ran out of byte budget is a success;
                // hitting the end of the media is an EOF outcome.
                if outputs.iter().any(|&at| self.info.devices[at].eof) {
                    status = status.worst(ExitStatus::EndOfFile);
                }
                break;
            }

            // Pick a device at random; skip ones that are done.
            let nth = if outputs.len() > 1 {
                self.rng.range(0, outputs.len() as u64 - 1) as usize
            } else {
                0
            };
            let at = outputs[nth];
            self.info.current = at;
            if budget_done[at]
                || self.info.devices[at].eof
                || self.info.devices[at].premature_eof
            {
                continue;
            }

            let Some(size) = self.draw_size(at, true) else {
                budget_done[at] = true;
                continue;
            };
            let (offset, size) = match self.place(at, size) {
                None => continue,
                Some(Ok(placed)) => placed,
                Some(Err(e)) => {
                    error!("cannot place record: {e}");
                    self.info.devices[at].counters.errors += 1;
                    fire(trigger);
                    continue;
                }
            };
            if size == 0 {
                self.info.devices[at].eof = true;
                continue;
            }

            let rot = if self.opts.enabled.contains(EnableFlags::ROTATE) {
                let rot = self.rotate_offset % ROTATE_SIZE;
                self.rotate_offset += 1;
                rot
            } else {
                0
            };
            self.info.devices[at].buffer_shift = rot;

            if self.fill_record(at, offset, size, rot) == ExitStatus::Failure {
                status = ExitStatus::Failure;
                break;
            }

            let record_lock = self.opts.enabled.contains(EnableFlags::RECORD_LOCK);
            if record_lock {
                let dip = &self.info.devices[at];
                if let Err(e) = dip.lock_range(offset, size as u64, LockMode::Exclusive) {
                    warn!("record lock failed: {e}");
                }
            }

            let outcome = self.submit(at, true, size, offset);
            let mut ios = 1;
            match outcome {
                Ok(Completion::Transferred(moved)) => {
                    if moved == size {
                        // Chain the record: capture the order entry from
                        // the first sub-block as actually written.
                        let dip = &self.info.devices[at];
                        let first = &dip.data()[rot..rot + dip.dsize as usize];
                        if let Ok(tag) = Btag::decode_checked(first) {
                            self.info.order.record(WriteOrder::capture(
                                &tag,
                                dip.index,
                                dip.dsize,
                                dip.kind == DeviceKind::Disk,
                            ));
                        }
                    }

                    let settled = {
                        let dsize = self.info.devices[at].dsize as usize;
                        moved / dsize * dsize
                    };
                    if self.opts.enabled.contains(EnableFlags::RAW) {
                        ios += 1;
                        if !self.raw_verify(at, offset, settled, rot) {
                            status = ExitStatus::Failure;
                        }
                    }
                    if self.info.mirror_mode()
                        && !self.mirror_verify(nth, at, offset, settled, rot)
                    {
                        status = ExitStatus::Failure;
                    }
                    self.advance(at, offset, moved);
                }
                Ok(Completion::Eof) => {
                    self.info.devices[at].eof = true;
                }
                Ok(Completion::Retryable) => unreachable!("submit resolves retries"),
                Err(e) => {
                    if is_no_space(&e) {
                        warn!(
                            device = %self.info.devices[at].path.display(),
                            "file system full; ending writes on this device"
                        );
                        self.info.devices[at].eof = true;
                    } else {
                        error!("write failed: {e}");
                        fire(trigger);
                    }
                }
            }

            if record_lock {
                let dip = &self.info.devices[at];
                let _ = dip.unlock_range(offset, size as u64);
            }

            if status == ExitStatus::Failure
                && self.info.total_errors() >= self.opts.error_limit
            {
                break;
            }
            self.keepalive(at);
            self.pace(ios);
        }

        if self.opts.enabled.contains(EnableFlags::FULL_LOCK) {
            for &at in &outputs {
                let dip = &self.info.devices[at];
                let end = effective_end(dip);
                let _ = dip.unlock_range(dip.file_position, end);
            }
        }
        for &at in &outputs {
            let dip = &mut self.info.devices[at];
            if dip.is_open() {
                if let Err(e) = dip.flush() {
                    warn!("flush failed: {e}");
                }
            }
        }
        status
    }

    /// Immediate re-read of a just-written record (raw mode).
    fn raw_verify(&mut self, at: usize, offset: u64, size: usize, rot: usize) -> bool {
        if size == 0 {
            return true;
        }
        let trigger = self.trigger;
        let reread_ok = {
            let dip = &mut self.info.devices[at];
            matches!(
                dip.read_verify(size, offset),
                Ok(Completion::Transferred(n)) if n >= size
            )
        };
        if !reread_ok {
            error!(
                device = %self.info.devices[at].path.display(),
                offset, "read-after-write could not re-read the record"
            );
            self.info.devices[at].counters.errors += 1;
            fire(trigger);
            return false;
        }

        let clean = {
            let dip = &self.info.devices[at];
            let written = &dip.data()[rot..rot + size];
            let reread = &dip.verify_data()[..size];
            if written == reread {
                true
            } else {
                let dsize = dip.dsize as usize;
                let sub = written
                    .chunks(dsize)
                    .zip(reread.chunks(dsize))
                    .position(|(a, b)| a != b)
                    .unwrap_or(0);
                let eindex = Btag::decode(&written[sub * dsize..]).ok().map(|expected| {
                    verify_tag(&VerifyInput {
                        expected: &expected,
                        record: &reread[sub * dsize..(sub + 1) * dsize],
                        flags: VerifyFlags::full(),
                        expected_opaque: None,
                    })
                    .eindex()
                });
                error!(
                    device = %dip.path.display(),
                    offset,
                    sub,
                    eindex = ?eindex.flatten(),
                    "read-after-write miscompare"
                );
                false
            }
        };
        if !clean {
            self.info.devices[at].counters.errors += 1;
            fire(trigger);
        }
        clean
    }

    /// Mirror mode: re-read the paired input and compare it with what was
    /// just written to the output.
    fn mirror_verify(
        &mut self,
        nth: usize,
        out_at: usize,
        offset: u64,
        size: usize,
        rot: usize,
    ) -> bool {
        if size == 0 {
            return true;
        }
        let Some(in_at) = self.info.paired_input(nth) else {
            return true;
        };
        let trigger = self.trigger;

        let reread_ok = {
            let dip = &mut self.info.devices[in_at];
            matches!(
                dip.read_verify(size, offset),
                Ok(Completion::Transferred(n)) if n >= size
            )
        };
        if !reread_ok {
            error!(
                input = %self.info.devices[in_at].path.display(),
                offset, "mirror re-read failed"
            );
            self.info.devices[in_at].counters.errors += 1;
            fire(trigger);
            return false;
        }

        let clean = {
            let written = &self.info.devices[out_at].data()[rot..rot + size];
            let mirrored = &self.info.devices[in_at].verify_data()[..size];
            if written == mirrored {
                true
            } else {
                let dsize = self.info.devices[out_at].dsize as usize;
                let sub = written
                    .chunks(dsize)
                    .zip(mirrored.chunks(dsize))
                    .position(|(a, b)| a != b)
                    .unwrap_or(0);
                let eindex = Btag::decode(&written[sub * dsize..]).ok().map(|expected| {
                    verify_tag(&VerifyInput {
                        expected: &expected,
                        record: &mirrored[sub * dsize..(sub + 1) * dsize],
                        flags: VerifyFlags::full(),
                        expected_opaque: None,
                    })
                    .eindex()
                });
                error!(
                    input = %self.info.devices[in_at].path.display(),
                    output = %self.info.devices[out_at].path.display(),
                    offset,
                    sub,
                    eindex = ?eindex.flatten(),
                    "mirror miscompare"
                );
                false
            }
        };
        if !clean {
            self.info.devices[in_at].counters.errors += 1;
            fire(trigger);
            return false;
        }

        // Chain-verify on the input side unless raw mode already did the
        // inline check against the same bytes.
        if self.opts.enabled.contains(EnableFlags::WRITE_ORDER)
            && !self.opts.enabled.contains(EnableFlags::RAW)
        {
            let decoded = {
                let dip = &self.info.devices[in_at];
                let block = &dip.verify_data()[..dip.dsize as usize];
                Btag::decode_checked(block)
                    .ok()
                    .map(|tag| (tag, decode_slot(block, &tag)))
            };
            if let Some((tag, Some(slot))) = decoded {
                let verdict = verify_write_order(
                    self.info,
                    &tag,
                    slot,
                    self.io_type == IoType::Random,
                    self.opts,
                );
                if verdict.is_failure() {
                    self.info.devices[in_at].counters.errors += 1;
                    fire(trigger);
                    return false;
                }
            }
        }
        true
    }

    /// One read pass. Read-only runs walk the input side; otherwise the
    /// outputs are re-read.
    pub fn read_pass(&mut self, pass_number: u64) -> ExitStatus {
        let side = if self.info.outputs.is_empty() {
            Side::Input
        } else {
            Side::Output
        };
        self.prepare(pass_number, side, false);
        let list: Vec<usize> = match side {
            Side::Input => self.info.inputs.clone(),
            Side::Output => self.info.outputs.clone(),
        };
        if list.is_empty() {
            return ExitStatus::Success;
        }
        let trigger = self.trigger;

        let read_only = self.info.outputs.is_empty();
        let mut status = ExitStatus::Success;
        let mut budget_done = vec![false; self.info.devices.len()];
        let mut iterations: u64 = 0;
        loop {
            if self.control.pause_point() {
                status = status.worst(ExitStatus::Warning);
                break;
            }
            iterations += 1;
            if iterations % CHECK_INTERVAL == 0
                && (self.stop_file_present() || self.out_of_time())
            {
                break;
            }
            if self.info.total_errors() >= self.opts.error_limit {
                status = ExitStatus::Failure;
                break;
            }
            if self.opts.record_limit > 0 {
                let records: u64 = list
                    .iter()
                    .map(|&at| self.info.devices[at].counters.pass_records_read)
                    .sum();
                if records >= self.opts.record_limit {
                    break;
                }
            }
            if list
                .iter()
                .all(|&at| budget_done[at] || self.info.devices[at].eof)
            {
                if list.iter().any(|&at| self.info.devices[at].eof) {
                    status = status.worst(ExitStatus::EndOfFile);
                }
                break;
            }

            let nth = if list.len() > 1 {
                self.rng.range(0, list.len() as u64 - 1) as usize
            } else {
                0
            };
            let at = list[nth];
            self.info.current = at;
            if budget_done[at] || self.info.devices[at].eof {
                continue;
            }

            let Some(drawn) = self.draw_size(at, false) else {
                budget_done[at] = true;
                continue;
            };
            let (offset, mut size) = match self.place(at, drawn) {
                None => continue,
                Some(Ok(placed)) => placed,
                Some(Err(e)) => {
                    error!("cannot place record: {e}");
                    self.info.devices[at].counters.errors += 1;
                    continue;
                }
            };
            if size == 0 {
                self.info.devices[at].eof = true;
                continue;
            }

            // Only bytes this run actually wrote are valid to check; past
            // a premature EOF that bound is sticky and hard.
            {
                let dip = &self.info.devices[at];
                if !read_only && dip.written_high > 0 {
                    if offset >= dip.written_high {
                        self.info.devices[at].eof = true;
                        continue;
                    }
                    size = size.min((dip.written_high - offset) as usize);
                }
            }

            if self.opts.enabled.contains(EnableFlags::PAD_CHECK) {
                let dip = &mut self.info.devices[at];
                dip.data_mut()[..size].fill(PAD_BYTE);
            }

            let outcome = self.submit(at, false, size, offset);
            match outcome {
                Ok(Completion::Transferred(moved)) => {
                    if !self.verify_record(at, offset, size, moved, read_only) {
                        status = ExitStatus::Failure;
                    }
                    self.advance(at, offset, moved);
                    if moved < size {
                        // Short read: the rest of the range is past EOF.
                        self.info.devices[at].eof = true;
                    }
                }
                Ok(Completion::Eof) => {
                    self.info.devices[at].eof = true;
                }
                Ok(Completion::Retryable) => unreachable!("submit resolves retries"),
                Err(e) => {
                    error!("read failed: {e}");
                    fire(trigger);
                }
            }

            if status == ExitStatus::Failure
                && self.info.total_errors() >= self.opts.error_limit
            {
                break;
            }
            self.keepalive(at);
            self.pace(1);
        }
        status
    }

    /// Verify one just-read record: pad bytes, block tags, payload
    /// pattern, and the write-order chain.
    fn verify_record(
        &mut self,
        at: usize,
        offset: u64,
        size: usize,
        moved: usize,
        read_only: bool,
    ) -> bool {
        if !self.opts.enabled.contains(EnableFlags::COMPARE) {
            return true;
        }
        let trigger = self.trigger;

        if self.opts.enabled.contains(EnableFlags::PAD_CHECK) && moved < size {
            let bad = {
                let dip = &self.info.devices[at];
                verify_pad(&dip.data()[..size], moved)
            };
            if let Some(bad) = bad {
                error!(
                    device = %self.info.devices[at].path.display(),
                    offset,
                    pad_offset = bad,
                    "pad bytes disturbed after a short read"
                );
                self.info.devices[at].counters.errors += 1;
                fire(trigger);
                return false;
            }
        }

        let whole = {
            let dsize = self.info.devices[at].dsize as usize;
            moved / dsize * dsize
        };
        if whole == 0 {
            return true;
        }

        // Per-record stamps a reader cannot reconstruct are left to the
        // write-order chain; the rest of the quick tier applies.
        let mut flags = VerifyFlags::quick()
            - VerifyFlags::WRITE_SECS
            - VerifyFlags::WRITE_USECS
            - VerifyFlags::OPAQUE_DATA;
        if self.io_type == IoType::Random {
            flags -= VerifyFlags::random_io_stale();
        }
        if read_only {
            flags -= VerifyFlags::read_only_stale();
            flags -= VerifyFlags::PATTERN;
        }

        let mut ok = true;
        let mut first_tag: Option<Btag> = None;
        let mut slot: Option<OrderSlot> = None;
        {
            let generation = self.generation;
            let dip = &self.info.devices[at];
            let dsize = dip.dsize as usize;
            let layout = Self::layout(dip);
            let template = dip.btag_template.expect("template installed before reads");
            let data = &dip.data()[..whole];

            for sub in 0..whole / dsize {
                let block = &data[sub * dsize..(sub + 1) * dsize];
                let lba = Self::sub_lba(dip, offset, sub);

                let mut expected = template;
                expected.apply_stamp(&WriteStamp {
                    lba_or_offset: lba,
                    pattern: pattern_word(&self.opts.pattern, lba),
                    generation,
                    record_size: size as u32,
                    step_offset: self.opts.step,
                    ..WriteStamp::default()
                });
                let report = verify_tag(&VerifyInput {
                    expected: &expected,
                    record: block,
                    flags,
                    expected_opaque: None,
                });
                if !report.is_ok() {
                    let first = report.mismatches.first();
                    error!(
                        device = %dip.path.display(),
                        offset,
                        sub,
                        eindex = ?report.eindex(),
                        field = ?first.map(|m| m.field),
                        expected = ?first.map(|m| m.expected.clone()),
                        received = ?first.map(|m| m.actual.clone()),
                        "block tag verification failed"
                    );
                    if let Ok(bad) = Btag::decode(block) {
                        error!("on-disk block tag:\n{bad}");
                    }
                    if dip.history.enabled() {
                        error!(
                            "request history for {}:\n{}",
                            dip.path.display(),
                            dip.history.dump()
                        );
                    }
                    ok = false;
                    break;
                }

                if !read_only {
                    if let Err(e) = verify_payload(
                        block,
                        layout,
                        lba,
                        &self.opts.pattern,
                        self.pattern_file,
                        template_modifiers(&template),
                    ) {
                        error!(
                            device = %dip.path.display(),
                            offset,
                            sub,
                            at_byte = e.offset,
                            expected = format_args!("{:#010x}", e.expected),
                            received = format_args!("{:#010x}", e.actual),
                            "data pattern miscompare"
                        );
                        ok = false;
                        break;
                    }
                }

                if sub == 0 {
                    if let Ok(tag) = Btag::decode_checked(block) {
                        slot = decode_slot(block, &tag);
                        first_tag = Some(tag);
                    }
                }
            }
        }

        if !ok {
            self.info.devices[at].counters.errors += 1;
            fire(trigger);
            return false;
        }

        if self.opts.enabled.contains(EnableFlags::WRITE_ORDER) {
            if let (Some(tag), Some(slot)) = (first_tag, slot) {
                match verify_write_order(
                    self.info,
                    &tag,
                    slot,
                    self.io_type == IoType::Random,
                    self.opts,
                ) {
                    WriteOrderVerdict::Failure(_) => {
                        self.info.devices[at].counters.errors += 1;
                        fire(trigger);
                        return false;
                    }
                    WriteOrderVerdict::Warning(reason) => {
                        debug!("write-order check skipped: {reason}");
                    }
                    WriteOrderVerdict::Clean | WriteOrderVerdict::NoPrior => {}
                }
            }
        }
        true
    }
}

fn template_modifiers(template: &Btag) -> PatternModifiers {
    PatternModifiers::from_bits_truncate(template.pattern_type())
}

fn decode_slot(block: &[u8], tag: &Btag) -> Option<OrderSlot> {
    if !tag.carries_write_order() {
        return None;
    }
    OrderSlot::decode(&block[btag::BTAG_SIZE..])
}

/// End of the exercised range for a context.
fn effective_end(dip: &DeviceContext) -> u64 {
    if dip.end_position > 0 {
        dip.end_position
    } else if dip.data_limit > 0 {
        dip.file_position + dip.data_limit
    } else if dip.capacity > 0 {
        dip.capacity
    } else {
        u64::MAX
    }
}

fn is_no_space(e: &DeviceError) -> bool {
    match e {
        DeviceError::Io { source, .. } => source.raw_os_error() == Some(libc::ENOSPC),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::DtappBehavior;
    use crate::info::DtappInfo;
    use crate::options::Dispose;
    use btag::SIGNATURE;
    use std::path::Path;

    fn options_for(path: &Path) -> DtOptions {
        DtOptions {
            output_paths: vec![path.to_path_buf()],
            limit: 64 * 1024,
            block_size: BlockSize::Fixed(8192),
            prefix: Some("%d@%h".to_string()),
            serial: "TESTSER1".to_string(),
            seed: Some(0xDEAD_BEEF_CAFE_BABE),
            dispose: Dispose::Keep,
            ..DtOptions::default()
        }
    }

    fn build(behavior: &DtappBehavior) -> DtappInfo {
        let mut master = crate::behavior::master_context(behavior).unwrap();
        master.set_owner(1, 0, None);
        let mut info = DtappInfo::new(master, Side::Output);
        behavior.setup_devices(&mut info, 0).unwrap();
        info
    }

    fn engine<'a>(
        info: &'a mut DtappInfo,
        behavior: &'a DtappBehavior,
        control: &'a ThreadControl,
    ) -> PassEngine<'a> {
        PassEngine::new(
            info,
            &behavior.options,
            control,
            None,
            None,
            Instant::now(),
            behavior.base_seed(),
        )
    }

    #[test]
    fn single_file_write_then_read_is_clean() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("sanity.dat");
        let behavior = DtappBehavior::new(options_for(&target)).unwrap();
        let control = ThreadControl::new();
        let mut info = build(&behavior);

        let mut engine = engine(&mut info, &behavior, &control);
        assert_eq!(engine.write_pass(0), ExitStatus::Success);
        assert_eq!(engine.read_pass(0), ExitStatus::Success);

        let dip = &info.devices[0];
        assert_eq!(dip.counters.pass_records_written, 8);
        assert_eq!(dip.counters.pass_bytes_written, 65536);
        assert_eq!(dip.counters.pass_records_read, 8);
        assert_eq!(dip.counters.pass_bytes_read, 65536);
        assert_eq!(dip.counters.errors, 0);
        assert_eq!(std::fs::metadata(&target).unwrap().len(), 65536);

        // Every device-sized sub-block on disk carries a sealed tag.
        let bytes = std::fs::read(&target).unwrap();
        for block in bytes.chunks(512) {
            let tag = Btag::decode_checked(block).unwrap();
            assert_eq!(tag.signature(), SIGNATURE);
            assert_eq!(tag.crc32(), btag::record_crc(block).unwrap());
            assert_eq!(tag.record_size(), 8192);
        }
    }

    #[test]
    fn same_seed_replays_the_same_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let mut lba_sequences = Vec::new();
        for name in ["a.dat", "b.dat"] {
            let target = dir.path().join(name);
            let mut opts = options_for(&target);
            opts.block_size = BlockSize::Random;
            opts.min_size = 4096;
            opts.max_size = 16384;
            let behavior = DtappBehavior::new(opts).unwrap();
            let control = ThreadControl::new();
            let mut info = build(&behavior);
            let mut engine = engine(&mut info, &behavior, &control);
            assert_eq!(engine.write_pass(0), ExitStatus::Success);

            let bytes = std::fs::read(&target).unwrap();
            let lbas: Vec<(u64, u32)> = bytes
                .chunks(512)
                .map(|block| {
                    let tag = Btag::decode_checked(block).unwrap();
                    (tag.lba(), tag.record_size())
                })
                .collect();
            lba_sequences.push(lbas);
        }
        assert_eq!(lba_sequences[0], lba_sequences[1]);
    }

    #[test]
    fn corrupted_payload_fails_the_read_pass() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("flip.dat");
        let behavior = DtappBehavior::new(options_for(&target)).unwrap();
        let control = ThreadControl::new();
        let mut info = build(&behavior);

        {
            let mut engine = engine(&mut info, &behavior, &control);
            assert_eq!(engine.write_pass(0), ExitStatus::Success);
        }

        // Single-bit flip in one record's payload.
        let mut bytes = std::fs::read(&target).unwrap();
        bytes[300] ^= 0x01;
        std::fs::write(&target, &bytes).unwrap();

        let mut engine = engine(&mut info, &behavior, &control);
        assert_eq!(engine.read_pass(0), ExitStatus::Failure);
        assert!(info.devices[0].counters.errors > 0);
    }

    #[test]
    fn premature_eof_bounds_the_read_pass() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("short.dat");
        let behavior = DtappBehavior::new(options_for(&target)).unwrap();
        let control = ThreadControl::new();
        let mut info = build(&behavior);

        let mut engine = engine(&mut info, &behavior, &control);
        assert_eq!(engine.write_pass(0), ExitStatus::Success);

        // Pretend only the first 4096 bytes reached media.
        engine.info.devices[0].premature_eof = true;
        engine.info.devices[0].written_high = 4096;

        let status = engine.read_pass(0);
        assert_ne!(status, ExitStatus::Failure);
        let dip = &info.devices[0];
        assert_eq!(dip.counters.errors, 0);
        assert_eq!(dip.counters.pass_bytes_read, 4096);
    }

    #[test]
    fn mirror_mismatch_is_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.dat");
        let input = dir.path().join("in.dat");
        // The "mirror" holds stale zeros, so every re-read must miscompare.
        std::fs::write(&input, vec![0u8; 64 * 1024]).unwrap();

        let mut opts = options_for(&out);
        opts.input_paths = vec![input];
        opts.error_limit = 1;
        let behavior = DtappBehavior::new(opts).unwrap();
        let control = ThreadControl::new();

        let mut master = crate::behavior::master_context(&behavior).unwrap();
        master.set_owner(1, 0, None);
        let mut info = DtappInfo::new(master, Side::Output);
        let in_path = behavior.options.input_paths[0].clone();
        let mut input_dip = behavior.make_context(&in_path, 0, IoMode::Read);
        input_dip.set_owner(1, 0, None);
        info.push(input_dip, Side::Input);
        behavior.setup_devices(&mut info, 0).unwrap();

        let mut engine = engine(&mut info, &behavior, &control);
        assert_eq!(engine.write_pass(0), ExitStatus::Failure);
        assert!(info.devices[1].counters.errors > 0);
    }

    #[test]
    fn mirror_with_true_mirror_is_clean() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("pair.dat");
        // A hard link is a perfect mirror: reads observe every write.
        std::fs::write(&out, b"").unwrap();
        let input = dir.path().join("pair-mirror.dat");
        std::fs::hard_link(&out, &input).unwrap();

        let mut opts = options_for(&out);
        opts.input_paths = vec![input];
        let behavior = DtappBehavior::new(opts).unwrap();
        let control = ThreadControl::new();

        let mut master = crate::behavior::master_context(&behavior).unwrap();
        master.set_owner(1, 0, None);
        let mut info = DtappInfo::new(master, Side::Output);
        let in_path = behavior.options.input_paths[0].clone();
        let mut input_dip = behavior.make_context(&in_path, 0, IoMode::Read);
        input_dip.set_owner(1, 0, None);
        info.push(input_dip, Side::Input);
        behavior.setup_devices(&mut info, 0).unwrap();

        let mut engine = engine(&mut info, &behavior, &control);
        assert_eq!(engine.write_pass(0), ExitStatus::Success);
        assert_eq!(info.devices[0].counters.errors, 0);
        assert_eq!(info.devices[1].counters.errors, 0);
    }

    #[test]
    fn reverse_pass_stops_at_the_range_start() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("reverse.dat");
        let mut opts = options_for(&target);
        opts.io_dir = DirMode::Reverse;
        let behavior = DtappBehavior::new(opts).unwrap();
        let control = ThreadControl::new();
        let mut info = build(&behavior);

        let mut engine = engine(&mut info, &behavior, &control);
        let status = engine.write_pass(0);
        assert_ne!(status, ExitStatus::Failure);

        let dip = &info.devices[0];
        assert_eq!(dip.offset, dip.file_position);
        assert_eq!(dip.counters.pass_bytes_written, 65536);
        assert_eq!(std::fs::metadata(&target).unwrap().len(), 65536);
    }

    #[test]
    fn random_pass_round_trips_with_seed() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("random.dat");
        // Preallocate so random offsets have a range to land in.
        std::fs::write(&target, vec![0u8; 256 * 1024]).unwrap();

        let mut opts = options_for(&target);
        opts.io_type = TypeMode::Random;
        opts.limit = 64 * 1024;
        let behavior = DtappBehavior::new(opts).unwrap();
        let control = ThreadControl::new();
        let mut info = build(&behavior);

        let mut engine = engine(&mut info, &behavior, &control);
        assert_eq!(engine.write_pass(0), ExitStatus::Success);
        assert_eq!(engine.read_pass(0), ExitStatus::Success);
        let dip = &info.devices[0];
        assert_eq!(dip.counters.errors, 0);
        assert_eq!(dip.counters.pass_bytes_read, 64 * 1024);
    }

    #[test]
    fn stop_request_ends_the_pass_early() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("stopped.dat");
        let mut opts = options_for(&target);
        opts.limit = 0;
        opts.record_limit = 0;
        opts.runtime = Some(Duration::from_secs(3600));
        opts.io_type = TypeMode::Random;
        std::fs::write(&target, vec![0u8; 256 * 1024]).unwrap();

        let behavior = DtappBehavior::new(opts).unwrap();
        let control = ThreadControl::new();
        control.mark_running();
        control.terminate();
        let mut info = build(&behavior);

        let mut engine = engine(&mut info, &behavior, &control);
        let status = engine.write_pass(0);
        assert_ne!(status, ExitStatus::Failure);
        // Terminated at the loop head: nothing was written.
        assert_eq!(info.devices[0].counters.pass_records_written, 0);
    }
}
