use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileTypeExt, MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use btag::Btag;
use mtwist::Mt64;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg};
use nix::sys::uio::{pread, pwrite};
use palign::{Arena, AlignedBuf};
use tracing::debug;

use crate::history::History;
use crate::{DeviceError, DeviceKind, IoDirection, IoMode, IoType, OpenFlags};

#[cfg(target_os = "linux")]
mod ioctl {
    nix::ioctl_read!(blkgetsize64, 0x12, 114, libc::size_t);
}

/// Outcome of one positioned read or write.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Completion {
    /// Bytes actually moved; may be short of the request.
    Transferred(usize),
    /// Transient failure; reissue without counting.
    Retryable,
    /// End of media or range.
    Eof,
}

/// Byte-range lock mode.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Per-pass and lifetime transfer counters.
#[derive(Debug, Default, Clone)]
pub struct Counters {
    pub pass_records_read: u64,
    pub pass_records_written: u64,
    pub pass_bytes_read: u64,
    pub pass_bytes_written: u64,
    pub total_records_read: u64,
    pub total_records_written: u64,
    pub total_bytes_read: u64,
    pub total_bytes_written: u64,
    pub pass_files: u64,
    pub total_files: u64,
    pub errors: u64,
    pub total_errors: u64,
    pub passes: u64,
}

impl Counters {
    /// Roll the per-pass numbers into the totals and start a fresh pass.
    pub fn end_pass(&mut self) {
        self.total_records_read += self.pass_records_read;
        self.total_records_written += self.pass_records_written;
        self.total_bytes_read += self.pass_bytes_read;
        self.total_bytes_written += self.pass_bytes_written;
        self.total_files += self.pass_files;
        self.total_errors += self.errors;
        self.pass_records_read = 0;
        self.pass_records_written = 0;
        self.pass_bytes_read = 0;
        self.pass_bytes_written = 0;
        self.pass_files = 0;
        self.errors = 0;
        self.passes += 1;
    }

    /// Fold another context's lifetime totals into this one.
    pub fn merge_totals(&mut self, other: &Counters) {
        self.total_records_read += other.total_records_read + other.pass_records_read;
        self.total_records_written += other.total_records_written + other.pass_records_written;
        self.total_bytes_read += other.total_bytes_read + other.pass_bytes_read;
        self.total_bytes_written += other.total_bytes_written + other.pass_bytes_written;
        self.total_files += other.total_files + other.pass_files;
        self.total_errors += other.total_errors + other.errors;
        self.passes += other.passes;
    }

    pub fn pass_bytes(&self) -> u64 {
        self.pass_bytes_read + self.pass_bytes_written
    }

    pub fn pass_records(&self) -> u64 {
        self.pass_records_read + self.pass_records_written
    }
}

/// Construction-time configuration for one device participant.
#[derive(Debug, Clone)]
pub struct DeviceSpec {
    pub path: PathBuf,
    pub dsize: u32,
    pub mode: IoMode,
    pub direction: IoDirection,
    pub io_type: IoType,
    pub open_flags: OpenFlags,
    /// Per-device byte budget for a pass; 0 means "whole device".
    pub data_limit: u64,
    /// Upper bound for random offsets; 0 defers to capacity at open.
    pub rdata_limit: u64,
    /// Base file position (start of the exercised range).
    pub file_position: u64,
    /// Blocks to skip between sequential records, in bytes.
    pub step: u64,
    /// Request-history depth; 0 disables.
    pub history_depth: usize,
}

impl Default for DeviceSpec {
    fn default() -> Self {
        DeviceSpec {
            path: PathBuf::new(),
            dsize: 512,
            mode: IoMode::Write,
            direction: IoDirection::Forward,
            io_type: IoType::Sequential,
            open_flags: OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE,
            data_limit: 0,
            rdata_limit: 0,
            file_position: 0,
            step: 0,
            history_depth: 0,
        }
    }
}

/// One device participant inside one worker thread.
pub struct DeviceContext {
    pub path: PathBuf,
    pub kind: DeviceKind,
    pub index: u8,
    handle: Option<File>,

    pub dsize: u32,
    /// Size of the underlying device or file at open, when known.
    pub capacity: u64,
    pub devid_or_inode: u64,
    /// Byte offset of this range within the containing volume.
    pub volume_base: u64,

    pub offset: u64,
    pub file_position: u64,
    pub end_position: u64,
    pub data_limit: u64,
    pub rdata_limit: u64,
    pub step: u64,

    pub mode: IoMode,
    pub direction: IoDirection,
    pub io_type: IoType,
    pub open_flags: OpenFlags,

    pub eof: bool,
    /// A short write on a regular file latches this; the pass engine stops
    /// writing on the context because reads past the valid range would
    /// report false corruption.
    pub premature_eof: bool,
    pub last_write_size: usize,
    pub last_write_offset: u64,
    /// Highest byte successfully written; bounds the read pass after a
    /// premature EOF.
    pub written_high: u64,
    /// requested - transferred for the most recent operation.
    pub data_resid: u64,

    pub counters: Counters,

    pub job_id: u32,
    pub thread_number: u32,
    pub job_tag: Option<String>,

    pub rng: Mt64,
    pub pattern_word: u32,
    pub btag_template: Option<Btag>,
    pub history: History,
    /// Byte shift into the data buffer for the next transfer (rotate mode).
    pub buffer_shift: usize,

    data_buf: Option<AlignedBuf>,
    verify_buf: Option<AlignedBuf>,
    pub pattern_buf: Vec<u8>,
    pub prefix: Vec<u8>,
    arena: Arena,
}

fn retryable(errno: Errno) -> bool {
    matches!(
        errno,
        Errno::EINTR | Errno::EAGAIN | Errno::EBUSY | Errno::ENOMEM
    )
}

impl DeviceContext {
    pub fn new(spec: &DeviceSpec, index: u8, arena: Arena) -> DeviceContext {
        DeviceContext {
            path: spec.path.clone(),
            kind: DeviceKind::File,
            index,
            handle: None,
            dsize: spec.dsize,
            capacity: 0,
            devid_or_inode: 0,
            volume_base: 0,
            offset: spec.file_position,
            file_position: spec.file_position,
            end_position: 0,
            data_limit: spec.data_limit,
            rdata_limit: spec.rdata_limit,
            step: spec.step,
            mode: spec.mode,
            direction: spec.direction,
            io_type: spec.io_type,
            open_flags: spec.open_flags,
            eof: false,
            premature_eof: false,
            last_write_size: 0,
            last_write_offset: 0,
            written_high: 0,
            data_resid: 0,
            counters: Counters::default(),
            job_id: 0,
            thread_number: 0,
            job_tag: None,
            rng: Mt64::default(),
            pattern_word: 0,
            btag_template: None,
            history: History::with_capacity(spec.history_depth),
            buffer_shift: 0,
            data_buf: None,
            verify_buf: None,
            pattern_buf: Vec::new(),
            prefix: Vec::new(),
            arena,
        }
    }

    /// Clone for another worker thread: same configuration, fresh handle,
    /// fresh counters and state, the RNG state carried over so a re-seed
    /// at pass start lands both on the same stream.
    pub fn clone_for_thread(&self) -> DeviceContext {
        DeviceContext {
            path: self.path.clone(),
            kind: self.kind,
            index: self.index,
            handle: None,
            dsize: self.dsize,
            capacity: self.capacity,
            devid_or_inode: self.devid_or_inode,
            volume_base: self.volume_base,
            offset: self.file_position,
            file_position: self.file_position,
            end_position: self.end_position,
            data_limit: self.data_limit,
            rdata_limit: self.rdata_limit,
            step: self.step,
            mode: self.mode,
            direction: self.direction,
            io_type: self.io_type,
            open_flags: self.open_flags,
            eof: false,
            premature_eof: false,
            last_write_size: 0,
            last_write_offset: 0,
            written_high: 0,
            data_resid: 0,
            counters: Counters::default(),
            job_id: self.job_id,
            thread_number: self.thread_number,
            job_tag: self.job_tag.clone(),
            rng: self.rng.clone(),
            pattern_word: self.pattern_word,
            btag_template: self.btag_template,
            history: History::with_capacity(self.history.capacity()),
            buffer_shift: 0,
            data_buf: None,
            verify_buf: None,
            pattern_buf: self.pattern_buf.clone(),
            prefix: self.prefix.clone(),
            arena: self.arena.clone(),
        }
    }

    pub fn set_owner(&mut self, job_id: u32, thread_number: u32, tag: Option<String>) {
        self.job_id = job_id;
        self.thread_number = thread_number;
        self.job_tag = tag;
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// Open the handle with the given flags, probing kind, identity and
    /// capacity from the opened file.
    pub fn open(&mut self, flags: OpenFlags) -> Result<(), DeviceError> {
        self.open_flags = flags;
        let mut options = OpenOptions::new();
        options
            .read(flags.contains(OpenFlags::READ))
            .write(flags.contains(OpenFlags::WRITE))
            .create(flags.contains(OpenFlags::CREATE))
            .truncate(flags.contains(OpenFlags::TRUNC));

        let mut custom = 0;
        if flags.contains(OpenFlags::DIRECT) {
            #[cfg(target_os = "linux")]
            {
                custom |= libc::O_DIRECT;
            }
        }
        if flags.contains(OpenFlags::SYNC) {
            custom |= libc::O_SYNC;
        }
        if flags.contains(OpenFlags::EXCL) {
            custom |= libc::O_EXCL;
        }
        if custom != 0 {
            options.custom_flags(custom);
        }

        let file = options
            .open(&self.path)
            .map_err(|e| DeviceError::io(&self.path, e))?;
        let meta = file
            .metadata()
            .map_err(|e| DeviceError::io(&self.path, e))?;

        if meta.file_type().is_block_device() {
            self.kind = DeviceKind::Disk;
            self.devid_or_inode = meta.rdev();
            self.capacity = block_device_size(&file).unwrap_or(0);
        } else {
            self.kind = DeviceKind::File;
            self.devid_or_inode = meta.ino();
            self.capacity = meta.size();
        }

        if self.rdata_limit == 0 {
            self.rdata_limit = if self.capacity > 0 {
                self.capacity
            } else {
                self.data_limit
            };
        }
        debug!(
            path = %self.path.display(),
            kind = ?self.kind,
            capacity = self.capacity,
            "device opened"
        );
        self.handle = Some(file);
        Ok(())
    }

    pub fn close(&mut self) {
        if self.handle.take().is_some() {
            self.counters.pass_files += 1;
        }
    }

    fn file(&self) -> Result<&File, DeviceError> {
        self.handle
            .as_ref()
            .ok_or_else(|| DeviceError::NotOpen(self.path.display().to_string()))
    }

    fn check_alignment(&self, offset: u64) -> Result<(), DeviceError> {
        if self.kind == DeviceKind::Disk && offset % self.dsize as u64 != 0 {
            return Err(DeviceError::Misaligned {
                offset,
                dsize: self.dsize,
            });
        }
        Ok(())
    }

    /// Allocate the data buffer (page-aligned, optionally pushed `misalign`
    /// bytes past the boundary for unaligned-path testing).
    pub fn setup_buffers(&mut self, size: usize, misalign: usize) {
        self.data_buf = Some(self.arena.alloc(size, misalign));
    }

    pub fn data(&self) -> &[u8] {
        self.data_buf
            .as_deref()
            .expect("data buffer initialised before I/O")
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.data_buf
            .as_deref_mut()
            .expect("data buffer initialised before I/O")
    }

    /// Make sure the verify buffer holds at least `size` bytes.
    pub fn ensure_verify(&mut self, size: usize) {
        let have = self.verify_buf.as_ref().map(|b| b.len()).unwrap_or(0);
        if have < size {
            self.verify_buf = Some(self.arena.alloc(size, 0));
        }
    }

    pub fn verify_data(&self) -> &[u8] {
        self.verify_buf
            .as_deref()
            .expect("verify buffer initialised before re-read")
    }

    /// Read into the data buffer. `aligned` is the size actually issued
    /// (a direct-I/O multiple of `dsize`); `requested` is what counts.
    pub fn read_record(
        &mut self,
        requested: usize,
        aligned: usize,
        offset: u64,
    ) -> Result<Completion, DeviceError> {
        self.check_alignment(offset)?;
        let issue = aligned.max(requested);
        let shift = self.buffer_shift;
        let n = {
            let file = self
                .handle
                .as_ref()
                .ok_or_else(|| DeviceError::NotOpen(self.path.display().to_string()))?;
            let buf = self
                .data_buf
                .as_deref_mut()
                .expect("data buffer initialised before I/O");
            let end = (shift + issue).min(buf.len());
            match pread(file, &mut buf[shift..end], offset as libc::off_t) {
                Ok(n) => n,
                Err(errno) if retryable(errno) => return Ok(Completion::Retryable),
                Err(errno) => {
                    self.counters.errors += 1;
                    return Err(DeviceError::io(&self.path, errno.into()));
                }
            }
        };
        if n == 0 {
            self.eof = true;
            return Ok(Completion::Eof);
        }
        let counted = n.min(requested);
        self.data_resid = (requested - counted) as u64;
        self.counters.pass_records_read += 1;
        self.counters.pass_bytes_read += counted as u64;
        Ok(Completion::Transferred(counted))
    }

    /// Read into the verify buffer (re-reads for verification; does not
    /// count toward pass transfer totals).
    pub fn read_verify(&mut self, requested: usize, offset: u64) -> Result<Completion, DeviceError> {
        self.check_alignment(offset)?;
        self.ensure_verify(requested);
        let n = {
            let file = self
                .handle
                .as_ref()
                .ok_or_else(|| DeviceError::NotOpen(self.path.display().to_string()))?;
            let buf = self
                .verify_buf
                .as_deref_mut()
                .expect("verify buffer initialised before re-read");
            match pread(file, &mut buf[..requested], offset as libc::off_t) {
                Ok(n) => n,
                Err(errno) if retryable(errno) => return Ok(Completion::Retryable),
                Err(errno) => {
                    self.counters.errors += 1;
                    return Err(DeviceError::io(&self.path, errno.into()));
                }
            }
        };
        if n == 0 {
            return Ok(Completion::Eof);
        }
        Ok(Completion::Transferred(n))
    }

    /// Write from the data buffer. Same contract as [`Self::read_record`];
    /// a short count on a regular file latches premature EOF.
    pub fn write_record(
        &mut self,
        requested: usize,
        aligned: usize,
        offset: u64,
    ) -> Result<Completion, DeviceError> {
        self.check_alignment(offset)?;
        let issue = aligned.max(requested);
        let shift = self.buffer_shift;
        let n = {
            let file = self
                .handle
                .as_ref()
                .ok_or_else(|| DeviceError::NotOpen(self.path.display().to_string()))?;
            let buf = self
                .data_buf
                .as_deref()
                .expect("data buffer initialised before I/O");
            let end = (shift + issue).min(buf.len());
            match pwrite(file, &buf[shift..end], offset as libc::off_t) {
                Ok(n) => n,
                Err(errno) if retryable(errno) => return Ok(Completion::Retryable),
                Err(errno) => {
                    self.counters.errors += 1;
                    return Err(DeviceError::io(&self.path, errno.into()));
                }
            }
        };
        if n == 0 {
            self.eof = true;
            return Ok(Completion::Eof);
        }
        Ok(self.account_write(requested, n.min(requested), offset))
    }

    fn account_write(&mut self, requested: usize, counted: usize, offset: u64) -> Completion {
        self.data_resid = (requested - counted) as u64;
        self.last_write_size = counted;
        self.last_write_offset = offset;
        self.written_high = self.written_high.max(offset + counted as u64);
        self.counters.pass_records_written += 1;
        self.counters.pass_bytes_written += counted as u64;
        if counted < requested && self.kind == DeviceKind::File {
            debug!(
                path = %self.path.display(),
                requested,
                counted,
                "short write on regular file; latching premature EOF"
            );
            self.premature_eof = true;
        }
        Completion::Transferred(counted)
    }

    pub fn flush(&mut self) -> Result<(), DeviceError> {
        let file = self.file()?;
        file.sync_all().map_err(|e| DeviceError::io(&self.path, e))
    }

    /// Advisory byte-range lock; waits for the range.
    pub fn lock_range(
        &self,
        offset: u64,
        len: u64,
        mode: LockMode,
    ) -> Result<(), DeviceError> {
        self.range_lock_op(
            offset,
            len,
            match mode {
                LockMode::Shared => libc::F_RDLCK,
                LockMode::Exclusive => libc::F_WRLCK,
            },
        )
    }

    pub fn unlock_range(&self, offset: u64, len: u64) -> Result<(), DeviceError> {
        self.range_lock_op(offset, len, libc::F_UNLCK)
    }

    fn range_lock_op(&self, offset: u64, len: u64, kind: i32) -> Result<(), DeviceError> {
        let file = self.file()?;
        let mut lock: libc::flock = unsafe { std::mem::zeroed() };
        lock.l_type = kind as libc::c_short;
        lock.l_whence = libc::SEEK_SET as libc::c_short;
        lock.l_start = offset as libc::off_t;
        lock.l_len = len as libc::off_t;
        fcntl(file.as_raw_fd(), FcntlArg::F_SETLKW(&lock))
            .map_err(|errno| DeviceError::io(&self.path, errno.into()))?;
        Ok(())
    }

    pub fn set_position(&mut self, offset: u64) -> Result<(), DeviceError> {
        self.check_alignment(offset)?;
        self.offset = offset;
        Ok(())
    }

    pub fn get_position(&self) -> u64 {
        self.offset
    }

    /// Divide the random-data range into `slices` disjoint regions and
    /// confine this context to slice `which` (0-based).
    pub fn init_slice(&mut self, slices: u32, which: u32) {
        debug_assert!(slices > 0 && which < slices);
        let whole = if self.rdata_limit > self.file_position {
            self.rdata_limit - self.file_position
        } else {
            self.data_limit
        };
        let dsize = self.dsize as u64;
        let span = (whole / slices as u64) / dsize * dsize;
        let start = self.file_position + span * which as u64;
        let end = if which + 1 == slices {
            self.file_position + whole
        } else {
            start + span
        };
        self.file_position = start;
        self.end_position = end;
        self.offset = start;
        if self.data_limit == 0 || self.data_limit > end - start {
            self.data_limit = end - start;
        }
    }

    /// Draw a dsize-aligned random offset such that `size` bytes fit
    /// inside [file_position, rdata_limit).
    pub fn random_offset(&mut self, size: u64) -> Result<u64, DeviceError> {
        let base = self.file_position;
        let limit = self.rdata_limit;
        if limit <= base {
            return Err(DeviceError::InvalidRandomRange { limit, base });
        }
        let span = limit - base;
        if size > span {
            return Err(DeviceError::RandomTransferTooLarge { size, span });
        }
        let max_start = span - size;
        let draw = self.rng.next_u64() % (max_start + 1);
        let aligned = draw / self.dsize as u64 * self.dsize as u64;
        Ok(base + aligned)
    }

    /// Reset per-pass state ahead of a new pass.
    pub fn start_pass(&mut self) {
        self.eof = false;
        self.data_resid = 0;
        self.offset = self.file_position;
    }
}

#[cfg(target_os = "linux")]
fn block_device_size(file: &File) -> Option<u64> {
    let mut size: libc::size_t = 0;
    unsafe { ioctl::blkgetsize64(file.as_raw_fd(), &mut size) }
        .ok()
        .map(|_| size as u64)
}

#[cfg(not(target_os = "linux"))]
fn block_device_size(_file: &File) -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn open_context(path: &Path, data_limit: u64) -> DeviceContext {
        let spec = DeviceSpec {
            path: path.to_path_buf(),
            dsize: 512,
            data_limit,
            ..DeviceSpec::default()
        };
        let mut dip = DeviceContext::new(&spec, 0, Arena::new());
        dip.open(OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE)
            .unwrap();
        dip.setup_buffers(8192, 0);
        dip
    }

    #[test]
    fn write_then_read_counts_and_resid() {
        let tmp = NamedTempFile::new().unwrap();
        let mut dip = open_context(tmp.path(), 65536);

        dip.data_mut()[..4096].fill(0x5A);
        let wrote = dip.write_record(4096, 4096, 0).unwrap();
        assert_eq!(wrote, Completion::Transferred(4096));
        assert_eq!(dip.counters.pass_records_written, 1);
        assert_eq!(dip.counters.pass_bytes_written, 4096);
        assert_eq!(dip.data_resid, 0);
        assert_eq!(dip.last_write_offset, 0);
        assert_eq!(dip.written_high, 4096);

        dip.data_mut().fill(0);
        let read = dip.read_record(4096, 4096, 0).unwrap();
        assert_eq!(read, Completion::Transferred(4096));
        assert!(dip.data()[..4096].iter().all(|&b| b == 0x5A));
        assert_eq!(dip.counters.pass_bytes_read, 4096);
    }

    #[test]
    fn read_past_end_reports_eof() {
        let tmp = NamedTempFile::new().unwrap();
        let mut dip = open_context(tmp.path(), 65536);
        dip.data_mut()[..512].fill(1);
        dip.write_record(512, 512, 0).unwrap();

        let got = dip.read_record(512, 512, 4096).unwrap();
        assert_eq!(got, Completion::Eof);
        assert!(dip.eof);
    }

    #[test]
    fn short_write_latches_premature_eof() {
        let tmp = NamedTempFile::new().unwrap();
        let mut dip = open_context(tmp.path(), 65536);
        assert!(!dip.premature_eof);

        let got = dip.account_write(8192, 4096, 0);
        assert_eq!(got, Completion::Transferred(4096));
        assert!(dip.premature_eof);
        assert_eq!(dip.data_resid, 4096);
        assert_eq!(dip.written_high, 4096);
    }

    #[test]
    fn range_locks_round_trip() {
        let tmp = NamedTempFile::new().unwrap();
        let dip = {
            let mut d = open_context(tmp.path(), 0);
            d.data_mut()[..512].fill(2);
            d.write_record(512, 512, 0).unwrap();
            d
        };
        dip.lock_range(0, 512, LockMode::Exclusive).unwrap();
        dip.unlock_range(0, 512).unwrap();
        dip.lock_range(0, 512, LockMode::Shared).unwrap();
        dip.unlock_range(0, 512).unwrap();
    }

    #[test]
    fn random_offsets_are_aligned_and_bounded() {
        let tmp = NamedTempFile::new().unwrap();
        let mut dip = open_context(tmp.path(), 0);
        dip.rdata_limit = 1 << 20;
        dip.io_type = IoType::Random;
        for _ in 0..1000 {
            let off = dip.random_offset(4096).unwrap();
            assert_eq!(off % 512, 0);
            assert!(off + 4096 <= 1 << 20);
        }
    }

    #[test]
    fn random_range_below_base_is_an_error() {
        let tmp = NamedTempFile::new().unwrap();
        let mut dip = open_context(tmp.path(), 0);
        dip.file_position = 8192;
        dip.rdata_limit = 4096;
        assert!(matches!(
            dip.random_offset(512),
            Err(DeviceError::InvalidRandomRange { .. })
        ));
    }

    #[test]
    fn raw_disk_offsets_must_be_block_aligned() {
        let tmp = NamedTempFile::new().unwrap();
        let mut dip = open_context(tmp.path(), 0);
        dip.kind = DeviceKind::Disk;
        assert!(matches!(
            dip.set_position(100),
            Err(DeviceError::Misaligned { .. })
        ));
        dip.set_position(1024).unwrap();
        assert_eq!(dip.get_position(), 1024);
    }

    #[test]
    fn thread_clone_resets_state_keeps_config() {
        let tmp = NamedTempFile::new().unwrap();
        let mut dip = open_context(tmp.path(), 1 << 20);
        dip.data_mut()[..512].fill(3);
        dip.write_record(512, 512, 0).unwrap();
        dip.premature_eof = true;

        let clone = dip.clone_for_thread();
        assert!(!clone.is_open());
        assert!(!clone.premature_eof);
        assert_eq!(clone.counters.pass_bytes_written, 0);
        assert_eq!(clone.data_limit, 1 << 20);
        assert_eq!(clone.dsize, dip.dsize);
        assert_eq!(clone.path, dip.path);
    }

    #[test]
    fn pass_rollover_accumulates_totals() {
        let mut counters = Counters {
            pass_records_written: 8,
            pass_bytes_written: 65536,
            ..Counters::default()
        };
        counters.end_pass();
        assert_eq!(counters.total_records_written, 8);
        assert_eq!(counters.total_bytes_written, 65536);
        assert_eq!(counters.pass_records_written, 0);
        assert_eq!(counters.passes, 1);
    }
}
