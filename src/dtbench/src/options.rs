//! The pre-parsed option surface the argument front end hands to the core.
//!
//! The core never parses a command line; the collaborator builds one of
//! these from `iobehavior=dtapp` option strings and the workload catalog.

use std::path::PathBuf;
use std::time::Duration;

use bitflags::bitflags;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BlockSize {
    Fixed(usize),
    /// Draw each record's size from [min, max] on the thread RNG.
    Random,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SizeIncrement {
    Fixed(usize),
    Vary,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DirMode {
    Forward,
    Reverse,
    /// Drawn from the RNG at each pass start.
    Vary,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TypeMode {
    Sequential,
    Random,
    Vary,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PatternSpec {
    /// Self-describing words seeded from the block LBA.
    Iot,
    /// Incrementing bytes.
    Incr,
    /// A constant 32-bit word.
    Pattern(u32),
    /// Bytes cycled from a pattern file.
    File(PathBuf),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Dispose {
    Keep,
    Delete,
    KeepOnError,
}

bitflags! {
    /// enable=/disable= switches the core honors.
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct EnableFlags: u32 {
        /// Compare read data against the expected pattern.
        const COMPARE      = 1 << 0;
        /// Check pad bytes after short reads.
        const PAD_CHECK    = 1 << 1;
        /// Carry the write-order extension and chain-verify on reads.
        const WRITE_ORDER  = 1 << 2;
        /// Re-read each record immediately after writing it.
        const RAW          = 1 << 3;
        /// Overlay the block LBA into each sub-block payload.
        const LBDATA       = 1 << 4;
        /// Overlay the write timestamp into each sub-block payload.
        const TIMESTAMP    = 1 << 5;
        /// Keep per-device request history for post-mortems.
        const HISTORY      = 1 << 6;
        /// Treat end-of-file as a run failure.
        const STRICT_EOF   = 1 << 7;
        /// Lock the full participating range for the pass.
        const FULL_LOCK    = 1 << 8;
        /// Lock each record's range around its I/O.
        const RECORD_LOCK  = 1 << 9;
        /// Shift the data pointer per record to exercise unaligned buffers.
        const ROTATE       = 1 << 10;
        /// Run the read half of each pass.
        const READ_PASS    = 1 << 11;
    }
}

impl Default for EnableFlags {
    fn default() -> Self {
        EnableFlags::COMPARE
            | EnableFlags::PAD_CHECK
            | EnableFlags::WRITE_ORDER
            | EnableFlags::READ_PASS
    }
}

/// Everything the dtapp behavior observes. Field names follow the option
/// spellings (`threads=`, `limit=`, `bs=`, ...).
#[derive(Debug, Clone)]
pub struct DtOptions {
    pub input_paths: Vec<PathBuf>,
    pub output_paths: Vec<PathBuf>,
    pub threads: u32,
    pub passes: u64,
    /// Wall-clock bound; `None` runs until the pass/record limits stop it.
    pub runtime: Option<Duration>,
    pub block_size: BlockSize,
    pub min_size: usize,
    pub max_size: usize,
    pub incr: SizeIncrement,
    /// Per-device byte budget for one pass.
    pub limit: u64,
    pub record_limit: u64,
    pub error_limit: u64,
    pub slices: u32,
    pub step: u64,
    pub io_dir: DirMode,
    pub io_type: TypeMode,
    pub dsize: u32,
    pub pattern: PatternSpec,
    pub prefix: Option<String>,
    pub log_prefix: Option<String>,
    pub keepalive: Option<String>,
    pub keepalive_secs: u64,
    pub stop_on: Option<PathBuf>,
    pub trigger: Option<String>,
    pub dispose: Dispose,
    /// flags=direct
    pub open_direct: bool,
    /// oflags=trunc
    pub truncate_output: bool,
    pub enabled: EnableFlags,
    /// User seed; a fixed seed replays the same offset sequence.
    pub seed: Option<u64>,
    /// Exact-IOPS pacing target, per thread.
    pub iops: Option<u32>,
    pub recovery_limit: u64,
    pub recovery_delay: Duration,
    pub history_depth: usize,
    /// Deliberate buffer misalignment past the page boundary.
    pub buffer_misalign: usize,
    pub tag: Option<String>,
    pub background: bool,
    pub iolock: bool,
    pub job_log: Option<PathBuf>,
    /// SAN serial recorded in every block tag.
    pub serial: String,
}

impl Default for DtOptions {
    fn default() -> Self {
        DtOptions {
            input_paths: Vec::new(),
            output_paths: Vec::new(),
            threads: 1,
            passes: 1,
            runtime: None,
            block_size: BlockSize::Fixed(8192),
            min_size: 512,
            max_size: 65536,
            incr: SizeIncrement::Fixed(512),
            limit: 0,
            record_limit: 0,
            error_limit: 1,
            slices: 0,
            step: 0,
            io_dir: DirMode::Forward,
            io_type: TypeMode::Sequential,
            dsize: 512,
            pattern: PatternSpec::Iot,
            prefix: None,
            log_prefix: None,
            keepalive: None,
            keepalive_secs: 0,
            stop_on: None,
            trigger: None,
            dispose: Dispose::Keep,
            open_direct: false,
            truncate_output: false,
            enabled: EnableFlags::default(),
            seed: None,
            iops: None,
            recovery_limit: 2,
            recovery_delay: Duration::from_secs(1),
            history_depth: 0,
            buffer_misalign: 0,
            tag: None,
            background: false,
            iolock: false,
            job_log: None,
            serial: String::new(),
        }
    }
}

impl DtOptions {
    /// Mirror mode pairs each output with the input at the same index.
    pub fn mirror_mode(&self) -> bool {
        !self.input_paths.is_empty() && !self.output_paths.is_empty()
    }

    /// A run with outputs writes; inputs alone make it read-only.
    pub fn read_only(&self) -> bool {
        self.output_paths.is_empty()
    }

    /// The invariant from the data model: when both sides are populated
    /// their counts must be equal; otherwise exactly one side is.
    pub fn validate(&self) -> Result<(), String> {
        if self.input_paths.is_empty() && self.output_paths.is_empty() {
            return Err("no devices: need if= and/or of=".to_string());
        }
        if self.mirror_mode() && self.input_paths.len() != self.output_paths.len() {
            return Err(format!(
                "mirror mode needs equal device counts (if={}, of={})",
                self.input_paths.len(),
                self.output_paths.len()
            ));
        }
        if self.threads == 0 {
            return Err("threads must be at least 1".to_string());
        }
        if self.dsize == 0 || self.dsize % 4 != 0 {
            return Err(format!("bad device block size {}", self.dsize));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_with_an_output() {
        let mut options = DtOptions::default();
        assert!(options.validate().is_err());
        options.output_paths.push("/tmp/x".into());
        assert!(options.validate().is_ok());
        assert!(!options.mirror_mode());
        assert!(!options.read_only());
    }

    #[test]
    fn mirror_counts_must_match() {
        let mut options = DtOptions::default();
        options.output_paths.push("/tmp/a".into());
        options.input_paths.push("/tmp/b".into());
        assert!(options.validate().is_ok());
        options.input_paths.push("/tmp/c".into());
        assert!(options.validate().is_err());
    }

    #[test]
    fn default_enables_cover_verification() {
        let flags = EnableFlags::default();
        assert!(flags.contains(EnableFlags::COMPARE));
        assert!(flags.contains(EnableFlags::WRITE_ORDER));
        assert!(flags.contains(EnableFlags::READ_PASS));
        assert!(!flags.contains(EnableFlags::STRICT_EOF));
    }
}
