//! The dtapp behavior: wiring between the scheduler and the pass engine.
//!
//! The scheduler hands each worker one primary device context; the
//! behavior builds the rest of the thread's device slab from the option
//! surface, opens everything, installs tag templates and prefixes, and
//! drives the pass loop. `job_finish` aggregates thread totals and applies
//! the dispose policy.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context};
use btag::{Btag, BtagFlags, PatternKind, PatternModifiers, TemplateInit, WRITE_ORDER_SIZE};
use devices::clock::{epoch_micros, epoch_secs};
use devices::{Counters, DeviceContext, DeviceKind, DeviceSpec, IoMode, OpenFlags};
use jobs::{Behavior, ExitStatus, JobOptions, JobRegistry, ThreadControl, ThreadReport};
use palign::Arena;
use stencil::{expand, expand_prefix, Env};
use tracing::{error, info, warn};

use crate::info::{DtappInfo, Side};
use crate::options::{BlockSize, Dispose, DtOptions, EnableFlags, PatternSpec};
use crate::pass::{PassEngine, ROTATE_SIZE};
use crate::trigger::Trigger;

pub struct DtappBehavior {
    pub options: DtOptions,
    trigger: Option<Trigger>,
    pattern_file: Option<Vec<u8>>,
    base_seed: u64,
    arena: Arena,
}

impl DtappBehavior {
    pub fn new(options: DtOptions) -> anyhow::Result<DtappBehavior> {
        options.validate().map_err(|e| anyhow!(e))?;

        let pattern_file = match &options.pattern {
            PatternSpec::File(path) => {
                let bytes = std::fs::read(path)
                    .with_context(|| format!("pattern file {}", path.display()))?;
                if bytes.is_empty() {
                    return Err(anyhow!("pattern file {} is empty", path.display()));
                }
                Some(bytes)
            }
            _ => None,
        };

        let trigger = options.trigger.as_deref().map(Trigger::new);
        let base_seed = options.seed.unwrap_or_else(|| {
            let (secs, usecs) = epoch_micros();
            ((secs as u64) << 32) ^ (usecs as u64) ^ (std::process::id() as u64)
        });

        Ok(DtappBehavior {
            options,
            trigger,
            pattern_file,
            base_seed,
            arena: Arena::new(),
        })
    }

    pub fn base_seed(&self) -> u64 {
        self.base_seed
    }

    pub(crate) fn make_context(&self, path: &Path, index: u8, mode: IoMode) -> DeviceContext {
        let spec = DeviceSpec {
            path: path.to_path_buf(),
            dsize: self.options.dsize,
            mode,
            data_limit: self.options.limit,
            step: self.options.step,
            history_depth: if self.options.enabled.contains(EnableFlags::HISTORY) {
                self.options.history_depth.max(16)
            } else {
                0
            },
            ..DeviceSpec::default()
        };
        DeviceContext::new(&spec, index, self.arena.clone())
    }

    fn write_flags(&self) -> OpenFlags {
        let mut flags = OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE;
        if self.options.open_direct {
            flags |= OpenFlags::DIRECT;
        }
        flags
    }

    fn read_flags(&self) -> OpenFlags {
        let mut flags = OpenFlags::READ;
        if self.options.open_direct {
            flags |= OpenFlags::DIRECT;
        }
        flags
    }

    fn pattern_kind(&self) -> PatternKind {
        match self.options.pattern {
            PatternSpec::Iot => PatternKind::Iot,
            PatternSpec::Incr => PatternKind::Incr,
            PatternSpec::Pattern(_) => PatternKind::Pattern,
            PatternSpec::File(_) => PatternKind::PatternFile,
        }
    }

    fn buffer_size(&self) -> usize {
        let record = match self.options.block_size {
            BlockSize::Fixed(n) => n,
            BlockSize::Random => self.options.max_size,
        };
        record + ROTATE_SIZE
    }

    /// Open, slice, buffer, and template every context of the slab.
    pub(crate) fn setup_devices(
        &self,
        info: &mut DtappInfo,
        thread_number: u32,
    ) -> anyhow::Result<()> {
        let opts = &self.options;
        let modifiers = {
            let mut m = PatternModifiers::empty();
            if opts.enabled.contains(EnableFlags::LBDATA) {
                m |= PatternModifiers::LBDATA;
            }
            if opts.enabled.contains(EnableFlags::TIMESTAMP) {
                m |= PatternModifiers::TIMESTAMP;
            }
            m
        };
        let carry_order = opts.enabled.contains(EnableFlags::WRITE_ORDER);
        let pass_start_epoch = epoch_secs();

        let outputs = info.outputs.clone();
        for at in 0..info.devices.len() {
            let is_output = outputs.contains(&at);
            let dip = &mut info.devices[at];
            dip.open(if is_output {
                self.write_flags()
            } else {
                self.read_flags()
            })?;
            if opts.slices > 0 {
                dip.init_slice(opts.slices, thread_number % opts.slices);
            }
            dip.setup_buffers(self.buffer_size(), opts.buffer_misalign);

            if let Some(template) = &opts.prefix {
                let expanded = {
                    let env = Env::for_dip(dip);
                    expand_prefix(template, &env)
                };
                dip.prefix = expanded;
            }

            let header = btag::BTAG_SIZE + if carry_order { WRITE_ORDER_SIZE } else { 0 };
            let needed = header + dip.prefix.len() + 4;
            if needed > dip.dsize as usize {
                return Err(anyhow!(
                    "device block size {} cannot hold tag + prefix ({needed} bytes)",
                    dip.dsize
                ));
            }

            let mut flags = BtagFlags::empty();
            if dip.kind == DeviceKind::File {
                flags |= BtagFlags::FILE;
            }
            if !dip.prefix.is_empty() {
                flags |= BtagFlags::PREFIX;
            }
            dip.btag_template = Some(Btag::template(&TemplateInit {
                serial: opts.serial.as_bytes(),
                hostname: stencil::full_hostname().as_bytes(),
                devid_or_inode: dip.devid_or_inode,
                pattern_kind: self.pattern_kind(),
                pattern_modifiers: modifiers,
                flags,
                write_pass_start: pass_start_epoch,
                process_id: std::process::id(),
                job_id: dip.job_id,
                thread_number: dip.thread_number,
                device_size: dip.dsize,
                opaque: carry_order,
            }));
        }
        Ok(())
    }

    fn run_thread(
        &self,
        master: DeviceContext,
        control: &ThreadControl,
    ) -> anyhow::Result<(ExitStatus, DtappInfo)> {
        let run_start = Instant::now();
        let thread_number = master.thread_number;
        let read_only = self.options.read_only();
        let side = if read_only { Side::Input } else { Side::Output };
        let owner = (master.job_id, master.thread_number, master.job_tag.clone());

        // Seed the runtime tunables; `modify` can change them later.
        use std::sync::atomic::Ordering;
        control
            .tuning
            .recovery_limit
            .store(self.options.recovery_limit, Ordering::Relaxed);
        control
            .tuning
            .recovery_delay_secs
            .store(self.options.recovery_delay.as_secs(), Ordering::Relaxed);
        control
            .tuning
            .keepalive_secs
            .store(self.options.keepalive_secs, Ordering::Relaxed);

        let mut info = DtappInfo::new(master, side);
        if read_only {
            for (index, path) in self.options.input_paths.iter().enumerate().skip(1) {
                let mut dip = self.make_context(path, index as u8, IoMode::Read);
                dip.set_owner(owner.0, owner.1, owner.2.clone());
                info.push(dip, Side::Input);
            }
        } else {
            for (index, path) in self.options.output_paths.iter().enumerate().skip(1) {
                let mut dip = self.make_context(path, index as u8, IoMode::Write);
                dip.set_owner(owner.0, owner.1, owner.2.clone());
                info.push(dip, Side::Output);
            }
            for (index, path) in self.options.input_paths.iter().enumerate() {
                let mut dip = self.make_context(path, index as u8, IoMode::Read);
                dip.set_owner(owner.0, owner.1, owner.2.clone());
                info.push(dip, Side::Input);
            }
        }

        self.setup_devices(&mut info, thread_number)?;

        let mut status = ExitStatus::Success;
        let passes = self.options.passes.max(1);
        {
            let mut engine = PassEngine::new(
                &mut info,
                &self.options,
                control,
                self.trigger.as_ref(),
                self.pattern_file.as_deref(),
                run_start,
                self.base_seed,
            );

            for pass in 0..passes {
                if !read_only {
                    let wrote_status = engine.write_pass(pass);
                    status = status.worst(wrote_status);
                    if status == ExitStatus::Failure || control.should_stop() {
                        break;
                    }

                    let wrote: u64 = engine
                        .info
                        .outputs
                        .iter()
                        .map(|&at| engine.info.devices[at].counters.pass_bytes_written)
                        .sum();
                    if wrote == 0 {
                        // The read half still runs; flagging this keeps the
                        // always-read decision revisitable.
                        warn!("write half moved no data; attempting the read half anyway");
                    }

                    let run_read = self.options.enabled.contains(EnableFlags::READ_PASS)
                        && !self.options.enabled.contains(EnableFlags::RAW);
                    if run_read {
                        let reopen = self.write_flags();
                        let outputs = engine.info.outputs.clone();
                        for &at in &outputs {
                            let dip = &mut engine.info.devices[at];
                            dip.close();
                            dip.open(reopen)?;
                        }
                        let read_status = engine.read_pass(pass);
                        status = status.worst(read_status);
                    }
                } else {
                    let read_status = engine.read_pass(pass);
                    status = status.worst(read_status);
                }

                for dip in engine.info.devices.iter_mut() {
                    dip.counters.end_pass();
                }
                control.publish(&engine.info.devices[0].counters);

                if status == ExitStatus::Failure || control.should_stop() {
                    break;
                }
                // Pass-boundary rendezvous: threads sharing a target start
                // the next pass in lockstep.
                if pass + 1 < passes {
                    if let Some(iolock) = control.iolock() {
                        iolock.wait_for_threads_done();
                    }
                }
            }
        }

        for dip in info.devices.iter_mut() {
            dip.close();
        }
        Ok((status, info))
    }
}

impl Behavior for DtappBehavior {
    fn thread_main(&self, master: DeviceContext, control: &ThreadControl) -> ThreadReport {
        match self.run_thread(master, control) {
            Ok((status, info)) => {
                let mut counters = Counters::default();
                for dip in &info.devices {
                    counters.merge_totals(&dip.counters);
                }
                control.publish(&counters);
                ThreadReport { status, counters }
            }
            Err(e) => {
                error!("worker thread failed: {e:#}");
                ThreadReport {
                    status: ExitStatus::Failure,
                    ..ThreadReport::default()
                }
            }
        }
    }

    fn job_finish(&self, job_id: u16, tag: Option<&str>, reports: &[ThreadReport]) {
        let mut totals = Counters::default();
        let mut status = ExitStatus::Success;
        for report in reports {
            totals.merge_totals(&report.counters);
            status = status.worst(report.status);
        }

        let prefix = self
            .options
            .log_prefix
            .as_deref()
            .map(|template| {
                let env = Env {
                    counters: Some(&totals),
                    job_id: Some(job_id as u32),
                    job_tag: tag,
                    ..Env::default()
                };
                expand(template, &env)
            })
            .unwrap_or_default();
        info!(
            "{prefix}job {job_id} finished ({status:?}): wrote {} records / {} bytes, \
             read {} records / {} bytes, {} errors over {} passes",
            totals.total_records_written,
            totals.total_bytes_written,
            totals.total_records_read,
            totals.total_bytes_read,
            totals.total_errors,
            totals.passes,
        );

        let delete = match self.options.dispose {
            Dispose::Delete => true,
            Dispose::KeepOnError => status != ExitStatus::Failure,
            Dispose::Keep => false,
        };
        if delete {
            for path in &self.options.output_paths {
                if path.is_file() {
                    if let Err(e) = std::fs::remove_file(path) {
                        warn!(path = %path.display(), error = %e, "dispose failed");
                    }
                }
            }
        }
    }
}

/// Build the primary (thread 0) device context for a run.
pub fn master_context(behavior: &DtappBehavior) -> anyhow::Result<DeviceContext> {
    let options = &behavior.options;
    let (path, mode) = if options.read_only() {
        (&options.input_paths[0], IoMode::Read)
    } else {
        (&options.output_paths[0], IoMode::Write)
    };
    Ok(behavior.make_context(path, 0, mode))
}

/// Start a dtapp job and, for foreground jobs, wait for its outcome.
pub fn run_job(
    registry: &Arc<JobRegistry>,
    options: DtOptions,
) -> anyhow::Result<ExitStatus> {
    // Output truncation happens once, before any worker opens the file;
    // doing it per thread would race sibling writers.
    if options.truncate_output {
        for path in &options.output_paths {
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)
                .with_context(|| format!("truncating {}", path.display()))?;
        }
    }

    let job = JobOptions {
        threads: options.threads,
        tag: options.tag.clone(),
        background: options.background,
        iolock: options.iolock,
        log_path: options.job_log.clone(),
    };
    let background = options.background;

    let behavior = Arc::new(DtappBehavior::new(options)?);
    let master = master_context(&behavior)?;
    let id = registry.execute_threads(behavior.clone(), master, job)?;
    if background {
        info!(job = id, "background job started");
        return Ok(ExitStatus::Success);
    }
    registry
        .wait_for_job(behavior.as_ref(), id)
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::BlockSize;
    use crate::run_exit_code;
    use std::time::Duration;

    fn options_for(path: &Path) -> DtOptions {
        DtOptions {
            output_paths: vec![path.to_path_buf()],
            limit: 64 * 1024,
            block_size: BlockSize::Fixed(8192),
            prefix: Some("%d@%h".to_string()),
            serial: "JOBSER01".to_string(),
            ..DtOptions::default()
        }
    }

    #[test]
    fn foreground_job_round_trips_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("job.dat");
        let registry = JobRegistry::new();

        let status = run_job(&registry, options_for(&target)).unwrap();
        assert_eq!(run_exit_code(status, false), 0);
        assert_eq!(std::fs::metadata(&target).unwrap().len(), 65536);
        assert!(registry.jobs().is_empty());
    }

    #[test]
    fn dispose_delete_removes_the_output() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("gone.dat");
        let registry = JobRegistry::new();

        let mut options = options_for(&target);
        options.dispose = Dispose::Delete;
        let status = run_job(&registry, options).unwrap();
        assert_eq!(run_exit_code(status, false), 0);
        assert!(!target.exists());
    }

    #[test]
    fn sliced_threads_share_one_file_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("sliced.dat");
        let registry = JobRegistry::new();

        let mut options = options_for(&target);
        options.threads = 2;
        options.slices = 2;
        options.tag = Some("sliced".to_string());
        let status = run_job(&registry, options).unwrap();
        assert_eq!(run_exit_code(status, false), 0);
        // Two disjoint 32k slices cover the whole 64k range.
        assert_eq!(std::fs::metadata(&target).unwrap().len(), 65536);
    }

    #[test]
    fn mirror_corruption_fails_the_job_and_fires_the_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("mirrored.dat");
        let stale = dir.path().join("stale-mirror.dat");
        let marker = dir.path().join("trigger-ran");
        std::fs::write(&stale, vec![0u8; 64 * 1024]).unwrap();
        let registry = JobRegistry::new();

        let mut options = options_for(&target);
        options.input_paths = vec![stale.clone()];
        options.trigger = Some(format!("cmd:touch {}", marker.display()));
        let status = run_job(&registry, options).unwrap();
        assert_eq!(status, ExitStatus::Failure);

        for _ in 0..200 {
            if marker.exists() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("trigger never fired");
    }

    #[test]
    fn truncate_option_resets_the_output_before_workers_start() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("trunc.dat");
        std::fs::write(&target, vec![0xFFu8; 256 * 1024]).unwrap();
        let registry = JobRegistry::new();

        let mut options = options_for(&target);
        options.truncate_output = true;
        let status = run_job(&registry, options).unwrap();
        assert_eq!(run_exit_code(status, false), 0);
        assert_eq!(std::fs::metadata(&target).unwrap().len(), 65536);
    }
}
