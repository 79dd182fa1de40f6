//! One job: a set of worker threads over cloned device contexts.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::warn;

use crate::control::ThreadControl;
use crate::iolock::IoCoordinator;
use crate::{ExitStatus, ThreadReport};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum JobState {
    #[default]
    Stopped,
    Running,
    Finished,
    Paused,
    Terminating,
    Cancelled,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum ThreadState {
    #[default]
    Stopped,
    Starting,
    Running,
    Finished,
    Joined,
    Paused,
    Terminating,
    Cancelled,
}

pub struct Job {
    pub id: u16,
    pub tag: Option<String>,
    state: Mutex<JobState>,
    /// Serialises multi-line diagnostic output within the job.
    pub print_lock: Mutex<()>,
    pub controls: Vec<Arc<ThreadControl>>,
    handles: Mutex<Vec<Option<JoinHandle<ThreadReport>>>>,
    reports: Mutex<Vec<ThreadReport>>,
    pub started_at: Instant,
    finished_at: Mutex<Option<Instant>>,
    log_sink: Option<Mutex<File>>,
    pub iolock: Option<Arc<IoCoordinator>>,
}

impl Job {
    pub(crate) fn new(
        id: u16,
        tag: Option<String>,
        controls: Vec<Arc<ThreadControl>>,
        log_path: Option<&PathBuf>,
        iolock: Option<Arc<IoCoordinator>>,
    ) -> Job {
        let log_sink = log_path.and_then(|path| match File::create(path) {
            Ok(file) => Some(Mutex::new(file)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot open job log");
                None
            }
        });
        Job {
            id,
            tag,
            state: Mutex::new(JobState::Stopped),
            print_lock: Mutex::new(()),
            controls,
            handles: Mutex::new(Vec::new()),
            reports: Mutex::new(Vec::new()),
            started_at: Instant::now(),
            finished_at: Mutex::new(None),
            log_sink,
            iolock,
        }
    }

    pub fn state(&self) -> JobState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: JobState) {
        *self.state.lock() = state;
        if matches!(state, JobState::Finished) {
            *self.finished_at.lock() = Some(Instant::now());
        }
    }

    pub fn threads(&self) -> usize {
        self.controls.len()
    }

    pub(crate) fn install_handles(&self, handles: Vec<JoinHandle<ThreadReport>>) {
        *self.handles.lock() = handles.into_iter().map(Some).collect();
    }

    /// Join every worker, collect reports, and mark threads joined.
    /// Subsequent calls return the cached reports.
    pub fn join_workers(&self) -> Vec<ThreadReport> {
        let mut handles = self.handles.lock();
        for (slot, control) in handles.iter_mut().zip(&self.controls) {
            if let Some(handle) = slot.take() {
                let mut report = match handle.join() {
                    Ok(report) => report,
                    Err(_) => {
                        warn!(job = self.id, "worker thread panicked");
                        ThreadReport {
                            status: ExitStatus::Failure,
                            ..ThreadReport::default()
                        }
                    }
                };
                // A cancelled thread's exit status is forced to failure.
                if control.is_cancelled() {
                    report.status = ExitStatus::Failure;
                }
                control.set_state(ThreadState::Joined);
                self.reports.lock().push(report);
            }
        }
        self.reports.lock().clone()
    }

    pub fn pause(&self) {
        for control in &self.controls {
            control.pause();
        }
        self.set_state(JobState::Paused);
    }

    pub fn resume(&self) {
        for control in &self.controls {
            control.resume();
        }
        self.set_state(JobState::Running);
    }

    pub fn stop(&self) {
        for control in &self.controls {
            control.terminate();
        }
        self.set_state(JobState::Terminating);
    }

    pub fn cancel(&self) {
        for control in &self.controls {
            control.cancel();
        }
        self.set_state(JobState::Cancelled);
    }

    pub fn elapsed_secs(&self) -> f64 {
        match *self.finished_at.lock() {
            Some(end) => end.duration_since(self.started_at).as_secs_f64(),
            None => self.started_at.elapsed().as_secs_f64(),
        }
    }

    /// Write a line to the job's own log sink, if it has one. Returns
    /// false when no sink is configured so the caller can fall back.
    pub fn log_line(&self, line: &str) -> bool {
        let Some(sink) = &self.log_sink else {
            return false;
        };
        let _serialise = self.print_lock.lock();
        let mut file = sink.lock();
        let _ = writeln!(file, "{line}");
        true
    }
}
