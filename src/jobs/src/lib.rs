//! Job and thread scheduling.
//!
//! A process-wide [`JobRegistry`] owns every job; a job owns its worker
//! threads; each worker owns its device contexts. Jobs start behind a
//! startup gate so every sibling begins I/O together, run until their
//! behavior returns or until stopped, and can be paused, resumed, stopped
//! or cancelled by id, exact tag, or tag prefix. Cancellation here is
//! cooperative: workers observe their [`ThreadControl`] at every loop head
//! and at I/O retry boundaries.

mod control;
mod iolock;
mod job;
mod registry;

pub use control::{StartGate, ThreadControl, Tuning};
pub use iolock::IoCoordinator;
pub use job::{Job, JobState, ThreadState};
pub use registry::{JobOptions, JobRegistry};

use devices::Counters;
use thiserror::Error;

/// Run-level outcome of a thread or job, ordered least to most severe.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Default)]
pub enum ExitStatus {
    #[default]
    Success,
    Warning,
    EndOfFile,
    Failure,
}

impl ExitStatus {
    /// Process exit code mapping.
    pub fn exit_code(self) -> i32 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::Warning => 1,
            ExitStatus::EndOfFile => 254,
            ExitStatus::Failure => 255,
        }
    }

    pub fn worst(self, other: ExitStatus) -> ExitStatus {
        self.max(other)
    }
}

/// What a worker thread hands back when it finishes.
#[derive(Debug, Default, Clone)]
pub struct ThreadReport {
    pub status: ExitStatus,
    pub counters: Counters,
}

/// An I/O behavior drives the worker threads of a job and aggregates the
/// job's results. The per-thread state a behavior needs lives inside its
/// `thread_main`, owned by the thread.
pub trait Behavior: Send + Sync + 'static {
    fn thread_main(
        &self,
        dip: devices::DeviceContext,
        control: &ThreadControl,
    ) -> ThreadReport;

    fn job_finish(&self, job_id: u16, tag: Option<&str>, reports: &[ThreadReport]);
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("no job with id {0}")]
    NoSuchJob(u16),
    #[error("no job tagged {0:?}")]
    NoSuchTag(String),
    #[error("job {0} is not waitable (already joined)")]
    NotWaitable(u16),
    #[error("a job needs at least one thread")]
    NoThreads,
    #[error("unknown modify parameter {0:?}")]
    UnknownParameter(String),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}
