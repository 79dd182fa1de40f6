//! The process-wide job registry.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use devices::DeviceContext;
use parking_lot::Mutex;
use stencil::{expand, Env};
use tracing::{error, info};

use crate::control::{StartGate, ThreadControl};
use crate::iolock::IoCoordinator;
use crate::job::{Job, JobState, ThreadState};
use crate::{Behavior, ExitStatus, JobError, ThreadReport};

/// Options the scheduler consumes when starting a job.
#[derive(Debug, Clone)]
pub struct JobOptions {
    pub threads: u32,
    pub tag: Option<String>,
    /// Detach and reap through the await thread instead of blocking.
    pub background: bool,
    /// Enable the pass-boundary rendezvous for shared-target runs.
    pub iolock: bool,
    pub log_path: Option<PathBuf>,
}

impl Default for JobOptions {
    fn default() -> Self {
        JobOptions {
            threads: 1,
            tag: None,
            background: false,
            iolock: false,
            log_path: None,
        }
    }
}

#[derive(Default)]
struct Inner {
    jobs: Vec<Arc<Job>>,
    next_id: u16,
}

/// Registry of live jobs. One instance sits at the top of the process and
/// is passed to everything that schedules or queries work.
#[derive(Default)]
pub struct JobRegistry {
    inner: Mutex<Inner>,
}

impl JobRegistry {
    pub fn new() -> Arc<JobRegistry> {
        Arc::new(JobRegistry::default())
    }

    /// Start a job of `threads` workers over clones of `master`.
    ///
    /// The master context becomes thread 0's context directly; only the
    /// remaining N-1 are cloned. The scheduler returns once every worker
    /// has passed the startup gate, so no thread issues I/O before its
    /// siblings are ready.
    pub fn execute_threads<B: Behavior>(
        self: &Arc<Self>,
        behavior: Arc<B>,
        master: DeviceContext,
        options: JobOptions,
    ) -> Result<u16, JobError> {
        if options.threads == 0 {
            return Err(JobError::NoThreads);
        }
        let threads = options.threads as usize;

        let id = {
            let mut inner = self.inner.lock();
            inner.next_id = inner.next_id.wrapping_add(1).max(1);
            inner.next_id
        };

        let controls: Vec<Arc<ThreadControl>> =
            (0..threads).map(|_| Arc::new(ThreadControl::new())).collect();
        let iolock = options.iolock.then(|| IoCoordinator::new(threads));
        if let Some(iolock) = &iolock {
            for control in &controls {
                control.set_iolock(iolock.clone());
            }
        }
        let job = Arc::new(Job::new(
            id,
            options.tag.clone(),
            controls.clone(),
            options.log_path.as_ref(),
            iolock.clone(),
        ));
        self.inner.lock().jobs.push(job.clone());

        let gate = Arc::new(StartGate::new(threads));
        let mut contexts = Vec::with_capacity(threads);
        contexts.push(master);
        for _ in 1..threads {
            contexts.push(contexts[0].clone_for_thread());
        }

        let mut handles = Vec::with_capacity(threads);
        for (number, mut dip) in contexts.into_iter().enumerate() {
            dip.set_owner(id as u32, number as u32, options.tag.clone());
            let control = controls[number].clone();
            let thread_gate = gate.clone();
            let behavior = behavior.clone();
            let iolock = iolock.clone();

            let spawned = thread::Builder::new()
                .name(format!("job{id}.{number}"))
                .spawn(move || {
                    if !thread_gate.ready_and_wait() {
                        control.set_state(ThreadState::Finished);
                        return ThreadReport {
                            status: ExitStatus::Failure,
                            ..ThreadReport::default()
                        };
                    }
                    control.mark_running();
                    let report = behavior.thread_main(dip, &control);
                    if let Some(iolock) = &iolock {
                        iolock.thread_exited();
                    }
                    if !control.is_cancelled() {
                        control.set_state(ThreadState::Finished);
                    }
                    report
                });

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    error!(job = id, error = %e, "worker spawn failed; aborting startup");
                    gate.abort();
                    for handle in handles {
                        let _ = handle.join();
                    }
                    job.set_state(JobState::Cancelled);
                    self.remove(id);
                    return Err(JobError::Spawn(e));
                }
            }
        }
        job.install_handles(handles);

        gate.wait();
        job.set_state(JobState::Running);
        info!(job = id, threads, tag = ?options.tag, "job running");

        if options.background {
            let registry = Arc::clone(self);
            let reaper = thread::Builder::new()
                .name(format!("a_job{id}"))
                .spawn(move || {
                    let status = registry.finish_job(behavior.as_ref(), id);
                    info!(job = id, status = ?status, "background job complete");
                });
            if let Err(e) = reaper {
                error!(job = id, error = %e, "await thread spawn failed");
            }
        }

        Ok(id)
    }

    /// Block until the job's workers are done; aggregate, finish, remove.
    pub fn wait_for_job<B: Behavior>(
        &self,
        behavior: &B,
        id: u16,
    ) -> Result<ExitStatus, JobError> {
        if self.find_by_id(id).is_none() {
            return Err(JobError::NoSuchJob(id));
        }
        Ok(self.finish_job(behavior, id))
    }

    fn finish_job<B: Behavior>(&self, behavior: &B, id: u16) -> ExitStatus {
        let Some(job) = self.find_by_id(id) else {
            return ExitStatus::Success;
        };
        let reports = job.join_workers();
        let status = reports
            .iter()
            .fold(ExitStatus::Success, |acc, r| acc.worst(r.status));
        job.set_state(JobState::Finished);
        behavior.job_finish(job.id, job.tag.as_deref(), &reports);
        job.log_line(&format!(
            "job {} finished {:?} after {:.3}s",
            job.id,
            status,
            job.elapsed_secs()
        ));
        self.remove(id);
        status
    }

    pub fn find_by_id(&self, id: u16) -> Option<Arc<Job>> {
        self.inner.lock().jobs.iter().find(|j| j.id == id).cloned()
    }

    pub fn find_by_tag(&self, tag: &str) -> Option<Arc<Job>> {
        self.inner
            .lock()
            .jobs
            .iter()
            .find(|j| j.tag.as_deref() == Some(tag))
            .cloned()
    }

    /// All jobs whose tag starts with `prefix`, in creation order.
    pub fn find_by_tag_prefix(&self, prefix: &str) -> Vec<Arc<Job>> {
        self.inner
            .lock()
            .jobs
            .iter()
            .filter(|j| {
                j.tag
                    .as_deref()
                    .map(|t| t.starts_with(prefix))
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    pub fn jobs(&self) -> Vec<Arc<Job>> {
        self.inner.lock().jobs.clone()
    }

    pub fn remove(&self, id: u16) {
        self.inner.lock().jobs.retain(|j| j.id != id);
    }

    pub fn pause_job(&self, id: u16) -> Result<(), JobError> {
        self.find_by_id(id).ok_or(JobError::NoSuchJob(id))?.pause();
        Ok(())
    }

    pub fn resume_job(&self, id: u16) -> Result<(), JobError> {
        self.find_by_id(id).ok_or(JobError::NoSuchJob(id))?.resume();
        Ok(())
    }

    pub fn stop_job(&self, id: u16) -> Result<(), JobError> {
        self.find_by_id(id).ok_or(JobError::NoSuchJob(id))?.stop();
        Ok(())
    }

    pub fn cancel_job(&self, id: u16) -> Result<(), JobError> {
        self.find_by_id(id).ok_or(JobError::NoSuchJob(id))?.cancel();
        Ok(())
    }

    /// Apply whitespace-separated `key=value` settings to a running job's
    /// tunables.
    pub fn modify_job(&self, id: u16, settings: &str) -> Result<(), JobError> {
        let job = self.find_by_id(id).ok_or(JobError::NoSuchJob(id))?;
        for token in settings.split_whitespace() {
            let (key, value) = token
                .split_once('=')
                .ok_or_else(|| JobError::UnknownParameter(token.to_string()))?;
            for control in &job.controls {
                let tuning = &control.tuning;
                match key {
                    "recovery_limit" => tuning
                        .recovery_limit
                        .store(parse_u64(key, value)?, Ordering::Relaxed),
                    "recovery_delay" => tuning
                        .recovery_delay_secs
                        .store(parse_u64(key, value)?, Ordering::Relaxed),
                    "keepalive" => tuning
                        .keepalive_secs
                        .store(parse_u64(key, value)?, Ordering::Relaxed),
                    "debug" => tuning.debug.store(parse_bool(key, value)?, Ordering::Relaxed),
                    "stats" => tuning.stats.store(parse_bool(key, value)?, Ordering::Relaxed),
                    _ => return Err(JobError::UnknownParameter(key.to_string())),
                }
            }
        }
        Ok(())
    }

    /// One formatted line per thread, expanded through the format engine.
    pub fn query_job(&self, id: u16, template: Option<&str>) -> Result<Vec<String>, JobError> {
        let job = self.find_by_id(id).ok_or(JobError::NoSuchJob(id))?;
        let template =
            template.unwrap_or("job %job thread %thread: %writes writes, %reads reads, %errors errors");
        let mut lines = Vec::with_capacity(job.threads());
        for (number, control) in job.controls.iter().enumerate() {
            let snapshot = control.snapshot();
            let env = Env {
                counters: Some(&snapshot),
                job_id: Some(job.id as u32),
                job_tag: job.tag.as_deref(),
                thread_number: Some(number as u32),
                ..Env::default()
            };
            lines.push(format!(
                "{} [{:?}]",
                expand(template, &env),
                control.state()
            ));
        }
        Ok(lines)
    }
}

fn parse_u64(key: &str, value: &str) -> Result<u64, JobError> {
    value
        .parse()
        .map_err(|_| JobError::UnknownParameter(format!("{key}={value}")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, JobError> {
    match value {
        "on" | "true" | "1" => Ok(true),
        "off" | "false" | "0" => Ok(false),
        _ => Err(JobError::UnknownParameter(format!("{key}={value}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devices::{Counters, DeviceSpec};
    use palign::Arena;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    /// Counts iterations through the engine-style loop until told to stop
    /// (or until `target` iterations when non-zero).
    struct TickBehavior {
        target: u64,
        finished_jobs: Mutex<Vec<u16>>,
        total_ticks: AtomicU64,
    }

    impl TickBehavior {
        fn new(target: u64) -> Arc<Self> {
            Arc::new(TickBehavior {
                target,
                finished_jobs: Mutex::new(Vec::new()),
                total_ticks: AtomicU64::new(0),
            })
        }
    }

    impl Behavior for TickBehavior {
        fn thread_main(&self, _dip: DeviceContext, control: &ThreadControl) -> ThreadReport {
            let mut counters = Counters::default();
            loop {
                if control.pause_point() {
                    break;
                }
                counters.pass_records_written += 1;
                self.total_ticks.fetch_add(1, Ordering::Relaxed);
                control.publish(&counters);
                if self.target > 0 && counters.pass_records_written >= self.target {
                    break;
                }
                thread::sleep(Duration::from_millis(1));
            }
            ThreadReport {
                status: ExitStatus::Success,
                counters,
            }
        }

        fn job_finish(&self, job_id: u16, _tag: Option<&str>, _reports: &[ThreadReport]) {
            self.finished_jobs.lock().push(job_id);
        }
    }

    fn master() -> DeviceContext {
        DeviceContext::new(
            &DeviceSpec {
                path: "/tmp/jobs-test".into(),
                ..DeviceSpec::default()
            },
            0,
            Arena::new(),
        )
    }

    #[test]
    fn foreground_job_runs_and_is_reaped() {
        let registry = JobRegistry::new();
        let behavior = TickBehavior::new(5);
        let id = registry
            .execute_threads(behavior.clone(), master(), JobOptions {
                threads: 3,
                tag: Some("smoke".to_string()),
                ..JobOptions::default()
            })
            .unwrap();

        assert_eq!(registry.find_by_id(id).unwrap().state(), JobState::Running);
        let status = registry.wait_for_job(behavior.as_ref(), id).unwrap();
        assert_eq!(status, ExitStatus::Success);
        assert!(registry.find_by_id(id).is_none());
        assert_eq!(behavior.finished_jobs.lock().as_slice(), &[id]);
        assert_eq!(behavior.total_ticks.load(Ordering::Relaxed), 15);
    }

    #[test]
    fn pause_stalls_counters_and_resume_restarts_them() {
        let registry = JobRegistry::new();
        let behavior = TickBehavior::new(0);
        let id = registry
            .execute_threads(behavior.clone(), master(), JobOptions {
                threads: 2,
                ..JobOptions::default()
            })
            .unwrap();

        thread::sleep(Duration::from_millis(30));
        registry.pause_job(id).unwrap();
        let job = registry.find_by_id(id).unwrap();
        assert_eq!(job.state(), JobState::Paused);
        for control in &job.controls {
            control.wait_for_state(ThreadState::Paused);
        }

        let before = behavior.total_ticks.load(Ordering::Relaxed);
        thread::sleep(Duration::from_millis(50));
        let during = behavior.total_ticks.load(Ordering::Relaxed);
        // Threads may finish the iteration they were in, nothing more.
        assert!(during <= before + 2, "paused threads kept counting");

        registry.resume_job(id).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(behavior.total_ticks.load(Ordering::Relaxed) > during);

        registry.stop_job(id).unwrap();
        let status = registry.wait_for_job(behavior.as_ref(), id).unwrap();
        assert_eq!(status, ExitStatus::Success);
    }

    #[test]
    fn cancel_forces_failure_status() {
        let registry = JobRegistry::new();
        let behavior = TickBehavior::new(0);
        let id = registry
            .execute_threads(behavior.clone(), master(), JobOptions::default())
            .unwrap();

        thread::sleep(Duration::from_millis(20));
        registry.cancel_job(id).unwrap();
        let status = registry.wait_for_job(behavior.as_ref(), id).unwrap();
        assert_eq!(status, ExitStatus::Failure);
    }

    #[test]
    fn background_job_reaps_itself() {
        let registry = JobRegistry::new();
        let behavior = TickBehavior::new(3);
        let id = registry
            .execute_threads(behavior.clone(), master(), JobOptions {
                background: true,
                ..JobOptions::default()
            })
            .unwrap();

        for _ in 0..100 {
            if registry.find_by_id(id).is_none() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(registry.find_by_id(id).is_none());
        assert_eq!(behavior.finished_jobs.lock().as_slice(), &[id]);
    }

    #[test]
    fn finders_by_tag_and_prefix() {
        let registry = JobRegistry::new();
        let behavior = TickBehavior::new(0);
        let a = registry
            .execute_threads(behavior.clone(), master(), JobOptions {
                tag: Some("night-a".to_string()),
                ..JobOptions::default()
            })
            .unwrap();
        let b = registry
            .execute_threads(behavior.clone(), master(), JobOptions {
                tag: Some("night-b".to_string()),
                ..JobOptions::default()
            })
            .unwrap();

        assert_eq!(registry.find_by_tag("night-a").unwrap().id, a);
        assert!(registry.find_by_tag("night").is_none());
        let matched = registry.find_by_tag_prefix("night-");
        assert_eq!(matched.len(), 2);

        for id in [a, b] {
            registry.stop_job(id).unwrap();
            registry.wait_for_job(behavior.as_ref(), id).unwrap();
        }
    }

    #[test]
    fn modify_updates_every_thread_and_rejects_unknowns() {
        let registry = JobRegistry::new();
        let behavior = TickBehavior::new(0);
        let id = registry
            .execute_threads(behavior.clone(), master(), JobOptions {
                threads: 2,
                ..JobOptions::default()
            })
            .unwrap();

        registry
            .modify_job(id, "recovery_limit=9 recovery_delay=3 debug=on")
            .unwrap();
        let job = registry.find_by_id(id).unwrap();
        for control in &job.controls {
            assert_eq!(control.tuning.recovery_limit.load(Ordering::Relaxed), 9);
            assert_eq!(control.tuning.recovery_delay_secs.load(Ordering::Relaxed), 3);
            assert!(control.tuning.debug.load(Ordering::Relaxed));
        }
        assert!(matches!(
            registry.modify_job(id, "bogus=1"),
            Err(JobError::UnknownParameter(_))
        ));

        registry.stop_job(id).unwrap();
        registry.wait_for_job(behavior.as_ref(), id).unwrap();
    }

    #[test]
    fn query_formats_one_line_per_thread() {
        let registry = JobRegistry::new();
        let behavior = TickBehavior::new(0);
        let id = registry
            .execute_threads(behavior.clone(), master(), JobOptions {
                threads: 2,
                tag: Some("q".to_string()),
                ..JobOptions::default()
            })
            .unwrap();

        thread::sleep(Duration::from_millis(30));
        let lines = registry.query_job(id, None).unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains(&format!("job {id} thread 0")));
        assert!(lines[1].contains("thread 1"));

        registry.stop_job(id).unwrap();
        registry.wait_for_job(behavior.as_ref(), id).unwrap();
    }
}
