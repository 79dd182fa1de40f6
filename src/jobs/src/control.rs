//! Per-thread control block and the job startup gate.

use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;

use devices::Counters;
use parking_lot::{Condvar, Mutex};

use crate::iolock::IoCoordinator;
use crate::job::ThreadState;

/// Runtime-tunable knobs, mutable through `modify` while the job runs.
#[derive(Debug)]
pub struct Tuning {
    pub recovery_limit: AtomicU64,
    pub recovery_delay_secs: AtomicU64,
    pub keepalive_secs: AtomicU64,
    pub debug: AtomicBool,
    pub stats: AtomicBool,
}

impl Default for Tuning {
    fn default() -> Self {
        Tuning {
            recovery_limit: AtomicU64::new(2),
            recovery_delay_secs: AtomicU64::new(1),
            keepalive_secs: AtomicU64::new(0),
            debug: AtomicBool::new(false),
            stats: AtomicBool::new(true),
        }
    }
}

/// Shared state between the scheduler and one worker thread.
///
/// The pause gate is checked by the pass engine at the top of every record
/// loop iteration; stop and cancel are observed at the same points, so all
/// cancellation is cooperative.
#[derive(Debug, Default)]
pub struct ThreadControl {
    state: Mutex<ThreadState>,
    state_cv: Condvar,
    pub tuning: Tuning,
    published: Mutex<Counters>,
    iolock: Mutex<Option<Arc<IoCoordinator>>>,
}

impl ThreadControl {
    pub fn new() -> Self {
        let control = ThreadControl::default();
        *control.state.lock() = ThreadState::Starting;
        control
    }

    pub fn state(&self) -> ThreadState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: ThreadState) {
        *self.state.lock() = state;
        self.state_cv.notify_all();
    }

    /// Move Starting -> Running once the startup gate opens.
    pub fn mark_running(&self) {
        let mut st = self.state.lock();
        if *st == ThreadState::Starting {
            *st = ThreadState::Running;
        }
        self.state_cv.notify_all();
    }

    /// Request a pause; only a running thread pauses.
    pub fn pause(&self) {
        let mut st = self.state.lock();
        if *st == ThreadState::Running {
            *st = ThreadState::Paused;
        }
        self.state_cv.notify_all();
    }

    pub fn resume(&self) {
        let mut st = self.state.lock();
        if *st == ThreadState::Paused {
            *st = ThreadState::Running;
        }
        self.state_cv.notify_all();
    }

    pub fn terminate(&self) {
        let mut st = self.state.lock();
        if !matches!(*st, ThreadState::Finished | ThreadState::Joined) {
            *st = ThreadState::Terminating;
        }
        self.state_cv.notify_all();
    }

    pub fn cancel(&self) {
        let mut st = self.state.lock();
        if !matches!(*st, ThreadState::Joined) {
            *st = ThreadState::Cancelled;
        }
        self.state_cv.notify_all();
    }

    /// Gate called at the top of every engine iteration: blocks while the
    /// thread is paused, and reports whether it should exit its loops.
    pub fn pause_point(&self) -> bool {
        let mut st = self.state.lock();
        while *st == ThreadState::Paused {
            self.state_cv.wait(&mut st);
        }
        matches!(*st, ThreadState::Terminating | ThreadState::Cancelled)
    }

    /// Non-blocking check for stop/cancel, for use inside retry loops.
    pub fn should_stop(&self) -> bool {
        matches!(
            self.state(),
            ThreadState::Terminating | ThreadState::Cancelled
        )
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == ThreadState::Cancelled
    }

    pub(crate) fn set_iolock(&self, iolock: Arc<IoCoordinator>) {
        *self.iolock.lock() = Some(iolock);
    }

    /// The job's pass-boundary rendezvous, when iolock is enabled.
    pub fn iolock(&self) -> Option<Arc<IoCoordinator>> {
        self.iolock.lock().clone()
    }

    /// Publish a counters snapshot for query output.
    pub fn publish(&self, counters: &Counters) {
        *self.published.lock() = counters.clone();
    }

    pub fn snapshot(&self) -> Counters {
        self.published.lock().clone()
    }

    /// Block until the thread reaches `target` or a terminal state.
    pub fn wait_for_state(&self, target: ThreadState) -> ThreadState {
        let mut st = self.state.lock();
        loop {
            if *st == target
                || matches!(
                    *st,
                    ThreadState::Finished | ThreadState::Joined | ThreadState::Cancelled
                )
            {
                return *st;
            }
            self.state_cv.wait(&mut st);
        }
    }
}

/// Startup barrier: every worker declares itself ready and then waits for
/// the whole job; the scheduler waits on the same gate before flipping the
/// job to running. An abort (a thread that failed to set up) releases
/// everyone with the aborted flag set.
#[derive(Debug, Default)]
pub struct StartGate {
    inner: Mutex<GateState>,
    cv: Condvar,
}

#[derive(Debug, Default)]
struct GateState {
    pending: usize,
    aborted: bool,
}

impl StartGate {
    pub fn new(pending: usize) -> Self {
        StartGate {
            inner: Mutex::new(GateState {
                pending,
                aborted: false,
            }),
            cv: Condvar::new(),
        }
    }

    /// Worker side: declare ready, wait for siblings. Returns false when
    /// startup was aborted.
    pub fn ready_and_wait(&self) -> bool {
        let mut gate = self.inner.lock();
        gate.pending = gate.pending.saturating_sub(1);
        if gate.pending == 0 {
            self.cv.notify_all();
        }
        while gate.pending > 0 && !gate.aborted {
            self.cv.wait(&mut gate);
        }
        !gate.aborted
    }

    /// Scheduler side: wait for every worker to reach the gate.
    pub fn wait(&self) -> bool {
        let mut gate = self.inner.lock();
        while gate.pending > 0 && !gate.aborted {
            self.cv.wait(&mut gate);
        }
        !gate.aborted
    }

    pub fn abort(&self) {
        let mut gate = self.inner.lock();
        gate.aborted = true;
        self.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn gate_releases_all_when_everyone_is_ready() {
        let gate = Arc::new(StartGate::new(3));
        thread::scope(|s| {
            for _ in 0..3 {
                let gate = gate.clone();
                s.spawn(move || {
                    assert!(gate.ready_and_wait());
                });
            }
            assert!(gate.wait());
        });
    }

    #[test]
    fn gate_abort_releases_waiters() {
        let gate = Arc::new(StartGate::new(2));
        thread::scope(|s| {
            let waiter = gate.clone();
            s.spawn(move || {
                assert!(!waiter.ready_and_wait());
            });
            thread::sleep(Duration::from_millis(20));
            gate.abort();
        });
    }

    #[test]
    fn pause_point_blocks_until_resume() {
        let control = Arc::new(ThreadControl::new());
        control.mark_running();
        control.pause();
        assert_eq!(control.state(), ThreadState::Paused);

        thread::scope(|s| {
            let inner = control.clone();
            let handle = s.spawn(move || inner.pause_point());
            thread::sleep(Duration::from_millis(20));
            assert!(!handle.is_finished());
            control.resume();
            assert!(!handle.join().unwrap());
        });
        assert_eq!(control.state(), ThreadState::Running);
    }

    #[test]
    fn terminate_wakes_a_paused_thread() {
        let control = Arc::new(ThreadControl::new());
        control.mark_running();
        control.pause();

        thread::scope(|s| {
            let inner = control.clone();
            let handle = s.spawn(move || inner.pause_point());
            thread::sleep(Duration::from_millis(20));
            control.terminate();
            // The pause gate must report "stop" once terminated.
            assert!(handle.join().unwrap());
        });
    }
}
