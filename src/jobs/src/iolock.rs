//! Pass-boundary rendezvous for threads sharing one device or file.
//!
//! When several threads exercise the same target, each pass has to start
//! from a consistent shared state or stale offsets read as corruption. At
//! the end of a pass every thread parks here; a coordinator thread watches
//! the done-count and, once every running thread has arrived, resets the
//! shared cursor and releases the whole set into the next pass in lockstep.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::warn;

const COORDINATOR_LOOP_CAP: u32 = 500;

#[derive(Debug, Default)]
struct Shared {
    running: usize,
    threads_done: usize,
    cursor: u64,
    generation: u64,
    coordinator_active: bool,
}

#[derive(Debug, Default)]
pub struct IoCoordinator {
    shared: Mutex<Shared>,
    cv: Condvar,
}

impl IoCoordinator {
    pub fn new(running: usize) -> Arc<IoCoordinator> {
        Arc::new(IoCoordinator {
            shared: Mutex::new(Shared {
                running,
                ..Shared::default()
            }),
            cv: Condvar::new(),
        })
    }

    /// Claim the next `len` bytes of the shared cursor.
    pub fn next_offset(&self, len: u64) -> u64 {
        let mut sh = self.shared.lock();
        let at = sh.cursor;
        sh.cursor += len;
        at
    }

    /// A thread is leaving the job entirely (last pass done or error);
    /// it no longer counts toward the rendezvous.
    pub fn thread_exited(&self) {
        let mut sh = self.shared.lock();
        sh.running = sh.running.saturating_sub(1);
        drop(sh);
        self.cv.notify_all();
    }

    /// Park until every running thread has finished the current pass.
    /// The first arrival spawns the coordinator if none is active.
    pub fn wait_for_threads_done(self: &Arc<Self>) {
        let parked_generation;
        {
            let mut sh = self.shared.lock();
            sh.threads_done += 1;
            parked_generation = sh.generation;
            if !sh.coordinator_active {
                sh.coordinator_active = true;
                let coordinator = Arc::clone(self);
                thread::spawn(move || coordinator.coordinate());
            }
        }

        let mut sh = self.shared.lock();
        while sh.generation == parked_generation {
            self.cv.wait(&mut sh);
        }
    }

    fn coordinate(&self) {
        let mut loops: u32 = 0;
        loop {
            {
                let mut sh = self.shared.lock();
                if sh.threads_done >= sh.running {
                    sh.threads_done = 0;
                    sh.cursor = 0;
                    sh.generation += 1;
                    sh.coordinator_active = false;
                    drop(sh);
                    self.cv.notify_all();
                    return;
                }
            }
            loops += 1;
            if loops >= COORDINATOR_LOOP_CAP {
                let sh = self.shared.lock();
                warn!(
                    done = sh.threads_done,
                    running = sh.running,
                    "iolock coordinator still waiting after {COORDINATOR_LOOP_CAP} polls"
                );
                drop(sh);
                loops = 0;
            }
            // Bounded spin: the rendezvous is pass-scale, not record-scale.
            thread::sleep(Duration::from_millis(10 + (loops % 5) as u64 * 10));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendezvous_releases_all_threads_together() {
        let iolock = IoCoordinator::new(4);
        thread::scope(|s| {
            for _ in 0..4 {
                let iolock = Arc::clone(&iolock);
                s.spawn(move || {
                    iolock.next_offset(4096);
                    iolock.wait_for_threads_done();
                });
            }
        });
        // Cursor reset for the next pass.
        assert_eq!(iolock.next_offset(0), 0);
    }

    #[test]
    fn exited_threads_do_not_block_the_rendezvous() {
        let iolock = IoCoordinator::new(3);
        iolock.thread_exited();
        thread::scope(|s| {
            for _ in 0..2 {
                let iolock = Arc::clone(&iolock);
                s.spawn(move || iolock.wait_for_threads_done());
            }
        });
    }

    #[test]
    fn cursor_hands_out_disjoint_ranges() {
        let iolock = IoCoordinator::new(1);
        assert_eq!(iolock.next_offset(8192), 0);
        assert_eq!(iolock.next_offset(8192), 8192);
        assert_eq!(iolock.next_offset(512), 16384);
    }
}
