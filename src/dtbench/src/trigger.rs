//! The corruption trigger: a user command launched on the first failure.

use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use tracing::{error, info};

/// Fires a shell command once, in a detached thread, the first time a run
/// reports a failure. The engine never waits on the result; the command is
/// there to capture array/system state while the corruption is fresh.
#[derive(Debug)]
pub struct Trigger {
    command: String,
    fired: AtomicBool,
}

impl Trigger {
    /// Accepts the `trigger=cmd:<shell>` spelling or a bare command.
    pub fn new(spec: &str) -> Trigger {
        let command = spec.strip_prefix("cmd:").unwrap_or(spec).to_string();
        Trigger {
            command,
            fired: AtomicBool::new(false),
        }
    }

    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::Relaxed)
    }

    pub fn fire(&self) {
        if self.fired.swap(true, Ordering::Relaxed) {
            return;
        }
        let command = self.command.clone();
        info!(command = %command, "firing failure trigger");
        let spawned = thread::Builder::new()
            .name("trigger".to_string())
            .spawn(move || match Command::new("sh").arg("-c").arg(&command).status() {
                Ok(status) => info!(command = %command, %status, "trigger finished"),
                Err(e) => error!(command = %command, error = %e, "trigger failed to start"),
            });
        if let Err(e) = spawned {
            error!(error = %e, "could not spawn trigger thread");
        }
    }
}
