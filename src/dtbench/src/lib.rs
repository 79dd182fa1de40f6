//! The dtapp I/O behavior: a data-integrity exerciser that drives
//! concurrent read/write passes over block devices or files and hunts for
//! corruption, ordering violations, and partial-write anomalies.
//!
//! Every written record carries a block tag in each device-sized sub-block;
//! reads re-verify the tags, and the write-order extension lets a read
//! chain back to the previous write on the referenced device and prove the
//! array really committed it. The attacker this is built for is storage
//! that silently drops or reorders acknowledged writes, so every check
//! survives an individually-consistent-but-stale record.

mod behavior;
mod info;
mod options;
mod pass;
mod pattern;
mod trigger;
mod verify;
mod workloads;

pub use behavior::{master_context, run_job, DtappBehavior};
pub use info::{DtappInfo, Side};
pub use options::{
    BlockSize, DirMode, Dispose, DtOptions, EnableFlags, PatternSpec, SizeIncrement, TypeMode,
};
pub use pass::PassEngine;
pub use pattern::{fill_payload, verify_payload, PatternMismatch, IOT_SEED};
pub use trigger::Trigger;
pub use verify::{verify_buffer_btags, verify_write_order, WriteOrderVerdict};
pub use workloads::{Workload, WorkloadCatalog};

use jobs::ExitStatus;

/// Map a job outcome to the process exit code the front end reports.
/// Warnings are success at run level; end-of-file is success unless the
/// user opted into strict EOF handling.
pub fn run_exit_code(status: ExitStatus, strict_eof: bool) -> i32 {
    match status {
        ExitStatus::Success | ExitStatus::Warning => 0,
        ExitStatus::EndOfFile => {
            if strict_eof {
                ExitStatus::EndOfFile.exit_code()
            } else {
                0
            }
        }
        ExitStatus::Failure => ExitStatus::Failure.exit_code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_mapping() {
        assert_eq!(run_exit_code(ExitStatus::Success, false), 0);
        assert_eq!(run_exit_code(ExitStatus::Warning, false), 0);
        assert_eq!(run_exit_code(ExitStatus::EndOfFile, false), 0);
        assert_eq!(run_exit_code(ExitStatus::EndOfFile, true), 254);
        assert_eq!(run_exit_code(ExitStatus::Failure, false), 255);
    }
}
