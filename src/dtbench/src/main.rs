use std::path::PathBuf;

use dtbench::{run_exit_code, run_job, BlockSize, Dispose, DtOptions};
use jobs::JobRegistry;

/// Smoke runner: one sanity pass over a scratch file (or the path given
/// as the first argument). The real front end builds `DtOptions` from the
/// dtapp option strings; this binary wires a fixed sanity workload.
fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let target = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join("dtbench-sanity.dat"));

    let options = DtOptions {
        output_paths: vec![target],
        limit: 64 * 1024,
        block_size: BlockSize::Fixed(8192),
        passes: 1,
        prefix: Some("%d@%h".to_string()),
        dispose: Dispose::Delete,
        ..DtOptions::default()
    };

    let registry = JobRegistry::new();
    let status = run_job(&registry, options)?;
    std::process::exit(run_exit_code(status, false));
}
