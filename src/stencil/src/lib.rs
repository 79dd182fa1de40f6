//! `%`-token template expansion.
//!
//! One engine serves four callers: log prefixes, keepalive messages, the
//! data prefix embedded in written blocks, and file paths. A `%` introduces
//! either a single-letter token or a keyword; keywords match longest-first
//! and case-insensitively, with an all-caps spelling selecting the run-total
//! variant of counter and throughput tokens. Unknown tokens pass through
//! literally so templates degrade instead of failing.

mod time;

pub use time::{format_hms, LocalTime};

use std::cell::Cell;
use std::time::Instant;

use devices::clock::epoch_micros;
use devices::{Counters, DeviceContext, IoDirection, IoType, OpenFlags};
use once_cell::sync::Lazy;

/// Word size of the data pattern; the data prefix is padded to this.
pub const PREFIX_ALIGN: usize = 4;

static HOSTNAME: Lazy<String> = Lazy::new(|| {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string())
});

/// Cached full host name.
pub fn full_hostname() -> &'static str {
    &HOSTNAME
}

/// Host name truncated at the first dot.
pub fn short_hostname() -> &'static str {
    HOSTNAME.split('.').next().unwrap_or(&HOSTNAME)
}

/// SCSI-level identity strings, when the device has them.
#[derive(Debug, Default, Clone)]
pub struct ScsiIdentity {
    pub dsf: String,
    pub serial: String,
    pub vendor: String,
    pub product: String,
    pub revision: String,
    pub devid: String,
    pub mgmt_address: String,
}

/// Everything a template may reference.
#[derive(Default)]
pub struct Env<'a> {
    pub dip: Option<&'a DeviceContext>,
    /// Counter source when no context is at hand (e.g. query snapshots).
    pub counters: Option<&'a Counters>,
    pub job_id: Option<u32>,
    pub job_tag: Option<&'a str>,
    pub thread_number: Option<u32>,
    pub pass_start: Option<Instant>,
    pub run_start: Option<Instant>,
    pub pass_limit: Option<u64>,
    pub error_limit: Option<u64>,
    pub sequence: u64,
    pub script: Option<&'a str>,
    pub array: Option<&'a str>,
    pub scsi: Option<&'a ScsiIdentity>,
    pub job_uuid: Option<&'a str>,
    pub last_stamp: Cell<Option<Instant>>,
}

impl<'a> Env<'a> {
    pub fn new() -> Env<'static> {
        Env::default()
    }

    pub fn for_dip(dip: &'a DeviceContext) -> Env<'a> {
        Env {
            dip: Some(dip),
            ..Env::default()
        }
    }
}

/// Expand a template into a string.
pub fn expand(template: &str, env: &Env<'_>) -> String {
    let mut out = String::with_capacity(template.len() * 2);
    let chars: Vec<char> = template.chars().collect();
    let mut at = 0;

    while at < chars.len() {
        match chars[at] {
            '\\' if at + 1 < chars.len() => {
                match chars[at + 1] {
                    'n' => out.push('\n'),
                    't' => out.push('\t'),
                    other => {
                        out.push('\\');
                        out.push(other);
                    }
                }
                at += 2;
            }
            '%' if at + 1 < chars.len() => {
                let consumed = expand_token(&chars[at + 1..], env, &mut out);
                if consumed == 0 {
                    out.push('%');
                    at += 1;
                } else {
                    at += 1 + consumed;
                }
            }
            c => {
                out.push(c);
                at += 1;
            }
        }
    }
    out
}

/// Expand a data-prefix template: the expansion is NUL terminated and then
/// padded with NULs up to a multiple of the pattern word size, so the same
/// prefix compares identically under sequential and random I/O.
pub fn expand_prefix(template: &str, env: &Env<'_>) -> Vec<u8> {
    let mut bytes = expand(template, env).into_bytes();
    bytes.push(0);
    while bytes.len() % PREFIX_ALIGN != 0 {
        bytes.push(0);
    }
    bytes
}

const MAX_KEYWORD: usize = 10;

/// Try to expand the token starting after a `%`. Returns how many chars of
/// the template were consumed (0 when nothing matched).
fn expand_token(rest: &[char], env: &Env<'_>, out: &mut String) -> usize {
    let run: String = rest
        .iter()
        .take(MAX_KEYWORD)
        .take_while(|c| c.is_ascii_alphanumeric())
        .collect();

    for len in (2..=run.chars().count()).rev() {
        let candidate: String = run.chars().take(len).collect();
        if let Some(value) = keyword_value(&candidate, env) {
            out.push_str(&value);
            return len;
        }
    }

    if let Some(first) = run.chars().next() {
        if let Some(value) = letter_value(first, env) {
            out.push_str(&value);
            return 1;
        }
    }
    0
}

fn elapsed_secs(start: Option<Instant>) -> f64 {
    start.map(|s| s.elapsed().as_secs_f64()).unwrap_or(0.0)
}

fn rate(amount: u64, secs: f64) -> u64 {
    if secs > 0.0 {
        (amount as f64 / secs) as u64
    } else {
        0
    }
}

struct DipNums {
    bytes_pass: u64,
    bytes_total: u64,
    records_pass: u64,
    records_total: u64,
    dsize: u64,
}

fn counters_of<'e>(env: &'e Env<'_>) -> Option<&'e Counters> {
    env.dip.map(|d| &d.counters).or(env.counters)
}

fn dip_nums(env: &Env<'_>) -> DipNums {
    match counters_of(env) {
        Some(c) => DipNums {
            bytes_pass: c.pass_bytes(),
            bytes_total: c.total_bytes_read + c.total_bytes_written + c.pass_bytes(),
            records_pass: c.pass_records(),
            records_total: c.total_records_read + c.total_records_written + c.pass_records(),
            dsize: env.dip.map(|d| d.dsize.max(1) as u64).unwrap_or(512),
        },
        None => DipNums {
            bytes_pass: 0,
            bytes_total: 0,
            records_pass: 0,
            records_total: 0,
            dsize: 512,
        },
    }
}

fn keyword_value(token: &str, env: &Env<'_>) -> Option<String> {
    let totals = token.chars().all(|c| !c.is_ascii_lowercase());
    let key = token.to_ascii_lowercase();
    let dip = env.dip;
    let nums = dip_nums(env);
    let (bytes, records, secs) = if totals {
        (
            nums.bytes_total,
            nums.records_total,
            elapsed_secs(env.run_start),
        )
    } else {
        (
            nums.bytes_pass,
            nums.records_pass,
            elapsed_secs(env.pass_start),
        )
    };

    let value = match key.as_str() {
        "device" | "dsf" => dip.map(|d| d.path.display().to_string()).unwrap_or_default(),
        "rdsf" => dip
            .map(|d| {
                std::fs::canonicalize(&d.path)
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|_| d.path.display().to_string())
            })
            .unwrap_or_default(),
        "host" => short_hostname().to_string(),
        "fqhost" => full_hostname().to_string(),
        "pid" => std::process::id().to_string(),
        "ppid" => unsafe { libc::getppid() }.to_string(),
        "user" => std::env::var("USER")
            .unwrap_or_else(|_| format!("uid{}", unsafe { libc::getuid() })),
        "job" => dip
            .map(|d| d.job_id)
            .or(env.job_id)
            .map(|v| v.to_string())
            .unwrap_or_default(),
        "tag" => dip
            .and_then(|d| d.job_tag.clone())
            .or_else(|| env.job_tag.map(str::to_string))
            .unwrap_or_default(),
        "thread" => dip
            .map(|d| d.thread_number)
            .or(env.thread_number)
            .map(|v| v.to_string())
            .unwrap_or_default(),
        "tid" => (unsafe { libc::pthread_self() } as u64).to_string(),
        "uuid" => env
            .job_uuid
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        "script" => env.script.unwrap_or_default().to_string(),
        "tmpdir" => std::env::temp_dir().display().to_string(),
        "array" => env.array.unwrap_or_default().to_string(),

        "passes" => counters_of(env)
            .map(|c| c.passes.to_string())
            .unwrap_or_default(),
        "passlimit" => env.pass_limit.map(|v| v.to_string()).unwrap_or_default(),
        "errors" => counters_of(env)
            .map(|c| {
                if totals {
                    (c.total_errors + c.errors).to_string()
                } else {
                    c.errors.to_string()
                }
            })
            .unwrap_or_default(),
        "errorlimit" => env.error_limit.map(|v| v.to_string()).unwrap_or_default(),
        "reads" => counters_of(env)
            .map(|c| {
                if totals {
                    (c.total_records_read + c.pass_records_read).to_string()
                } else {
                    c.pass_records_read.to_string()
                }
            })
            .unwrap_or_default(),
        "writes" => counters_of(env)
            .map(|c| {
                if totals {
                    (c.total_records_written + c.pass_records_written).to_string()
                } else {
                    c.pass_records_written.to_string()
                }
            })
            .unwrap_or_default(),

        "iodir" => dip
            .map(|d| match d.direction {
                IoDirection::Forward => "forward".to_string(),
                IoDirection::Reverse => "reverse".to_string(),
            })
            .unwrap_or_default(),
        "iotype" => dip
            .map(|d| match d.io_type {
                IoType::Sequential => "sequential".to_string(),
                IoType::Random => "random".to_string(),
            })
            .unwrap_or_default(),
        "lba" => dip
            .map(|d| (d.offset / d.dsize.max(1) as u64).to_string())
            .unwrap_or_default(),
        "offset" => dip.map(|d| d.offset.to_string()).unwrap_or_default(),
        "bufmode" => dip
            .map(|d| {
                if d.open_flags.contains(OpenFlags::DIRECT) {
                    "unbuffered".to_string()
                } else {
                    "buffered".to_string()
                }
            })
            .unwrap_or_default(),

        "ymd" => {
            let t = LocalTime::now();
            format!("{:04}{:02}{:02}", t.year, t.month, t.day)
        }
        "year" => format!("{:04}", LocalTime::now().year),
        "month" => format!("{:02}", LocalTime::now().month),
        "day" => format!("{:02}", LocalTime::now().day),
        "hms" => {
            let t = LocalTime::now();
            format!("{:02}{:02}{:02}", t.hour, t.minute, t.second)
        }
        "hour" => format!("{:02}", LocalTime::now().hour),
        "minute" => format!("{:02}", LocalTime::now().minute),
        "second" => format!("{:02}", LocalTime::now().second),
        "date" => {
            let t = LocalTime::now();
            format!(
                "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                t.year, t.month, t.day, t.hour, t.minute, t.second
            )
        }
        "seq" => env.sequence.to_string(),
        "tod" => {
            let (secs, usecs) = epoch_micros();
            format!("{secs}.{usecs:06}")
        }
        "etod" => {
            let now = Instant::now();
            let since = env
                .last_stamp
                .get()
                .map(|prev| now.duration_since(prev).as_secs_f64())
                .unwrap_or(0.0);
            env.last_stamp.set(Some(now));
            format!("{since:.6}")
        }
        "nate" => {
            let (secs, usecs) = epoch_micros();
            format!("{secs}{usecs:06}")
        }
        "nimble" => {
            let t = LocalTime::now();
            format!(
                "{:04}{:02}{:02}{:02}{:02}{:02}",
                t.year, t.month, t.day, t.hour, t.minute, t.second
            )
        }

        "serial" => env.scsi.map(|s| s.serial.clone()).unwrap_or_default(),
        "vendor" => env.scsi.map(|s| s.vendor.clone()).unwrap_or_default(),
        "product" => env.scsi.map(|s| s.product.clone()).unwrap_or_default(),
        "revision" => env.scsi.map(|s| s.revision.clone()).unwrap_or_default(),
        "devid" => env.scsi.map(|s| s.devid.clone()).unwrap_or_default(),
        "mgmtaddr" => env.scsi.map(|s| s.mgmt_address.clone()).unwrap_or_default(),

        "bps" => rate(bytes, secs).to_string(),
        "kbps" => (rate(bytes, secs) / 1024).to_string(),
        "mbps" => (rate(bytes, secs) / (1024 * 1024)).to_string(),
        "lbps" => rate(bytes / nums.dsize, secs).to_string(),
        "iops" => rate(records, secs).to_string(),
        "spio" => {
            if records > 0 {
                format!("{:.6}", secs / records as f64)
            } else {
                "0.000000".to_string()
            }
        }
        _ => return None,
    };
    Some(value)
}

fn letter_value(letter: char, env: &Env<'_>) -> Option<String> {
    let dip = env.dip;
    let nums = dip_nums(env);
    let c = counters_of(env).cloned().unwrap_or_default();

    let value = match letter {
        'b' => nums.bytes_pass.to_string(),
        'B' => nums.bytes_total.to_string(),
        'k' => (nums.bytes_pass / 1024).to_string(),
        'K' => (nums.bytes_total / 1024).to_string(),
        'm' => (nums.bytes_pass / (1024 * 1024)).to_string(),
        'M' => (nums.bytes_total / (1024 * 1024)).to_string(),
        'l' => (nums.bytes_pass / nums.dsize).to_string(),
        'L' => (nums.bytes_total / nums.dsize).to_string(),
        'f' => c.pass_files.to_string(),
        'F' => (c.total_files + c.pass_files).to_string(),
        's' => format!("{:.0}", elapsed_secs(env.pass_start)),
        'S' => format!("{:.0}", elapsed_secs(env.run_start)),
        't' => format_hms(elapsed_secs(env.pass_start)),
        'T' => format_hms(elapsed_secs(env.run_start)),
        'r' => c.pass_records_read.to_string(),
        'R' => (c.total_records_read + c.pass_records_read).to_string(),
        'w' => c.pass_records_written.to_string(),
        'W' => (c.total_records_written + c.pass_records_written).to_string(),
        'd' => dip.map(|d| d.path.display().to_string()).unwrap_or_default(),
        'D' => return keyword_value("rdsf", env),
        'h' => short_hostname().to_string(),
        'H' => full_hostname().to_string(),
        'p' => std::process::id().to_string(),
        'P' => unsafe { libc::getppid() }.to_string(),
        'u' => return keyword_value("user", env),
        'j' => return keyword_value("job", env),
        'J' => return keyword_value("tag", env),
        _ => return None,
    };
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use devices::{DeviceContext, DeviceSpec};
    use palign::Arena;
    use std::path::PathBuf;

    fn dip() -> DeviceContext {
        let spec = DeviceSpec {
            path: PathBuf::from("/tmp/target"),
            dsize: 512,
            ..DeviceSpec::default()
        };
        let mut dip = DeviceContext::new(&spec, 0, Arena::new());
        dip.set_owner(3, 1, Some("nightly".to_string()));
        dip
    }

    #[test]
    fn prefix_rounds_to_word_size_with_nul_before_pad() {
        let dip = dip();
        let env = Env::for_dip(&dip);
        let expanded = expand("%d@%h", &env);
        let prefix = expand_prefix("%d@%h", &env);

        assert_eq!(prefix.len() % PREFIX_ALIGN, 0);
        assert!(prefix.len() > expanded.len());
        assert_eq!(prefix[expanded.len()], 0);
        assert!(prefix[expanded.len()..].iter().all(|&b| b == 0));
        assert_eq!(&prefix[..expanded.len()], expanded.as_bytes());
    }

    #[test]
    fn device_and_host_tokens() {
        let dip = dip();
        let env = Env::for_dip(&dip);
        let out = expand("%d@%h", &env);
        assert!(out.starts_with("/tmp/target@"));
        assert!(out.len() > "/tmp/target@".len());
    }

    #[test]
    fn keywords_match_longest_and_any_case() {
        let dip = dip();
        let env = Env::for_dip(&dip);
        assert_eq!(expand("%job", &env), "3");
        assert_eq!(expand("%JOB", &env), "3");
        assert_eq!(expand("%tag", &env), "nightly");
        assert_eq!(expand("%thread", &env), "1");
        // "iodir" must win over a hypothetical shorter match.
        assert_eq!(expand("%iodir", &env), "forward");
        assert_eq!(expand("%iotype", &env), "sequential");
    }

    #[test]
    fn unknown_tokens_pass_through() {
        let env = Env::new();
        assert_eq!(expand("100%q done", &env), "100%q done");
        assert_eq!(expand("50%", &env), "50%");
    }

    #[test]
    fn escapes_expand() {
        let env = Env::new();
        assert_eq!(expand("a\\nb\\tc", &env), "a\nb\tc");
        assert_eq!(expand("a\\xb", &env), "a\\xb");
    }

    #[test]
    fn counter_letters_track_the_context() {
        let mut dip = dip();
        dip.counters.pass_bytes_written = 65536;
        dip.counters.pass_records_written = 8;
        dip.counters.total_bytes_written = 1048576;
        let env = Env::for_dip(&dip);
        assert_eq!(expand("%b", &env), "65536");
        assert_eq!(expand("%k", &env), "64");
        assert_eq!(expand("%l", &env), "128");
        assert_eq!(expand("%w", &env), "8");
        assert_eq!(expand("%B", &env), "1114112");
    }

    #[test]
    fn date_tokens_have_fixed_width() {
        let env = Env::new();
        assert_eq!(expand("%ymd", &env).len(), 8);
        assert_eq!(expand("%hms", &env).len(), 6);
        let year: i32 = expand("%year", &env).parse().unwrap();
        assert!(year >= 2020);
    }

    #[test]
    fn sequence_and_tod() {
        let env = Env {
            sequence: 42,
            ..Env::default()
        };
        assert_eq!(expand("%seq", &env), "42");
        let tod = expand("%tod", &env);
        assert!(tod.contains('.'));
    }

    #[test]
    fn throughput_without_elapsed_is_zero() {
        let dip = dip();
        let env = Env::for_dip(&dip);
        assert_eq!(expand("%bps", &env), "0");
        assert_eq!(expand("%iops", &env), "0");
    }
}
