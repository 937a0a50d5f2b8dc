// src/util.rs

//! Small platform probes shared by both daemons.

use serde_json::{Value, json};

/// Current process memory usage in bytes, reported under `status` requests.
///
/// Reads `/proc/self/status` on Linux; other platforms report zeros rather
/// than failing the request.
pub fn memory_usage() -> Value {
    let (rss, vsz) = read_proc_status().unwrap_or((0, 0));
    json!({ "rss": rss, "vsz": vsz })
}

#[cfg(target_os = "linux")]
fn read_proc_status() -> Option<(u64, u64)> {
    let text = std::fs::read_to_string("/proc/self/status").ok()?;
    let mut rss = 0u64;
    let mut vsz = 0u64;
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            rss = parse_kib(rest)?;
        } else if let Some(rest) = line.strip_prefix("VmSize:") {
            vsz = parse_kib(rest)?;
        }
    }
    Some((rss, vsz))
}

#[cfg(target_os = "linux")]
fn parse_kib(rest: &str) -> Option<u64> {
    // Lines look like "VmRSS:      1234 kB".
    let n: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
    Some(n * 1024)
}

#[cfg(not(target_os = "linux"))]
fn read_proc_status() -> Option<(u64, u64)> {
    None
}

/// Name of a terminating signal, recorded in the job table's `sig` column.
pub fn signal_name(sig: i32) -> String {
    let name = match sig {
        1 => "SIGHUP",
        2 => "SIGINT",
        3 => "SIGQUIT",
        4 => "SIGILL",
        5 => "SIGTRAP",
        6 => "SIGABRT",
        7 => "SIGBUS",
        8 => "SIGFPE",
        9 => "SIGKILL",
        10 => "SIGUSR1",
        11 => "SIGSEGV",
        12 => "SIGUSR2",
        13 => "SIGPIPE",
        14 => "SIGALRM",
        15 => "SIGTERM",
        17 => "SIGCHLD",
        18 => "SIGCONT",
        19 => "SIGSTOP",
        20 => "SIGTSTP",
        24 => "SIGXCPU",
        25 => "SIGXFSZ",
        _ => return format!("SIG{sig}"),
    };
    name.to_string()
}
