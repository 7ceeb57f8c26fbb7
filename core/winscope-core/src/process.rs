//! Process inspection helpers.
//!
//! Liveness and environment lookups sit behind traits so the engine can be
//! exercised with fake processes.

use fs_err as fs;
use std::collections::HashMap;
use std::path::PathBuf;
use sysinfo::{Pid, ProcessRefreshKind, System};

/// Seconds of drift tolerated when comparing process start times.
const START_TIME_TOLERANCE_SECS: u64 = 2;

pub trait ProcessProbe {
    fn is_alive(&self, pid: u32) -> bool;
    fn start_time(&self, pid: u32) -> Option<u64>;

    /// Liveness that also rejects a pid recycled by a different process.
    fn is_alive_verified(&self, pid: u32, expected_start: Option<u64>) -> bool {
        if !self.is_alive(pid) {
            return false;
        }
        match (expected_start, self.start_time(pid)) {
            (Some(expected), Some(current)) => {
                expected.abs_diff(current) <= START_TIME_TOLERANCE_SECS
            }
            _ => true,
        }
    }
}

pub trait ProcessInspector {
    fn environment(&self, pid: u32) -> Option<HashMap<String, String>>;
    fn command_line(&self, pid: u32) -> Option<Vec<String>>;
    fn working_directory(&self, pid: u32) -> Option<PathBuf>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcesses;

impl ProcessProbe for SystemProcesses {
    fn is_alive(&self, pid: u32) -> bool {
        if pid == 0 || pid > i32::MAX as u32 {
            return false;
        }
        // SAFETY: signal 0 only performs the existence/permission check.
        let result = unsafe { libc::kill(pid as i32, 0) };
        if result == 0 {
            return true;
        }
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    fn start_time(&self, pid: u32) -> Option<u64> {
        let mut sys = System::new();
        let sys_pid = Pid::from(pid as usize);
        sys.refresh_process_specifics(sys_pid, ProcessRefreshKind::new());
        sys.process(sys_pid).map(|process| process.start_time())
    }
}

impl ProcessInspector for SystemProcesses {
    fn environment(&self, pid: u32) -> Option<HashMap<String, String>> {
        let raw = fs::read(format!("/proc/{}/environ", pid)).ok()?;
        Some(parse_nul_pairs(&raw))
    }

    fn command_line(&self, pid: u32) -> Option<Vec<String>> {
        let raw = fs::read(format!("/proc/{}/cmdline", pid)).ok()?;
        let args = split_nul(&raw);
        if args.is_empty() {
            None
        } else {
            Some(args)
        }
    }

    fn working_directory(&self, pid: u32) -> Option<PathBuf> {
        fs::read_link(format!("/proc/{}/cwd", pid)).ok()
    }
}

fn split_nul(raw: &[u8]) -> Vec<String> {
    raw.split(|byte| *byte == 0)
        .filter(|chunk| !chunk.is_empty())
        .map(|chunk| String::from_utf8_lossy(chunk).to_string())
        .collect()
}

pub fn parse_nul_pairs(raw: &[u8]) -> HashMap<String, String> {
    split_nul(raw)
        .into_iter()
        .filter_map(|entry| {
            let (key, value) = entry.split_once('=')?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}
