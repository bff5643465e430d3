use std::fmt;

use nix::unistd::{getgid, getpid, gettid, getuid};

use crate::Pid;

pub const TASK_COMM_LEN: usize = 16;

/// Identity of the thread which triggered an event, the equivalent of
/// `fill_process_data` on kernel side. Anything richer (ancestry, container,
/// image) is attached later by userspace from the process tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessData {
    pub pid: Pid,
    pub tid: Pid,
    pub uid: u32,
    pub gid: u32,
    pub comm: [u8; TASK_COMM_LEN],
}

impl ProcessData {
    /// Command name up to the first NUL.
    pub fn comm(&self) -> String {
        let len = self
            .comm
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(TASK_COMM_LEN);
        String::from_utf8_lossy(&self.comm[..len]).into_owned()
    }
}

impl fmt::Display for ProcessData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}/{})", self.comm(), self.pid, self.tid)
    }
}

/// Supplies process metadata for the current thread.
/// Called once per emitted event, it must be cheap and infallible.
pub trait ProcessEnricher: Send + Sync {
    fn current_process_data(&self) -> ProcessData;
}

/// Reads process metadata of the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct CurrentProcess;

impl ProcessEnricher for CurrentProcess {
    fn current_process_data(&self) -> ProcessData {
        let mut comm = [0; TASK_COMM_LEN];
        if let Ok(name) = nix::sys::prctl::get_name() {
            let name = name.as_bytes();
            let len = name.len().min(TASK_COMM_LEN - 1);
            comm[..len].copy_from_slice(&name[..len]);
        }
        ProcessData {
            pid: getpid(),
            tid: gettid(),
            uid: getuid().as_raw(),
            gid: getgid().as_raw(),
            comm,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_process() {
        let data = CurrentProcess.current_process_data();
        assert_eq!(data.pid.as_raw() as u32, std::process::id());
        assert_eq!(data.uid, getuid().as_raw());
        assert!(!data.comm().is_empty());
    }

    #[test]
    fn comm_without_nul() {
        let data = ProcessData {
            pid: Pid::from_raw(1),
            tid: Pid::from_raw(1),
            uid: 0,
            gid: 0,
            comm: *b"sixteen_chars_xx",
        };
        assert_eq!(data.comm(), "sixteen_chars_xx");
    }
}
