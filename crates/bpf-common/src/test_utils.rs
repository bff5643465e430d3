use std::collections::HashMap;

use parking_lot::Mutex;

use crate::{
    Pid,
    memory::{MemoryError, UserMemory, UserPtr},
    process::{ProcessData, ProcessEnricher, TASK_COMM_LEN},
};

const FIRST_ADDRESS: u64 = 0x7f00_0000_0000;
const REGION_ALIGN: u64 = 0x1000;

/// Simulated user address space: strings are placed in distinct regions and
/// anything outside a region faults.
#[derive(Default)]
pub struct FakeUserMemory {
    regions: Mutex<HashMap<u64, Vec<u8>>>,
}

impl FakeUserMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place a NUL terminated copy of `s` in memory.
    pub fn alloc_str(&self, s: &str) -> UserPtr {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        self.alloc_bytes(bytes)
    }

    /// Place raw bytes in memory. Without a NUL terminator, reads running
    /// past the end of the region fault.
    pub fn alloc_bytes(&self, bytes: Vec<u8>) -> UserPtr {
        let mut regions = self.regions.lock();
        let base = FIRST_ADDRESS + regions.len() as u64 * REGION_ALIGN;
        regions.insert(base, bytes);
        UserPtr(base)
    }

    /// An address which is never mapped.
    pub fn unmapped(&self) -> UserPtr {
        UserPtr(0xdead_0000)
    }
}

impl UserMemory for FakeUserMemory {
    fn read_str(&self, ptr: UserPtr, dst: &mut [u8]) -> Result<usize, MemoryError> {
        let Some(max) = dst.len().checked_sub(1) else {
            return Err(MemoryError::EmptyBuffer);
        };
        let regions = self.regions.lock();
        let region = regions.get(&ptr.0).ok_or(MemoryError::Fault(ptr.0))?;
        let len = match region.iter().position(|&b| b == 0) {
            Some(nul) => nul.min(max),
            None if region.len() >= max => max,
            None => return Err(MemoryError::Fault(ptr.0 + region.len() as u64)),
        };
        dst[..len].copy_from_slice(&region[..len]);
        dst[len..].fill(0);
        Ok(len + 1)
    }
}

/// Enricher returning the same metadata for every event.
#[derive(Debug, Clone, Copy)]
pub struct FixedProcess(pub ProcessData);

impl FixedProcess {
    pub fn new(pid: i32, comm: &str) -> Self {
        let mut name = [0; TASK_COMM_LEN];
        let len = comm.len().min(TASK_COMM_LEN - 1);
        name[..len].copy_from_slice(&comm.as_bytes()[..len]);
        Self(ProcessData {
            pid: Pid::from_raw(pid),
            tid: Pid::from_raw(pid),
            uid: 0,
            gid: 0,
            comm: name,
        })
    }
}

impl ProcessEnricher for FixedProcess {
    fn current_process_data(&self) -> ProcessData {
        self.0
    }
}
