//! Reads from the address space of the thread which issued a syscall.
//!
//! Syscall arguments like `pathname` are pointers into user memory which may be
//! unmapped, partially mapped or changed concurrently by another thread.
//! Reads follow the `bpf_probe_read_str` contract: copy at most `dst.len() - 1`
//! bytes, always NUL terminate, fail as a whole on a fault.

use std::io::IoSliceMut;

use nix::{
    sys::uio::{RemoteIoVec, process_vm_readv},
    unistd::getpid,
};
use thiserror::Error;

/// Address of a syscall argument in user memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UserPtr(pub u64);

impl UserPtr {
    pub const NULL: UserPtr = UserPtr(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("fault reading user memory at {0:#x}")]
    Fault(u64),
    #[error("empty destination buffer")]
    EmptyBuffer,
}

pub trait UserMemory: Send + Sync {
    /// Copy a NUL terminated string starting at `ptr` into `dst`.
    /// Returns the number of bytes written, including the terminating NUL.
    fn read_str(&self, ptr: UserPtr, dst: &mut [u8]) -> Result<usize, MemoryError>;
}

/// Reads strings from the memory of the current process with `process_vm_readv`,
/// which reports unmapped pages as errors instead of raising a signal.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessVmReader;

impl UserMemory for ProcessVmReader {
    fn read_str(&self, ptr: UserPtr, dst: &mut [u8]) -> Result<usize, MemoryError> {
        let Some(max) = dst.len().checked_sub(1) else {
            return Err(MemoryError::EmptyBuffer);
        };
        if ptr.is_null() {
            return Err(MemoryError::Fault(ptr.0));
        }
        let remote = [RemoteIoVec {
            base: ptr.0 as usize,
            len: max,
        }];
        let read = {
            let mut local = [IoSliceMut::new(&mut dst[..max])];
            process_vm_readv(getpid(), &mut local, &remote)
                .map_err(|_| MemoryError::Fault(ptr.0))?
        };
        // A read stopping at a page boundary is fine as long as the string
        // terminated before it.
        match dst[..read].iter().position(|&b| b == 0) {
            Some(nul) => {
                dst[nul..].fill(0);
                Ok(nul + 1)
            }
            None if read == max => {
                dst[max] = 0;
                Ok(max + 1)
            }
            None => Err(MemoryError::Fault(ptr.0 + read as u64)),
        }
    }
}
