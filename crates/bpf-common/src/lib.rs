//! Building blocks shared by every probe program: bounded maps, user memory
//! access, process metadata, timestamps and the event output channel.
//!
//! Everything reachable from a probe handler completes in bounded time and
//! never blocks, so handlers can run inline on the thread issuing a syscall.

mod bpf_sender;
pub mod maps;
pub mod memory;
pub mod process;
pub mod program;
#[cfg(feature = "test-utils")]
pub mod test_runner;
#[cfg(feature = "test-utils")]
pub mod test_utils;
pub mod time;

pub use bpf_sender::BpfSender;
pub use program::{BpfContext, BpfEvent, ProgramError};

pub use nix::unistd::Pid;
