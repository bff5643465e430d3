//! `open`/`openat` probes.
//!
//! Opens are far more frequent than unlinks, so besides path prefixes they
//! can be discarded on the exact `flags` value (eg. every `O_RDONLY|O_CLOEXEC`
//! read by the dynamic loader).

use bpf_common::{BpfSender, Pid, memory::UserPtr};

use crate::{
    EventType, FsEvent, FsProbes,
    identity::{Dentry, PathKey},
    syscall_cache::{OpenArgs, SyscallArgs, SyscallKind},
};

impl<S: BpfSender<FsEvent>> FsProbes<S> {
    /// `tracepoint/syscalls/sys_enter_open`
    pub fn sys_open(&self, tid: Pid, pathname: UserPtr, flags: i32, mode: u32) {
        self.trace_sys_open(tid, SyscallKind::Open, pathname, flags, mode);
    }

    /// `tracepoint/syscalls/sys_enter_openat`
    pub fn sys_openat(&self, tid: Pid, pathname: UserPtr, flags: i32, mode: u32) {
        self.trace_sys_open(tid, SyscallKind::Openat, pathname, flags, mode);
    }

    fn trace_sys_open(
        &self,
        tid: Pid,
        kind: SyscallKind,
        pathname: UserPtr,
        flags: i32,
        mode: u32,
    ) {
        if self.open_flags_discarders.should_discard(flags)
            || self
                .open_discarders
                .should_discard(self.ctx.memory(), pathname)
        {
            self.syscalls.discard(tid);
            return;
        }
        let args = OpenArgs {
            flags,
            mode,
            path_key: PathKey::default(),
        };
        self.syscalls.begin(tid, kind, SyscallArgs::Open(args));
    }

    /// `kprobe/vfs_open`
    pub fn vfs_open(&self, tid: Pid, dentry: &Dentry) {
        self.resolve(tid, dentry, EventType::Open);
    }

    /// `tracepoint/syscalls/sys_exit_open` and `sys_exit_openat`
    pub fn sys_open_ret(&self, tid: Pid, retval: i64) {
        self.finalize(tid, retval, EventType::Open);
    }
}
