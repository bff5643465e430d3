//! `unlink`/`unlinkat` probes.

use bpf_common::{BpfSender, Pid, memory::UserPtr};

use crate::{
    EventType, FsEvent, FsProbes,
    identity::{Dentry, PathKey},
    syscall_cache::{SyscallArgs, SyscallKind, UnlinkArgs},
};

impl<S: BpfSender<FsEvent>> FsProbes<S> {
    /// `tracepoint/syscalls/sys_enter_unlink`
    pub fn sys_unlink(&self, tid: Pid, pathname: UserPtr) {
        self.trace_sys_unlink(tid, SyscallKind::Unlink, pathname, 0);
    }

    /// `tracepoint/syscalls/sys_enter_unlinkat`
    pub fn sys_unlinkat(&self, tid: Pid, pathname: UserPtr, flags: i32) {
        self.trace_sys_unlink(tid, SyscallKind::Unlinkat, pathname, flags);
    }

    fn trace_sys_unlink(&self, tid: Pid, kind: SyscallKind, pathname: UserPtr, flags: i32) {
        if self
            .unlink_discarders
            .should_discard(self.ctx.memory(), pathname)
        {
            self.syscalls.discard(tid);
            return;
        }
        let args = UnlinkArgs {
            flags,
            path_key: PathKey::default(),
        };
        self.syscalls.begin(tid, kind, SyscallArgs::Unlink(args));
    }

    /// `kprobe/vfs_unlink`: called once per overlay layer.
    pub fn vfs_unlink(&self, tid: Pid, dentry: &Dentry) {
        self.resolve(tid, dentry, EventType::Unlink);
    }

    /// `tracepoint/syscalls/sys_exit_unlink` and `sys_exit_unlinkat`
    pub fn sys_unlink_ret(&self, tid: Pid, retval: i64) {
        self.finalize(tid, retval, EventType::Unlink);
    }
}

#[cfg(test)]
mod tests {
    use bpf_common::{
        event_check,
        test_runner::{TestRunner, retval_check},
    };
    use nix::unistd::gettid;
    use syswatch_core::kernel::{errno, file::AT_REMOVEDIR};

    use crate::{
        Config, EventType, FsEvent, ObjectIdentity, program, program_with_config,
        syscall_cache::CallState,
    };

    use super::*;

    const EXT4_SUPER_MAGIC: u64 = 0xef53;

    fn ext4_identity(inode: u64, mount_id: u32) -> ObjectIdentity {
        ObjectIdentity {
            inode,
            mount_id,
            overlay_depth: 0,
        }
    }

    #[test]
    fn unlink_emits_one_event() {
        TestRunner::with_ebpf(program)
            .run(|probes, memory| {
                let tid = gettid();
                probes.sys_unlink(tid, memory.alloc_str("/tmp/foo"));
                assert_eq!(probes.syscalls().state(tid), CallState::Entered);
                probes.mnt_want_write(tid, 28);
                probes.vfs_unlink(tid, &Dentry::new(1234, EXT4_SUPER_MAGIC));
                probes.sys_unlink_ret(tid, 0);
                assert_eq!(probes.syscalls().state(tid), CallState::Unseen);
                // a second return finds nothing
                probes.sys_unlink_ret(tid, 0);
            })
            .expect(|event| event.retval == 0)
            .expect_event(event_check!(
                FsEvent::FileDeleted,
                (
                    identity,
                    ObjectIdentity {
                        inode: 1234,
                        mount_id: 28,
                        overlay_depth: 0
                    },
                    "identity"
                ),
                (flags, 0, "flags")
            ))
            .assert();
    }

    #[test]
    fn unlinkat_keeps_flags() {
        let result = TestRunner::with_ebpf(program).run(|probes, memory| {
            let tid = gettid();
            probes.sys_unlinkat(tid, memory.alloc_str("/tmp/dir"), AT_REMOVEDIR);
            probes.vfs_unlink(tid, &Dentry::new(77, EXT4_SUPER_MAGIC));
            probes.sys_unlink_ret(tid, 0);
        });
        assert_eq!(result.events.len(), 1);
        result
            .expect_event(event_check!(
                FsEvent::FileDeleted,
                (identity, ext4_identity(77, 0), "identity"),
                (flags, AT_REMOVEDIR, "flags")
            ))
            .assert();
    }

    #[test]
    fn discarded_path_leaves_no_state() {
        let config = Config {
            unlink_discarders: vec!["/var/lib/blocked".to_string()],
            ..Default::default()
        };
        TestRunner::with_ebpf(|ctx, tx| program_with_config(ctx, config, tx))
            .run(|probes, memory| {
                let tid = gettid();
                probes.sys_unlink(tid, memory.alloc_str("/var/lib/blocked"));
                assert!(probes.syscalls().is_empty());
                probes.mnt_want_write(tid, 28);
                probes.vfs_unlink(tid, &Dentry::new(1, EXT4_SUPER_MAGIC));
                probes.sys_unlink_ret(tid, 0);
                assert!(probes.syscalls().is_empty());
            })
            .expect_no_event()
            .assert();
    }

    #[test]
    fn discarders_are_per_family() {
        TestRunner::with_ebpf(program)
            .run(|probes, memory| {
                probes.discarders(EventType::Open).insert(b"/tmp/foo");
                let tid = gettid();
                probes.sys_unlink(tid, memory.alloc_str("/tmp/foo"));
                probes.sys_unlink_ret(tid, 0);
            })
            .expect_event(event_check!(FsEvent::FileDeleted, (flags, 0, "flags")))
            .assert();
    }

    #[test]
    fn discarder_removal() {
        TestRunner::with_ebpf(program)
            .run(|probes, memory| {
                let discarders = probes.discarders(EventType::Unlink);
                let tid = gettid();
                discarders.insert(b"/tmp/foo");
                probes.sys_unlink(tid, memory.alloc_str("/tmp/foo"));
                probes.sys_unlink_ret(tid, 0);
                assert!(discarders.remove(b"/tmp/foo"));
                probes.sys_unlink(tid, memory.alloc_str("/tmp/foo"));
                probes.sys_unlink_ret(tid, 0);
            })
            .expect_event(event_check!(FsEvent::FileDeleted, (flags, 0, "flags")))
            .assert();
    }

    #[test]
    fn unreadable_path_is_traced() {
        let config = Config {
            unlink_discarders: vec!["/tmp".to_string()],
            ..Default::default()
        };
        let result = TestRunner::with_ebpf(|ctx, tx| program_with_config(ctx, config, tx)).run(
            |probes, memory| {
                let tid = gettid();
                probes.sys_unlink(tid, memory.unmapped());
                probes.sys_unlink_ret(tid, 0);
            },
        );
        assert_eq!(result.events.len(), 1);
    }

    #[test]
    fn overlay_reentry_keeps_first_identity() {
        TestRunner::with_ebpf(program)
            .run(|probes, memory| {
                let tid = gettid();
                probes.sys_unlink(tid, memory.alloc_str("/merged/file"));
                for (mount_id, ino, numlower) in [(40, 7001, 2), (41, 7002, 1), (42, 7003, 0)] {
                    probes.mnt_want_write(tid, mount_id);
                    probes.vfs_unlink(tid, &Dentry::overlay(ino, numlower));
                    assert_eq!(probes.syscalls().state(tid), CallState::Entered);
                }
                let hits = probes
                    .syscalls()
                    .peek(tid, |context| context.mid_flight_hits);
                assert_eq!(hits, Some(6));
                probes.sys_unlink_ret(tid, 0);
            })
            .expect_event(event_check!(
                FsEvent::FileDeleted,
                (
                    identity,
                    ObjectIdentity {
                        inode: 7001,
                        mount_id: 40,
                        overlay_depth: 2
                    },
                    "identity"
                )
            ))
            .assert();
    }

    #[test]
    fn uninteresting_errors_are_dropped() {
        TestRunner::with_ebpf(program)
            .run(|probes, memory| {
                let tid = gettid();
                for errno in [errno::ENOENT, errno::EBUSY, errno::EISDIR] {
                    probes.sys_unlink(tid, memory.alloc_str("/tmp/foo"));
                    probes.vfs_unlink(tid, &Dentry::new(5, EXT4_SUPER_MAGIC));
                    probes.sys_unlink_ret(tid, errno.as_retval());
                    // the context is consumed even when nothing is emitted
                    assert!(!probes.syscalls().contains(tid));
                }
            })
            .expect_no_event()
            .assert();
    }

    #[test]
    fn denied_unlink_is_reported() {
        TestRunner::with_ebpf(program)
            .run(|probes, memory| {
                let tid = gettid();
                probes.sys_unlink(tid, memory.alloc_str("/etc/shadow"));
                probes.sys_unlink_ret(tid, errno::EPERM.as_retval());
            })
            .expect_event({
                let mut checks = event_check!(
                    FsEvent::FileDeleted,
                    (identity, ObjectIdentity::default(), "unresolved identity")
                );
                checks.push(retval_check(errno::EPERM.as_retval()));
                checks
            })
            .assert();
    }

    #[test]
    fn configured_errors_are_reported() {
        let config = Config {
            reported_errors: vec![errno::ENOENT],
            ..Default::default()
        };
        let result = TestRunner::with_ebpf(|ctx, tx| program_with_config(ctx, config, tx)).run(
            |probes, memory| {
                let tid = gettid();
                for errno in [errno::ENOENT, errno::EACCES] {
                    probes.sys_unlink(tid, memory.alloc_str("/tmp/foo"));
                    probes.sys_unlink_ret(tid, errno.as_retval());
                }
            },
        );
        assert_eq!(result.events.len(), 1);
        assert_eq!(result.events[0].retval, errno::ENOENT.as_retval());
    }

    #[test]
    fn attached_mid_call() {
        TestRunner::with_ebpf(program)
            .run(|probes, _memory| {
                let tid = gettid();
                // entry happened before the probes were attached
                probes.mnt_want_write(tid, 28);
                probes.vfs_unlink(tid, &Dentry::new(5, EXT4_SUPER_MAGIC));
                probes.sys_unlink_ret(tid, 0);
                assert!(probes.syscalls().is_empty());
            })
            .expect_no_event()
            .assert();
    }

    #[test]
    fn discarded_call_drops_leaked_context() {
        let config = Config {
            unlink_discarders: vec!["/var/lib/blocked".to_string()],
            ..Default::default()
        };
        TestRunner::with_ebpf(|ctx, tx| program_with_config(ctx, config, tx))
            .run(|probes, memory| {
                let tid = gettid();
                // return of the first call was missed
                probes.sys_unlink(tid, memory.alloc_str("/tmp/first"));
                probes.sys_unlinkat(tid, memory.alloc_str("/var/lib/blocked"), 0);
                assert!(probes.syscalls().is_empty());
                // these belong to the discarded call
                probes.vfs_unlink(tid, &Dentry::new(4242, EXT4_SUPER_MAGIC));
                probes.sys_unlink_ret(tid, 0);
            })
            .expect_no_event()
            .assert();
    }

    #[test]
    fn orphaned_entry_is_replaced() {
        TestRunner::with_ebpf(program)
            .run(|probes, memory| {
                let tid = gettid();
                // return of the first call was missed
                probes.sys_unlink(tid, memory.alloc_str("/tmp/first"));
                probes.vfs_unlink(tid, &Dentry::new(1, EXT4_SUPER_MAGIC));
                probes.sys_unlinkat(tid, memory.alloc_str("/tmp/second"), AT_REMOVEDIR);
                probes.vfs_unlink(tid, &Dentry::new(2, EXT4_SUPER_MAGIC));
                probes.sys_unlink_ret(tid, 0);
            })
            .expect_event(event_check!(
                FsEvent::FileDeleted,
                (identity, ext4_identity(2, 0), "identity"),
                (flags, AT_REMOVEDIR, "flags")
            ))
            .assert();
    }

    #[test]
    fn other_family_return_drops_context() {
        TestRunner::with_ebpf(program)
            .run(|probes, memory| {
                let tid = gettid();
                probes.sys_unlink(tid, memory.alloc_str("/tmp/foo"));
                // open probes don't touch unlink contexts
                probes.vfs_open(tid, &Dentry::new(9, EXT4_SUPER_MAGIC));
                assert_eq!(
                    probes
                        .syscalls()
                        .peek(tid, |context| context.args.path_key().is_resolved()),
                    Some(false)
                );
                probes.sys_open_ret(tid, 3);
                assert!(probes.syscalls().is_empty());
                probes.sys_unlink_ret(tid, 0);
            })
            .expect_no_event()
            .assert();
    }

    #[test]
    fn threads_are_independent() {
        TestRunner::with_ebpf(program)
            .run(|probes, memory| {
                let (a, b) = (Pid::from_raw(100), Pid::from_raw(101));
                probes.sys_unlink(a, memory.alloc_str("/tmp/a"));
                probes.sys_unlink(b, memory.alloc_str("/tmp/b"));
                probes.vfs_unlink(b, &Dentry::new(2, EXT4_SUPER_MAGIC));
                probes.vfs_unlink(a, &Dentry::new(1, EXT4_SUPER_MAGIC));
                probes.sys_unlink_ret(a, 0);
                probes.sys_unlink_ret(b, 0);
            })
            .expect_event(event_check!(
                FsEvent::FileDeleted,
                (identity, ext4_identity(1, 0), "identity")
            ))
            .expect_event(event_check!(
                FsEvent::FileDeleted,
                (identity, ext4_identity(2, 0), "identity")
            ))
            .assert();
    }

    #[test]
    fn concurrent_threads() {
        let result = TestRunner::with_ebpf(program).run(|probes, memory| {
            std::thread::scope(|s| {
                for i in 0..8u64 {
                    s.spawn(move || {
                        let tid = Pid::from_raw(1000 + i as i32);
                        for _ in 0..50 {
                            probes.sys_unlink(tid, memory.alloc_str("/tmp/churn"));
                            probes.mnt_want_write(tid, i as u32);
                            probes.vfs_unlink(tid, &Dentry::new(i, EXT4_SUPER_MAGIC));
                            probes.sys_unlink_ret(tid, 0);
                        }
                    });
                }
            });
        });
        assert_eq!(result.events.len(), 400);
        for event in &result.events {
            let identity = event.payload.identity();
            assert_eq!(identity.inode, identity.mount_id as u64);
        }
    }
}
