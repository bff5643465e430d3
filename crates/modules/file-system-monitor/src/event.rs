//! Event construction at syscall return.

use bpf_common::{BpfEvent, process::ProcessData, time::Timestamp};
use syswatch_core::kernel::errno::{self, Errno};

use crate::{
    FsEvent,
    syscall_cache::{SyscallArgs, SyscallContext},
};

/// Decides which return values are worth an event.
///
/// Successful calls are always reported. Failures are expected noise (races
/// on already deleted files, missing paths) unless their error code is
/// explicitly listed: by default only denied attempts are reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnPolicy {
    reported_errors: Vec<Errno>,
}

impl Default for ReturnPolicy {
    fn default() -> Self {
        Self::new(vec![errno::EACCES, errno::EPERM])
    }
}

impl ReturnPolicy {
    pub fn new(reported_errors: Vec<Errno>) -> Self {
        Self { reported_errors }
    }

    pub fn is_unhandled_error(&self, retval: i64) -> bool {
        retval < 0
            && !self
                .reported_errors
                .iter()
                .any(|errno| errno.as_retval() == retval)
    }

    pub fn reported_errors(&self) -> &[Errno] {
        &self.reported_errors
    }
}

/// Assemble the event for a consumed context. Unresolved identities, like
/// the one of a call denied before reaching `vfs_unlink`, are reported zeroed.
pub fn build(context: &SyscallContext, retval: i64, process: ProcessData) -> BpfEvent<FsEvent> {
    let identity = context.args.path_key().identity().unwrap_or_default();
    let payload = match context.args {
        SyscallArgs::Unlink(args) => FsEvent::FileDeleted {
            identity,
            flags: args.flags,
        },
        SyscallArgs::Open(args) => FsEvent::FileOpened {
            identity,
            flags: args.flags,
            mode: args.mode,
        },
    };
    BpfEvent {
        timestamp: Timestamp::now(),
        retval,
        process,
        payload,
    }
}

#[cfg(test)]
mod tests {
    use bpf_common::test_utils::FixedProcess;

    use super::*;
    use crate::{
        identity::{Dentry, ObjectIdentity, PathKey},
        syscall_cache::{OpenArgs, SyscallKind, UnlinkArgs},
    };

    #[test]
    fn default_policy() {
        let policy = ReturnPolicy::default();
        assert!(!policy.is_unhandled_error(0));
        assert!(!policy.is_unhandled_error(3));
        assert!(!policy.is_unhandled_error(errno::EACCES.as_retval()));
        assert!(!policy.is_unhandled_error(errno::EPERM.as_retval()));
        assert!(policy.is_unhandled_error(errno::ENOENT.as_retval()));
        assert!(policy.is_unhandled_error(errno::EBUSY.as_retval()));
        assert!(policy.is_unhandled_error(errno::EISDIR.as_retval()));
    }

    #[test]
    fn empty_policy_drops_every_error() {
        let policy = ReturnPolicy::new(vec![]);
        assert!(policy.is_unhandled_error(errno::EACCES.as_retval()));
        assert!(!policy.is_unhandled_error(0));
    }

    #[test]
    fn build_unlink() {
        let mut path_key = PathKey::default();
        path_key.set_mount_id(3);
        path_key.resolve(&Dentry::overlay(99, 1));
        let context = SyscallContext::new(
            SyscallKind::Unlinkat,
            SyscallArgs::Unlink(UnlinkArgs {
                flags: 0x200,
                path_key,
            }),
        );
        let process = FixedProcess::new(10, "rm").0;
        let event = build(&context, 0, process);
        assert_eq!(event.retval, 0);
        assert_eq!(event.process, process);
        assert_eq!(
            event.payload,
            FsEvent::FileDeleted {
                identity: ObjectIdentity {
                    inode: 99,
                    mount_id: 3,
                    overlay_depth: 1
                },
                flags: 0x200
            }
        );
    }

    #[test]
    fn build_unresolved_open() {
        let context = SyscallContext::new(
            SyscallKind::Open,
            SyscallArgs::Open(OpenArgs {
                flags: 2,
                mode: 0o600,
                path_key: PathKey::default(),
            }),
        );
        let event = build(&context, -13, FixedProcess::new(10, "cat").0);
        assert_eq!(
            event.payload,
            FsEvent::FileOpened {
                identity: ObjectIdentity::default(),
                flags: 2,
                mode: 0o600
            }
        );
    }
}
