//! # File system monitor
//!
//! Probes for filesystem-mutating syscalls. Each syscall family follows the
//! same shape:
//!
//! 1. the entry probe checks discarders and saves the arguments in the
//!    [`SyscallCache`](syscall_cache::SyscallCache), keyed by thread id
//! 2. mid-flight probes (`mnt_want_write`, `vfs_unlink`, `vfs_open`) resolve
//!    the [`ObjectIdentity`] of the target, once per call
//! 3. the return probe consumes the context, drops uninteresting return codes
//!    and emits a [`FsEvent`] through the [`BpfSender`].
//!
//! Expected misses (discarded calls, returns without an entry, probes
//! attached mid-call) are not errors: handlers just return.

use std::fmt;

use bpf_common::{
    BpfContext, BpfSender, Pid, ProgramError,
    program::{DecodeError, FixedPayload},
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use strum::Display;
use syswatch_core::{ConfigError, ModuleConfig, kernel::errno::Errno};

pub mod discarder;
pub mod event;
pub mod identity;
mod open;
pub mod syscall_cache;
mod unlink;

use discarder::{DISCARDERS_MAX_ENTRIES, FlagsDiscarders, PREFIX_FILTER_SIZE, PrefixDiscarders};
use event::ReturnPolicy;
pub use identity::{Dentry, ObjectIdentity};
use syscall_cache::{SYSCALL_CACHE_MAX_ENTRIES, SyscallCache};

pub const MODULE_NAME: &str = "file-system-monitor";

/// Tag of an event on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
#[repr(u64)]
pub enum EventType {
    Unlink = 1,
    Open = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsEvent {
    FileDeleted {
        identity: ObjectIdentity,
        flags: i32,
    },
    FileOpened {
        identity: ObjectIdentity,
        flags: i32,
        mode: u32,
    },
}

impl FsEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            FsEvent::FileDeleted { .. } => EventType::Unlink,
            FsEvent::FileOpened { .. } => EventType::Open,
        }
    }

    pub fn identity(&self) -> ObjectIdentity {
        match self {
            FsEvent::FileDeleted { identity, .. } | FsEvent::FileOpened { identity, .. } => {
                *identity
            }
        }
    }
}

impl fmt::Display for FsEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsEvent::FileDeleted { identity, flags } => {
                write!(f, "unlink {{ {identity} flags={flags:#x} }}")
            }
            FsEvent::FileOpened {
                identity,
                flags,
                mode,
            } => write!(f, "open {{ {identity} flags={flags:#x} mode={mode:#o} }}"),
        }
    }
}

/// `inode | mount_id | overlay_depth | flags | mode`, mode is zero for unlink.
impl FixedPayload for FsEvent {
    const SIZE: usize = 24;

    fn kind(&self) -> u64 {
        self.event_type() as u64
    }

    fn encode(&self, buf: &mut BytesMut) {
        let (identity, flags, mode) = match *self {
            FsEvent::FileDeleted { identity, flags } => (identity, flags, 0),
            FsEvent::FileOpened {
                identity,
                flags,
                mode,
            } => (identity, flags, mode),
        };
        buf.put_u64_le(identity.inode);
        buf.put_u32_le(identity.mount_id);
        buf.put_i32_le(identity.overlay_depth);
        buf.put_i32_le(flags);
        buf.put_u32_le(mode);
    }

    fn decode(kind: u64, buf: &mut Bytes) -> Result<Self, DecodeError> {
        let identity = ObjectIdentity {
            inode: buf.get_u64_le(),
            mount_id: buf.get_u32_le(),
            overlay_depth: buf.get_i32_le(),
        };
        let flags = buf.get_i32_le();
        let mode = buf.get_u32_le();
        match kind {
            k if k == EventType::Unlink as u64 => Ok(FsEvent::FileDeleted { identity, flags }),
            k if k == EventType::Open as u64 => Ok(FsEvent::FileOpened {
                identity,
                flags,
                mode,
            }),
            other => Err(DecodeError::UnknownKind(other)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub syscall_cache_capacity: usize,
    pub discarder_capacity: usize,
    /// Bytes of the path compared by prefix discarders, NUL included
    pub prefix_size: usize,
    pub reported_errors: Vec<Errno>,
    pub unlink_discarders: Vec<String>,
    pub open_discarders: Vec<String>,
    pub open_flags_discarders: Vec<i32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            syscall_cache_capacity: SYSCALL_CACHE_MAX_ENTRIES,
            discarder_capacity: DISCARDERS_MAX_ENTRIES,
            prefix_size: PREFIX_FILTER_SIZE,
            reported_errors: ReturnPolicy::default().reported_errors().to_vec(),
            unlink_discarders: Vec::new(),
            open_discarders: Vec::new(),
            open_flags_discarders: Vec::new(),
        }
    }
}

impl TryFrom<&ModuleConfig> for Config {
    type Error = ConfigError;

    fn try_from(config: &ModuleConfig) -> Result<Self, Self::Error> {
        let default = Config::default();
        Ok(Config {
            syscall_cache_capacity: config
                .with_default("syscall_cache_capacity", default.syscall_cache_capacity)?,
            discarder_capacity: config
                .with_default("discarder_capacity", default.discarder_capacity)?,
            prefix_size: config.with_default("prefix_size", default.prefix_size)?,
            reported_errors: config
                .get_list_with_default("reported_errors", default.reported_errors)?,
            unlink_discarders: config.get_list("unlink_discarders")?,
            open_discarders: config.get_list("open_discarders")?,
            open_flags_discarders: config.get_list("open_flags_discarders")?,
        })
    }
}

/// The set of attached probes with the maps they share.
///
/// Maps live as long as this value: they're created on attach and
/// dropped on detach. Every handler takes `&self` and can run concurrently
/// from any number of threads.
pub struct FsProbes<S> {
    ctx: BpfContext,
    sender: S,
    syscalls: SyscallCache,
    unlink_discarders: PrefixDiscarders,
    open_discarders: PrefixDiscarders,
    open_flags_discarders: FlagsDiscarders,
    return_policy: ReturnPolicy,
}

/// Attach the probes with the default configuration.
pub fn program<S: BpfSender<FsEvent>>(
    ctx: BpfContext,
    sender: S,
) -> Result<FsProbes<S>, ProgramError> {
    program_with_config(ctx, Config::default(), sender)
}

pub fn program_with_config<S: BpfSender<FsEvent>>(
    ctx: BpfContext,
    config: Config,
    sender: S,
) -> Result<FsProbes<S>, ProgramError> {
    if !(1..=PREFIX_FILTER_SIZE).contains(&config.prefix_size) {
        return Err(ProgramError::InvalidSetting {
            setting: "prefix_size",
            value: config.prefix_size.to_string(),
            reason: "must be between 1 and 32",
        });
    }
    for (setting, capacity) in [
        ("syscall_cache_capacity", config.syscall_cache_capacity),
        ("discarder_capacity", config.discarder_capacity),
    ] {
        if capacity == 0 {
            return Err(ProgramError::InvalidSetting {
                setting,
                value: capacity.to_string(),
                reason: "must be greater than 0",
            });
        }
    }

    let probes = FsProbes {
        ctx,
        sender,
        syscalls: SyscallCache::new(config.syscall_cache_capacity),
        unlink_discarders: PrefixDiscarders::new(
            "unlink_prefix_discarders",
            config.discarder_capacity,
            config.prefix_size,
        ),
        open_discarders: PrefixDiscarders::new(
            "open_prefix_discarders",
            config.discarder_capacity,
            config.prefix_size,
        ),
        open_flags_discarders: FlagsDiscarders::new(
            "open_flags_discarders",
            config.discarder_capacity,
        ),
        return_policy: ReturnPolicy::new(config.reported_errors),
    };
    for path in &config.unlink_discarders {
        probes.unlink_discarders.insert(path.as_bytes());
    }
    for path in &config.open_discarders {
        probes.open_discarders.insert(path.as_bytes());
    }
    for flags in &config.open_flags_discarders {
        probes.open_flags_discarders.insert(*flags);
    }
    log::debug!(
        "{MODULE_NAME}: attached with {} unlink, {} open and {} flags discarders",
        probes.unlink_discarders.len(),
        probes.open_discarders.len(),
        probes.open_flags_discarders.len()
    );
    Ok(probes)
}

impl<S: BpfSender<FsEvent>> FsProbes<S> {
    /// Path prefix discarders of a syscall family
    pub fn discarders(&self, event_type: EventType) -> &PrefixDiscarders {
        match event_type {
            EventType::Unlink => &self.unlink_discarders,
            EventType::Open => &self.open_discarders,
        }
    }

    pub fn open_flags_discarders(&self) -> &FlagsDiscarders {
        &self.open_flags_discarders
    }

    pub fn syscalls(&self) -> &SyscallCache {
        &self.syscalls
    }

    /// `kprobe/mnt_want_write`: runs before `vfs_*` for every family and
    /// provides the mount id of the target.
    pub fn mnt_want_write(&self, tid: Pid, mount_id: u32) {
        self.syscalls.peek(tid, |context| {
            context.mid_flight(|args| args.path_key_mut().set_mount_id(mount_id))
        });
    }

    /// Resolve the identity of the in-flight call of `tid`, if it belongs to
    /// the expected family.
    fn resolve(&self, tid: Pid, dentry: &Dentry, family: EventType) -> Option<ObjectIdentity> {
        self.syscalls
            .peek(tid, |context| {
                if context.kind.event_type() != family {
                    return None;
                }
                Some(context.mid_flight(|args| args.path_key_mut().resolve(dentry)))
            })
            .flatten()
    }

    /// Consume the in-flight call of `tid` and emit its event.
    fn finalize(&self, tid: Pid, retval: i64, family: EventType) {
        let Some(context) = self.syscalls.end(tid) else {
            return;
        };
        // The return of a different family means we missed a whole call
        if context.kind.event_type() != family {
            log::trace!("{tid}: dropping stale {} context", context.kind);
            return;
        }
        if self.return_policy.is_unhandled_error(retval) {
            return;
        }
        let event = event::build(&context, retval, self.ctx.enricher().current_process_data());
        log::trace!("{tid}: {}", event);
        self.sender.send(event);
    }

    /// Detach the probes. In-flight contexts and discarders are dropped.
    pub fn detach(self) {
        log::debug!(
            "{MODULE_NAME}: detached with {} in-flight syscalls",
            self.syscalls.len()
        );
    }
}

#[cfg(feature = "test-suite")]
pub mod test_suite {
    use bpf_common::{
        event_check,
        test_runner::{TestCase, TestRunner, TestSuite, retval_check},
    };
    use nix::unistd::gettid;
    use syswatch_core::kernel::{
        errno,
        file::{AT_REMOVEDIR, flags::O_RDWR},
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

    pub fn tests() -> TestSuite {
        TestSuite {
            name: "file-system-monitor",
            tests: vec![
                unlink_file(),
                unlinkat_dir(),
                unlink_discarded(),
                unlink_overlay(),
                unlink_denied(),
                unlink_missing_file(),
                open_file(),
                open_flags_discarded(),
            ],
        }
    }

    fn unlink_file() -> TestCase {
        TestCase::new("unlink_file", async {
            TestRunner::with_ebpf(program)
                .run(|probes, memory| {
                    let tid = gettid();
                    probes.sys_unlink(tid, memory.alloc_str("/tmp/foo"));
                    probes.mnt_want_write(tid, 28);
                    probes.vfs_unlink(tid, &Dentry::new(5001, EXT4_SUPER_MAGIC));
                    probes.sys_unlink_ret(tid, 0);
                })
                .expect_event({
                    let mut checks = event_check!(
                        FsEvent::FileDeleted,
                        (identity, ext4_identity(5001, 28), "identity"),
                        (flags, 0, "flags")
                    );
                    checks.push(retval_check(0));
                    checks
                })
                .report()
        })
    }

    fn unlinkat_dir() -> TestCase {
        TestCase::new("unlinkat_dir", async {
            TestRunner::with_ebpf(program)
                .run(|probes, memory| {
                    let tid = gettid();
                    probes.sys_unlinkat(tid, memory.alloc_str("/tmp/dir"), AT_REMOVEDIR);
                    probes.mnt_want_write(tid, 28);
                    probes.vfs_unlink(tid, &Dentry::new(5002, EXT4_SUPER_MAGIC));
                    probes.sys_unlink_ret(tid, 0);
                })
                .expect_event(event_check!(
                    FsEvent::FileDeleted,
                    (
                        identity,
                        ObjectIdentity {
                            inode: 5002,
                            mount_id: 28,
                            overlay_depth: 0
                        },
                        "identity"
                    ),
                    (flags, AT_REMOVEDIR, "flags")
                ))
                .report()
        })
    }

    fn unlink_discarded() -> TestCase {
        TestCase::new("unlink_discarded", async {
            let config = Config {
                unlink_discarders: vec!["/var/lib/blocked".to_string()],
                ..Default::default()
            };
            TestRunner::with_ebpf(|ctx, tx| program_with_config(ctx, config, tx))
                .run(|probes, memory| {
                    let tid = gettid();
                    probes.sys_unlink(tid, memory.alloc_str("/var/lib/blocked"));
                    assert!(!probes.syscalls().contains(tid));
                    probes.vfs_unlink(tid, &Dentry::new(5003, EXT4_SUPER_MAGIC));
                    probes.sys_unlink_ret(tid, 0);
                })
                .expect_no_event()
                .report()
        })
    }

    fn unlink_overlay() -> TestCase {
        TestCase::new("unlink_overlay", async {
            TestRunner::with_ebpf(program)
                .run(|probes, memory| {
                    let tid = gettid();
                    probes.sys_unlink(tid, memory.alloc_str("/merged/file"));
                    // one vfs_unlink per overlay layer, only the first is the real file
                    for (mount_id, ino, numlower) in [(40, 7001, 2), (41, 7002, 1), (42, 7003, 0)] {
                        probes.mnt_want_write(tid, mount_id);
                        probes.vfs_unlink(tid, &Dentry::overlay(ino, numlower));
                    }
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
                .report()
        })
    }

    fn unlink_denied() -> TestCase {
        TestCase::new("unlink_denied", async {
            TestRunner::with_ebpf(program)
                .run(|probes, memory| {
                    let tid = gettid();
                    probes.sys_unlink(tid, memory.alloc_str("/etc/shadow"));
                    probes.sys_unlink_ret(tid, errno::EACCES.as_retval());
                })
                .expect_event({
                    let mut checks = event_check!(
                        FsEvent::FileDeleted,
                        (identity, ObjectIdentity::default(), "unresolved identity")
                    );
                    checks.push(retval_check(errno::EACCES.as_retval()));
                    checks
                })
                .report()
        })
    }

    fn unlink_missing_file() -> TestCase {
        TestCase::new("unlink_missing_file", async {
            TestRunner::with_ebpf(program)
                .run(|probes, memory| {
                    let tid = gettid();
                    probes.sys_unlink(tid, memory.alloc_str("/tmp/missing"));
                    probes.sys_unlink_ret(tid, errno::ENOENT.as_retval());
                })
                .expect_no_event()
                .report()
        })
    }

    fn open_file() -> TestCase {
        TestCase::new("open_file", async {
            TestRunner::with_ebpf(program)
                .run(|probes, memory| {
                    let tid = gettid();
                    probes.sys_openat(tid, memory.alloc_str("/tmp/open_file"), O_RDWR, 0);
                    probes.vfs_open(tid, &Dentry::new(6001, EXT4_SUPER_MAGIC));
                    probes.sys_open_ret(tid, 3);
                })
                .expect_event({
                    let mut checks = event_check!(
                        FsEvent::FileOpened,
                        (identity, ext4_identity(6001, 0), "identity"),
                        (flags, O_RDWR, "open flags"),
                        (mode, 0u32, "mode")
                    );
                    checks.push(retval_check(3));
                    checks
                })
                .report()
        })
    }

    fn open_flags_discarded() -> TestCase {
        TestCase::new("open_flags_discarded", async {
            let config = Config {
                open_flags_discarders: vec![O_RDWR],
                ..Default::default()
            };
            TestRunner::with_ebpf(|ctx, tx| program_with_config(ctx, config, tx))
                .run(|probes, memory| {
                    let tid = gettid();
                    probes.sys_open(tid, memory.alloc_str("/tmp/open_file"), O_RDWR, 0);
                    probes.vfs_open(tid, &Dentry::new(6002, EXT4_SUPER_MAGIC));
                    probes.sys_open_ret(tid, 3);
                })
                .expect_no_event()
                .report()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_identity() -> ObjectIdentity {
        ObjectIdentity {
            inode: 0x1122_3344_5566_7788,
            mount_id: 31,
            overlay_depth: 2,
        }
    }

    #[test]
    fn config_defaults() {
        let config = Config::try_from(&ModuleConfig::default()).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.discarder_capacity, 256);
        assert_eq!(config.prefix_size, 32);
        assert_eq!(
            config.reported_errors,
            vec![
                syswatch_core::kernel::errno::EACCES,
                syswatch_core::kernel::errno::EPERM
            ]
        );
    }

    #[test]
    fn config_from_module_config() {
        let module_config: ModuleConfig = [
            ("discarder_capacity", "16"),
            ("reported_errors", "EACCES"),
            ("unlink_discarders", "/tmp/.X11-unix/,/var/cache/"),
            ("open_flags_discarders", "0, 524288"),
        ]
        .into_iter()
        .collect();
        let config = Config::try_from(&module_config).unwrap();
        assert_eq!(config.discarder_capacity, 16);
        assert_eq!(config.syscall_cache_capacity, SYSCALL_CACHE_MAX_ENTRIES);
        assert_eq!(config.reported_errors, vec![syswatch_core::kernel::errno::EACCES]);
        assert_eq!(config.unlink_discarders.len(), 2);
        assert_eq!(config.open_flags_discarders, vec![0, 524288]);
    }

    #[test]
    fn config_invalid_errno() {
        let module_config: ModuleConfig = [("reported_errors", "EACCES,ENOPE")].into_iter().collect();
        assert!(matches!(
            Config::try_from(&module_config),
            Err(ConfigError::InvalidValue { field, .. }) if field == "reported_errors"
        ));
    }

    #[test]
    fn invalid_prefix_size() {
        let (tx, _rx) = tokio::sync::mpsc::channel::<bpf_common::BpfEvent<FsEvent>>(1);
        let config = Config {
            prefix_size: 33,
            ..Default::default()
        };
        assert!(matches!(
            program_with_config(BpfContext::default(), config, tx),
            Err(ProgramError::InvalidSetting {
                setting: "prefix_size",
                ..
            })
        ));
    }

    #[test]
    fn wire_layout() {
        let payload = FsEvent::FileOpened {
            identity: sample_identity(),
            flags: 0x241,
            mode: 0o644,
        };
        let mut buf = BytesMut::new();
        payload.encode(&mut buf);
        assert_eq!(buf.len(), FsEvent::SIZE);
        assert_eq!(&buf[0..8], &0x1122_3344_5566_7788u64.to_le_bytes());
        assert_eq!(&buf[8..12], &31u32.to_le_bytes());
        assert_eq!(&buf[12..16], &2i32.to_le_bytes());
        assert_eq!(&buf[16..20], &0x241i32.to_le_bytes());
        assert_eq!(&buf[20..24], &0o644u32.to_le_bytes());
        assert_eq!(
            FsEvent::decode(EventType::Open as u64, &mut buf.freeze()),
            Ok(payload)
        );
    }

    #[test]
    fn unlink_has_no_mode() {
        let payload = FsEvent::FileDeleted {
            identity: sample_identity(),
            flags: 0,
        };
        let mut buf = BytesMut::new();
        payload.encode(&mut buf);
        assert_eq!(&buf[20..24], &[0; 4]);
        assert_eq!(payload.kind(), 1);
        assert_eq!(
            FsEvent::decode(9, &mut buf.freeze()),
            Err(DecodeError::UnknownKind(9))
        );
    }

    #[test]
    fn full_record_size() {
        assert_eq!(bpf_common::BpfEvent::<FsEvent>::ENCODED_SIZE, 80);
    }

    #[test]
    fn display() {
        let payload = FsEvent::FileDeleted {
            identity: sample_identity(),
            flags: 0x200,
        };
        assert_eq!(
            payload.to_string(),
            "unlink { inode=1234605616436508552 mount_id=31 overlay_depth=2 flags=0x200 }"
        );
    }

    #[cfg(feature = "test-suite")]
    #[tokio::test]
    async fn test_suite() {
        for test_case in test_suite::tests().tests {
            let report = test_case.test.await;
            assert!(
                report.success,
                "{} failed:\n{}",
                test_case.name,
                report.lines.join("\n")
            );
        }
    }
}
