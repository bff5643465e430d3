//! Canonical identity of the filesystem object a syscall acts on.
//!
//! Identity is assembled from two mid-flight probes:
//! - `mnt_want_write` runs first and provides the mount id
//! - `vfs_unlink`/`vfs_open` provide the dentry, from which we read the inode
//!   and the number of overlay lower layers.
//!
//! On overlay filesystems the kernel re-enters `vfs_unlink` once per layer.
//! Only the first call refers to the object the user asked for; later calls
//! address the overlay work directory and must not replace it.

use std::fmt;

use syswatch_core::kernel::fs::OVERLAYFS_SUPER_MAGIC;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectIdentity {
    pub inode: u64,
    pub mount_id: u32,
    /// Overlay lower layers beneath the object, 0 outside of overlayfs
    pub overlay_depth: i32,
}

impl fmt::Display for ObjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "inode={} mount_id={} overlay_depth={}",
            self.inode, self.mount_id, self.overlay_depth
        )
    }
}

/// Directory entry handed to mid-flight probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dentry {
    pub ino: u64,
    /// `s_magic` of the superblock owning the dentry
    pub sb_magic: u64,
    /// `numlower` of the overlay entry, read only on overlayfs
    pub ovl_numlower: i32,
}

impl Dentry {
    pub fn new(ino: u64, sb_magic: u64) -> Self {
        Self {
            ino,
            sb_magic,
            ovl_numlower: 0,
        }
    }

    pub fn overlay(ino: u64, numlower: i32) -> Self {
        Self {
            ino,
            sb_magic: OVERLAYFS_SUPER_MAGIC,
            ovl_numlower: numlower,
        }
    }

    fn overlay_numlower(&self) -> i32 {
        if self.sb_magic == OVERLAYFS_SUPER_MAGIC {
            self.ovl_numlower
        } else {
            0
        }
    }
}

/// Identity resolution state carried by an in-flight syscall.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PathKey {
    mount_id: Option<u32>,
    identity: Option<ObjectIdentity>,
}

impl PathKey {
    /// Record the mount being written to. First writer wins and nothing
    /// changes once the identity is resolved.
    pub fn set_mount_id(&mut self, mount_id: u32) -> bool {
        if self.mount_id.is_some() || self.identity.is_some() {
            return false;
        }
        self.mount_id = Some(mount_id);
        true
    }

    /// Resolve the identity from `dentry`, unless a previous call already did.
    /// Returns the identity in effect after the call.
    pub fn resolve(&mut self, dentry: &Dentry) -> ObjectIdentity {
        if let Some(identity) = self.identity {
            return identity;
        }
        let identity = ObjectIdentity {
            inode: dentry.ino,
            mount_id: self.mount_id.unwrap_or_default(),
            overlay_depth: dentry.overlay_numlower(),
        };
        self.identity = Some(identity);
        identity
    }

    pub fn is_resolved(&self) -> bool {
        self.identity.is_some()
    }

    pub fn identity(&self) -> Option<ObjectIdentity> {
        self.identity
    }

    pub fn mount_id(&self) -> Option<u32> {
        self.mount_id
    }
}
