//! In-flight syscalls, keyed by thread id.
//!
//! Entry and return of a syscall are observed by two different probes, and
//! some arguments are only available in between. The entry probe saves a
//! [`SyscallContext`], mid-flight probes enrich it and the return probe
//! consumes it.
//!
//! A thread runs at most one syscall at a time and the kernel always runs
//! entry before return, so contexts never race on the same key. If the
//! return is missed the context stays around until LRU eviction, the next
//! call of the thread, or the next discarded call of the thread.

use bpf_common::{Pid, maps::LruHashMap};
use strum::Display;

use crate::{EventType, identity::PathKey};

pub const SYSCALL_CACHE_MAX_ENTRIES: usize = 1024;

/// Member of a syscall family which produced a context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum SyscallKind {
    Unlink,
    Unlinkat,
    Open,
    Openat,
}

impl SyscallKind {
    pub fn event_type(self) -> EventType {
        match self {
            SyscallKind::Unlink | SyscallKind::Unlinkat => EventType::Unlink,
            SyscallKind::Open | SyscallKind::Openat => EventType::Open,
        }
    }
}

/// Progress of a single syscall through its probes.
///
/// `Unseen` is reported for threads without a context: either no call is in
/// flight, its entry was discarded, or it was evicted before returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum CallState {
    Unseen,
    Entered,
    Resolving,
    Returned,
}

impl CallState {
    fn can_move_to(self, next: CallState) -> bool {
        use CallState::*;
        matches!(
            (self, next),
            (Unseen, Entered)
                | (Entered, Resolving)
                | (Resolving, Entered)
                | (Entered, Returned)
                | (Resolving, Returned)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnlinkArgs {
    pub flags: i32,
    pub path_key: PathKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenArgs {
    pub flags: i32,
    pub mode: u32,
    pub path_key: PathKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallArgs {
    Unlink(UnlinkArgs),
    Open(OpenArgs),
}

impl SyscallArgs {
    pub fn path_key(&self) -> &PathKey {
        match self {
            SyscallArgs::Unlink(args) => &args.path_key,
            SyscallArgs::Open(args) => &args.path_key,
        }
    }

    pub fn path_key_mut(&mut self) -> &mut PathKey {
        match self {
            SyscallArgs::Unlink(args) => &mut args.path_key,
            SyscallArgs::Open(args) => &mut args.path_key,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallContext {
    pub kind: SyscallKind,
    pub state: CallState,
    /// How many times mid-flight probes ran for this call
    pub mid_flight_hits: u8,
    pub args: SyscallArgs,
}

impl SyscallContext {
    pub fn new(kind: SyscallKind, args: SyscallArgs) -> Self {
        Self {
            kind,
            state: CallState::Entered,
            mid_flight_hits: 0,
            args,
        }
    }

    /// Move to `next` if the transition is allowed.
    pub fn transition(&mut self, next: CallState) -> bool {
        if !self.state.can_move_to(next) {
            log::trace!("{}: invalid transition {} -> {}", self.kind, self.state, next);
            return false;
        }
        self.state = next;
        true
    }

    /// Run a mid-flight step: `Entered -> Resolving -> Entered`.
    pub fn mid_flight<R>(&mut self, f: impl FnOnce(&mut SyscallArgs) -> R) -> R {
        self.transition(CallState::Resolving);
        self.mid_flight_hits = self.mid_flight_hits.saturating_add(1);
        let result = f(&mut self.args);
        self.transition(CallState::Entered);
        result
    }
}

pub struct SyscallCache {
    map: LruHashMap<Pid, SyscallContext>,
}

impl SyscallCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            map: LruHashMap::with_max_entries("syscalls", max_entries),
        }
    }

    /// Start tracking a syscall for `tid`. A context left over by a call
    /// whose return was missed is replaced.
    pub fn begin(&self, tid: Pid, kind: SyscallKind, args: SyscallArgs) {
        if let Some(orphan) = self.map.insert(tid, SyscallContext::new(kind, args)) {
            log::trace!("{tid}: replacing orphaned {} context", orphan.kind);
        }
    }

    /// Access the in-flight context of `tid` without consuming it.
    pub fn peek<R>(&self, tid: Pid, f: impl FnOnce(&mut SyscallContext) -> R) -> Option<R> {
        self.map.update(&tid, f)
    }

    /// Consume the in-flight context of `tid`.
    pub fn end(&self, tid: Pid) -> Option<SyscallContext> {
        let mut context = self.map.remove(&tid)?;
        context.transition(CallState::Returned);
        Some(context)
    }

    /// Current state of the call of `tid`. Eviction order is not affected.
    pub fn state(&self, tid: Pid) -> CallState {
        self.map
            .peek(&tid, |context| context.state)
            .unwrap_or(CallState::Unseen)
    }

    /// Forget the call of `tid`, if any. Used when a new call of the same
    /// thread is discarded, so that a context leaked by a missed return
    /// can't be completed by it.
    pub fn discard(&self, tid: Pid) {
        if let Some(stale) = self.map.remove(&tid) {
            log::trace!("{tid}: dropping stale {} context", stale.kind);
        }
    }

    pub fn contains(&self, tid: Pid) -> bool {
        self.map.contains_key(&tid)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&self) {
        self.map.clear()
    }
}
