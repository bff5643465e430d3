//! Discarders: kernel side verdicts that a syscall is not interesting.
//!
//! They're checked by entry probes before any state is allocated, so that
//! high volume noise (eg. temp file churn) costs a single map lookup.
//! Discarders are installed by userspace; probes only read them. A missing
//! entry means "not judged yet", never "interesting".

use std::fmt;

use bpf_common::{
    maps::LruHashMap,
    memory::{UserMemory, UserPtr},
};

/// Size of the key of prefix discarders, including the NUL terminator.
pub const PREFIX_FILTER_SIZE: usize = 32;
pub const DISCARDERS_MAX_ENTRIES: usize = 256;

/// Null padded path prefix. Paths sharing the first `prefix_size - 1` bytes
/// share the same key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PrefixKey([u8; PREFIX_FILTER_SIZE]);

impl PrefixKey {
    /// Key of a path known to userspace, truncated as a probe would read it.
    pub fn new(path: &[u8], prefix_size: usize) -> Self {
        let mut key = [0; PREFIX_FILTER_SIZE];
        let max = prefix_size.clamp(1, PREFIX_FILTER_SIZE) - 1;
        let len = path
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(path.len())
            .min(max);
        key[..len].copy_from_slice(&path[..len]);
        Self(key)
    }

    /// Read the key from a syscall argument. Faulting and empty reads
    /// produce no key.
    pub fn read(memory: &dyn UserMemory, pathname: UserPtr, prefix_size: usize) -> Option<Self> {
        let mut key = [0; PREFIX_FILTER_SIZE];
        let size = prefix_size.clamp(1, PREFIX_FILTER_SIZE);
        match memory.read_str(pathname, &mut key[..size]) {
            Ok(len) if len > 1 => Some(Self(key)),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        let len = self
            .0
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(PREFIX_FILTER_SIZE);
        &self.0[..len]
    }
}

impl fmt::Debug for PrefixKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrefixKey({:?})", String::from_utf8_lossy(self.as_bytes()))
    }
}

/// Value of a discarder entry. Only its presence is meaningful.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Filter {
    pub value: u8,
}

/// Discarders keyed by path prefix.
pub struct PrefixDiscarders {
    map: LruHashMap<PrefixKey, Filter>,
    prefix_size: usize,
}

impl PrefixDiscarders {
    pub fn new(name: &'static str, max_entries: usize, prefix_size: usize) -> Self {
        Self {
            map: LruHashMap::with_max_entries(name, max_entries),
            prefix_size,
        }
    }

    /// Check the path argument of a syscall. Unreadable paths are never
    /// discarded, and a miss leaves the map untouched.
    pub fn should_discard(&self, memory: &dyn UserMemory, pathname: UserPtr) -> bool {
        match PrefixKey::read(memory, pathname, self.prefix_size) {
            Some(key) => self.map.get(&key).is_some(),
            None => false,
        }
    }

    pub fn insert(&self, path: &[u8]) -> PrefixKey {
        let key = PrefixKey::new(path, self.prefix_size);
        self.map.insert(key, Filter::default());
        key
    }

    pub fn remove(&self, path: &[u8]) -> bool {
        self.map
            .remove(&PrefixKey::new(path, self.prefix_size))
            .is_some()
    }

    pub fn contains(&self, path: &[u8]) -> bool {
        self.map
            .contains_key(&PrefixKey::new(path, self.prefix_size))
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

/// Discarders keyed by the raw `flags` argument of a syscall.
pub struct FlagsDiscarders {
    map: LruHashMap<i32, Filter>,
}

impl FlagsDiscarders {
    pub fn new(name: &'static str, max_entries: usize) -> Self {
        Self {
            map: LruHashMap::with_max_entries(name, max_entries),
        }
    }

    pub fn should_discard(&self, flags: i32) -> bool {
        self.map.get(&flags).is_some()
    }

    pub fn insert(&self, flags: i32) {
        self.map.insert(flags, Filter::default());
    }

    pub fn remove(&self, flags: i32) -> bool {
        self.map.remove(&flags).is_some()
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
