//! Metadata cache for B-tree nodes, symbol table nodes, local heaps and
//! object headers.
//!
//! The [`MetadataCache`] owns the [`FileSpace`] and keeps decoded structures
//! keyed by file address, with LRU eviction controlled by a byte budget.
//! Access goes through *protect*: [`MetadataCache::protect_read`] hands out a
//! shared [`ProtectedRead`] guard (any number may coexist), and
//! [`MetadataCache::protect_write`] hands out an exclusive [`Protected`] guard.
//! While protected, an entry cannot be evicted or moved. Dropping a guard
//! unprotects it; [`Protected::release`] does the same but reports failures.
//!
//! The cache is single-threaded and uses `RefCell` internally, so guards on
//! different addresses can be held at the same time.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;

use tracing::{debug, error, trace};

use crate::encoding::{is_defined, Address, FileSizes};
use crate::error::FormatError;
use crate::file_space::FileSpace;
use crate::property_list::{DEFAULT_METADATA_CACHE_BYTES, MAX_METADATA_CACHE_BYTES};

/// A structure that lives in the metadata cache.
pub trait CacheEntry: Any + Sized {
    /// Extra information needed to decode the structure.
    type Context: ?Sized;

    /// Short name used in logs.
    const KIND: &'static str;

    /// Decode the structure stored at `addr`.
    fn load(
        space: &FileSpace,
        addr: Address,
        sizes: FileSizes,
        ctx: &Self::Context,
    ) -> Result<Self, FormatError>;

    /// Encode the structure back to `addr`.
    fn flush(&self, space: &mut FileSpace, addr: Address, sizes: FileSizes)
        -> Result<(), FormatError>;

    /// Bytes the structure occupies on disk at its address.
    fn disk_size(&self, sizes: FileSizes) -> u64;

    /// Return the structure's file space when it is deleted.
    fn free_space(&self, space: &mut FileSpace, addr: Address, sizes: FileSizes) {
        space.free(addr, self.disk_size(sizes));
    }
}

trait StoredEntry {
    fn entry_type(&self) -> TypeId;
    fn flush_to(&self, space: &mut FileSpace, addr: Address, sizes: FileSizes)
        -> Result<(), FormatError>;
    fn into_any(self: Rc<Self>) -> Rc<dyn Any>;
}

impl<T: CacheEntry> StoredEntry for T {
    fn entry_type(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn flush_to(
        &self,
        space: &mut FileSpace,
        addr: Address,
        sizes: FileSizes,
    ) -> Result<(), FormatError> {
        self.flush(space, addr, sizes)
    }

    fn into_any(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}

/// Marker recorded on entries created or dirtied inside a [`TagScope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryTag {
    /// Written while copying objects from another file.
    Copied,
}

/// Counters for protect discipline and cache effectiveness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Successful protect calls.
    pub protects: u64,
    /// Successful unprotect calls.
    pub unprotects: u64,
    /// Protects served from a resident entry.
    pub hits: u64,
    /// Protects that had to decode from file space.
    pub misses: u64,
    /// Entries dropped to stay within budget.
    pub evictions: u64,
}

impl CacheStats {
    /// Protects not yet matched by an unprotect.
    pub fn outstanding(&self) -> u64 {
        self.protects - self.unprotects
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PinState {
    Idle,
    Reading(u32),
    Writing,
}

struct Slot {
    /// `None` while write-protected.
    entry: Option<Rc<dyn StoredEntry>>,
    kind: &'static str,
    state: PinState,
    dirty: bool,
    approx_size: usize,
    last_access: u64,
    tag: Option<EntryTag>,
}

struct CacheInner {
    slots: HashMap<Address, Slot>,
    current_bytes: usize,
    max_bytes: usize,
    tick: u64,
    stats: CacheStats,
    fail_protect_in: Option<u64>,
    tag: Option<EntryTag>,
}

impl CacheInner {
    fn touch(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn injected_failure(&mut self) -> bool {
        match self.fail_protect_in {
            Some(0) => {
                self.fail_protect_in = None;
                true
            }
            Some(n) => {
                self.fail_protect_in = Some(n - 1);
                false
            }
            None => false,
        }
    }
}

fn approx_size(disk_size: u64) -> usize {
    disk_size as usize + 64
}

/// Flags applied when an entry is unprotected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnprotectFlags {
    /// Content changed and must be written back.
    pub dirty: bool,
    /// Remove the entry from the cache.
    pub deleted: bool,
    /// With `deleted`, also return the entry's file space.
    pub free_file_space: bool,
}

/// The paged metadata cache of one file.
pub struct MetadataCache {
    sizes: FileSizes,
    space: RefCell<FileSpace>,
    inner: RefCell<CacheInner>,
}

impl MetadataCache {
    /// Create a cache over `space` with the default size (2 MiB).
    pub fn new(space: FileSpace, sizes: FileSizes) -> Self {
        Self::with_capacity(space, sizes, DEFAULT_METADATA_CACHE_BYTES)
    }

    /// Create a cache with a custom byte budget.
    ///
    /// Clamped to [`MAX_METADATA_CACHE_BYTES`].
    pub fn with_capacity(space: FileSpace, sizes: FileSizes, max_bytes: usize) -> Self {
        Self {
            sizes,
            space: RefCell::new(space),
            inner: RefCell::new(CacheInner {
                slots: HashMap::new(),
                current_bytes: 0,
                max_bytes: max_bytes.min(MAX_METADATA_CACHE_BYTES),
                tick: 0,
                stats: CacheStats::default(),
                fail_protect_in: None,
                tag: None,
            }),
        }
    }

    /// Address and length widths of the file.
    pub fn sizes(&self) -> FileSizes {
        self.sizes
    }

    /// Reserve file space.
    pub fn allocate(&self, size: u64) -> Result<Address, FormatError> {
        self.space.borrow_mut().allocate(size)
    }

    /// Return file space.
    pub fn free(&self, addr: Address, size: u64) {
        self.space.borrow_mut().free(addr, size)
    }

    /// Write bytes that are not managed as a cache entry.
    pub fn write_raw(&self, addr: Address, data: &[u8]) -> Result<(), FormatError> {
        self.space.borrow_mut().write(addr, data)
    }

    /// Copy bytes out of file space, bypassing the cache.
    pub fn read_raw(&self, addr: Address, len: usize) -> Result<Vec<u8>, FormatError> {
        Ok(self.space.borrow().read(addr, len)?.to_vec())
    }

    /// End of allocated file space.
    pub fn eoa(&self) -> u64 {
        self.space.borrow().eoa()
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        self.inner.borrow().stats
    }

    /// Number of cached entries, protected or not.
    pub fn len(&self) -> usize {
        self.inner.borrow().slots.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.inner.borrow().slots.is_empty()
    }

    /// Whether an entry for `addr` is resident.
    pub fn contains(&self, addr: Address) -> bool {
        self.inner.borrow().slots.contains_key(&addr)
    }

    /// Whether `addr` is currently protected.
    pub fn is_protected(&self, addr: Address) -> bool {
        self.inner
            .borrow()
            .slots
            .get(&addr)
            .is_some_and(|s| s.state != PinState::Idle)
    }

    /// Current bytes used by cached entries.
    pub fn current_bytes(&self) -> usize {
        self.inner.borrow().current_bytes
    }

    /// Make the protect `n` calls from now fail (`0` fails the next one).
    pub fn inject_protect_failure(&self, n: u64) {
        self.inner.borrow_mut().fail_protect_in = Some(n);
    }

    /// Make the file space allocation `n` calls from now fail.
    pub fn inject_allocation_failure(&self, n: u64) {
        self.space.borrow_mut().inject_allocation_failure(n);
    }

    /// Clear any pending injected failures.
    pub fn clear_injected_failures(&self) {
        self.inner.borrow_mut().fail_protect_in = None;
        self.space.borrow_mut().clear_injected_failure();
    }

    /// Tag entries inserted or dirtied until the returned scope is dropped.
    pub fn tag_scope(&self, tag: EntryTag) -> TagScope<'_> {
        let previous = self.inner.borrow_mut().tag.replace(tag);
        TagScope {
            cache: self,
            previous,
        }
    }

    /// Resident entries carrying `tag`, in address order.
    pub fn tagged(&self, tag: EntryTag) -> Vec<Address> {
        let inner = self.inner.borrow();
        let mut addrs: Vec<Address> = inner
            .slots
            .iter()
            .filter(|(_, s)| s.tag == Some(tag))
            .map(|(&a, _)| a)
            .collect();
        addrs.sort_unstable();
        addrs
    }

    /// Add a newly created structure at `addr`. It starts dirty.
    pub fn insert<T: CacheEntry>(&self, addr: Address, entry: T) -> Result<(), FormatError> {
        if !is_defined(addr) {
            return Err(FormatError::Protect {
                address: addr,
                reason: "undefined address",
            });
        }
        {
            let mut inner = self.inner.borrow_mut();
            if inner.slots.contains_key(&addr) {
                return Err(FormatError::Protect {
                    address: addr,
                    reason: "address already cached",
                });
            }
            let size = approx_size(entry.disk_size(self.sizes));
            let tick = inner.touch();
            let tag = inner.tag;
            inner.current_bytes += size;
            inner.slots.insert(
                addr,
                Slot {
                    entry: Some(Rc::new(entry)),
                    kind: T::KIND,
                    state: PinState::Idle,
                    dirty: true,
                    approx_size: size,
                    last_access: tick,
                    tag,
                },
            );
        }
        trace!(addr, kind = T::KIND, "cache.insert");
        self.evict_if_needed()
    }

    fn fetch<T: CacheEntry>(
        &self,
        addr: Address,
        ctx: &T::Context,
    ) -> Result<(), FormatError> {
        let mut inner = self.inner.borrow_mut();
        if inner.injected_failure() {
            return Err(FormatError::Protect {
                address: addr,
                reason: "injected failure",
            });
        }
        if !is_defined(addr) {
            return Err(FormatError::Protect {
                address: addr,
                reason: "undefined address",
            });
        }
        if inner.slots.contains_key(&addr) {
            inner.stats.hits += 1;
            return Ok(());
        }
        inner.stats.misses += 1;
        let entry = T::load(&self.space.borrow(), addr, self.sizes, ctx)?;
        let size = approx_size(entry.disk_size(self.sizes));
        let tick = inner.touch();
        inner.current_bytes += size;
        inner.slots.insert(
            addr,
            Slot {
                entry: Some(Rc::new(entry)),
                kind: T::KIND,
                state: PinState::Idle,
                dirty: false,
                approx_size: size,
                last_access: tick,
                tag: None,
            },
        );
        trace!(addr, kind = T::KIND, "cache.load");
        Ok(())
    }

    /// Pin the entry at `addr` for reading, loading it if needed.
    pub fn protect_read<T: CacheEntry>(
        &self,
        addr: Address,
        ctx: &T::Context,
    ) -> Result<ProtectedRead<'_, T>, FormatError> {
        self.fetch::<T>(addr, ctx)?;
        let mut inner = self.inner.borrow_mut();
        let tick = inner.touch();
        let slot = inner.slots.get_mut(&addr).ok_or(FormatError::Protect {
            address: addr,
            reason: "entry vanished",
        })?;
        let count = match slot.state {
            PinState::Writing => {
                return Err(FormatError::Protect {
                    address: addr,
                    reason: "entry already protected for write",
                })
            }
            PinState::Reading(n) => n,
            PinState::Idle => 0,
        };
        let any = match &slot.entry {
            Some(entry) => Rc::clone(entry).into_any(),
            None => {
                return Err(FormatError::Protect {
                    address: addr,
                    reason: "entry already protected for write",
                })
            }
        };
        let entry = any.downcast::<T>().map_err(|_| FormatError::Protect {
            address: addr,
            reason: "entry holds a different structure",
        })?;
        slot.state = PinState::Reading(count + 1);
        slot.last_access = tick;
        inner.stats.protects += 1;
        Ok(ProtectedRead {
            cache: self,
            addr,
            entry: Some(entry),
        })
    }

    /// Pin the entry at `addr` for exclusive modification.
    pub fn protect_write<T: CacheEntry>(
        &self,
        addr: Address,
        ctx: &T::Context,
    ) -> Result<Protected<'_, T>, FormatError> {
        self.fetch::<T>(addr, ctx)?;
        let mut inner = self.inner.borrow_mut();
        let tick = inner.touch();
        let slot = inner.slots.get_mut(&addr).ok_or(FormatError::Protect {
            address: addr,
            reason: "entry vanished",
        })?;
        if slot.state != PinState::Idle {
            return Err(FormatError::Protect {
                address: addr,
                reason: "entry already protected",
            });
        }
        let shared = match slot.entry.take() {
            Some(shared) if shared.entry_type() == TypeId::of::<T>() => shared,
            other => {
                slot.entry = other;
                return Err(FormatError::Protect {
                    address: addr,
                    reason: "entry holds a different structure",
                });
            }
        };
        let entry = match shared.into_any().downcast::<T>() {
            Ok(rc) => match Rc::try_unwrap(rc) {
                Ok(entry) => entry,
                Err(rc) => {
                    slot.entry = Some(rc as Rc<dyn StoredEntry>);
                    return Err(FormatError::Protect {
                        address: addr,
                        reason: "entry still shared",
                    });
                }
            },
            Err(_) => {
                inner.slots.remove(&addr);
                return Err(FormatError::Protect {
                    address: addr,
                    reason: "entry holds a different structure",
                });
            }
        };
        slot.state = PinState::Writing;
        slot.last_access = tick;
        inner.stats.protects += 1;
        Ok(Protected {
            cache: self,
            addr,
            entry: Some(entry),
            flags: UnprotectFlags::default(),
        })
    }

    fn unprotect_write<T: CacheEntry>(
        &self,
        addr: Address,
        entry: T,
        flags: UnprotectFlags,
    ) -> Result<(), FormatError> {
        {
            let mut inner = self.inner.borrow_mut();
            let tag = inner.tag;
            let Some(slot) = inner.slots.get_mut(&addr) else {
                return Err(FormatError::Unprotect {
                    address: addr,
                    reason: "entry not cached",
                });
            };
            if slot.state != PinState::Writing {
                return Err(FormatError::Unprotect {
                    address: addr,
                    reason: "entry not protected for write",
                });
            }
            if flags.deleted {
                if let Some(slot) = inner.slots.remove(&addr) {
                    inner.current_bytes -= slot.approx_size;
                }
                inner.stats.unprotects += 1;
                drop(inner);
                if flags.free_file_space {
                    entry.free_space(&mut self.space.borrow_mut(), addr, self.sizes);
                }
                debug!(addr, kind = T::KIND, "cache.delete");
                return Ok(());
            }
            let size = approx_size(entry.disk_size(self.sizes));
            let old_size = slot.approx_size;
            slot.entry = Some(Rc::new(entry));
            slot.state = PinState::Idle;
            slot.approx_size = size;
            if flags.dirty {
                slot.dirty = true;
                if tag.is_some() {
                    slot.tag = tag;
                }
            }
            inner.current_bytes = inner.current_bytes - old_size + size;
            inner.stats.unprotects += 1;
        }
        self.evict_if_needed()
    }

    fn unprotect_read(&self, addr: Address) -> Result<(), FormatError> {
        let mut inner = self.inner.borrow_mut();
        let Some(slot) = inner.slots.get_mut(&addr) else {
            return Err(FormatError::Unprotect {
                address: addr,
                reason: "entry not cached",
            });
        };
        slot.state = match slot.state {
            PinState::Reading(1) => PinState::Idle,
            PinState::Reading(n) => PinState::Reading(n - 1),
            _ => {
                return Err(FormatError::Unprotect {
                    address: addr,
                    reason: "entry not protected for read",
                })
            }
        };
        inner.stats.unprotects += 1;
        drop(inner);
        self.evict_if_needed()
    }

    /// Relocate an unprotected entry to `new_addr`, loading it first if
    /// needed. The entry is marked dirty at its new address.
    pub fn move_entry<T: CacheEntry>(
        &self,
        old_addr: Address,
        new_addr: Address,
        ctx: &T::Context,
    ) -> Result<(), FormatError> {
        self.fetch::<T>(old_addr, ctx)?;
        let mut inner = self.inner.borrow_mut();
        if inner.slots.contains_key(&new_addr) {
            return Err(FormatError::Protect {
                address: new_addr,
                reason: "destination already cached",
            });
        }
        match inner.slots.get(&old_addr) {
            Some(slot) if slot.state == PinState::Idle => {}
            _ => {
                return Err(FormatError::Protect {
                    address: old_addr,
                    reason: "cannot move a protected entry",
                })
            }
        }
        if let Some(mut slot) = inner.slots.remove(&old_addr) {
            slot.dirty = true;
            inner.slots.insert(new_addr, slot);
        }
        debug!(old_addr, new_addr, kind = T::KIND, "cache.move");
        Ok(())
    }

    fn evict_if_needed(&self) -> Result<(), FormatError> {
        loop {
            let mut inner = self.inner.borrow_mut();
            if inner.current_bytes <= inner.max_bytes {
                return Ok(());
            }
            let victim = inner
                .slots
                .iter()
                .filter(|(_, s)| s.state == PinState::Idle)
                .min_by_key(|(_, s)| s.last_access)
                .map(|(&a, _)| a);
            let Some(addr) = victim else {
                return Ok(());
            };
            let Some(slot) = inner.slots.remove(&addr) else {
                return Ok(());
            };
            inner.current_bytes -= slot.approx_size;
            inner.stats.evictions += 1;
            drop(inner);
            if slot.dirty {
                if let Some(entry) = &slot.entry {
                    entry.flush_to(&mut self.space.borrow_mut(), addr, self.sizes)?;
                }
            }
            trace!(addr, kind = slot.kind, "cache.evict");
        }
    }

    /// Write every dirty entry to file space.
    ///
    /// Fails if any entry is still protected for write.
    pub fn flush(&self) -> Result<(), FormatError> {
        let mut inner = self.inner.borrow_mut();
        let mut addrs: Vec<Address> = inner.slots.keys().copied().collect();
        addrs.sort_unstable();
        let mut space = self.space.borrow_mut();
        let mut written = 0usize;
        for addr in addrs {
            let Some(slot) = inner.slots.get_mut(&addr) else {
                continue;
            };
            if !slot.dirty {
                continue;
            }
            let Some(entry) = &slot.entry else {
                return Err(FormatError::Unprotect {
                    address: addr,
                    reason: "flush while entry protected for write",
                });
            };
            entry.flush_to(&mut space, addr, self.sizes)?;
            slot.dirty = false;
            written += 1;
        }
        debug!(written, "cache.flush");
        Ok(())
    }

    /// Flush everything and hand back the file space.
    pub fn into_space(self) -> Result<FileSpace, FormatError> {
        self.flush()?;
        Ok(self.space.into_inner())
    }
}

impl fmt::Debug for MetadataCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("MetadataCache")
            .field("entries", &inner.slots.len())
            .field("current_bytes", &inner.current_bytes)
            .field("max_bytes", &inner.max_bytes)
            .field("stats", &inner.stats)
            .finish()
    }
}

/// Restores the previous tag when dropped.
pub struct TagScope<'c> {
    cache: &'c MetadataCache,
    previous: Option<EntryTag>,
}

impl Drop for TagScope<'_> {
    fn drop(&mut self) {
        self.cache.inner.borrow_mut().tag = self.previous;
    }
}

/// Exclusive handle on a protected cache entry.
///
/// Dropping the guard unprotects with the flags set so far; release
/// failures on that path are logged.
pub struct Protected<'c, T: CacheEntry> {
    cache: &'c MetadataCache,
    addr: Address,
    entry: Option<T>,
    flags: UnprotectFlags,
}

impl<'c, T: CacheEntry> Protected<'c, T> {
    /// File address of the entry.
    pub fn address(&self) -> Address {
        self.addr
    }

    /// The cache the entry belongs to.
    pub fn cache(&self) -> &'c MetadataCache {
        self.cache
    }

    /// Mark the entry as modified.
    pub fn mark_dirty(&mut self) {
        self.flags.dirty = true;
    }

    /// Remove the entry on release, optionally returning its file space.
    pub fn mark_deleted(&mut self, free_file_space: bool) {
        self.flags.deleted = true;
        self.flags.free_file_space = free_file_space;
    }

    /// Unprotect now, reporting failure.
    pub fn release(mut self) -> Result<(), FormatError> {
        match self.entry.take() {
            Some(entry) => self.cache.unprotect_write(self.addr, entry, self.flags),
            None => Ok(()),
        }
    }
}

impl<T: CacheEntry> Deref for Protected<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.entry {
            Some(entry) => entry,
            None => unreachable!("protected entry used after release"),
        }
    }
}

impl<T: CacheEntry> DerefMut for Protected<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.entry {
            Some(entry) => entry,
            None => unreachable!("protected entry used after release"),
        }
    }
}

impl<T: CacheEntry> Drop for Protected<'_, T> {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            if let Err(e) = self.cache.unprotect_write(self.addr, entry, self.flags) {
                error!(addr = self.addr, kind = T::KIND, error = %e, "cache.unprotect_failed");
            }
        }
    }
}

/// Shared read-only handle on a protected cache entry.
pub struct ProtectedRead<'c, T: CacheEntry> {
    cache: &'c MetadataCache,
    addr: Address,
    entry: Option<Rc<T>>,
}

impl<T: CacheEntry> ProtectedRead<'_, T> {
    /// File address of the entry.
    pub fn address(&self) -> Address {
        self.addr
    }

    /// Unprotect now, reporting failure.
    pub fn release(mut self) -> Result<(), FormatError> {
        match self.entry.take() {
            Some(entry) => {
                drop(entry);
                self.cache.unprotect_read(self.addr)
            }
            None => Ok(()),
        }
    }
}

impl<T: CacheEntry> Deref for ProtectedRead<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.entry {
            Some(entry) => entry,
            None => unreachable!("protected entry used after release"),
        }
    }
}

impl<T: CacheEntry> Drop for ProtectedRead<'_, T> {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            drop(entry);
            if let Err(e) = self.cache.unprotect_read(self.addr) {
                error!(addr = self.addr, kind = T::KIND, error = %e, "cache.unprotect_failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Blob(Vec<u8>);

    impl CacheEntry for Blob {
        type Context = usize;
        const KIND: &'static str = "blob";

        fn load(
            space: &FileSpace,
            addr: Address,
            _sizes: FileSizes,
            len: &usize,
        ) -> Result<Self, FormatError> {
            Ok(Blob(space.read(addr, *len)?.to_vec()))
        }

        fn flush(
            &self,
            space: &mut FileSpace,
            addr: Address,
            _sizes: FileSizes,
        ) -> Result<(), FormatError> {
            space.write(addr, &self.0)
        }

        fn disk_size(&self, _sizes: FileSizes) -> u64 {
            self.0.len() as u64
        }
    }

    fn cache() -> MetadataCache {
        MetadataCache::new(FileSpace::new(0), FileSizes::default())
    }

    #[test]
    fn write_guard_flushes_dirty_content() {
        let cache = cache();
        let addr = cache.allocate(4).unwrap();
        cache.insert(addr, Blob(vec![0; 4])).unwrap();
        {
            let mut blob = cache.protect_write::<Blob>(addr, &4).unwrap();
            blob.0[0] = 7;
            blob.mark_dirty();
            blob.release().unwrap();
        }
        cache.flush().unwrap();
        assert_eq!(cache.read_raw(addr, 4).unwrap(), vec![7, 0, 0, 0]);
        let stats = cache.stats();
        assert_eq!(stats.protects, stats.unprotects);
    }

    #[test]
    fn readers_share_writers_exclude() {
        let cache = cache();
        let addr = cache.allocate(2).unwrap();
        cache.insert(addr, Blob(vec![1, 2])).unwrap();
        let a = cache.protect_read::<Blob>(addr, &2).unwrap();
        let b = cache.protect_read::<Blob>(addr, &2).unwrap();
        assert_eq!(a.0, b.0);
        let err = cache.protect_write::<Blob>(addr, &2).err().unwrap();
        assert!(matches!(err, FormatError::Protect { .. }));
        drop(a);
        drop(b);
        assert!(!cache.is_protected(addr));
        let w = cache.protect_write::<Blob>(addr, &2).unwrap();
        assert!(cache.protect_read::<Blob>(addr, &2).is_err());
        drop(w);
        assert_eq!(cache.stats().outstanding(), 0);
    }

    #[test]
    fn load_miss_then_hit() {
        let mut space = FileSpace::new(0);
        let addr = space.allocate(3).unwrap();
        space.write(addr, &[9, 8, 7]).unwrap();
        let cache = MetadataCache::new(space, FileSizes::default());
        assert_eq!(cache.protect_read::<Blob>(addr, &3).unwrap().0, vec![9, 8, 7]);
        drop(cache.protect_read::<Blob>(addr, &3).unwrap());
        let stats = cache.stats();
        assert_eq!((stats.misses, stats.hits), (1, 1));
    }

    #[test]
    fn deleted_entry_frees_space() {
        let cache = cache();
        let a = cache.allocate(8).unwrap();
        let _b = cache.allocate(8).unwrap();
        cache.insert(a, Blob(vec![0; 8])).unwrap();
        let mut blob = cache.protect_write::<Blob>(a, &8).unwrap();
        blob.mark_deleted(true);
        blob.release().unwrap();
        assert!(!cache.contains(a));
        assert_eq!(cache.allocate(8).unwrap(), a);
    }

    #[test]
    fn injected_protect_failure() {
        let cache = cache();
        let addr = cache.allocate(1).unwrap();
        cache.insert(addr, Blob(vec![5])).unwrap();
        cache.inject_protect_failure(0);
        let err = cache.protect_read::<Blob>(addr, &1).err().unwrap();
        assert_eq!(
            err,
            FormatError::Protect {
                address: addr,
                reason: "injected failure"
            }
        );
        assert!(cache.protect_read::<Blob>(addr, &1).is_ok());
    }

    #[test]
    fn eviction_writes_back_dirty_entries() {
        let cache = MetadataCache::with_capacity(FileSpace::new(0), FileSizes::default(), 150);
        let a = cache.allocate(16).unwrap();
        let b = cache.allocate(16).unwrap();
        cache.insert(a, Blob(vec![1; 16])).unwrap();
        cache.insert(b, Blob(vec![2; 16])).unwrap();
        assert!(!cache.contains(a));
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(cache.read_raw(a, 16).unwrap(), vec![1; 16]);
    }

    #[test]
    fn move_entry_relocates() {
        let cache = cache();
        let a = cache.allocate(2).unwrap();
        let b = cache.allocate(2).unwrap();
        cache.insert(a, Blob(vec![3, 4])).unwrap();
        cache.move_entry::<Blob>(a, b, &2).unwrap();
        assert!(!cache.contains(a));
        cache.flush().unwrap();
        assert_eq!(cache.read_raw(b, 2).unwrap(), vec![3, 4]);
    }

    #[test]
    fn tag_scope_marks_inserted_entries() {
        let cache = cache();
        let a = cache.allocate(1).unwrap();
        let b = cache.allocate(1).unwrap();
        cache.insert(a, Blob(vec![0])).unwrap();
        {
            let _scope = cache.tag_scope(EntryTag::Copied);
            cache.insert(b, Blob(vec![0])).unwrap();
        }
        assert_eq!(cache.tagged(EntryTag::Copied), vec![b]);
    }
}
