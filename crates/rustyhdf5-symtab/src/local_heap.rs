//! HDF5 local heap: the per-group store of link names and soft-link values.
//!
//! A heap is a prefix (`HEAP`, version 0, data segment size, free-list head,
//! data segment address) plus a data segment. Objects are null-terminated
//! strings placed at 8-byte aligned offsets. Free space is tracked in-band:
//! each free block starts with the offset of the next free block and its own
//! size, both `length_size` wide, so blocks smaller than two lengths cannot
//! be tracked and are lost when freed.

use tracing::{debug, trace};

use crate::encoding::{Address, Decoder, Encoder, FileSizes};
use crate::error::FormatError;
use crate::file_space::FileSpace;
use crate::metadata_cache::{CacheEntry, MetadataCache};

const HEAP_SIGNATURE: &[u8; 4] = b"HEAP";
const HEAP_VERSION: u8 = 0;

/// Free-list head value meaning "no free blocks".
const FREE_NULL: u64 = 1;

/// Segments at or below this size are never shrunk.
const MIN_HEAP: u64 = 128;

/// Round up to the heap's 8-byte object alignment.
pub fn align(n: u64) -> u64 {
    (n + 7) & !7
}

fn sizeof_free(sizes: FileSizes) -> u64 {
    2 * sizes.sizeof_size() as u64
}

/// Bytes of the heap prefix.
pub fn prefix_size(sizes: FileSizes) -> u64 {
    8 + 2 * sizes.sizeof_size() as u64 + sizes.sizeof_addr() as u64
}

/// A free block inside the data segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeBlock {
    /// Offset within the data segment.
    pub offset: u64,
    /// Size in bytes.
    pub size: u64,
}

impl FreeBlock {
    fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// A loaded local heap.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalHeap {
    /// File address of the data segment.
    pub data_segment_address: Address,
    data: Vec<u8>,
    /// Most recently freed first.
    free_list: Vec<FreeBlock>,
    stored_bytes: u64,
}

impl LocalHeap {
    /// Create an empty heap whose data segment holds at least `size_hint`
    /// bytes, returning the prefix address.
    pub fn create(cache: &MetadataCache, size_hint: u64) -> Result<Address, FormatError> {
        let sizes = cache.sizes();
        let mut size = align(size_hint);
        if size > 0 && size < sizeof_free(sizes) {
            size = sizeof_free(sizes);
        }
        let prefix = prefix_size(sizes);
        let addr = cache.allocate(prefix + size)?;
        let heap = LocalHeap {
            data_segment_address: addr + prefix,
            data: vec![0; size as usize],
            free_list: if size > 0 {
                vec![FreeBlock { offset: 0, size }]
            } else {
                Vec::new()
            },
            stored_bytes: 0,
        };
        cache.insert(addr, heap)?;
        debug!(addr, size, "heap.create");
        Ok(addr)
    }

    /// Delete the heap at `addr` and return all of its file space.
    pub fn delete(cache: &MetadataCache, addr: Address) -> Result<(), FormatError> {
        let mut heap = cache.protect_write::<LocalHeap>(addr, &())?;
        heap.mark_deleted(true);
        heap.release()?;
        debug!(addr, "heap.delete");
        Ok(())
    }

    /// Size of the data segment.
    pub fn data_segment_size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Bytes sitting in the free list.
    pub fn free_bytes(&self) -> u64 {
        self.free_list.iter().map(|b| b.size).sum()
    }

    /// Free blocks, most recently freed first.
    pub fn free_blocks(&self) -> &[FreeBlock] {
        &self.free_list
    }

    /// Bytes of live objects.
    ///
    /// Exact for objects inserted since the heap was created or loaded;
    /// objects that were already on disk count with their alignment padding.
    pub fn stored_bytes(&self) -> u64 {
        self.stored_bytes
    }

    /// Borrow the data segment from `offset` to its end.
    pub fn offset_into(&self, offset: u64) -> Result<&[u8], FormatError> {
        if offset >= self.data_segment_size() {
            return Err(FormatError::UnexpectedEof {
                expected: offset as usize + 1,
                available: self.data.len(),
            });
        }
        Ok(&self.data[offset as usize..])
    }

    /// Read the null-terminated string at `offset`.
    pub fn read_string(&self, offset: u64) -> Result<&str, FormatError> {
        let tail = self.offset_into(offset)?;
        let end = tail
            .iter()
            .position(|&b| b == 0)
            .ok_or(FormatError::UnexpectedEof {
                expected: self.data.len() + 1,
                available: self.data.len(),
            })?;
        core::str::from_utf8(&tail[..end]).map_err(|_| {
            FormatError::Corrupt(format!("local heap string at {offset} is not UTF-8"))
        })
    }

    /// Store `name` with its terminator, returning its offset.
    pub fn insert_str(&mut self, cache: &MetadataCache, name: &str) -> Result<u64, FormatError> {
        let mut buf = Vec::with_capacity(name.len() + 1);
        buf.extend_from_slice(name.as_bytes());
        buf.push(0);
        self.insert(cache, &buf)
    }

    /// Store raw bytes, returning their offset.
    pub fn insert(&mut self, cache: &MetadataCache, bytes: &[u8]) -> Result<u64, FormatError> {
        let sizes = cache.sizes();
        let min_free = sizeof_free(sizes);
        let need = align(bytes.len() as u64).max(8);

        let mut offset = None;
        let mut last: Option<usize> = None;
        for i in 0..self.free_list.len() {
            let block = self.free_list[i];
            if block.size > need && block.size - need >= min_free {
                offset = Some(block.offset);
                self.free_list[i].offset += need;
                self.free_list[i].size -= need;
                break;
            } else if block.size == need {
                offset = Some(block.offset);
                self.free_list.remove(i);
                break;
            } else if last.map_or(true, |j| self.free_list[j].offset < block.offset) {
                last = Some(i);
            }
        }

        let offset = match offset {
            Some(offset) => offset,
            None => self.grow(cache, need, last)?,
        };

        let start = offset as usize;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        self.data[start + bytes.len()..start + need as usize].fill(0);
        self.stored_bytes += bytes.len() as u64;
        trace!(offset, len = bytes.len(), "heap.insert");
        Ok(offset)
    }

    fn grow(
        &mut self,
        cache: &MetadataCache,
        need: u64,
        last: Option<usize>,
    ) -> Result<u64, FormatError> {
        let sizes = cache.sizes();
        let min_free = sizeof_free(sizes);
        let old_size = self.data_segment_size();
        let trailing = last.filter(|&j| self.free_list[j].end() == old_size);

        let mut need_more = need.max(old_size);
        if trailing.is_none() && need_more < need + min_free {
            need_more = need;
        }
        let new_size = old_size + need_more;
        if sizes.sizeof_size() < 8 && new_size >= 1u64 << (8 * sizes.sizeof_size()) {
            return Err(FormatError::AllocationFailed { size: new_size });
        }

        let new_addr = cache.allocate(new_size)?;
        if old_size > 0 {
            cache.free(self.data_segment_address, old_size);
        }
        self.data_segment_address = new_addr;
        self.data.resize(new_size as usize, 0);

        let offset = match trailing {
            Some(j) => {
                let offset = self.free_list[j].offset;
                self.free_list[j].offset += need;
                self.free_list[j].size += need_more - need;
                if self.free_list[j].size < min_free {
                    self.free_list.remove(j);
                }
                offset
            }
            None => {
                if need_more - need >= min_free {
                    self.free_list.insert(
                        0,
                        FreeBlock {
                            offset: old_size + need,
                            size: need_more - need,
                        },
                    );
                }
                old_size
            }
        };
        debug!(old_size, new_size, addr = new_addr, "heap.grow");
        Ok(offset)
    }

    /// Release `size` bytes at `offset`.
    pub fn remove(
        &mut self,
        cache: &MetadataCache,
        offset: u64,
        size: u64,
    ) -> Result<(), FormatError> {
        if size == 0 || offset + size > self.data_segment_size() {
            return Err(FormatError::Corrupt(format!(
                "local heap object {offset}+{size} outside data segment of {} bytes",
                self.data_segment_size()
            )));
        }
        self.stored_bytes = self.stored_bytes.saturating_sub(size);
        let size = align(size);
        trace!(offset, size, "heap.remove");

        for i in 0..self.free_list.len() {
            let block = self.free_list[i];
            if offset + size == block.offset {
                let mut merged = FreeBlock {
                    offset,
                    size: size + block.size,
                };
                let left = self
                    .free_list
                    .iter()
                    .enumerate()
                    .find(|&(j, b)| j != i && b.end() == offset)
                    .map(|(j, _)| j);
                if let Some(j) = left {
                    merged.offset = self.free_list[j].offset;
                    merged.size += self.free_list[j].size;
                }
                return self.replace_merged(cache, i, left, merged);
            } else if block.end() == offset {
                let mut merged = FreeBlock {
                    offset: block.offset,
                    size: block.size + size,
                };
                let right = self
                    .free_list
                    .iter()
                    .enumerate()
                    .find(|&(j, b)| j != i && b.offset == merged.end())
                    .map(|(j, _)| j);
                if let Some(j) = right {
                    merged.size += self.free_list[j].size;
                }
                return self.replace_merged(cache, i, right, merged);
            }
        }

        if size < sizeof_free(cache.sizes()) {
            return Ok(());
        }
        let block = FreeBlock { offset, size };
        self.free_list.insert(0, block);
        if block.end() == self.data_segment_size() && 2 * size > self.data_segment_size() {
            self.minimize(cache)?;
        }
        Ok(())
    }

    fn replace_merged(
        &mut self,
        cache: &MetadataCache,
        keep: usize,
        absorbed: Option<usize>,
        merged: FreeBlock,
    ) -> Result<(), FormatError> {
        self.free_list[keep] = merged;
        if let Some(j) = absorbed {
            self.free_list.remove(j);
        }
        if merged.end() == self.data_segment_size() && 2 * merged.size > self.data_segment_size()
        {
            self.minimize(cache)?;
        }
        Ok(())
    }

    /// Shrink the data segment when a large free block sits at its end.
    fn minimize(&mut self, cache: &MetadataCache) -> Result<(), FormatError> {
        let min_free = sizeof_free(cache.sizes());
        let old_size = self.data_segment_size();
        let Some(j) = self.free_list.iter().position(|b| b.end() == old_size) else {
            return Ok(());
        };
        let last = self.free_list[j];
        if last.size < old_size / 2 || old_size <= MIN_HEAP {
            return Ok(());
        }

        let mut new_size = old_size;
        while new_size > MIN_HEAP && new_size >= last.offset + min_free {
            new_size /= 2;
        }
        if new_size < last.offset + min_free {
            if self.free_list.len() == 1 {
                new_size *= 2;
                self.free_list[j].size = align(new_size - last.offset);
                new_size = self.free_list[j].end();
            } else {
                new_size = last.offset;
                self.free_list.remove(j);
            }
        } else {
            self.free_list[j].size = align(new_size - last.offset);
            new_size = self.free_list[j].end();
        }

        if new_size < old_size {
            cache.free(self.data_segment_address + new_size, old_size - new_size);
            self.data.truncate(new_size as usize);
            debug!(old_size, new_size, "heap.shrink");
        }
        Ok(())
    }

    /// Parse a heap prefix and data segment at `addr`.
    pub fn parse(space: &FileSpace, addr: Address, sizes: FileSizes) -> Result<LocalHeap, FormatError> {
        let prefix = space.read(addr, prefix_size(sizes) as usize)?;
        let mut d = Decoder::new(prefix, sizes);
        d.signature(HEAP_SIGNATURE, FormatError::InvalidLocalHeapSignature)?;
        let version = d.u8()?;
        if version != HEAP_VERSION {
            return Err(FormatError::InvalidLocalHeapVersion(version));
        }
        d.skip(3)?;
        let data_segment_size = d.length()?;
        let free_list_head = d.length()?;
        let data_segment_address = d.address()?;

        let data = space
            .read(data_segment_address, data_segment_size as usize)?
            .to_vec();

        let mut free_list = Vec::new();
        let mut next = free_list_head;
        let limit = data.len() / 8 + 1;
        while next != FREE_NULL && next != u64::MAX >> (64 - 8 * sizes.sizeof_size()) {
            if free_list.len() > limit {
                return Err(FormatError::Corrupt("local heap free list loops".into()));
            }
            if next
                .checked_add(sizeof_free(sizes))
                .map_or(true, |end| end > data_segment_size)
            {
                return Err(FormatError::Corrupt(format!(
                    "local heap free block at {next} outside data segment"
                )));
            }
            let mut fd = Decoder::new(&data[next as usize..], sizes);
            let following = fd.length()?;
            let size = fd.length()?;
            if next.checked_add(size).map_or(true, |end| end > data_segment_size) {
                return Err(FormatError::Corrupt(format!(
                    "local heap free block {next}+{size} outside data segment"
                )));
            }
            free_list.push(FreeBlock { offset: next, size });
            next = following;
        }

        let free: u64 = free_list.iter().map(|b| b.size).sum();
        Ok(LocalHeap {
            data_segment_address,
            stored_bytes: data_segment_size.saturating_sub(free),
            data,
            free_list,
        })
    }
}

impl CacheEntry for LocalHeap {
    type Context = ();
    const KIND: &'static str = "local heap";

    fn load(
        space: &FileSpace,
        addr: Address,
        sizes: FileSizes,
        _ctx: &(),
    ) -> Result<Self, FormatError> {
        LocalHeap::parse(space, addr, sizes)
    }

    fn flush(
        &self,
        space: &mut FileSpace,
        addr: Address,
        sizes: FileSizes,
    ) -> Result<(), FormatError> {
        let mut image = self.data.clone();
        for (i, block) in self.free_list.iter().enumerate() {
            let next = self.free_list.get(i + 1).map_or(FREE_NULL, |b| b.offset);
            let mut e = Encoder::new(sizes);
            e.length(next);
            e.length(block.size);
            let start = block.offset as usize;
            image[start..start + e.len()].copy_from_slice(&e.into_inner());
        }
        space.write(self.data_segment_address, &image)?;

        let mut e = Encoder::with_capacity(sizes, prefix_size(sizes) as usize);
        e.bytes(HEAP_SIGNATURE);
        e.u8(HEAP_VERSION);
        e.zeros(3);
        e.length(self.data_segment_size());
        e.length(self.free_list.first().map_or(FREE_NULL, |b| b.offset));
        e.address(self.data_segment_address);
        space.write(addr, &e.into_inner())
    }

    fn disk_size(&self, sizes: FileSizes) -> u64 {
        prefix_size(sizes) + self.data_segment_size()
    }

    fn free_space(&self, space: &mut FileSpace, addr: Address, sizes: FileSizes) {
        if self.data_segment_address == addr + prefix_size(sizes) {
            space.free(addr, prefix_size(sizes) + self.data_segment_size());
        } else {
            space.free(addr, prefix_size(sizes));
            space.free(self.data_segment_address, self.data_segment_size());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(sizes: FileSizes) -> MetadataCache {
        MetadataCache::new(FileSpace::new(0), sizes)
    }

    #[test]
    fn create_then_insert_and_read() {
        let cache = cache(FileSizes::default());
        let addr = LocalHeap::create(&cache, 64).unwrap();
        let mut heap = cache.protect_write::<LocalHeap>(addr, &()).unwrap();
        assert_eq!(heap.insert_str(&cache, "").unwrap(), 0);
        let off = heap.insert_str(&cache, "alpha").unwrap();
        assert_eq!(off, 8);
        assert_eq!(heap.read_string(off).unwrap(), "alpha");
        assert_eq!(heap.read_string(0).unwrap(), "");
        assert_eq!(heap.stored_bytes(), 7);
    }

    #[test]
    fn heap_grows_when_full() {
        let cache = cache(FileSizes::default());
        let addr = LocalHeap::create(&cache, 24).unwrap();
        let mut heap = cache.protect_write::<LocalHeap>(addr, &()).unwrap();
        let names = ["a", "bb", "ccc", "dddd", "eeeee", "ffffff"];
        let offsets: Vec<u64> = names
            .iter()
            .map(|n| heap.insert_str(&cache, n).unwrap())
            .collect();
        assert!(heap.data_segment_size() >= 48);
        for (name, off) in names.iter().zip(offsets) {
            assert_eq!(heap.read_string(off).unwrap(), *name);
        }
    }

    #[test]
    fn remove_merges_neighbours() {
        let cache = cache(FileSizes::default());
        let addr = LocalHeap::create(&cache, 128).unwrap();
        let mut heap = cache.protect_write::<LocalHeap>(addr, &()).unwrap();
        let names = ["first_long_name", "secnd_long_name", "third_long_name", "forth_long_name"];
        let offs: Vec<u64> = names
            .iter()
            .map(|n| heap.insert_str(&cache, n).unwrap())
            .collect();
        assert_eq!(offs, vec![0, 16, 32, 48]);
        heap.remove(&cache, offs[0], 16).unwrap();
        heap.remove(&cache, offs[2], 16).unwrap();
        heap.remove(&cache, offs[1], 16).unwrap();
        assert_eq!(
            heap.free_blocks(),
            &[
                FreeBlock { offset: 0, size: 48 },
                FreeBlock { offset: 64, size: 64 }
            ]
        );
    }

    #[test]
    fn tiny_isolated_blocks_are_lost() {
        let cache = cache(FileSizes::default());
        let addr = LocalHeap::create(&cache, 64).unwrap();
        let mut heap = cache.protect_write::<LocalHeap>(addr, &()).unwrap();
        let _a = heap.insert_str(&cache, "a").unwrap();
        let b = heap.insert_str(&cache, "b").unwrap();
        let _c = heap.insert_str(&cache, "c").unwrap();
        let before = heap.free_bytes();
        heap.remove(&cache, b, 2).unwrap();
        assert_eq!(heap.free_bytes(), before);
    }

    #[test]
    fn remove_out_of_range_is_corrupt() {
        let cache = cache(FileSizes::default());
        let addr = LocalHeap::create(&cache, 32).unwrap();
        let mut heap = cache.protect_write::<LocalHeap>(addr, &()).unwrap();
        assert!(matches!(
            heap.remove(&cache, 30, 8),
            Err(FormatError::Corrupt(_))
        ));
    }

    #[test]
    fn flush_and_reload_preserves_strings_and_free_list() {
        let sizes = FileSizes::new(4, 4).unwrap();
        let cache = cache(sizes);
        let addr = LocalHeap::create(&cache, 64).unwrap();
        {
            let mut heap = cache.protect_write::<LocalHeap>(addr, &()).unwrap();
            heap.insert_str(&cache, "").unwrap();
            heap.insert_str(&cache, "dataset").unwrap();
            heap.mark_dirty();
        }
        let space = cache.into_space().unwrap();
        let heap = LocalHeap::parse(&space, addr, sizes).unwrap();
        assert_eq!(heap.read_string(8).unwrap(), "dataset");
        assert_eq!(heap.free_blocks(), &[FreeBlock { offset: 16, size: 48 }]);
    }

    #[test]
    fn parse_rejects_bad_signature() {
        let mut space = FileSpace::new(64);
        space.write(0, b"PEAH").unwrap();
        assert_eq!(
            LocalHeap::parse(&space, 0, FileSizes::default()).unwrap_err(),
            FormatError::InvalidLocalHeapSignature
        );
    }

    #[test]
    fn delete_returns_all_space() {
        let cache = cache(FileSizes::default());
        let addr = LocalHeap::create(&cache, 64).unwrap();
        {
            let mut heap = cache.protect_write::<LocalHeap>(addr, &()).unwrap();
            for i in 0..20 {
                heap.insert_str(&cache, &format!("name{i}")).unwrap();
            }
            heap.mark_dirty();
        }
        LocalHeap::delete(&cache, addr).unwrap();
        assert_eq!(cache.eoa(), 0);
    }
}
