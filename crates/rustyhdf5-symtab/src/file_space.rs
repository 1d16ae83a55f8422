//! In-memory file image with a free-space manager.
//!
//! Space is handed out first-fit from a sorted list of free extents and
//! otherwise taken from the end of the allocated region. Freed extents are
//! coalesced with their neighbours; an extent that reaches the end of the
//! allocated region shrinks it instead.

use tracing::trace;

use crate::encoding::Address;
use crate::error::FormatError;

/// A contiguous run of free bytes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Extent {
    /// First free byte.
    pub start: Address,
    /// Number of free bytes.
    pub len: u64,
}

impl Extent {
    /// New extent.
    pub fn new(start: Address, len: u64) -> Self {
        Self { start, len }
    }

    /// One past the last byte.
    pub fn end(&self) -> Address {
        self.start + self.len
    }

    /// Absorb `other` if it starts exactly where this extent ends.
    pub fn coalesce_with(&mut self, other: &Extent) -> bool {
        if self.end() == other.start {
            self.len += other.len;
            true
        } else {
            false
        }
    }
}

/// Backing store for a file under construction or loaded from bytes.
#[derive(Debug, Clone, Default)]
pub struct FileSpace {
    image: Vec<u8>,
    eoa: u64,
    free: Vec<Extent>,
    fail_allocation_in: Option<u64>,
}

impl FileSpace {
    /// Empty file with the first `reserved` bytes already allocated.
    pub fn new(reserved: u64) -> Self {
        Self {
            image: vec![0; reserved as usize],
            eoa: reserved,
            free: Vec::new(),
            fail_allocation_in: None,
        }
    }

    /// Wrap existing bytes; everything is considered allocated.
    pub fn from_image(image: Vec<u8>) -> Self {
        let eoa = image.len() as u64;
        Self {
            image,
            eoa,
            free: Vec::new(),
            fail_allocation_in: None,
        }
    }

    /// End of the allocated region.
    pub fn eoa(&self) -> u64 {
        self.eoa
    }

    /// Free extents in address order.
    pub fn free_extents(&self) -> &[Extent] {
        &self.free
    }

    /// Total bytes sitting in free extents.
    pub fn free_bytes(&self) -> u64 {
        self.free.iter().map(|e| e.len).sum()
    }

    /// Make the allocation `n` calls from now fail (`0` fails the next one).
    pub fn inject_allocation_failure(&mut self, n: u64) {
        self.fail_allocation_in = Some(n);
    }

    /// Drop a pending injected failure.
    pub fn clear_injected_failure(&mut self) {
        self.fail_allocation_in = None;
    }

    /// Reserve `size` bytes of file space.
    pub fn allocate(&mut self, size: u64) -> Result<Address, FormatError> {
        if let Some(n) = self.fail_allocation_in {
            if n == 0 {
                self.fail_allocation_in = None;
                return Err(FormatError::AllocationFailed { size });
            }
            self.fail_allocation_in = Some(n - 1);
        }
        if size == 0 {
            return Err(FormatError::InvalidArgument(
                "zero-sized allocation".into(),
            ));
        }

        if let Some(pos) = self.free.iter().position(|e| e.len >= size) {
            let extent = &mut self.free[pos];
            let addr = extent.start;
            extent.start += size;
            extent.len -= size;
            if extent.len == 0 {
                self.free.remove(pos);
            }
            trace!(addr, size, "space.alloc.reuse");
            return Ok(addr);
        }

        let addr = self.eoa;
        self.eoa = addr
            .checked_add(size)
            .ok_or(FormatError::AllocationFailed { size })?;
        self.image.resize(self.eoa as usize, 0);
        trace!(addr, size, "space.alloc.extend");
        Ok(addr)
    }

    /// Return `size` bytes at `addr` to the free list.
    pub fn free(&mut self, addr: Address, size: u64) {
        if size == 0 {
            return;
        }
        trace!(addr, size, "space.free");
        let mut extent = Extent::new(addr, size);
        let pos = self.free.partition_point(|e| e.start < addr);
        if pos < self.free.len() && extent.coalesce_with(&self.free[pos]) {
            self.free.remove(pos);
        }
        if pos > 0 && self.free[pos - 1].coalesce_with(&extent) {
            extent = self.free.remove(pos - 1);
            self.insert_or_trim(pos - 1, extent);
        } else {
            self.insert_or_trim(pos, extent);
        }
    }

    fn insert_or_trim(&mut self, pos: usize, extent: Extent) {
        if extent.end() == self.eoa {
            self.eoa = extent.start;
            self.image.truncate(self.eoa as usize);
        } else {
            self.free.insert(pos, extent);
        }
    }

    /// Borrow `len` bytes at `addr`.
    pub fn read(&self, addr: Address, len: usize) -> Result<&[u8], FormatError> {
        let start = addr as usize;
        let end = start.saturating_add(len);
        if end > self.image.len() {
            return Err(FormatError::UnexpectedEof {
                expected: end,
                available: self.image.len(),
            });
        }
        Ok(&self.image[start..end])
    }

    /// Overwrite bytes at `addr`; the range must be allocated.
    pub fn write(&mut self, addr: Address, data: &[u8]) -> Result<(), FormatError> {
        let start = addr as usize;
        let end = start.saturating_add(data.len());
        if end as u64 > self.eoa {
            return Err(FormatError::UnexpectedEof {
                expected: end,
                available: self.eoa as usize,
            });
        }
        self.image[start..end].copy_from_slice(data);
        Ok(())
    }

    /// Take the image, truncated to the allocated region.
    pub fn into_image(mut self) -> Vec<u8> {
        self.image.truncate(self.eoa as usize);
        self.image
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_extends_then_reuses() {
        let mut space = FileSpace::new(16);
        let a = space.allocate(32).unwrap();
        let b = space.allocate(32).unwrap();
        assert_eq!((a, b), (16, 48));
        space.free(a, 32);
        assert_eq!(space.free_extents(), &[Extent::new(16, 32)]);
        assert_eq!(space.allocate(8).unwrap(), 16);
        assert_eq!(space.free_extents(), &[Extent::new(24, 24)]);
    }

    #[test]
    fn free_coalesces_neighbours() {
        let mut space = FileSpace::new(0);
        let a = space.allocate(8).unwrap();
        let b = space.allocate(8).unwrap();
        let c = space.allocate(8).unwrap();
        let _d = space.allocate(8).unwrap();
        space.free(a, 8);
        space.free(c, 8);
        space.free(b, 8);
        assert_eq!(space.free_extents(), &[Extent::new(0, 24)]);
    }

    #[test]
    fn free_at_end_shrinks() {
        let mut space = FileSpace::new(0);
        let a = space.allocate(8).unwrap();
        let b = space.allocate(8).unwrap();
        space.free(a, 8);
        space.free(b, 8);
        assert_eq!(space.eoa(), 0);
        assert!(space.free_extents().is_empty());
    }

    #[test]
    fn injected_failure_fires_once() {
        let mut space = FileSpace::new(0);
        space.inject_allocation_failure(1);
        assert!(space.allocate(8).is_ok());
        assert_eq!(
            space.allocate(8).unwrap_err(),
            FormatError::AllocationFailed { size: 8 }
        );
        assert!(space.allocate(8).is_ok());
    }

    #[test]
    fn write_outside_allocation_fails() {
        let mut space = FileSpace::new(4);
        assert!(space.write(2, &[1, 2]).is_ok());
        assert!(space.write(3, &[1, 2]).is_err());
        assert_eq!(space.read(2, 2).unwrap(), &[1, 2]);
    }
}
