//! HDF5 Symbol Table Message and Symbol Table Node (SNOD).

use std::cmp::Ordering;

use crate::encoding::{is_defined, Address, Decoder, Encoder, FileSizes};
use crate::entry::{entry_size, SymbolTableEntry};
use crate::error::FormatError;
use crate::file_space::FileSpace;
use crate::local_heap::LocalHeap;
use crate::metadata_cache::CacheEntry;

const SNOD_SIGNATURE: &[u8; 4] = b"SNOD";
const SNOD_VERSION: u8 = 1;
const SNOD_HEADER_SIZE: usize = 8;

/// Symbol Table message (type 0x0011) found in v1 group object headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolTableMessage {
    /// Address of B-tree v1 (type 0) for this group.
    pub btree_address: Address,
    /// Address of the local heap for this group.
    pub local_heap_address: Address,
}

impl SymbolTableMessage {
    /// Encoded size: two addresses.
    pub fn encoded_size(sizes: FileSizes) -> usize {
        2 * sizes.sizeof_addr()
    }

    /// Parse a Symbol Table message from raw message data bytes.
    pub fn parse(data: &[u8], sizes: FileSizes) -> Result<SymbolTableMessage, FormatError> {
        let mut d = Decoder::new(data, sizes);
        let btree_address = d.address()?;
        let local_heap_address = d.address()?;
        Ok(SymbolTableMessage {
            btree_address,
            local_heap_address,
        })
    }

    /// Append the message body.
    pub fn encode(&self, e: &mut Encoder) {
        e.address(self.btree_address);
        e.address(self.local_heap_address);
    }

    /// Serialize the message body.
    pub fn to_bytes(&self, sizes: FileSizes) -> Vec<u8> {
        let mut e = Encoder::with_capacity(sizes, Self::encoded_size(sizes));
        self.encode(&mut e);
        e.into_inner()
    }

    /// Both addresses are defined.
    pub fn is_complete(&self) -> bool {
        is_defined(self.btree_address) && is_defined(self.local_heap_address)
    }
}

/// Outcome of a binary search over a node's entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchResult {
    /// Whether an entry with the name exists.
    pub found: bool,
    /// Index of the match, or where the name would be inserted.
    pub index: usize,
}

/// Encoded size of a node holding up to `2 * sym_leaf_k` entries.
pub fn node_size(sizes: FileSizes, sym_leaf_k: u16) -> usize {
    SNOD_HEADER_SIZE + 2 * sym_leaf_k as usize * entry_size(sizes)
}

/// A symbol table node: a leaf of the group B-tree.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolTableNode {
    /// Live entries, sorted by name.
    pub entries: Vec<SymbolTableEntry>,
    sym_leaf_k: u16,
}

impl SymbolTableNode {
    /// Empty node sized for `2 * sym_leaf_k` entries.
    pub fn new(sym_leaf_k: u16) -> Self {
        Self {
            entries: Vec::with_capacity(2 * sym_leaf_k as usize),
            sym_leaf_k,
        }
    }

    /// Build a node from already sorted entries.
    pub fn from_entries(sym_leaf_k: u16, entries: Vec<SymbolTableEntry>) -> Self {
        Self {
            entries,
            sym_leaf_k,
        }
    }

    /// The K this node was sized with.
    pub fn sym_leaf_k(&self) -> u16 {
        self.sym_leaf_k
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        2 * self.sym_leaf_k as usize
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the node has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Binary search by name; names are compared bytewise.
    pub fn search(&self, heap: &LocalHeap, name: &str) -> Result<SearchResult, FormatError> {
        let (mut lo, mut hi) = (0, self.entries.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let candidate = heap.read_string(self.entries[mid].name_offset)?;
            match name.cmp(candidate) {
                Ordering::Less => hi = mid,
                Ordering::Greater => lo = mid + 1,
                Ordering::Equal => {
                    return Ok(SearchResult {
                        found: true,
                        index: mid,
                    })
                }
            }
        }
        Ok(SearchResult {
            found: false,
            index: lo,
        })
    }

    /// Parse a Symbol Table Node from the start of `data`.
    pub fn parse(
        data: &[u8],
        sizes: FileSizes,
        sym_leaf_k: u16,
    ) -> Result<SymbolTableNode, FormatError> {
        let mut d = Decoder::new(data, sizes);
        d.signature(SNOD_SIGNATURE, FormatError::InvalidSymbolTableNodeSignature)?;
        let version = d.u8()?;
        if version != SNOD_VERSION {
            return Err(FormatError::InvalidSymbolTableNodeVersion(version));
        }
        d.skip(1)?;
        let num_symbols = d.u16()? as usize;
        if num_symbols > 2 * sym_leaf_k as usize {
            return Err(FormatError::Corrupt(format!(
                "symbol table node holds {num_symbols} entries, capacity {}",
                2 * sym_leaf_k as usize
            )));
        }
        let entries = SymbolTableEntry::decode_vec(&mut d, num_symbols)?;
        Ok(SymbolTableNode {
            entries,
            sym_leaf_k,
        })
    }

    /// Serialize the node at its full fixed size, empty slots included.
    pub fn to_bytes(&self, sizes: FileSizes) -> Vec<u8> {
        let size = node_size(sizes, self.sym_leaf_k);
        let mut e = Encoder::with_capacity(sizes, size);
        e.bytes(SNOD_SIGNATURE);
        e.u8(SNOD_VERSION);
        e.u8(0);
        e.u16(self.entries.len() as u16);
        SymbolTableEntry::encode_vec(&self.entries, &mut e, sizes);
        for _ in self.entries.len()..self.capacity() {
            SymbolTableEntry::encode(None, &mut e, sizes);
        }
        e.into_inner()
    }
}

impl CacheEntry for SymbolTableNode {
    type Context = u16;
    const KIND: &'static str = "symbol table node";

    fn load(
        space: &FileSpace,
        addr: Address,
        sizes: FileSizes,
        sym_leaf_k: &u16,
    ) -> Result<Self, FormatError> {
        let data = space.read(addr, node_size(sizes, *sym_leaf_k))?;
        SymbolTableNode::parse(data, sizes, *sym_leaf_k)
    }

    fn flush(
        &self,
        space: &mut FileSpace,
        addr: Address,
        sizes: FileSizes,
    ) -> Result<(), FormatError> {
        space.write(addr, &self.to_bytes(sizes))
    }

    fn disk_size(&self, sizes: FileSizes) -> u64 {
        node_size(sizes, self.sym_leaf_k) as u64
    }
}
