//! Symbol table entries: the fixed-width records stored in symbol table
//! nodes and in the superblock's root entry.
//!
//! Layout: name offset (length), object header address (address), cache
//! type (`u32`), 4 reserved bytes, then a 16-byte scratch pad whose meaning
//! depends on the cache type.

use std::mem;

use tracing::trace;

use crate::encoding::{is_defined, Address, Decoder, Encoder, FileSizes, UNDEFINED_ADDRESS};
use crate::error::FormatError;
use crate::link::{Link, LinkTarget, ObjectType};
use crate::local_heap::LocalHeap;
use crate::metadata_cache::MetadataCache;
use crate::object_header::ObjectHeader;
use crate::symbol_table::SymbolTableMessage;

/// Size of the scratch pad.
pub const SCRATCH_SIZE: usize = 16;

const CACHE_NOTHING: u32 = 0;
const CACHE_SYMBOL_TABLE: u32 = 1;
const CACHE_SYMBOLIC_LINK: u32 = 2;

/// Encoded width of one entry.
pub fn entry_size(sizes: FileSizes) -> usize {
    sizes.sizeof_size() + sizes.sizeof_addr() + 4 + 4 + SCRATCH_SIZE
}

/// Information denormalized into an entry to spare an object header read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CachedInfo {
    /// Nothing cached.
    #[default]
    Nothing,
    /// The target is a group; its own B-tree and heap addresses.
    SymbolTable {
        btree_address: Address,
        heap_address: Address,
    },
    /// The entry is a soft link; heap offset of its target path.
    SymbolicLink { value_offset: u32 },
}

/// One name-to-object binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolTableEntry {
    /// Byte offset of the link name in the group's local heap.
    pub name_offset: u64,
    /// Address of the target's object header, undefined for soft links.
    pub header_address: Address,
    /// Cached hint about the target.
    pub cached: CachedInfo,
}

impl Default for SymbolTableEntry {
    fn default() -> Self {
        Self {
            name_offset: 0,
            header_address: UNDEFINED_ADDRESS,
            cached: CachedInfo::Nothing,
        }
    }
}

impl SymbolTableEntry {
    /// Decode one entry, leaving the cursor exactly one entry further on.
    pub fn decode(d: &mut Decoder<'_>) -> Result<Self, FormatError> {
        let sizes = d.sizes();
        d.ensure(entry_size(sizes))?;
        let start = d.position();

        let name_offset = d.length()?;
        let header_address = d.address()?;
        let cache_type = d.u32()?;
        d.skip(4)?;

        let cached = match cache_type {
            CACHE_NOTHING => CachedInfo::Nothing,
            CACHE_SYMBOL_TABLE => CachedInfo::SymbolTable {
                btree_address: d.address()?,
                heap_address: d.address()?,
            },
            CACHE_SYMBOLIC_LINK => CachedInfo::SymbolicLink {
                value_offset: d.u32()?,
            },
            other => return Err(FormatError::UnknownCacheType(other)),
        };

        let consumed = d.position() - start;
        d.skip(entry_size(sizes) - consumed)?;
        Ok(Self {
            name_offset,
            header_address,
            cached,
        })
    }

    /// Encode `entry`, or a canonical empty record for `None`.
    pub fn encode(entry: Option<&Self>, e: &mut Encoder, sizes: FileSizes) {
        let start = e.len();
        let empty = Self::default();
        let entry = entry.unwrap_or(&empty);

        e.length(entry.name_offset);
        e.address(entry.header_address);
        match entry.cached {
            CachedInfo::Nothing => {
                e.u32(CACHE_NOTHING);
                e.zeros(4);
            }
            CachedInfo::SymbolTable {
                btree_address,
                heap_address,
            } => {
                e.u32(CACHE_SYMBOL_TABLE);
                e.zeros(4);
                e.address(btree_address);
                e.address(heap_address);
            }
            CachedInfo::SymbolicLink { value_offset } => {
                e.u32(CACHE_SYMBOLIC_LINK);
                e.zeros(4);
                e.u32(value_offset);
            }
        }
        e.pad_to(start + entry_size(sizes));
    }

    /// Decode `n` consecutive entries.
    pub fn decode_vec(d: &mut Decoder<'_>, n: usize) -> Result<Vec<Self>, FormatError> {
        let mut entries = Vec::with_capacity(n);
        for _ in 0..n {
            if d.remaining() < entry_size(d.sizes()) {
                return Err(FormatError::Corrupt(
                    "ran off end of input buffer while decoding symbol table entries".into(),
                ));
            }
            entries.push(Self::decode(d)?);
        }
        Ok(entries)
    }

    /// Encode every entry in order.
    pub fn encode_vec(entries: &[Self], e: &mut Encoder, sizes: FileSizes) {
        for entry in entries {
            Self::encode(Some(entry), e, sizes);
        }
    }

    /// Move the entry out, leaving this slot reset.
    pub fn take(&mut self) -> Self {
        mem::take(self)
    }

    /// Clear to the empty state.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Cached symbol table addresses, if the target is a known group.
    pub fn symbol_table(&self) -> Option<SymbolTableMessage> {
        match self.cached {
            CachedInfo::SymbolTable {
                btree_address,
                heap_address,
            } => Some(SymbolTableMessage {
                btree_address,
                local_heap_address: heap_address,
            }),
            _ => None,
        }
    }

    /// Build the entry for a new link, storing its name (and a soft link's
    /// value) in `heap`.
    ///
    /// For hard links to groups, `group_info` is cached in the entry. For
    /// hard links of unknown type the target header is probed for a symbol
    /// table message.
    pub fn from_link(
        cache: &MetadataCache,
        heap: &mut LocalHeap,
        name: &str,
        target: &LinkTarget,
        obj_type: ObjectType,
        group_info: Option<&SymbolTableMessage>,
    ) -> Result<Self, FormatError> {
        if let LinkTarget::External { .. } = target {
            return Err(FormatError::UnsupportedLinkType(target.kind_name()));
        }

        let name_offset = heap
            .insert_str(cache, name)
            .map_err(|e| FormatError::HeapInsert(Box::new(e)))?;

        let entry = match target {
            LinkTarget::Hard {
                object_header_address,
            } => {
                let stab = match (obj_type, group_info) {
                    (ObjectType::Group, Some(info)) => Some(info.clone()),
                    (ObjectType::Unknown, _) => {
                        ObjectHeader::read_symbol_table(cache, *object_header_address)?
                    }
                    _ => None,
                };
                Self {
                    name_offset,
                    header_address: *object_header_address,
                    cached: stab.map_or(CachedInfo::Nothing, |s| CachedInfo::SymbolTable {
                        btree_address: s.btree_address,
                        heap_address: s.local_heap_address,
                    }),
                }
            }
            LinkTarget::Soft { target_path } => {
                let value_offset = heap
                    .insert_str(cache, target_path)
                    .map_err(|e| FormatError::HeapInsert(Box::new(e)))?;
                let value_offset = u32::try_from(value_offset).map_err(|_| {
                    FormatError::Corrupt(format!(
                        "soft link value offset {value_offset} exceeds 32 bits"
                    ))
                })?;
                Self {
                    name_offset,
                    header_address: UNDEFINED_ADDRESS,
                    cached: CachedInfo::SymbolicLink { value_offset },
                }
            }
            LinkTarget::External { .. } => {
                return Err(FormatError::UnsupportedLinkType(target.kind_name()))
            }
        };
        trace!(name, name_offset, "entry.from_link");
        Ok(entry)
    }

    /// Resolve the entry's name and target through `heap`.
    pub fn to_link(&self, heap: &LocalHeap) -> Result<Link, FormatError> {
        let name = heap.read_string(self.name_offset)?.to_owned();
        let target = match self.cached {
            CachedInfo::SymbolicLink { value_offset } => LinkTarget::Soft {
                target_path: heap.read_string(u64::from(value_offset))?.to_owned(),
            },
            _ => LinkTarget::Hard {
                object_header_address: self.header_address,
            },
        };
        Ok(Link { name, target })
    }

    /// Whether the entry refers to an object header.
    pub fn is_hard_link(&self) -> bool {
        !matches!(self.cached, CachedInfo::SymbolicLink { .. }) && is_defined(self.header_address)
    }
}
