//! Group B-trees: the B-tree engine bound to symbol table nodes.
//!
//! Keys are offsets of names in the group's local heap. The key to the
//! right of a child is the greatest name stored under it, so a name belongs
//! to child `i` when `key[i] < name <= key[i + 1]`.

use std::cmp::Ordering;

use tracing::{debug, trace};

use crate::btree::{
    BTreeClass, BTreeKey, BTreeShared, CriticalKey, InsertResult, IterStatus, KeyBounds, NewNode,
    RemoveResult,
};
use crate::encoding::{is_defined, Address, Decoder, Encoder, FileSizes};
use crate::entry::{CachedInfo, SymbolTableEntry};
use crate::error::{finish, FormatError};
use crate::file::File;
use crate::link::{Link, LinkTarget, ObjectType};
use crate::local_heap::LocalHeap;
use crate::metadata_cache::EntryTag;
use crate::object_header::{CopyMap, ObjectHeader};
use crate::property_list::CopyProps;
use crate::stab;
use crate::symbol_table::{node_size, SymbolTableMessage, SymbolTableNode};

/// Node type of group B-trees.
pub const GROUP_NODE_TYPE: u8 = 0;

/// A group B-tree key: heap offset of a boundary name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupKey {
    /// Offset of the name in the local heap.
    pub offset: u64,
}

impl BTreeKey for GroupKey {
    fn encoded_len(sizes: FileSizes) -> usize {
        sizes.sizeof_size()
    }

    fn decode(d: &mut Decoder<'_>) -> Result<Self, FormatError> {
        Ok(GroupKey { offset: d.length()? })
    }

    fn encode(&self, e: &mut Encoder) {
        e.length(self.offset);
    }
}

/// Node parameters of every group B-tree in `file`.
pub fn shared(file: &File) -> BTreeShared {
    BTreeShared {
        node_type: GROUP_NODE_TYPE,
        two_k: 2 * file.create_props().btree_k,
    }
}

/// The group's local heap, protected for reading or writing by the caller.
pub enum HeapAccess<'a> {
    /// Lookups and bulk deletes only read names.
    Read(&'a LocalHeap),
    /// Inserts and removes add or free names.
    Write(&'a mut LocalHeap),
}

impl HeapAccess<'_> {
    fn get(&self) -> &LocalHeap {
        match self {
            HeapAccess::Read(heap) => heap,
            HeapAccess::Write(heap) => heap,
        }
    }

    fn get_mut(&mut self) -> Result<&mut LocalHeap, FormatError> {
        match self {
            HeapAccess::Write(heap) => Ok(heap),
            HeapAccess::Read(_) => Err(FormatError::InvalidArgument(
                "local heap is protected read-only".into(),
            )),
        }
    }
}

enum GroupOp<'a> {
    Find {
        found: Option<SymbolTableEntry>,
    },
    Insert {
        target: &'a LinkTarget,
        obj_type: ObjectType,
        crt_info: Option<&'a SymbolTableMessage>,
    },
    Remove,
    Delete,
}

/// One operation on a group B-tree.
pub struct GroupBTree<'a> {
    file: &'a File,
    heap: HeapAccess<'a>,
    name: &'a str,
    op: GroupOp<'a>,
}

impl<'a> GroupBTree<'a> {
    /// Look up `name`.
    pub fn find(file: &'a File, heap: &'a LocalHeap, name: &'a str) -> Self {
        Self {
            file,
            heap: HeapAccess::Read(heap),
            name,
            op: GroupOp::Find { found: None },
        }
    }

    /// Insert a link named `name`.
    ///
    /// `crt_info` is cached in the new entry when `obj_type` is a group.
    pub fn insert(
        file: &'a File,
        heap: &'a mut LocalHeap,
        name: &'a str,
        target: &'a LinkTarget,
        obj_type: ObjectType,
        crt_info: Option<&'a SymbolTableMessage>,
    ) -> Self {
        Self {
            file,
            heap: HeapAccess::Write(heap),
            name,
            op: GroupOp::Insert {
                target,
                obj_type,
                crt_info,
            },
        }
    }

    /// Remove the link named `name`.
    pub fn remove(file: &'a File, heap: &'a mut LocalHeap, name: &'a str) -> Self {
        Self {
            file,
            heap: HeapAccess::Write(heap),
            name,
            op: GroupOp::Remove,
        }
    }

    /// Tear down every node while deleting the whole group.
    pub fn delete(file: &'a File, heap: &'a LocalHeap) -> Self {
        Self {
            file,
            heap: HeapAccess::Read(heap),
            name: "",
            op: GroupOp::Delete,
        }
    }

    /// The entry a successful find matched.
    pub fn into_found(self) -> Option<SymbolTableEntry> {
        match self.op {
            GroupOp::Find { found } => found,
            _ => None,
        }
    }

    fn sym_leaf_k(&self) -> u16 {
        self.file.create_props().sym_leaf_k
    }

    fn name_at(&self, key: &GroupKey) -> Result<&str, FormatError> {
        self.heap.get().read_string(key.offset)
    }
}

impl BTreeClass for GroupBTree<'_> {
    type Key = GroupKey;
    const NODE_TYPE: u8 = GROUP_NODE_TYPE;
    const FOLLOW_MIN: bool = true;
    const FOLLOW_MAX: bool = true;
    const CRITICAL_KEY: CriticalKey = CriticalKey::Right;

    fn two_k(&self) -> u16 {
        2 * self.file.create_props().btree_k
    }

    fn split_ratios(&self) -> [f64; 3] {
        self.file.transfer_props().btree_split_ratios
    }

    fn cmp2(&self, left: &GroupKey, right: &GroupKey) -> Result<Ordering, FormatError> {
        Ok(self.name_at(left)?.cmp(self.name_at(right)?))
    }

    fn cmp3(&self, left: &GroupKey, right: &GroupKey) -> Result<Ordering, FormatError> {
        if self.name <= self.name_at(left)? {
            Ok(Ordering::Less)
        } else if self.name > self.name_at(right)? {
            Ok(Ordering::Greater)
        } else {
            Ok(Ordering::Equal)
        }
    }

    fn new_node(
        &mut self,
        op: NewNode,
        left: &mut GroupKey,
        right: &mut GroupKey,
    ) -> Result<Address, FormatError> {
        let cache = self.file.cache();
        let k = self.sym_leaf_k();
        let addr = cache.allocate(node_size(cache.sizes(), k) as u64)?;
        cache.insert(addr, SymbolTableNode::new(k))?;
        // Both bounds start as the empty string stored at offset 0.
        left.offset = 0;
        right.offset = 0;
        debug!(addr, ?op, "snode.create");
        Ok(addr)
    }

    fn found(&mut self, addr: Address, _left: &GroupKey) -> Result<bool, FormatError> {
        let cache = self.file.cache();
        let node = cache.protect_read::<SymbolTableNode>(addr, &self.sym_leaf_k())?;
        let hit = node
            .search(self.heap.get(), self.name)
            .map(|s| s.found.then(|| node.entries[s.index].clone()));
        let hit = finish(hit, node.release())?;
        let is_hit = hit.is_some();
        if let GroupOp::Find { found } = &mut self.op {
            *found = hit;
        }
        Ok(is_hit)
    }

    fn insert(
        &mut self,
        addr: Address,
        bounds: &mut KeyBounds<GroupKey>,
        middle: &mut GroupKey,
    ) -> Result<InsertResult, FormatError> {
        let (target, obj_type, crt_info) = match &self.op {
            GroupOp::Insert {
                target,
                obj_type,
                crt_info,
            } => (*target, *obj_type, *crt_info),
            _ => {
                return Err(FormatError::InvalidArgument(
                    "group B-tree insert without a link".into(),
                ))
            }
        };
        let cache = self.file.cache();
        let k = self.sym_leaf_k();
        let mut node = cache.protect_write::<SymbolTableNode>(addr, &k)?;

        let search = node.search(self.heap.get(), self.name)?;
        if search.found {
            return Err(FormatError::DuplicateName(self.name.to_owned()));
        }
        let entry = SymbolTableEntry::from_link(
            cache,
            self.heap.get_mut()?,
            self.name,
            target,
            obj_type,
            crt_info,
        )?;
        let new_offset = entry.name_offset;
        let mut idx = search.index;

        let result = if node.len() >= node.capacity() {
            let half = k as usize;
            let right_addr = cache.allocate(node_size(cache.sizes(), k) as u64)?;
            let mut right = SymbolTableNode::from_entries(k, node.entries.split_off(half));
            middle.offset = node.entries[half - 1].name_offset;
            if idx <= half {
                if idx == half {
                    middle.offset = new_offset;
                }
                node.entries.insert(idx, entry);
            } else {
                idx -= half;
                if idx == half {
                    bounds.right = GroupKey { offset: new_offset };
                    bounds.right_changed = true;
                }
                right.entries.insert(idx, entry);
            }
            debug!(
                addr,
                right_addr,
                left_len = node.len(),
                right_len = right.len(),
                "snode.split"
            );
            cache.insert(right_addr, right)?;
            InsertResult::Right(right_addr)
        } else {
            if idx == node.len() {
                bounds.right = GroupKey { offset: new_offset };
                bounds.right_changed = true;
            }
            node.entries.insert(idx, entry);
            InsertResult::Noop
        };

        node.mark_dirty();
        node.release()?;
        trace!(name = self.name, addr, "snode.insert");
        Ok(result)
    }

    fn remove(
        &mut self,
        addr: Address,
        bounds: &mut KeyBounds<GroupKey>,
    ) -> Result<RemoveResult, FormatError> {
        let cache = self.file.cache();
        let mut node = cache.protect_write::<SymbolTableNode>(addr, &self.sym_leaf_k())?;

        let search = node.search(self.heap.get(), self.name)?;
        if !search.found {
            return Err(FormatError::NotFound(self.name.to_owned()));
        }
        let idx = search.index;
        let entry = node.entries[idx].clone();

        match entry.cached {
            CachedInfo::SymbolicLink { value_offset } => {
                let heap = self.heap.get_mut()?;
                let offset = u64::from(value_offset);
                let len = heap.read_string(offset)?.len() as u64;
                heap.remove(cache, offset, len + 1)?;
            }
            _ if is_defined(entry.header_address) => {
                ObjectHeader::adjust_link_count(self.file, entry.header_address, -1)?;
            }
            _ => {}
        }
        let name_len = self.name.len() as u64;
        self.heap.get_mut()?.remove(cache, entry.name_offset, name_len + 1)?;

        node.mark_dirty();
        let result = if node.len() == 1 {
            node.entries.clear();
            node.mark_deleted(true);
            RemoveResult::Remove
        } else {
            node.entries.remove(idx);
            if idx == node.len() {
                bounds.right = GroupKey {
                    offset: node.entries[idx - 1].name_offset,
                };
                bounds.right_changed = true;
            }
            RemoveResult::Noop
        };
        node.release()?;
        trace!(name = self.name, addr, ?result, "snode.remove");
        Ok(result)
    }

    fn remove_all(&mut self, addr: Address) -> Result<(), FormatError> {
        let cache = self.file.cache();
        let mut node = cache.protect_write::<SymbolTableNode>(addr, &self.sym_leaf_k())?;
        // The heap goes away with the group, so names are left in place.
        for entry in node.entries.iter().filter(|e| e.is_hard_link()) {
            ObjectHeader::adjust_link_count(self.file, entry.header_address, -1)?;
        }
        node.entries.clear();
        node.mark_deleted(true);
        node.release()?;
        trace!(addr, "snode.remove_all");
        Ok(())
    }
}

fn load_entries(file: &File, addr: Address) -> Result<Vec<SymbolTableEntry>, FormatError> {
    let k = file.create_props().sym_leaf_k;
    let node = file.cache().protect_read::<SymbolTableNode>(addr, &k)?;
    let entries = node.entries.clone();
    node.release()?;
    Ok(entries)
}

/// Visit the links of the node at `addr`.
///
/// `visited` counts every entry passed over, skipped or not; entries are
/// handed to `op` once it reaches `skip`.
pub fn iterate_node<F>(
    file: &File,
    heap: &LocalHeap,
    addr: Address,
    skip: u64,
    visited: &mut u64,
    op: &mut F,
) -> Result<IterStatus, FormatError>
where
    F: FnMut(&Link) -> Result<IterStatus, FormatError>,
{
    let k = file.create_props().sym_leaf_k;
    let node = file.cache().protect_read::<SymbolTableNode>(addr, &k)?;
    let mut body = || -> Result<IterStatus, FormatError> {
        for entry in &node.entries {
            let skipped = *visited < skip;
            *visited += 1;
            if skipped {
                continue;
            }
            if op(&entry.to_link(heap)?)? == IterStatus::Stop {
                return Ok(IterStatus::Stop);
            }
        }
        Ok(IterStatus::Continue)
    };
    let status = body();
    finish(status, node.release())
}

/// Number of entries in the node at `addr`.
pub fn sumup(file: &File, addr: Address) -> Result<u64, FormatError> {
    let k = file.create_props().sym_leaf_k;
    let node = file.cache().protect_read::<SymbolTableNode>(addr, &k)?;
    let n = node.len() as u64;
    node.release()?;
    Ok(n)
}

/// Entry `*remaining` of the node at `addr`, or `None` after subtracting the
/// node's length from `*remaining`.
pub fn by_index(
    file: &File,
    addr: Address,
    remaining: &mut u64,
) -> Result<Option<SymbolTableEntry>, FormatError> {
    let k = file.create_props().sym_leaf_k;
    let node = file.cache().protect_read::<SymbolTableNode>(addr, &k)?;
    let n = node.len() as u64;
    let hit = if *remaining < n {
        Some(node.entries[*remaining as usize].clone())
    } else {
        *remaining -= n;
        None
    };
    node.release()?;
    Ok(hit)
}

/// Append the links of the node at `addr` to `table`.
pub fn build_table(
    file: &File,
    heap: &LocalHeap,
    addr: Address,
    table: &mut Vec<Link>,
) -> Result<(), FormatError> {
    for entry in load_entries(file, addr)? {
        table.push(entry.to_link(heap)?);
    }
    Ok(())
}

/// Bytes of the symbol table node at `addr`.
pub fn iterate_size(file: &File) -> u64 {
    node_size(file.sizes(), file.create_props().sym_leaf_k) as u64
}

/// Copy every link of the source node at `addr` into the destination group.
///
/// Hard link targets are copied (or linked again when already copied); soft
/// links are kept, or replaced by copies of their targets when
/// `expand_soft_links` is set and the target resolves.
#[allow(clippy::too_many_arguments)]
pub fn copy_node(
    src: &File,
    src_stab: &SymbolTableMessage,
    src_heap: &LocalHeap,
    addr: Address,
    dst: &File,
    dst_stab: &SymbolTableMessage,
    map: &mut CopyMap,
    props: &CopyProps,
) -> Result<(), FormatError> {
    let _copied = dst.cache().tag_scope(EntryTag::Copied);
    for entry in load_entries(src, addr)? {
        let link = entry.to_link(src_heap)?;
        let source_header = match &link.target {
            LinkTarget::Soft { target_path } if props.expand_soft_links => {
                match stab::resolve_path(src, src_stab, target_path) {
                    Ok(header) => Some(header),
                    Err(e) => {
                        debug!(name = %link.name, target = %target_path, error = %e, "copy.dangling_soft_link");
                        None
                    }
                }
            }
            LinkTarget::Hard {
                object_header_address,
            } => Some(*object_header_address),
            _ => None,
        };

        match source_header {
            Some(header) => {
                let copied = ObjectHeader::copy_to(src, header, dst, map, props)?;
                let obj_type = ObjectHeader::read_object_type(dst.cache(), copied)?;
                let crt_info = ObjectHeader::read_symbol_table(dst.cache(), copied)?;
                let target = LinkTarget::Hard {
                    object_header_address: copied,
                };
                stab::insert(dst, dst_stab, &link.name, &target, obj_type, crt_info.as_ref())?;
            }
            None => {
                stab::insert(dst, dst_stab, &link.name, &link.target, ObjectType::Unknown, None)?;
            }
        }
        trace!(name = %link.name, "snode.copy");
    }
    Ok(())
}
