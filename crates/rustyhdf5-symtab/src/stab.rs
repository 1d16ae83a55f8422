//! Symbol tables: a group's B-tree and local heap managed as one unit.
//!
//! Every operation takes the group's [`SymbolTableMessage`]. The heap is
//! protected for the duration of each call and handed to the B-tree
//! operation, which compares names through it.

use tracing::{debug, warn};

use crate::btree::{self, IterStatus};
use crate::encoding::{is_defined, Address};
use crate::entry::{CachedInfo, SymbolTableEntry};
use crate::error::{finish, FormatError};
use crate::file::File;
use crate::group_btree::{self, GroupBTree, GroupKey};
use crate::link::{Link, LinkTarget, ObjectType};
use crate::local_heap::{align, prefix_size, LocalHeap};
use crate::metadata_cache::{EntryTag, MetadataCache};
use crate::object_header::{CopyMap, HeaderMessage, ObjectHeader};
use crate::property_list::{CopyProps, GroupCreateProps};
use crate::symbol_table::SymbolTableMessage;

/// Soft links followed before a path lookup gives up.
pub const MAX_SOFT_LINK_HOPS: usize = 16;

/// Order in which links are visited or indexed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IterOrder {
    /// Ascending by name.
    #[default]
    Increasing,
    /// Descending by name.
    Decreasing,
    /// Whatever order is cheapest; ascending for symbol tables.
    Native,
}

/// Result of [`iterate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterOutcome {
    /// Whether the callback stopped the walk.
    pub status: IterStatus,
    /// Links passed over, skipped ones included. Pass this back as `skip`
    /// to resume after a stop.
    pub visited: u64,
}

/// What a link refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberType {
    /// A soft link; its target is not looked at.
    SoftLink,
    /// A hard link to an object of the given type.
    Object(ObjectType),
}

/// File space used by one symbol table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageInfo {
    /// B-tree nodes plus symbol table nodes.
    pub btree_bytes: u64,
    /// Local heap prefix plus data segment.
    pub heap_bytes: u64,
}

fn with_heap<T>(
    file: &File,
    stab: &SymbolTableMessage,
    f: impl FnOnce(&LocalHeap) -> Result<T, FormatError>,
) -> Result<T, FormatError> {
    let heap = file
        .cache()
        .protect_read::<LocalHeap>(stab.local_heap_address, &())?;
    let body = f(&heap);
    finish(body, heap.release())
}

fn with_heap_mut<T>(
    file: &File,
    stab: &SymbolTableMessage,
    f: impl FnOnce(&mut LocalHeap) -> Result<T, FormatError>,
) -> Result<T, FormatError> {
    let mut heap = file
        .cache()
        .protect_write::<LocalHeap>(stab.local_heap_address, &())?;
    let body = f(&mut heap);
    // Growing the heap moves its data segment even when the body fails.
    heap.mark_dirty();
    finish(body, heap.release())
}

fn index_out_of_bound(n: u64) -> FormatError {
    FormatError::InvalidArgument(format!("index out of bound: {n}"))
}

/// Create an empty B-tree and a local heap of at least `size_hint` bytes.
///
/// The empty string is stored at heap offset 0; it is the initial bound of
/// every new symbol table node.
pub fn create_components(file: &File, size_hint: u64) -> Result<SymbolTableMessage, FormatError> {
    let cache = file.cache();
    let btree_address = btree::create::<GroupKey>(cache, group_btree::shared(file))?;
    let local_heap_address = LocalHeap::create(cache, size_hint)?;
    let stab = SymbolTableMessage {
        btree_address,
        local_heap_address,
    };
    let offset = with_heap_mut(file, &stab, |heap| heap.insert_str(cache, ""))?;
    if offset != 0 {
        return Err(FormatError::Corrupt(format!(
            "empty name stored at offset {offset} of a new local heap"
        )));
    }
    debug!(btree_address, local_heap_address, size_hint, "stab.create_components");
    Ok(stab)
}

/// Create a group: symbol table components plus an object header holding
/// the symbol table message. The header starts with no links to it.
pub fn create(
    file: &File,
    props: &GroupCreateProps,
) -> Result<(Address, SymbolTableMessage), FormatError> {
    let sizes = file.sizes();
    let hint = if props.local_heap_size_hint > 0 {
        props.local_heap_size_hint
    } else {
        8 + u64::from(props.est_num_entries) * align(u64::from(props.est_name_len) + 1) + 1
    };
    let size_hint = hint.max(2 * sizes.sizeof_size() as u64 + 2);
    let stab = create_components(file, size_hint)?;
    let header = ObjectHeader::create(
        file.cache(),
        vec![HeaderMessage::symbol_table(&stab, sizes)],
        0,
    )?;
    debug!(header, size_hint, "stab.create");
    Ok((header, stab))
}

/// Add a link named `name`.
///
/// Link counts are left alone; callers account for new hard links.
pub fn insert(
    file: &File,
    stab: &SymbolTableMessage,
    name: &str,
    target: &LinkTarget,
    obj_type: ObjectType,
    crt_info: Option<&SymbolTableMessage>,
) -> Result<(), FormatError> {
    if name.is_empty() {
        return Err(FormatError::InvalidArgument("empty link name".into()));
    }
    with_heap_mut(file, stab, |heap| {
        let mut class = GroupBTree::insert(file, heap, name, target, obj_type, crt_info);
        btree::insert(file.cache(), &mut class, stab.btree_address)
    })?;
    debug!(name, kind = target.kind_name(), "stab.insert");
    Ok(())
}

fn find_entry(
    file: &File,
    heap: &LocalHeap,
    stab: &SymbolTableMessage,
    name: &str,
) -> Result<SymbolTableEntry, FormatError> {
    let mut class = GroupBTree::find(file, heap, name);
    let hit = btree::find(file.cache(), &mut class, stab.btree_address)?;
    match class.into_found() {
        Some(entry) if hit => Ok(entry),
        _ => Err(FormatError::NotFound(name.to_owned())),
    }
}

/// The entry stored for `name`.
pub fn lookup_entry(
    file: &File,
    stab: &SymbolTableMessage,
    name: &str,
) -> Result<SymbolTableEntry, FormatError> {
    with_heap(file, stab, |heap| find_entry(file, heap, stab, name))
}

/// The link named `name`.
pub fn lookup(file: &File, stab: &SymbolTableMessage, name: &str) -> Result<Link, FormatError> {
    with_heap(file, stab, |heap| find_entry(file, heap, stab, name)?.to_link(heap))
}

/// Whether a link named `name` exists.
pub fn contains(file: &File, stab: &SymbolTableMessage, name: &str) -> Result<bool, FormatError> {
    match lookup_entry(file, stab, name) {
        Ok(_) => Ok(true),
        Err(FormatError::NotFound(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Remove the link named `name`, dropping one link to its target.
pub fn remove(file: &File, stab: &SymbolTableMessage, name: &str) -> Result<(), FormatError> {
    with_heap_mut(file, stab, |heap| {
        let mut class = GroupBTree::remove(file, heap, name);
        btree::remove(file.cache(), &mut class, stab.btree_address)
    })?;
    debug!(name, "stab.remove");
    Ok(())
}

/// Remove the `n`th link in `order`.
pub fn remove_by_index(
    file: &File,
    stab: &SymbolTableMessage,
    order: IterOrder,
    n: u64,
) -> Result<(), FormatError> {
    let name = name_by_index(file, stab, order, n)?;
    remove(file, stab, &name)
}

fn link_table(
    file: &File,
    heap: &LocalHeap,
    stab: &SymbolTableMessage,
    order: IterOrder,
) -> Result<Vec<Link>, FormatError> {
    let mut table = Vec::new();
    btree::iterate::<GroupKey, _>(
        file.cache(),
        group_btree::shared(file),
        stab.btree_address,
        &mut |_, addr, _| {
            group_btree::build_table(file, heap, addr, &mut table)?;
            Ok(IterStatus::Continue)
        },
    )?;
    match order {
        IterOrder::Decreasing => table.sort_by(|a, b| b.name.cmp(&a.name)),
        IterOrder::Increasing | IterOrder::Native => table.sort_by(|a, b| a.name.cmp(&b.name)),
    }
    Ok(table)
}

/// Call `op` for each link in `order`, starting after the first `skip`.
///
/// Fails if `skip` is not below the number of links.
pub fn iterate<F>(
    file: &File,
    stab: &SymbolTableMessage,
    order: IterOrder,
    skip: u64,
    mut op: F,
) -> Result<IterOutcome, FormatError>
where
    F: FnMut(&Link) -> Result<IterStatus, FormatError>,
{
    with_heap(file, stab, |heap| {
        let mut visited = 0;
        let status = match order {
            IterOrder::Increasing | IterOrder::Native => btree::iterate::<GroupKey, _>(
                file.cache(),
                group_btree::shared(file),
                stab.btree_address,
                &mut |_, addr, _| {
                    group_btree::iterate_node(file, heap, addr, skip, &mut visited, &mut op)
                },
            )?,
            IterOrder::Decreasing => {
                let table = link_table(file, heap, stab, order)?;
                if skip > 0 && skip >= table.len() as u64 {
                    return Err(index_out_of_bound(skip));
                }
                visited = skip;
                let mut status = IterStatus::Continue;
                for link in table.iter().skip(skip as usize) {
                    visited += 1;
                    if op(link)? == IterStatus::Stop {
                        status = IterStatus::Stop;
                        break;
                    }
                }
                status
            }
        };
        if skip > 0 && skip >= visited {
            return Err(index_out_of_bound(skip));
        }
        Ok(IterOutcome { status, visited })
    })
}

/// Number of links.
pub fn count(file: &File, stab: &SymbolTableMessage) -> Result<u64, FormatError> {
    let mut n = 0;
    btree::iterate::<GroupKey, _>(
        file.cache(),
        group_btree::shared(file),
        stab.btree_address,
        &mut |_, addr, _| {
            n += group_btree::sumup(file, addr)?;
            Ok(IterStatus::Continue)
        },
    )?;
    Ok(n)
}

fn entry_by_index(
    file: &File,
    stab: &SymbolTableMessage,
    order: IterOrder,
    n: u64,
) -> Result<SymbolTableEntry, FormatError> {
    let mut remaining = match order {
        IterOrder::Decreasing => {
            let total = count(file, stab)?;
            if n >= total {
                return Err(index_out_of_bound(n));
            }
            total - (n + 1)
        }
        IterOrder::Increasing | IterOrder::Native => n,
    };
    let mut hit = None;
    btree::iterate::<GroupKey, _>(
        file.cache(),
        group_btree::shared(file),
        stab.btree_address,
        &mut |_, addr, _| {
            hit = group_btree::by_index(file, addr, &mut remaining)?;
            Ok(if hit.is_some() {
                IterStatus::Stop
            } else {
                IterStatus::Continue
            })
        },
    )?;
    hit.ok_or_else(|| index_out_of_bound(n))
}

/// Name of the `n`th link in `order`.
pub fn name_by_index(
    file: &File,
    stab: &SymbolTableMessage,
    order: IterOrder,
    n: u64,
) -> Result<String, FormatError> {
    let entry = entry_by_index(file, stab, order, n)?;
    with_heap(file, stab, |heap| {
        Ok(heap.read_string(entry.name_offset)?.to_owned())
    })
}

/// The `n`th link in `order`.
pub fn lookup_by_index(
    file: &File,
    stab: &SymbolTableMessage,
    order: IterOrder,
    n: u64,
) -> Result<Link, FormatError> {
    let entry = entry_by_index(file, stab, order, n)?;
    with_heap(file, stab, |heap| entry.to_link(heap))
}

/// What the `n`th link in `order` refers to.
pub fn type_by_index(
    file: &File,
    stab: &SymbolTableMessage,
    order: IterOrder,
    n: u64,
) -> Result<MemberType, FormatError> {
    let entry = entry_by_index(file, stab, order, n)?;
    match entry.cached {
        CachedInfo::SymbolicLink { .. } => Ok(MemberType::SoftLink),
        CachedInfo::SymbolTable { .. } => Ok(MemberType::Object(ObjectType::Group)),
        CachedInfo::Nothing => Ok(MemberType::Object(ObjectHeader::read_object_type(
            file.cache(),
            entry.header_address,
        )?)),
    }
}

/// File space held by the symbol table.
pub fn storage_size(file: &File, stab: &SymbolTableMessage) -> Result<StorageInfo, FormatError> {
    let mut leaves = 0u64;
    let info = btree::get_info::<GroupKey, _>(
        file.cache(),
        group_btree::shared(file),
        stab.btree_address,
        &mut |_| {
            leaves += 1;
            Ok(())
        },
    )?;
    let btree_bytes = info.size + leaves * group_btree::iterate_size(file);
    let heap_bytes = with_heap(file, stab, |heap| {
        Ok(prefix_size(file.sizes()) + heap.data_segment_size())
    })?;
    Ok(StorageInfo {
        btree_bytes,
        heap_bytes,
    })
}

fn probe_heap(cache: &MetadataCache, addr: Address) -> Result<(), FormatError> {
    cache.protect_read::<LocalHeap>(addr, &())?.release()
}

fn probe_tree(file: &File, heap_addr: Address, btree_addr: Address) -> Result<(), FormatError> {
    let cache = file.cache();
    let heap = cache.protect_read::<LocalHeap>(heap_addr, &())?;
    let result = btree::valid(cache, &GroupBTree::find(file, &heap, ""), btree_addr);
    finish(result, heap.release())
}

/// Check that both addresses in `stab` lead to the right structures.
///
/// A broken address is replaced from `alt` (typically the copy cached in the
/// parent's entry) when that one checks out. Returns the message to use.
pub fn validate(
    file: &File,
    stab: &SymbolTableMessage,
    alt: Option<&SymbolTableMessage>,
) -> Result<SymbolTableMessage, FormatError> {
    let cache = file.cache();
    let mut checked = stab.clone();

    if let Err(e) = probe_heap(cache, checked.local_heap_address) {
        match alt.filter(|a| {
            is_defined(a.local_heap_address) && a.local_heap_address != checked.local_heap_address
        }) {
            Some(alt) => {
                probe_heap(cache, alt.local_heap_address)?;
                warn!(
                    bad = checked.local_heap_address,
                    good = alt.local_heap_address,
                    error = %e,
                    "stab.repair_heap_address"
                );
                checked.local_heap_address = alt.local_heap_address;
            }
            None => return Err(e),
        }
    }

    if let Err(e) = probe_tree(file, checked.local_heap_address, checked.btree_address) {
        match alt.filter(|a| is_defined(a.btree_address) && a.btree_address != checked.btree_address)
        {
            Some(alt) => {
                probe_tree(file, checked.local_heap_address, alt.btree_address)?;
                warn!(
                    bad = checked.btree_address,
                    good = alt.btree_address,
                    error = %e,
                    "stab.repair_btree_address"
                );
                checked.btree_address = alt.btree_address;
            }
            None => return Err(e),
        }
    }
    Ok(checked)
}

/// Header address of the object `path` names.
///
/// Absolute paths start at the root group, relative ones at `stab`. Soft
/// links are followed relative to the group that holds them.
pub fn resolve_path(
    file: &File,
    stab: &SymbolTableMessage,
    path: &str,
) -> Result<Address, FormatError> {
    resolve(file, stab, path, MAX_SOFT_LINK_HOPS)
}

fn resolve(
    file: &File,
    stab: &SymbolTableMessage,
    path: &str,
    hops: usize,
) -> Result<Address, FormatError> {
    let (mut group, mut addr) = if path.starts_with('/') {
        (file.root_group().clone(), Some(file.root_header_address()))
    } else {
        (stab.clone(), None)
    };

    let mut components = path
        .split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .peekable();
    while let Some(component) = components.next() {
        let entry = lookup_entry(file, &group, component)?;
        let (target, cached) = match entry.cached {
            CachedInfo::SymbolicLink { value_offset } => {
                if hops == 0 {
                    return Err(FormatError::InvalidArgument(format!(
                        "too many soft links resolving {path}"
                    )));
                }
                let value = with_heap(file, &group, |heap| {
                    Ok(heap.read_string(u64::from(value_offset))?.to_owned())
                })?;
                (resolve(file, &group, &value, hops - 1)?, None)
            }
            _ => (entry.header_address, entry.symbol_table()),
        };
        addr = Some(target);

        if components.peek().is_some() {
            group = match cached {
                Some(cached) => cached,
                None => ObjectHeader::read_symbol_table(file.cache(), target)?.ok_or_else(|| {
                    FormatError::NotFound(format!("{component} in {path} is not a group"))
                })?,
            };
        }
    }
    addr.ok_or_else(|| FormatError::InvalidArgument(format!("path names no object: {path:?}")))
}

/// Free the symbol table: every node, then the heap.
///
/// Links held by the table are dropped first, deleting objects whose last
/// link this was.
pub fn delete(file: &File, stab: &SymbolTableMessage) -> Result<(), FormatError> {
    with_heap(file, stab, |heap| {
        let mut class = GroupBTree::delete(file, heap);
        btree::delete(file.cache(), &mut class, stab.btree_address)
    })?;
    LocalHeap::delete(file.cache(), stab.local_heap_address)?;
    debug!(
        btree = stab.btree_address,
        heap = stab.local_heap_address,
        "stab.delete"
    );
    Ok(())
}

/// First half of copying a group into `dst`: empty components sized like
/// the source heap. Links are filled in by [`post_copy_file`] once the
/// destination object header exists.
pub fn copy_file(
    src: &File,
    src_stab: &SymbolTableMessage,
    dst: &File,
) -> Result<SymbolTableMessage, FormatError> {
    let size_hint = with_heap(src, src_stab, |heap| Ok(heap.data_segment_size()))?;
    let _copied = dst.cache().tag_scope(EntryTag::Copied);
    create_components(dst, size_hint)
}

/// Second half of copying a group: copy every link from `src_stab` into
/// `dst_stab`.
pub fn post_copy_file(
    src: &File,
    src_stab: &SymbolTableMessage,
    dst: &File,
    dst_stab: &SymbolTableMessage,
    map: &mut CopyMap,
    props: &CopyProps,
) -> Result<(), FormatError> {
    with_heap(src, src_stab, |heap| {
        btree::iterate::<GroupKey, _>(
            src.cache(),
            group_btree::shared(src),
            src_stab.btree_address,
            &mut |_, addr, _| {
                group_btree::copy_node(src, src_stab, heap, addr, dst, dst_stab, map, props)?;
                Ok(IterStatus::Continue)
            },
        )
    })?;
    debug!(
        src = src_stab.btree_address,
        dst = dst_stab.btree_address,
        "stab.post_copy"
    );
    Ok(())
}
