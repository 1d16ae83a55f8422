//! Version 1 B-tree engine ("TREE" nodes).
//!
//! The engine is generic over a [`BTreeClass`], which supplies the key type,
//! key comparison against the operation's search value, and the callbacks
//! that create, search, grow and shrink leaf objects. Internal nodes hold
//! `N` child addresses separated by `N + 1` keys; child `i` covers the range
//! between keys `i` and `i + 1`.
//!
//! The root of a tree never moves: when the root splits, the old root is
//! relocated and a new root is written at the original address.

use std::cmp::Ordering;
use std::fmt;

use tracing::{debug, trace};

use crate::encoding::{is_defined, Address, Decoder, Encoder, FileSizes, UNDEFINED_ADDRESS};
use crate::error::{finish, FormatError};
use crate::file_space::FileSpace;
use crate::metadata_cache::{CacheEntry, MetadataCache, Protected};

const TREE_SIGNATURE: &[u8; 4] = b"TREE";

/// A key stored between child pointers.
pub trait BTreeKey: Clone + Default + fmt::Debug + PartialEq + 'static {
    /// Encoded size of one key.
    fn encoded_len(sizes: FileSizes) -> usize;
    /// Decode one key.
    fn decode(d: &mut Decoder<'_>) -> Result<Self, FormatError>;
    /// Encode one key.
    fn encode(&self, e: &mut Encoder);
}

/// Which key of a child describes the child's own contents.
///
/// When a child is removed its critical key goes with it; the other key
/// stays as a bound of the neighbouring child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CriticalKey {
    /// The key to the left of the child.
    Left,
    /// The key to the right of the child.
    Right,
}

/// Why a leaf object is being created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewNode {
    /// First object of an empty tree.
    First,
    /// New object to the left of an existing one.
    Left,
    /// New object to the right of an existing one.
    Right,
}

/// Outcome of inserting into a subtree or leaf object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    /// Nothing for the parent to do.
    Noop,
    /// The child moved to a new address.
    Change(Address),
    /// A new child was created to the left; the middle key separates them.
    Left(Address),
    /// A new child was created to the right; the middle key separates them.
    Right(Address),
}

/// Outcome of removing from a subtree or leaf object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveResult {
    /// The child survives.
    Noop,
    /// The child is gone; drop its pointer.
    Remove,
}

/// Iteration control returned by visitor callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterStatus {
    /// Keep going.
    Continue,
    /// Stop early without error.
    Stop,
}

/// The keys bounding one child, and whether a callback changed them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyBounds<K> {
    /// Key to the left of the child.
    pub left: K,
    /// Set when `left` was modified.
    pub left_changed: bool,
    /// Key to the right of the child.
    pub right: K,
    /// Set when `right` was modified.
    pub right_changed: bool,
}

impl<K: Clone> KeyBounds<K> {
    fn around(keys: &[K], idx: usize) -> Self {
        Self {
            left: keys[idx].clone(),
            left_changed: false,
            right: keys[idx + 1].clone(),
            right_changed: false,
        }
    }
}

/// Parameters shared by every node of one tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BTreeShared {
    /// Node type recorded in each node.
    pub node_type: u8,
    /// Maximum children per node.
    pub two_k: u16,
}

impl BTreeShared {
    /// Encoded size of one node.
    pub fn node_size<K: BTreeKey>(&self, sizes: FileSizes) -> usize {
        let two_k = self.two_k as usize;
        8 + 2 * sizes.sizeof_addr()
            + two_k * sizes.sizeof_addr()
            + (two_k + 1) * K::encoded_len(sizes)
    }
}

/// The operations a tree delegates to its instantiation.
///
/// A class value carries the state of a single operation: the search value
/// consulted by [`BTreeClass::cmp3`] and whatever the leaf callbacks need.
pub trait BTreeClass {
    /// Key type.
    type Key: BTreeKey;
    /// Node type tag written to every node.
    const NODE_TYPE: u8;
    /// Descend into the leftmost child when the value sorts before it.
    const FOLLOW_MIN: bool;
    /// Descend into the rightmost child when the value sorts after it.
    const FOLLOW_MAX: bool;
    /// Key that describes each child.
    const CRITICAL_KEY: CriticalKey;

    /// Maximum children per internal node.
    fn two_k(&self) -> u16;

    /// Split ratios for leftmost, interior and rightmost nodes.
    fn split_ratios(&self) -> [f64; 3];

    /// Order two keys.
    fn cmp2(&self, left: &Self::Key, right: &Self::Key) -> Result<Ordering, FormatError>;

    /// Place the operation's value relative to the range `(left, right]`.
    fn cmp3(&self, left: &Self::Key, right: &Self::Key) -> Result<Ordering, FormatError>;

    /// Create a leaf object, filling in the keys around it.
    fn new_node(
        &mut self,
        op: NewNode,
        left: &mut Self::Key,
        right: &mut Self::Key,
    ) -> Result<Address, FormatError>;

    /// Look the value up in the leaf object at `addr`.
    fn found(&mut self, addr: Address, left: &Self::Key) -> Result<bool, FormatError>;

    /// Insert the value into the leaf object at `addr`.
    ///
    /// When a new object is created, `middle` receives the key between the
    /// two objects.
    fn insert(
        &mut self,
        addr: Address,
        bounds: &mut KeyBounds<Self::Key>,
        middle: &mut Self::Key,
    ) -> Result<InsertResult, FormatError>;

    /// Remove the value from the leaf object at `addr`.
    fn remove(
        &mut self,
        addr: Address,
        bounds: &mut KeyBounds<Self::Key>,
    ) -> Result<RemoveResult, FormatError>;

    /// Release everything the leaf object at `addr` holds, then the object.
    fn remove_all(&mut self, addr: Address) -> Result<(), FormatError>;

    /// Node parameters for this tree.
    fn shared(&self) -> BTreeShared {
        BTreeShared {
            node_type: Self::NODE_TYPE,
            two_k: self.two_k(),
        }
    }
}

/// One node of a tree.
#[derive(Debug, Clone, PartialEq)]
pub struct BTreeNode<K> {
    /// Node type.
    pub node_type: u8,
    /// 0 for nodes whose children are leaf objects.
    pub level: u8,
    /// Left sibling at the same level.
    pub left: Address,
    /// Right sibling at the same level.
    pub right: Address,
    /// `children.len() + 1` keys.
    pub keys: Vec<K>,
    /// Child addresses.
    pub children: Vec<Address>,
    two_k: u16,
}

impl<K: BTreeKey> BTreeNode<K> {
    /// An empty level-0 node.
    pub fn new(shared: BTreeShared) -> Self {
        Self {
            node_type: shared.node_type,
            level: 0,
            left: UNDEFINED_ADDRESS,
            right: UNDEFINED_ADDRESS,
            keys: vec![K::default()],
            children: Vec::new(),
            two_k: shared.two_k,
        }
    }

    fn shared(&self) -> BTreeShared {
        BTreeShared {
            node_type: self.node_type,
            two_k: self.two_k,
        }
    }

    /// Parse a node, checking it belongs to a tree described by `shared`.
    pub fn parse(
        data: &[u8],
        sizes: FileSizes,
        shared: BTreeShared,
    ) -> Result<BTreeNode<K>, FormatError> {
        let mut d = Decoder::new(data, sizes);
        d.signature(TREE_SIGNATURE, FormatError::InvalidBTreeSignature)?;
        let node_type = d.u8()?;
        if node_type != shared.node_type {
            return Err(FormatError::InvalidBTreeNodeType(node_type));
        }
        let level = d.u8()?;
        let entries_used = d.u16()?;
        if entries_used > shared.two_k {
            return Err(FormatError::Corrupt(format!(
                "B-tree node uses {entries_used} entries, capacity {}",
                shared.two_k
            )));
        }
        let left = d.address()?;
        let right = d.address()?;

        // key[0], child[0], key[1], child[1], ..., child[N-1], key[N]
        let n = entries_used as usize;
        let mut keys = Vec::with_capacity(n + 1);
        let mut children = Vec::with_capacity(n);
        for _ in 0..n {
            keys.push(K::decode(&mut d)?);
            children.push(d.address()?);
        }
        keys.push(K::decode(&mut d)?);

        Ok(BTreeNode {
            node_type,
            level,
            left,
            right,
            keys,
            children,
            two_k: shared.two_k,
        })
    }

    /// Serialize at full node size.
    pub fn to_bytes(&self, sizes: FileSizes) -> Vec<u8> {
        let size = self.shared().node_size::<K>(sizes);
        let mut e = Encoder::with_capacity(sizes, size);
        e.bytes(TREE_SIGNATURE);
        e.u8(self.node_type);
        e.u8(self.level);
        e.u16(self.children.len() as u16);
        e.address(self.left);
        e.address(self.right);
        for (key, child) in self.keys.iter().zip(&self.children) {
            key.encode(&mut e);
            e.address(*child);
        }
        if let Some(last) = self.keys.get(self.children.len()) {
            last.encode(&mut e);
        }
        e.pad_to(size);
        e.into_inner()
    }
}

impl<K: BTreeKey> CacheEntry for BTreeNode<K> {
    type Context = BTreeShared;
    const KIND: &'static str = "B-tree node";

    fn load(
        space: &FileSpace,
        addr: Address,
        sizes: FileSizes,
        shared: &BTreeShared,
    ) -> Result<Self, FormatError> {
        let data = space.read(addr, shared.node_size::<K>(sizes))?;
        BTreeNode::parse(data, sizes, *shared)
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
        self.shared().node_size::<K>(sizes) as u64
    }
}

type Node<'c, C> = Protected<'c, BTreeNode<<C as BTreeClass>::Key>>;

/// Binary search for the child whose range holds the class's value.
fn locate<C: BTreeClass>(
    class: &C,
    node: &BTreeNode<C::Key>,
) -> Result<(usize, Ordering), FormatError> {
    let (mut lt, mut rt) = (0, node.children.len());
    let mut idx = 0;
    let mut cmp = Ordering::Less;
    while lt < rt && cmp != Ordering::Equal {
        idx = (lt + rt) / 2;
        cmp = class.cmp3(&node.keys[idx], &node.keys[idx + 1])?;
        if cmp == Ordering::Less {
            rt = idx;
        } else {
            lt = idx + 1;
        }
    }
    Ok((idx, cmp))
}

/// Fail unless the node at `addr` sits at `expected` level.
fn check_level<K>(node: &BTreeNode<K>, addr: Address, expected: Option<u8>) -> Result<(), FormatError> {
    match expected {
        Some(level) if node.level != level => Err(FormatError::Corrupt(format!(
            "B-tree node at {addr:#x} has level {}, expected {level}",
            node.level
        ))),
        _ => Ok(()),
    }
}

/// Create an empty tree, returning the root address.
pub fn create<K: BTreeKey>(cache: &MetadataCache, shared: BTreeShared) -> Result<Address, FormatError> {
    let addr = cache.allocate(shared.node_size::<K>(cache.sizes()) as u64)?;
    cache.insert(addr, BTreeNode::<K>::new(shared))?;
    debug!(addr, node_type = shared.node_type, "btree.create");
    Ok(addr)
}

/// Look up the class's value, delegating to [`BTreeClass::found`] at the leaf.
pub fn find<C: BTreeClass>(
    cache: &MetadataCache,
    class: &mut C,
    addr: Address,
) -> Result<bool, FormatError> {
    find_helper(cache, class, addr, None)
}

fn find_helper<C: BTreeClass>(
    cache: &MetadataCache,
    class: &mut C,
    addr: Address,
    expected_level: Option<u8>,
) -> Result<bool, FormatError> {
    let shared = class.shared();
    let node = cache.protect_read::<BTreeNode<C::Key>>(addr, &shared)?;
    check_level(&node, addr, expected_level)?;
    let (idx, cmp) = locate(class, &node)?;
    if cmp != Ordering::Equal {
        node.release()?;
        return Ok(false);
    }
    let child = node.children[idx];
    let result = if node.level > 0 {
        find_helper(cache, class, child, Some(node.level - 1))
    } else {
        let left = node.keys[idx].clone();
        class.found(child, &left)
    };
    finish(result, node.release())
}

/// Insert the class's value. The root stays at `addr`.
pub fn insert<C: BTreeClass>(
    cache: &MetadataCache,
    class: &mut C,
    addr: Address,
) -> Result<(), FormatError> {
    let shared = class.shared();
    let mut root = cache.protect_write::<BTreeNode<C::Key>>(addr, &shared)?;
    let mut bounds = KeyBounds::default();
    let mut middle = C::Key::default();

    let split_addr = match insert_helper(cache, class, &mut root, &mut bounds, &mut middle)? {
        InsertResult::Noop => return root.release(),
        InsertResult::Right(split_addr) => split_addr,
        other => {
            return Err(FormatError::Corrupt(format!(
                "B-tree root insert returned {other:?}"
            )))
        }
    };

    let level = root.level;
    if !bounds.left_changed {
        bounds.left = root.keys[0].clone();
    }
    if !bounds.right_changed {
        let split = cache.protect_read::<BTreeNode<C::Key>>(split_addr, &shared)?;
        bounds.right = split.keys[split.children.len()].clone();
        split.release()?;
    }

    // Keep the root in place: move the old root aside and write a new root
    // over its address.
    let old_root_addr = cache.allocate(shared.node_size::<C::Key>(cache.sizes()) as u64)?;
    root.release()?;
    cache.move_entry::<BTreeNode<C::Key>>(addr, old_root_addr, &shared)?;

    let mut split = cache.protect_write::<BTreeNode<C::Key>>(split_addr, &shared)?;
    split.left = old_root_addr;
    split.mark_dirty();
    split.release()?;

    let new_root = BTreeNode {
        node_type: shared.node_type,
        level: level + 1,
        left: UNDEFINED_ADDRESS,
        right: UNDEFINED_ADDRESS,
        keys: vec![bounds.left, middle, bounds.right],
        children: vec![old_root_addr, split_addr],
        two_k: shared.two_k,
    };
    cache.insert(addr, new_root)?;
    debug!(addr, old_root_addr, split_addr, level = level + 1, "btree.new_root");
    Ok(())
}

fn insert_helper<C: BTreeClass>(
    cache: &MetadataCache,
    class: &mut C,
    node: &mut Node<'_, C>,
    bounds: &mut KeyBounds<C::Key>,
    middle: &mut C::Key,
) -> Result<InsertResult, FormatError> {
    let shared = class.shared();
    let (mut idx, cmp) = locate(class, node)?;
    let n = node.children.len();

    let result = if n == 0 {
        if node.level != 0 {
            return Err(FormatError::Corrupt(format!(
                "empty B-tree node at {:#x} has level {}",
                node.address(),
                node.level
            )));
        }
        let mut left = C::Key::default();
        let mut right = C::Key::default();
        let child = class.new_node(NewNode::First, &mut left, &mut right)?;
        node.keys = vec![left, right];
        node.children = vec![child];
        node.mark_dirty();
        idx = 0;
        if C::FOLLOW_MIN {
            leaf_insert(class, node, idx, bounds, middle)?
        } else {
            InsertResult::Noop
        }
    } else if cmp == Ordering::Less && idx == 0 {
        if node.level > 0 {
            subtree_insert(cache, class, node, idx, bounds, middle)?
        } else if C::FOLLOW_MIN {
            leaf_insert(class, node, idx, bounds, middle)?
        } else {
            *middle = node.keys[idx].clone();
            let mut left = node.keys[idx].clone();
            let child = class.new_node(NewNode::Left, &mut left, middle)?;
            node.keys[idx] = left;
            bounds.left_changed = true;
            InsertResult::Left(child)
        }
    } else if cmp == Ordering::Greater && idx + 1 >= n {
        idx = n - 1;
        if node.level > 0 {
            subtree_insert(cache, class, node, idx, bounds, middle)?
        } else if C::FOLLOW_MAX {
            leaf_insert(class, node, idx, bounds, middle)?
        } else {
            *middle = node.keys[idx + 1].clone();
            let mut right = node.keys[idx + 1].clone();
            let child = class.new_node(NewNode::Right, middle, &mut right)?;
            node.keys[idx + 1] = right;
            bounds.right_changed = true;
            InsertResult::Right(child)
        }
    } else if cmp != Ordering::Equal {
        return Err(FormatError::Corrupt(format!(
            "no branch of B-tree node at {:#x} covers the value",
            node.address()
        )));
    } else if node.level > 0 {
        subtree_insert(cache, class, node, idx, bounds, middle)?
    } else {
        leaf_insert(class, node, idx, bounds, middle)?
    };

    // Boundary changes only leave this node through its outermost keys.
    if bounds.left_changed {
        node.mark_dirty();
        if idx > 0 {
            bounds.left_changed = false;
        } else {
            bounds.left = node.keys[idx].clone();
        }
    }
    if bounds.right_changed {
        node.mark_dirty();
        if idx + 1 < node.children.len() {
            bounds.right_changed = false;
        } else {
            bounds.right = node.keys[idx + 1].clone();
        }
    }

    let split = match result {
        InsertResult::Noop => None,
        InsertResult::Change(child) => {
            node.children[idx] = child;
            node.mark_dirty();
            None
        }
        InsertResult::Left(child) | InsertResult::Right(child) => {
            let anchor_right = matches!(result, InsertResult::Right(_));
            node.mark_dirty();
            if node.children.len() == shared.two_k as usize {
                let mut split = split_node(cache, class, node, idx)?;
                if idx < node.children.len() {
                    insert_child(node, idx, child, anchor_right, middle);
                } else {
                    idx -= node.children.len();
                    insert_child(&mut split.node, idx, child, anchor_right, middle);
                }
                Some(split)
            } else {
                insert_child(node, idx, child, anchor_right, middle);
                None
            }
        }
    };
    match split {
        Some(split) => {
            *middle = split.node.keys[0].clone();
            cache.insert(split.addr, split.node)?;
            Ok(InsertResult::Right(split.addr))
        }
        None => Ok(InsertResult::Noop),
    }
}

fn subtree_insert<C: BTreeClass>(
    cache: &MetadataCache,
    class: &mut C,
    node: &mut Node<'_, C>,
    idx: usize,
    bounds: &mut KeyBounds<C::Key>,
    middle: &mut C::Key,
) -> Result<InsertResult, FormatError> {
    let shared = class.shared();
    let child_addr = node.children[idx];
    let mut child = cache.protect_write::<BTreeNode<C::Key>>(child_addr, &shared)?;
    check_level(&child, child_addr, Some(node.level - 1))?;
    let mut sub = KeyBounds::around(&node.keys, idx);
    let result = insert_helper(cache, class, &mut child, &mut sub, middle);
    let released = child.release();
    let result = finish(result, released)?;
    absorb_bounds(node, idx, sub, bounds);
    Ok(result)
}

fn leaf_insert<C: BTreeClass>(
    class: &mut C,
    node: &mut Node<'_, C>,
    idx: usize,
    bounds: &mut KeyBounds<C::Key>,
    middle: &mut C::Key,
) -> Result<InsertResult, FormatError> {
    let mut sub = KeyBounds::around(&node.keys, idx);
    let result = class.insert(node.children[idx], &mut sub, middle)?;
    absorb_bounds(node, idx, sub, bounds);
    Ok(result)
}

/// Write a child's possibly updated keys back into `node`.
fn absorb_bounds<K: BTreeKey>(
    node: &mut BTreeNode<K>,
    idx: usize,
    sub: KeyBounds<K>,
    bounds: &mut KeyBounds<K>,
) {
    if sub.left_changed {
        node.keys[idx] = sub.left;
        bounds.left_changed = true;
    }
    if sub.right_changed {
        node.keys[idx + 1] = sub.right;
        bounds.right_changed = true;
    }
}

fn insert_child<K: BTreeKey>(
    node: &mut BTreeNode<K>,
    idx: usize,
    child: Address,
    anchor_right: bool,
    middle: &K,
) {
    node.keys.insert(idx + 1, middle.clone());
    let at = if anchor_right { idx + 1 } else { idx };
    node.children.insert(at, child);
}

struct Split<K> {
    addr: Address,
    node: BTreeNode<K>,
}

/// Split a full node in two. The right half is returned, not yet cached.
fn split_node<C: BTreeClass>(
    cache: &MetadataCache,
    class: &C,
    node: &mut Node<'_, C>,
    idx: usize,
) -> Result<Split<C::Key>, FormatError> {
    let shared = class.shared();
    let two_k = shared.two_k as usize;
    let ratios = class.split_ratios();
    let ratio = if !is_defined(node.right) {
        ratios[2]
    } else if !is_defined(node.left) {
        ratios[0]
    } else {
        ratios[1]
    };
    let mut nleft = (two_k as f64 * ratio) as usize;

    // The new child stays in the same node as the child that split.
    if idx < nleft && nleft == two_k {
        nleft -= 1;
    } else if idx >= nleft && nleft == 0 {
        nleft += 1;
    }

    let addr = cache.allocate(shared.node_size::<C::Key>(cache.sizes()) as u64)?;
    let right_keys = node.keys[nleft..].to_vec();
    node.keys.truncate(nleft + 1);
    let right_children = node.children.split_off(nleft);

    let split = BTreeNode {
        node_type: node.node_type,
        level: node.level,
        left: node.address(),
        right: node.right,
        keys: right_keys,
        children: right_children,
        two_k: shared.two_k,
    };

    if is_defined(node.right) {
        let mut sibling = cache.protect_write::<BTreeNode<C::Key>>(node.right, &shared)?;
        sibling.left = addr;
        sibling.mark_dirty();
        sibling.release()?;
    }
    node.right = addr;
    node.mark_dirty();
    debug!(
        addr = node.address(),
        split_addr = addr,
        nleft,
        nright = split.children.len(),
        level = node.level,
        "btree.split"
    );
    Ok(Split { addr, node: split })
}

/// Remove the class's value from the tree.
pub fn remove<C: BTreeClass>(
    cache: &MetadataCache,
    class: &mut C,
    addr: Address,
) -> Result<(), FormatError> {
    let mut bounds = KeyBounds::default();
    remove_helper(cache, class, addr, 0, None, &mut bounds)?;
    Ok(())
}

fn remove_helper<C: BTreeClass>(
    cache: &MetadataCache,
    class: &mut C,
    addr: Address,
    depth: usize,
    expected_level: Option<u8>,
    bounds: &mut KeyBounds<C::Key>,
) -> Result<RemoveResult, FormatError> {
    let shared = class.shared();
    let mut node = cache.protect_write::<BTreeNode<C::Key>>(addr, &shared)?;
    check_level(&node, addr, expected_level)?;
    let (idx, cmp) = locate(class, &node)?;
    if cmp != Ordering::Equal {
        return Err(FormatError::NotFound(format!(
            "B-tree key not found under node {addr:#x}"
        )));
    }

    let child = node.children[idx];
    let mut sub = KeyBounds::around(&node.keys, idx);
    let result = if node.level > 0 {
        remove_helper(cache, class, child, depth + 1, Some(node.level - 1), &mut sub)?
    } else {
        class.remove(child, &mut sub)?
    };
    absorb_bounds(&mut node, idx, sub, bounds);

    if bounds.left_changed {
        node.mark_dirty();
        if idx > 0 {
            bounds.left_changed = false;
        } else {
            bounds.left = node.keys[idx].clone();
        }
    }
    if bounds.right_changed {
        node.mark_dirty();
        if idx + 1 < node.children.len() {
            bounds.right_changed = false;
        } else {
            bounds.right = node.keys[idx + 1].clone();
        }
    }

    let n = node.children.len();
    let mut outcome = RemoveResult::Noop;
    if result == RemoveResult::Remove {
        if n == 1 {
            outcome = RemoveResult::Remove;
            if depth > 0 {
                unlink_from_siblings::<C>(cache, &node)?;
                node.left = UNDEFINED_ADDRESS;
                node.right = UNDEFINED_ADDRESS;
                node.mark_deleted(true);
                node.release()?;
                debug!(addr, "btree.delete_node");
                return Ok(outcome);
            }
            node.children.clear();
            node.keys.truncate(1);
            node.level = 0;
        } else if idx == 0 {
            match C::CRITICAL_KEY {
                CriticalKey::Left => {
                    node.keys.remove(0);
                    bounds.left = node.keys[0].clone();
                    bounds.left_changed = true;
                }
                CriticalKey::Right => {
                    node.keys.remove(1);
                }
            }
            node.children.remove(0);
        } else if idx + 1 == n {
            match C::CRITICAL_KEY {
                CriticalKey::Left => {
                    node.keys.remove(n - 1);
                }
                CriticalKey::Right => {
                    node.keys.remove(n);
                    bounds.right = node.keys[n - 1].clone();
                    bounds.right_changed = true;
                }
            }
            node.children.remove(n - 1);
        } else {
            match C::CRITICAL_KEY {
                CriticalKey::Left => node.keys.remove(idx),
                CriticalKey::Right => node.keys.remove(idx + 1),
            };
            node.children.remove(idx);
        }
        node.mark_dirty();
    }

    // Keep the keys shared with same-level neighbours consistent.
    if bounds.left_changed && is_defined(node.left) {
        let mut sibling = cache.protect_write::<BTreeNode<C::Key>>(node.left, &shared)?;
        let last = sibling.children.len();
        sibling.keys[last] = node.keys[0].clone();
        sibling.mark_dirty();
        sibling.release()?;
    } else if bounds.right_changed && is_defined(node.right) {
        let mut sibling = cache.protect_write::<BTreeNode<C::Key>>(node.right, &shared)?;
        sibling.keys[0] = node.keys[node.children.len()].clone();
        sibling.mark_dirty();
        sibling.release()?;
    }

    node.release()?;
    Ok(outcome)
}

/// Splice a node that is about to be deleted out of its sibling chain.
fn unlink_from_siblings<C: BTreeClass>(
    cache: &MetadataCache,
    node: &BTreeNode<C::Key>,
) -> Result<(), FormatError> {
    let shared = node.shared();
    if is_defined(node.left) {
        let mut sibling = cache.protect_write::<BTreeNode<C::Key>>(node.left, &shared)?;
        if C::CRITICAL_KEY == CriticalKey::Left {
            let last = sibling.children.len();
            sibling.keys[last] = node.keys[1].clone();
        }
        sibling.right = node.right;
        sibling.mark_dirty();
        sibling.release()?;
    }
    if is_defined(node.right) {
        let mut sibling = cache.protect_write::<BTreeNode<C::Key>>(node.right, &shared)?;
        if C::CRITICAL_KEY == CriticalKey::Right {
            sibling.keys[0] = node.keys[0].clone();
        }
        sibling.left = node.left;
        sibling.mark_dirty();
        sibling.release()?;
    }
    Ok(())
}

/// Delete the whole tree, calling [`BTreeClass::remove_all`] on every leaf
/// object first.
pub fn delete<C: BTreeClass>(
    cache: &MetadataCache,
    class: &mut C,
    addr: Address,
) -> Result<(), FormatError> {
    delete_helper(cache, class, addr, None)
}

fn delete_helper<C: BTreeClass>(
    cache: &MetadataCache,
    class: &mut C,
    addr: Address,
    expected_level: Option<u8>,
) -> Result<(), FormatError> {
    let shared = class.shared();
    let mut node = cache.protect_write::<BTreeNode<C::Key>>(addr, &shared)?;
    check_level(&node, addr, expected_level)?;
    let children = node.children.clone();
    let level = node.level;
    let mut body = Ok(());
    for child in children {
        body = if level > 0 {
            delete_helper(cache, class, child, Some(level - 1))
        } else {
            class.remove_all(child)
        };
        if body.is_err() {
            break;
        }
    }
    node.mark_deleted(true);
    trace!(addr, level, "btree.delete");
    finish(body, node.release())
}

/// Visit every leaf object in key order.
///
/// `op` receives the keys around each object and its address.
pub fn iterate<K, F>(
    cache: &MetadataCache,
    shared: BTreeShared,
    addr: Address,
    op: &mut F,
) -> Result<IterStatus, FormatError>
where
    K: BTreeKey,
    F: FnMut(&K, Address, &K) -> Result<IterStatus, FormatError>,
{
    iterate_helper(cache, shared, addr, None, op)
}

fn iterate_helper<K, F>(
    cache: &MetadataCache,
    shared: BTreeShared,
    addr: Address,
    expected_level: Option<u8>,
    op: &mut F,
) -> Result<IterStatus, FormatError>
where
    K: BTreeKey,
    F: FnMut(&K, Address, &K) -> Result<IterStatus, FormatError>,
{
    let node = cache.protect_read::<BTreeNode<K>>(addr, &shared)?;
    check_level(&node, addr, expected_level)?;
    let mut status = Ok(IterStatus::Continue);
    for (i, &child) in node.children.iter().enumerate() {
        status = if node.level > 0 {
            iterate_helper(cache, shared, child, Some(node.level - 1), op)
        } else {
            op(&node.keys[i], child, &node.keys[i + 1])
        };
        if !matches!(status, Ok(IterStatus::Continue)) {
            break;
        }
    }
    finish(status, node.release())
}

/// Node count and bytes of a tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BTreeInfo {
    /// Number of B-tree nodes.
    pub num_nodes: u64,
    /// Bytes occupied by B-tree nodes.
    pub size: u64,
}

/// Measure a tree, calling `leaf_op` with the address of each leaf object.
pub fn get_info<K, F>(
    cache: &MetadataCache,
    shared: BTreeShared,
    addr: Address,
    leaf_op: &mut F,
) -> Result<BTreeInfo, FormatError>
where
    K: BTreeKey,
    F: FnMut(Address) -> Result<(), FormatError>,
{
    let mut info = BTreeInfo::default();
    info_helper::<K, F>(cache, shared, addr, None, leaf_op, &mut info)?;
    Ok(info)
}

fn info_helper<K, F>(
    cache: &MetadataCache,
    shared: BTreeShared,
    addr: Address,
    expected_level: Option<u8>,
    leaf_op: &mut F,
    info: &mut BTreeInfo,
) -> Result<(), FormatError>
where
    K: BTreeKey,
    F: FnMut(Address) -> Result<(), FormatError>,
{
    let node = cache.protect_read::<BTreeNode<K>>(addr, &shared)?;
    check_level(&node, addr, expected_level)?;
    info.num_nodes += 1;
    info.size += shared.node_size::<K>(cache.sizes()) as u64;
    let mut body = Ok(());
    for &child in &node.children {
        body = if node.level > 0 {
            info_helper::<K, F>(cache, shared, child, Some(node.level - 1), leaf_op, info)
        } else {
            leaf_op(child)
        };
        if body.is_err() {
            break;
        }
    }
    finish(body, node.release())
}

/// Addresses of all leaf objects in key order.
pub fn collect_leaves<K: BTreeKey>(
    cache: &MetadataCache,
    shared: BTreeShared,
    addr: Address,
) -> Result<Vec<Address>, FormatError> {
    let mut leaves = Vec::new();
    iterate::<K, _>(cache, shared, addr, &mut |_, child, _| {
        leaves.push(child);
        Ok(IterStatus::Continue)
    })?;
    Ok(leaves)
}

/// Check that every node of the tree loads, has the expected type and
/// level, and holds keys in order.
pub fn valid<C: BTreeClass>(
    cache: &MetadataCache,
    class: &C,
    addr: Address,
) -> Result<(), FormatError> {
    valid_helper(cache, class, addr, None)
}

fn valid_helper<C: BTreeClass>(
    cache: &MetadataCache,
    class: &C,
    addr: Address,
    expected_level: Option<u8>,
) -> Result<(), FormatError> {
    let shared = class.shared();
    let node = cache.protect_read::<BTreeNode<C::Key>>(addr, &shared)?;
    let body = (|| {
        check_level(&node, addr, expected_level)?;
        if node.level > 0 && node.children.is_empty() {
            return Err(FormatError::Corrupt(format!(
                "internal B-tree node at {addr:#x} has no children"
            )));
        }
        for pair in node.keys.windows(2) {
            if class.cmp2(&pair[0], &pair[1])? == Ordering::Greater {
                return Err(FormatError::Corrupt(format!(
                    "B-tree node at {addr:#x} holds keys out of order"
                )));
            }
        }
        if node.level > 0 {
            for &child in &node.children {
                valid_helper(cache, class, child, Some(node.level - 1))?;
            }
        }
        Ok(())
    })();
    finish(body, node.release())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    /// Integer keys over leaf objects that each hold a sorted run of values.
    #[derive(Debug, Clone, Copy, Default, PartialEq)]
    struct IntKey(u64);

    impl BTreeKey for IntKey {
        fn encoded_len(_sizes: FileSizes) -> usize {
            8
        }
        fn decode(d: &mut Decoder<'_>) -> Result<Self, FormatError> {
            let lo = d.u32()? as u64;
            let hi = d.u32()? as u64;
            Ok(IntKey(lo | hi << 32))
        }
        fn encode(&self, e: &mut Encoder) {
            e.u32(self.0 as u32);
            e.u32((self.0 >> 32) as u32);
        }
    }

    /// Leaves live in a side table keyed by a fake address.
    struct Runs {
        value: u64,
        leaves: BTreeMap<Address, Vec<u64>>,
        next_leaf: Address,
        capacity: usize,
        found: bool,
    }

    impl Runs {
        fn new(capacity: usize) -> Self {
            Self {
                value: 0,
                leaves: BTreeMap::new(),
                next_leaf: 1 << 40,
                capacity,
                found: false,
            }
        }
    }

    impl BTreeClass for Runs {
        type Key = IntKey;
        const NODE_TYPE: u8 = 7;
        const FOLLOW_MIN: bool = true;
        const FOLLOW_MAX: bool = true;
        const CRITICAL_KEY: CriticalKey = CriticalKey::Right;

        fn two_k(&self) -> u16 {
            4
        }
        fn split_ratios(&self) -> [f64; 3] {
            [0.1, 0.5, 0.9]
        }
        fn cmp2(&self, l: &IntKey, r: &IntKey) -> Result<Ordering, FormatError> {
            Ok(l.0.cmp(&r.0))
        }
        fn cmp3(&self, l: &IntKey, r: &IntKey) -> Result<Ordering, FormatError> {
            Ok(if self.value <= l.0 {
                Ordering::Less
            } else if self.value > r.0 {
                Ordering::Greater
            } else {
                Ordering::Equal
            })
        }
        fn new_node(
            &mut self,
            _op: NewNode,
            left: &mut IntKey,
            right: &mut IntKey,
        ) -> Result<Address, FormatError> {
            let addr = self.next_leaf;
            self.next_leaf += 1;
            self.leaves.insert(addr, Vec::new());
            *left = IntKey(0);
            *right = IntKey(0);
            Ok(addr)
        }
        fn found(&mut self, addr: Address, _left: &IntKey) -> Result<bool, FormatError> {
            self.found = self.leaves[&addr].contains(&self.value);
            Ok(self.found)
        }
        fn insert(
            &mut self,
            addr: Address,
            bounds: &mut KeyBounds<IntKey>,
            middle: &mut IntKey,
        ) -> Result<InsertResult, FormatError> {
            let mut run = self.leaves.remove(&addr).unwrap_or_default();
            let idx = run.partition_point(|&v| v < self.value);
            run.insert(idx, self.value);
            if idx + 1 == run.len() {
                bounds.right = IntKey(self.value);
                bounds.right_changed = true;
            }
            if run.len() > self.capacity {
                let right = run.split_off(run.len() / 2);
                *middle = IntKey(*run.last().unwrap_or(&0));
                let new_addr = self.next_leaf;
                self.next_leaf += 1;
                self.leaves.insert(addr, run);
                self.leaves.insert(new_addr, right);
                return Ok(InsertResult::Right(new_addr));
            }
            self.leaves.insert(addr, run);
            Ok(InsertResult::Noop)
        }
        fn remove(
            &mut self,
            addr: Address,
            bounds: &mut KeyBounds<IntKey>,
        ) -> Result<RemoveResult, FormatError> {
            let run = self.leaves.get_mut(&addr).unwrap();
            let idx = run
                .iter()
                .position(|&v| v == self.value)
                .ok_or_else(|| FormatError::NotFound(self.value.to_string()))?;
            run.remove(idx);
            if run.is_empty() {
                self.leaves.remove(&addr);
                return Ok(RemoveResult::Remove);
            }
            if idx == run.len() {
                bounds.right = IntKey(run[idx - 1]);
                bounds.right_changed = true;
            }
            Ok(RemoveResult::Noop)
        }
        fn remove_all(&mut self, addr: Address) -> Result<(), FormatError> {
            self.leaves.remove(&addr);
            Ok(())
        }
    }

    fn cache() -> MetadataCache {
        MetadataCache::new(FileSpace::new(0), FileSizes::default())
    }

    fn all_values(cache: &MetadataCache, runs: &Runs, root: Address) -> Vec<u64> {
        collect_leaves::<IntKey>(cache, runs.shared(), root)
            .unwrap()
            .iter()
            .flat_map(|a| runs.leaves[a].clone())
            .collect()
    }

    #[test]
    fn node_round_trip_through_bytes() {
        let shared = BTreeShared {
            node_type: 0,
            two_k: 4,
        };
        let sizes = FileSizes::new(4, 4).unwrap();
        let node = BTreeNode {
            node_type: 0,
            level: 1,
            left: UNDEFINED_ADDRESS,
            right: 0x400,
            keys: vec![IntKey(0), IntKey(5), IntKey(9)],
            children: vec![0x100, 0x200],
            two_k: 4,
        };
        let bytes = node.to_bytes(sizes);
        assert_eq!(bytes.len(), shared.node_size::<IntKey>(sizes));
        assert_eq!(&bytes[0..4], b"TREE");
        assert_eq!(BTreeNode::<IntKey>::parse(&bytes, sizes, shared).unwrap(), node);
    }

    #[test]
    fn parse_rejects_wrong_type_and_signature() {
        let shared = BTreeShared {
            node_type: 0,
            two_k: 4,
        };
        let sizes = FileSizes::default();
        let mut bytes = BTreeNode::<IntKey>::new(shared).to_bytes(sizes);
        bytes[4] = 1;
        assert_eq!(
            BTreeNode::<IntKey>::parse(&bytes, sizes, shared).unwrap_err(),
            FormatError::InvalidBTreeNodeType(1)
        );
        bytes[0] = b'X';
        assert_eq!(
            BTreeNode::<IntKey>::parse(&bytes, sizes, shared).unwrap_err(),
            FormatError::InvalidBTreeSignature
        );
    }

    #[test]
    fn root_stays_put_while_tree_grows() {
        let cache = cache();
        let mut runs = Runs::new(2);
        let root = create::<IntKey>(&cache, runs.shared()).unwrap();
        for v in 1..=60 {
            runs.value = v;
            insert(&cache, &mut runs, root).unwrap();
        }
        let root_node = cache
            .protect_read::<BTreeNode<IntKey>>(root, &runs.shared())
            .unwrap();
        assert!(root_node.level >= 2);
        assert!(!is_defined(root_node.left) && !is_defined(root_node.right));
        drop(root_node);

        assert_eq!(all_values(&cache, &runs, root), (1..=60).collect::<Vec<_>>());
        for v in [1, 17, 60] {
            runs.value = v;
            assert!(find(&cache, &mut runs, root).unwrap());
        }
        runs.value = 61;
        assert!(!find(&cache, &mut runs, root).unwrap());
        valid(&cache, &runs, root).unwrap();
        assert_eq!(cache.stats().outstanding(), 0);
    }

    #[test]
    fn remove_everything_collapses_root() {
        let cache = cache();
        let mut runs = Runs::new(2);
        let root = create::<IntKey>(&cache, runs.shared()).unwrap();
        for v in 1..=30 {
            runs.value = v;
            insert(&cache, &mut runs, root).unwrap();
        }
        for v in (1..=30).rev().step_by(2).chain((1..=30).rev().skip(1).step_by(2)) {
            runs.value = v;
            remove(&cache, &mut runs, root).unwrap();
        }
        let root_node = cache
            .protect_read::<BTreeNode<IntKey>>(root, &runs.shared())
            .unwrap();
        assert_eq!(root_node.level, 0);
        assert!(root_node.children.is_empty());
        drop(root_node);
        assert!(runs.leaves.is_empty());

        runs.value = 3;
        insert(&cache, &mut runs, root).unwrap();
        assert_eq!(all_values(&cache, &runs, root), vec![3]);
    }

    #[test]
    fn remove_missing_value_is_not_found() {
        let cache = cache();
        let mut runs = Runs::new(4);
        let root = create::<IntKey>(&cache, runs.shared()).unwrap();
        runs.value = 10;
        insert(&cache, &mut runs, root).unwrap();
        runs.value = 11;
        let err = remove(&cache, &mut runs, root).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
        assert_eq!(cache.stats().outstanding(), 0);
    }

    #[test]
    fn info_counts_nodes_and_leaves() {
        let cache = cache();
        let mut runs = Runs::new(2);
        let root = create::<IntKey>(&cache, runs.shared()).unwrap();
        for v in 1..=20 {
            runs.value = v;
            insert(&cache, &mut runs, root).unwrap();
        }
        let mut leaves = 0;
        let info = get_info::<IntKey, _>(&cache, runs.shared(), root, &mut |_| {
            leaves += 1;
            Ok(())
        })
        .unwrap();
        assert!(info.num_nodes > 1);
        assert_eq!(
            info.size,
            info.num_nodes * runs.shared().node_size::<IntKey>(cache.sizes()) as u64
        );
        assert_eq!(leaves, runs.leaves.len());
    }

    #[test]
    fn delete_frees_every_node() {
        let cache = cache();
        let mut runs = Runs::new(2);
        let root = create::<IntKey>(&cache, runs.shared()).unwrap();
        for v in 1..=40 {
            runs.value = v;
            insert(&cache, &mut runs, root).unwrap();
        }
        delete(&cache, &mut runs, root).unwrap();
        assert!(runs.leaves.is_empty());
        assert_eq!(cache.eoa(), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn iterate_stops_early() {
        let cache = cache();
        let mut runs = Runs::new(2);
        let root = create::<IntKey>(&cache, runs.shared()).unwrap();
        for v in 1..=12 {
            runs.value = v;
            insert(&cache, &mut runs, root).unwrap();
        }
        let mut seen = 0;
        let status = iterate::<IntKey, _>(&cache, runs.shared(), root, &mut |_, _, _| {
            seen += 1;
            Ok(if seen == 2 {
                IterStatus::Stop
            } else {
                IterStatus::Continue
            })
        })
        .unwrap();
        assert_eq!(status, IterStatus::Stop);
        assert_eq!(seen, 2);
        assert_eq!(cache.stats().outstanding(), 0);
    }

    #[test]
    fn child_at_wrong_level_is_corrupt() {
        use crate::error::ErrorKind;

        let cache = cache();
        let mut runs = Runs::new(2);
        let shared = runs.shared();
        let addr = cache
            .allocate(shared.node_size::<IntKey>(cache.sizes()) as u64)
            .unwrap();
        // An internal node whose only child is itself.
        cache
            .insert(
                addr,
                BTreeNode {
                    node_type: Runs::NODE_TYPE,
                    level: 1,
                    left: UNDEFINED_ADDRESS,
                    right: UNDEFINED_ADDRESS,
                    keys: vec![IntKey(0), IntKey(100)],
                    children: vec![addr],
                    two_k: shared.two_k,
                },
            )
            .unwrap();

        runs.value = 5;
        assert_eq!(
            find(&cache, &mut runs, addr).unwrap_err().kind(),
            ErrorKind::CorruptStructure
        );
        let err = iterate::<IntKey, _>(&cache, shared, addr, &mut |_, _, _| {
            Ok(IterStatus::Continue)
        })
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptStructure);
        let err = get_info::<IntKey, _>(&cache, shared, addr, &mut |_| Ok(())).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptStructure);
        assert_eq!(
            valid(&cache, &runs, addr).unwrap_err().kind(),
            ErrorKind::CorruptStructure
        );
        assert!(remove(&cache, &mut runs, addr).is_err());
        assert!(insert(&cache, &mut runs, addr).is_err());
        assert_eq!(cache.stats().outstanding(), 0);
    }
}
