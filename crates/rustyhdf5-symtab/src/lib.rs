//! HDF5 classic group storage: version 1 B-trees over symbol table nodes,
//! with link names kept in a per-group local heap.
//!
//! The [`btree`] module is a generic engine parameterised by a
//! [`btree::BTreeClass`]; [`group_btree`] instantiates it for groups and
//! [`stab`] ties a group's B-tree and heap together. Structures are read and
//! written through the [`metadata_cache`] over an in-memory [`file_space`].

pub mod btree;
pub mod encoding;
pub mod entry;
pub mod error;
pub mod file;
pub mod file_space;
pub mod group_btree;
pub mod link;
pub mod local_heap;
pub mod metadata_cache;
pub mod object_header;
pub mod property_list;
pub mod stab;
pub mod superblock;
pub mod symbol_table;

pub use encoding::{Address, FileSizes, UNDEFINED_ADDRESS};
pub use error::{ErrorKind, FormatError};
pub use file::File;
pub use link::{Link, LinkTarget, ObjectType};
pub use property_list::{
    CopyProps, FileAccessProps, FileCreateProps, GroupCreateProps, TransferProps,
};
pub use symbol_table::SymbolTableMessage;
