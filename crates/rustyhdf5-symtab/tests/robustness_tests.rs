//! Robustness tests: decoders and file open return errors (not panics) on
//! malformed input.

use rustyhdf5_symtab::btree::{BTreeNode, BTreeShared};
use rustyhdf5_symtab::encoding::Decoder;
use rustyhdf5_symtab::entry::SymbolTableEntry;
use rustyhdf5_symtab::group_btree::GroupKey;
use rustyhdf5_symtab::file_space::FileSpace;
use rustyhdf5_symtab::local_heap::LocalHeap;
use rustyhdf5_symtab::object_header::ObjectHeader;
use rustyhdf5_symtab::superblock::Superblock;
use rustyhdf5_symtab::symbol_table::{SymbolTableMessage, SymbolTableNode};
use rustyhdf5_symtab::{ErrorKind, File, FileAccessProps, FileCreateProps, FileSizes, FormatError};

const GROUP_TREE: BTreeShared = BTreeShared {
    node_type: 0,
    two_k: 32,
};

// ---- Truncated / empty inputs ----

#[test]
fn empty_image() {
    assert_eq!(
        File::open(Vec::new(), FileAccessProps::new()).unwrap_err(),
        FormatError::SignatureNotFound
    );
}

#[test]
fn truncated_superblock() {
    let image = File::create(FileCreateProps::new(), FileAccessProps::new())
        .unwrap()
        .close()
        .unwrap();
    for len in [9, 23, 40, 90] {
        assert!(Superblock::parse(&image[..len]).is_err(), "len {len}");
    }
}

#[test]
fn truncated_entry() {
    let sizes = FileSizes::default();
    let data = [0u8; 20];
    let mut d = Decoder::new(&data, sizes);
    assert!(matches!(
        SymbolTableEntry::decode(&mut d),
        Err(FormatError::UnexpectedEof { .. })
    ));
}

#[test]
fn truncated_symbol_table_node() {
    let data = b"SNOD\x01\x00\x02\x00";
    let err = SymbolTableNode::parse(data, FileSizes::default(), 4).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CorruptStructure);
}

#[test]
fn truncated_btree_node() {
    let data = b"TREE\x00\x00\x01\x00";
    assert!(BTreeNode::<GroupKey>::parse(data, FileSizes::default(), GROUP_TREE).is_err());
}

#[test]
fn truncated_object_header() {
    assert!(ObjectHeader::parse(&[0x01, 0x00, 0x05], FileSizes::default()).is_err());
}

#[test]
fn truncated_symbol_table_message() {
    assert!(SymbolTableMessage::parse(&[0u8; 12], FileSizes::default()).is_err());
}

// ---- Invalid signatures and versions ----

#[test]
fn bad_symbol_table_node_signature() {
    let data = [b'X'; 64];
    assert_eq!(
        SymbolTableNode::parse(&data, FileSizes::default(), 4).unwrap_err(),
        FormatError::InvalidSymbolTableNodeSignature
    );
}

#[test]
fn bad_symbol_table_node_version() {
    let mut data = vec![0u8; 8 + 8 * 40];
    data[..4].copy_from_slice(b"SNOD");
    data[4] = 7;
    assert_eq!(
        SymbolTableNode::parse(&data, FileSizes::default(), 4).unwrap_err(),
        FormatError::InvalidSymbolTableNodeVersion(7)
    );
}

#[test]
fn node_count_above_capacity() {
    let mut data = vec![0u8; 8 + 8 * 40];
    data[..4].copy_from_slice(b"SNOD");
    data[4] = 1;
    data[6] = 9;
    let err = SymbolTableNode::parse(&data, FileSizes::default(), 4).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CorruptStructure);
}

#[test]
fn unknown_cache_type() {
    let sizes = FileSizes::default();
    let mut data = vec![0u8; 40];
    data[16] = 3;
    let mut d = Decoder::new(&data, sizes);
    assert_eq!(
        SymbolTableEntry::decode(&mut d).unwrap_err(),
        FormatError::UnknownCacheType(3)
    );
}

#[test]
fn bad_btree_signature() {
    let data = [b'Y'; 64];
    assert_eq!(
        BTreeNode::<GroupKey>::parse(&data, FileSizes::default(), GROUP_TREE).unwrap_err(),
        FormatError::InvalidBTreeSignature
    );
}

#[test]
fn bad_local_heap_signature() {
    let space = FileSpace::from_image(vec![0xAB; 64]);
    assert_eq!(
        LocalHeap::parse(&space, 0, FileSizes::default()).unwrap_err(),
        FormatError::InvalidLocalHeapSignature
    );
}

fn heap_image(free_head: u64, block: Option<(u64, u64)>) -> Vec<u8> {
    let mut image = Vec::with_capacity(32 + 64);
    image.extend_from_slice(b"HEAP\x00\x00\x00\x00");
    image.extend_from_slice(&64u64.to_le_bytes());
    image.extend_from_slice(&free_head.to_le_bytes());
    image.extend_from_slice(&32u64.to_le_bytes());
    image.resize(32 + 64, 0);
    if let Some((offset, size)) = block {
        let at = 32 + offset as usize;
        image[at..at + 8].copy_from_slice(&1u64.to_le_bytes());
        image[at + 8..at + 16].copy_from_slice(&size.to_le_bytes());
    }
    image
}

#[test]
fn local_heap_free_head_near_max_offset() {
    let space = FileSpace::from_image(heap_image(u64::MAX - 3, None));
    let err = LocalHeap::parse(&space, 0, FileSizes::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CorruptStructure);
}

#[test]
fn local_heap_free_block_size_near_max() {
    let space = FileSpace::from_image(heap_image(16, Some((16, u64::MAX - 8))));
    let err = LocalHeap::parse(&space, 0, FileSizes::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CorruptStructure);
}

#[test]
fn unsupported_superblock_version() {
    let mut image = File::create(FileCreateProps::new(), FileAccessProps::new())
        .unwrap()
        .close()
        .unwrap();
    image[8] = 3;
    assert_eq!(
        File::open(image, FileAccessProps::new()).unwrap_err(),
        FormatError::UnsupportedVersion(3)
    );
}

#[test]
fn invalid_offset_size() {
    let mut image = File::create(FileCreateProps::new(), FileAccessProps::new())
        .unwrap()
        .close()
        .unwrap();
    image[13] = 3;
    assert_eq!(
        File::open(image, FileAccessProps::new()).unwrap_err(),
        FormatError::InvalidOffsetSize(3)
    );
}

// ---- Damaged files ----

#[test]
fn root_btree_pointing_at_garbage() {
    let file = File::create(FileCreateProps::new(), FileAccessProps::new()).unwrap();
    let btree = file.root_group().btree_address;
    let mut image = file.close().unwrap();
    image[btree as usize..btree as usize + 4].copy_from_slice(b"JUNK");
    let err = File::open(image, FileAccessProps::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CorruptStructure);
}

#[test]
fn image_shorter_than_recorded_eof() {
    let image = File::create(FileCreateProps::new(), FileAccessProps::new())
        .unwrap()
        .close()
        .unwrap();
    let short = image[..image.len() - 8].to_vec();
    assert!(matches!(
        File::open(short, FileAccessProps::new()).unwrap_err(),
        FormatError::UnexpectedEof { .. }
    ));
}
