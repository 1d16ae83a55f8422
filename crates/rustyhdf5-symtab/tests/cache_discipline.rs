//! Every protect is matched by an unprotect, on success and on every
//! failure path, including failures injected into the cache itself.

use rustyhdf5_symtab::btree::IterStatus;
use rustyhdf5_symtab::stab::{self, IterOrder};
use rustyhdf5_symtab::{
    ErrorKind, File, FileAccessProps, FileCreateProps, FormatError, GroupCreateProps, LinkTarget,
    ObjectType, SymbolTableMessage,
};

fn populated(n: usize) -> (File, SymbolTableMessage) {
    let file = File::create(
        FileCreateProps::new().sym_leaf_k(2).btree_k(2),
        FileAccessProps::new(),
    )
    .unwrap();
    let root = file.root_group().clone();
    for i in 0..n {
        file.link_soft(&root, &format!("name{i:03}"), "/target").unwrap();
    }
    (file, root)
}

fn hard(addr: u64) -> LinkTarget {
    LinkTarget::Hard {
        object_header_address: addr,
    }
}

/// Run `op` with a protect failure injected at every possible point until it
/// succeeds, checking the balance after each attempt.
fn sweep<T>(
    mut setup: impl FnMut() -> (File, SymbolTableMessage),
    mut op: impl FnMut(&File, &SymbolTableMessage) -> Result<T, FormatError>,
) -> usize {
    for n in 0..500 {
        let (file, root) = setup();
        file.cache().inject_protect_failure(n);
        let result = op(&file, &root);
        file.cache().clear_injected_failures();
        assert_eq!(
            file.cache().stats().outstanding(),
            0,
            "unbalanced after failure at protect {n}"
        );
        match result {
            Ok(_) => return n as usize,
            Err(e) => assert_eq!(e.kind(), ErrorKind::CacheProtocolFailure, "{e}"),
        }
    }
    panic!("operation never succeeded");
}

#[test]
fn balanced_on_success_and_not_found() {
    let (file, root) = populated(30);
    let before = file.cache().stats();
    stab::lookup(&file, &root, "name007").unwrap();
    assert!(stab::lookup(&file, &root, "missing").is_err());
    assert!(stab::remove(&file, &root, "missing").is_err());
    let after = file.cache().stats();
    assert!(after.protects > before.protects);
    assert_eq!(after.outstanding(), 0);
}

#[test]
fn balanced_after_duplicate() {
    let (file, root) = populated(30);
    let err = stab::insert(&file, &root, "name010", &hard(0x10), ObjectType::Dataset, None)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DuplicateName);
    assert_eq!(file.cache().stats().outstanding(), 0);
}

#[test]
fn injected_failures_during_splitting_insert() {
    let attempts = sweep(
        || populated(4),
        |file, root| stab::insert(file, root, "zzz", &hard(0x10), ObjectType::Dataset, None),
    );
    assert!(attempts > 0);
}

#[test]
fn injected_failures_during_lookup() {
    sweep(
        || populated(40),
        |file, root| stab::lookup(file, root, "name033"),
    );
}

#[test]
fn injected_failures_during_remove() {
    sweep(
        || populated(40),
        |file, root| stab::remove(file, root, "name020"),
    );
}

#[test]
fn injected_failures_during_iterate() {
    sweep(
        || populated(40),
        |file, root| {
            stab::iterate(file, root, IterOrder::Decreasing, 3, |_| Ok(IterStatus::Continue))
        },
    );
}

#[test]
fn injected_failures_during_group_delete() {
    sweep(
        || {
            let (file, root) = populated(0);
            let (_, child) = file
                .create_group(&root, "child", &GroupCreateProps::new())
                .unwrap();
            for i in 0..12 {
                let obj = file.create_object(vec![]).unwrap();
                file.link_hard(&child, &format!("obj{i}"), obj).unwrap();
            }
            (file, root)
        },
        |file, root| file.unlink(root, "child"),
    );
}

#[test]
fn allocation_failure_leaves_full_leaf_intact() {
    let (file, root) = populated(4);
    file.cache().inject_allocation_failure(0);
    let err = stab::insert(&file, &root, "zzz", &hard(0x10), ObjectType::Dataset, None)
        .unwrap_err();
    file.cache().clear_injected_failures();
    assert_eq!(err.kind(), ErrorKind::AllocationFailure);
    assert_eq!(file.cache().stats().outstanding(), 0);
    assert_eq!(stab::count(&file, &root).unwrap(), 4);
    assert!(!stab::contains(&file, &root, "zzz").unwrap());
    for i in 0..4 {
        assert!(stab::contains(&file, &root, &format!("name{i:03}")).unwrap());
    }
}

#[test]
fn small_cache_budget_evicts_without_losing_data() {
    let file = File::create(
        FileCreateProps::new().sym_leaf_k(2).btree_k(2),
        FileAccessProps::new().metadata_cache(4096),
    )
    .unwrap();
    let root = file.root_group().clone();
    for i in 0..200 {
        file.link_soft(&root, &format!("n{i:03}"), "/t").unwrap();
    }
    assert!(file.cache().stats().evictions > 0);
    assert_eq!(stab::count(&file, &root).unwrap(), 200);
    assert_eq!(
        stab::name_by_index(&file, &root, IterOrder::Increasing, 150).unwrap(),
        "n150"
    );
    assert_eq!(file.cache().stats().outstanding(), 0);
}
