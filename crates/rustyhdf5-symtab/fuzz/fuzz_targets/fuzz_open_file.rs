#![no_main]
use libfuzzer_sys::fuzz_target;
use rustyhdf5_symtab::btree::IterStatus;
use rustyhdf5_symtab::stab::{self, IterOrder};
use rustyhdf5_symtab::{File, FileAccessProps};

fuzz_target!(|data: &[u8]| {
    // Full open: superblock → root object header → root B-tree and heap
    let file = match File::open(data.to_vec(), FileAccessProps::new()) {
        Ok(f) => f,
        Err(_) => return,
    };
    let root = file.root_group().clone();
    let _ = stab::iterate(&file, &root, IterOrder::Increasing, 0, |_| Ok(IterStatus::Continue));
    let _ = stab::resolve_path(&file, &root, "/a/b");
});
