#![no_main]
use libfuzzer_sys::fuzz_target;
use rustyhdf5_symtab::encoding::Decoder;
use rustyhdf5_symtab::entry::SymbolTableEntry;
use rustyhdf5_symtab::symbol_table::SymbolTableNode;
use rustyhdf5_symtab::FileSizes;

fuzz_target!(|data: &[u8]| {
    // First two bytes pick the widths and K; the rest is the node.
    if data.len() < 2 {
        return;
    }
    let widths = [2u8, 4, 8];
    let offset_size = widths[(data[0] % 3) as usize];
    let length_size = widths[(data[0] / 3 % 3) as usize];
    let sizes = match FileSizes::new(offset_size, length_size) {
        Ok(s) => s,
        Err(_) => return,
    };
    let k = u16::from(data[1] % 64) + 1;
    let body = &data[2..];
    let _ = SymbolTableNode::parse(body, sizes, k);
    let _ = SymbolTableEntry::decode(&mut Decoder::new(body, sizes));
});
