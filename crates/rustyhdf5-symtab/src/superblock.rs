//! Version 0 superblock: format signature, address and length widths, the
//! group K values and the root group's symbol table entry.

use crate::encoding::{Address, Decoder, Encoder, FileSizes, UNDEFINED_ADDRESS};
use crate::entry::{entry_size, SymbolTableEntry};
use crate::error::FormatError;

/// HDF5 format signature.
pub const SIGNATURE: [u8; 8] = [0x89, b'H', b'D', b'F', b'\r', b'\n', 0x1a, b'\n'];

// sig(8) + version(1) + free_space_ver(1) + root_grp_ver(1) + reserved(1)
// + shared_hdr_ver(1) + offset_size(1) + length_size(1) + reserved(1)
// + group_leaf_k(2) + group_internal_k(2) + consistency_flags(4)
const FIXED_SIZE: usize = 24;

/// A parsed version 0 superblock.
#[derive(Debug, Clone, PartialEq)]
pub struct Superblock {
    /// Address and length widths.
    pub sizes: FileSizes,
    /// Symbol table leaf K.
    pub sym_leaf_k: u16,
    /// Group B-tree internal node K.
    pub btree_k: u16,
    /// File consistency flags.
    pub consistency_flags: u32,
    /// Base address; all other addresses are relative to it.
    pub base_address: Address,
    /// End of file address.
    pub eof_address: u64,
    /// Entry for the root group.
    pub root: SymbolTableEntry,
}

impl Superblock {
    /// Encoded size for the given widths.
    pub fn encoded_size(sizes: FileSizes) -> usize {
        FIXED_SIZE + 4 * sizes.sizeof_addr() + entry_size(sizes)
    }

    /// Parse a superblock at the start of `data`.
    pub fn parse(data: &[u8]) -> Result<Superblock, FormatError> {
        if data.len() < SIGNATURE.len() || data[..SIGNATURE.len()] != SIGNATURE {
            return Err(FormatError::SignatureNotFound);
        }
        let mut d = Decoder::new(data, FileSizes::default());
        d.ensure(FIXED_SIZE)?;
        d.skip(SIGNATURE.len())?;

        let version = d.u8()?;
        if version != 0 {
            return Err(FormatError::UnsupportedVersion(version));
        }
        let free_space_version = d.u8()?;
        let root_group_version = d.u8()?;
        d.skip(1)?;
        let shared_header_version = d.u8()?;
        for v in [free_space_version, root_group_version, shared_header_version] {
            if v != 0 {
                return Err(FormatError::UnsupportedVersion(v));
            }
        }

        let offset_size = d.u8()?;
        let length_size = d.u8()?;
        d.skip(1)?;
        let sizes = FileSizes::new(offset_size, length_size)?;

        let sym_leaf_k = d.u16()?;
        let btree_k = d.u16()?;
        if sym_leaf_k == 0 || btree_k == 0 {
            return Err(FormatError::Corrupt(format!(
                "superblock K values must be positive: leaf {sym_leaf_k}, internal {btree_k}"
            )));
        }
        let consistency_flags = d.u32()?;

        let rest = d.bytes(d.remaining())?;
        let mut d = Decoder::new(rest, sizes);
        let base_address = d.address()?;
        let _free_space_address = d.address()?;
        let eof_address = d.address()?;
        let _driver_info_address = d.address()?;
        let root = SymbolTableEntry::decode(&mut d)?;

        Ok(Superblock {
            sizes,
            sym_leaf_k,
            btree_k,
            consistency_flags,
            base_address,
            eof_address,
            root,
        })
    }

    /// Serialize the superblock.
    pub fn to_bytes(&self) -> Vec<u8> {
        let sizes = self.sizes;
        let mut e = Encoder::with_capacity(sizes, Self::encoded_size(sizes));
        e.bytes(&SIGNATURE);
        e.zeros(4); // superblock, free space, root group versions; reserved
        e.u8(0); // shared header version
        e.u8(sizes.sizeof_addr() as u8);
        e.u8(sizes.sizeof_size() as u8);
        e.u8(0);
        e.u16(self.sym_leaf_k);
        e.u16(self.btree_k);
        e.u32(self.consistency_flags);
        e.address(self.base_address);
        e.address(UNDEFINED_ADDRESS);
        e.address(self.eof_address);
        e.address(UNDEFINED_ADDRESS);
        SymbolTableEntry::encode(Some(&self.root), &mut e, sizes);
        e.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::CachedInfo;

    fn sample(sizes: FileSizes) -> Superblock {
        Superblock {
            sizes,
            sym_leaf_k: 4,
            btree_k: 16,
            consistency_flags: 0,
            base_address: 0,
            eof_address: 4096,
            root: SymbolTableEntry {
                name_offset: 0,
                header_address: 96,
                cached: CachedInfo::SymbolTable {
                    btree_address: 136,
                    heap_address: 680,
                },
            },
        }
    }

    #[test]
    fn v0_8byte_offsets() {
        let sb = sample(FileSizes::default());
        let bytes = sb.to_bytes();
        assert_eq!(bytes.len(), Superblock::encoded_size(FileSizes::default()));
        assert_eq!(bytes.len(), 96);
        assert_eq!(bytes[13], 8);
        assert_eq!(Superblock::parse(&bytes).unwrap(), sb);
    }

    #[test]
    fn v0_4byte_offsets() {
        let sizes = FileSizes::new(4, 4).unwrap();
        let sb = sample(sizes);
        let bytes = sb.to_bytes();
        assert_eq!(bytes.len(), 24 + 16 + 32);
        let back = Superblock::parse(&bytes).unwrap();
        assert_eq!(back.eof_address, 4096);
        assert_eq!(back.root.header_address, 96);
    }

    #[test]
    fn bad_signature() {
        let mut bytes = sample(FileSizes::default()).to_bytes();
        bytes[1] = b'X';
        assert_eq!(
            Superblock::parse(&bytes).unwrap_err(),
            FormatError::SignatureNotFound
        );
    }

    #[test]
    fn unsupported_version() {
        let mut bytes = sample(FileSizes::default()).to_bytes();
        bytes[8] = 2;
        assert_eq!(
            Superblock::parse(&bytes).unwrap_err(),
            FormatError::UnsupportedVersion(2)
        );
    }

    #[test]
    fn truncated_is_eof() {
        let bytes = sample(FileSizes::default()).to_bytes();
        assert!(matches!(
            Superblock::parse(&bytes[..60]).unwrap_err(),
            FormatError::UnexpectedEof { .. }
        ));
    }
}
