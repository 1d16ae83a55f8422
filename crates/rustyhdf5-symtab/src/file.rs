//! An HDF5 file held in memory: superblock, metadata cache and root group.
//!
//! [`File::create`] starts an empty file, [`File::open`] loads an image
//! produced by [`File::close`]. Everything between goes through the
//! metadata cache; the image is only brought up to date on close.

use tracing::{debug, info};

use crate::encoding::{Address, FileSizes, UNDEFINED_ADDRESS};
use crate::entry::{CachedInfo, SymbolTableEntry};
use crate::error::FormatError;
use crate::file_space::FileSpace;
use crate::link::{LinkTarget, ObjectType};
use crate::metadata_cache::MetadataCache;
use crate::object_header::{CopyMap, HeaderMessage, ObjectHeader};
use crate::property_list::{
    CopyProps, FileAccessProps, FileCreateProps, GroupCreateProps, TransferProps,
};
use crate::stab;
use crate::superblock::Superblock;
use crate::symbol_table::SymbolTableMessage;

fn unset_root() -> SymbolTableMessage {
    SymbolTableMessage {
        btree_address: UNDEFINED_ADDRESS,
        local_heap_address: UNDEFINED_ADDRESS,
    }
}

/// An open file.
#[derive(Debug)]
pub struct File {
    cache: MetadataCache,
    create_props: FileCreateProps,
    access_props: FileAccessProps,
    transfer: TransferProps,
    root_header: Address,
    root: SymbolTableMessage,
}

impl File {
    /// Create an empty file holding only the root group.
    pub fn create(
        create_props: FileCreateProps,
        access_props: FileAccessProps,
    ) -> Result<File, FormatError> {
        let sizes = create_props.validate()?;
        let space = FileSpace::new(Superblock::encoded_size(sizes) as u64);
        let cache = MetadataCache::with_capacity(space, sizes, access_props.metadata_cache_bytes);
        let mut file = File {
            cache,
            create_props,
            access_props,
            transfer: TransferProps::default(),
            root_header: UNDEFINED_ADDRESS,
            root: unset_root(),
        };

        let (root_header, root) = stab::create(&file, &GroupCreateProps::new())?;
        // The superblock holds the root group's only link.
        ObjectHeader::adjust_link_count(&file, root_header, 1)?;
        file.root_header = root_header;
        file.root = root;
        debug!(root_header, "file.create");
        Ok(file)
    }

    /// Load a file image.
    ///
    /// The root group's symbol table message is checked against the copy
    /// cached in the superblock and repaired from it when broken.
    pub fn open(image: Vec<u8>, access_props: FileAccessProps) -> Result<File, FormatError> {
        let sb = Superblock::parse(&image)?;
        if sb.base_address != 0 {
            return Err(FormatError::Corrupt(format!(
                "unsupported base address {:#x}",
                sb.base_address
            )));
        }
        if sb.eof_address > image.len() as u64 {
            return Err(FormatError::UnexpectedEof {
                expected: sb.eof_address as usize,
                available: image.len(),
            });
        }
        let create_props = FileCreateProps::new()
            .sizes(
                sb.sizes.sizeof_addr() as u8,
                sb.sizes.sizeof_size() as u8,
            )
            .sym_leaf_k(sb.sym_leaf_k)
            .btree_k(sb.btree_k);
        create_props.validate()?;

        let space = FileSpace::from_image(image);
        let cache =
            MetadataCache::with_capacity(space, sb.sizes, access_props.metadata_cache_bytes);
        let mut file = File {
            cache,
            create_props,
            access_props,
            transfer: TransferProps::default(),
            root_header: sb.root.header_address,
            root: unset_root(),
        };

        let cached = sb.root.symbol_table();
        let stored = ObjectHeader::read_symbol_table(&file.cache, file.root_header)?;
        let root = match (stored, cached) {
            (Some(stored), cached) => stab::validate(&file, &stored, cached.as_ref())?,
            (None, Some(cached)) => stab::validate(&file, &cached, None)?,
            (None, None) => {
                return Err(FormatError::Corrupt(
                    "root object header has no symbol table message".into(),
                ))
            }
        };
        file.root = root;
        info!(
            root_header = file.root_header,
            eof = sb.eof_address,
            "file.open"
        );
        Ok(file)
    }

    /// Flush all metadata and return the file image.
    pub fn close(self) -> Result<Vec<u8>, FormatError> {
        let sizes = self.sizes();
        let sb = Superblock {
            sizes,
            sym_leaf_k: self.create_props.sym_leaf_k,
            btree_k: self.create_props.btree_k,
            consistency_flags: 0,
            base_address: 0,
            eof_address: self.cache.eoa(),
            root: SymbolTableEntry {
                name_offset: 0,
                header_address: self.root_header,
                cached: CachedInfo::SymbolTable {
                    btree_address: self.root.btree_address,
                    heap_address: self.root.local_heap_address,
                },
            },
        };
        self.cache.flush()?;
        self.cache.write_raw(0, &sb.to_bytes())?;
        let image = self.cache.into_space()?.into_image();
        debug!(len = image.len(), "file.close");
        Ok(image)
    }

    /// The metadata cache.
    pub fn cache(&self) -> &MetadataCache {
        &self.cache
    }

    /// Address and length widths.
    pub fn sizes(&self) -> FileSizes {
        self.cache.sizes()
    }

    /// Creation properties recorded in the superblock.
    pub fn create_props(&self) -> &FileCreateProps {
        &self.create_props
    }

    /// Access properties the file was opened with.
    pub fn access_props(&self) -> &FileAccessProps {
        &self.access_props
    }

    /// Transfer properties applied to B-tree splits.
    pub fn transfer_props(&self) -> &TransferProps {
        &self.transfer
    }

    /// Replace the transfer properties.
    pub fn set_transfer_props(&mut self, props: TransferProps) -> Result<(), FormatError> {
        props.validate()?;
        self.transfer = props;
        Ok(())
    }

    /// Symbol table message of the root group.
    pub fn root_group(&self) -> &SymbolTableMessage {
        &self.root
    }

    /// Object header address of the root group.
    pub fn root_header_address(&self) -> Address {
        self.root_header
    }

    /// Create a group and link it into `parent` as `name`.
    pub fn create_group(
        &self,
        parent: &SymbolTableMessage,
        name: &str,
        props: &GroupCreateProps,
    ) -> Result<(Address, SymbolTableMessage), FormatError> {
        let (header, group) = stab::create(self, props)?;
        let target = LinkTarget::Hard {
            object_header_address: header,
        };
        if let Err(e) = stab::insert(self, parent, name, &target, ObjectType::Group, Some(&group)) {
            // A header with no links is deleted by a zero adjustment.
            let cleanup = ObjectHeader::adjust_link_count(self, header, 0).map(|_| ());
            return Err(e.with_cleanup(cleanup));
        }
        ObjectHeader::adjust_link_count(self, header, 1)?;
        Ok((header, group))
    }

    /// Create an object header with no links to it. Link it with
    /// [`File::link_hard`] or it is leaked.
    pub fn create_object(&self, messages: Vec<HeaderMessage>) -> Result<Address, FormatError> {
        ObjectHeader::create(&self.cache, messages, 0)
    }

    /// Add a hard link to the object at `header`.
    pub fn link_hard(
        &self,
        parent: &SymbolTableMessage,
        name: &str,
        header: Address,
    ) -> Result<(), FormatError> {
        let target = LinkTarget::Hard {
            object_header_address: header,
        };
        stab::insert(self, parent, name, &target, ObjectType::Unknown, None)?;
        ObjectHeader::adjust_link_count(self, header, 1)?;
        Ok(())
    }

    /// Add a soft link holding `target_path`.
    pub fn link_soft(
        &self,
        parent: &SymbolTableMessage,
        name: &str,
        target_path: &str,
    ) -> Result<(), FormatError> {
        let target = LinkTarget::Soft {
            target_path: target_path.to_owned(),
        };
        stab::insert(self, parent, name, &target, ObjectType::Unknown, None)
    }

    /// Remove the link `name` from `parent`.
    pub fn unlink(&self, parent: &SymbolTableMessage, name: &str) -> Result<(), FormatError> {
        stab::remove(self, parent, name)
    }

    /// Copy the object at `addr` into `dst` and link the copy into
    /// `dst_parent` as `name`. Returns the copy's header address.
    pub fn copy_object(
        &self,
        addr: Address,
        dst: &File,
        dst_parent: &SymbolTableMessage,
        name: &str,
        props: &CopyProps,
    ) -> Result<Address, FormatError> {
        let mut map = CopyMap::new();
        let copied = ObjectHeader::copy_to(self, addr, dst, &mut map, props)?;
        let obj_type = ObjectHeader::read_object_type(dst.cache(), copied)?;
        let crt_info = ObjectHeader::read_symbol_table(dst.cache(), copied)?;
        let target = LinkTarget::Hard {
            object_header_address: copied,
        };
        if let Err(e) = stab::insert(dst, dst_parent, name, &target, obj_type, crt_info.as_ref()) {
            let cleanup = ObjectHeader::adjust_link_count(dst, copied, -1).map(|_| ());
            return Err(e.with_cleanup(cleanup));
        }
        debug!(src = addr, dst = copied, objects = map.len(), "file.copy_object");
        Ok(copied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::stab::IterOrder;

    #[test]
    fn create_then_reopen_empty() {
        let file = File::create(FileCreateProps::new(), FileAccessProps::new()).unwrap();
        let root = file.root_group().clone();
        let root_header = file.root_header_address();
        assert_eq!(ObjectHeader::read_link_count(file.cache(), root_header).unwrap(), 1);

        let image = file.close().unwrap();
        let sb = Superblock::parse(&image).unwrap();
        assert_eq!(sb.eof_address, image.len() as u64);
        assert_eq!(sb.root.symbol_table(), Some(root.clone()));

        let file = File::open(image, FileAccessProps::new()).unwrap();
        assert_eq!(file.root_group(), &root);
        assert_eq!(stab::count(&file, &root).unwrap(), 0);
    }

    #[test]
    fn group_links_survive_reopen() {
        let props = FileCreateProps::new().sizes(4, 4).sym_leaf_k(2).btree_k(2);
        let file = File::create(props.clone(), FileAccessProps::new()).unwrap();
        let root = file.root_group().clone();
        for i in 0..20 {
            file.create_group(&root, &format!("g{i:02}"), &GroupCreateProps::new())
                .unwrap();
        }
        file.link_soft(&root, "alias", "/g03").unwrap();
        let image = file.close().unwrap();

        let file = File::open(image, FileAccessProps::new()).unwrap();
        assert_eq!(file.create_props(), &props);
        let root = file.root_group().clone();
        assert_eq!(stab::count(&file, &root).unwrap(), 21);
        assert_eq!(
            stab::name_by_index(&file, &root, IterOrder::Increasing, 0).unwrap(),
            "alias"
        );
        let g03 = stab::resolve_path(&file, &root, "/g03").unwrap();
        assert_eq!(stab::resolve_path(&file, &root, "alias").unwrap(), g03);
    }

    #[test]
    fn duplicate_group_name_cleans_up_header() {
        let file = File::create(FileCreateProps::new(), FileAccessProps::new()).unwrap();
        let root = file.root_group().clone();
        file.create_group(&root, "g", &GroupCreateProps::new()).unwrap();
        let eoa = file.cache().eoa();
        let err = file
            .create_group(&root, "g", &GroupCreateProps::new())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateName);
        assert_eq!(file.cache().eoa(), eoa);
        assert_eq!(file.cache().stats().outstanding(), 0);
    }

    #[test]
    fn open_rejects_garbage() {
        let err = File::open(vec![0; 128], FileAccessProps::new()).unwrap_err();
        assert_eq!(err, FormatError::SignatureNotFound);
    }

    #[test]
    fn set_transfer_props_validates() {
        let mut file = File::create(FileCreateProps::new(), FileAccessProps::new()).unwrap();
        assert!(file
            .set_transfer_props(TransferProps::new().split_ratios(0.2, 1.5, 0.8))
            .is_err());
        file.set_transfer_props(TransferProps::new().split_ratios(0.2, 0.5, 0.8))
            .unwrap();
        assert_eq!(file.transfer_props().btree_split_ratios, [0.2, 0.5, 0.8]);
    }
}
