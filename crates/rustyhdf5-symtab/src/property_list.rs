//! Property lists for file creation, file access, transfers, groups and copies.
//!
//! Each list is a plain struct with public fields, a `Default` matching the
//! library defaults, and chainable `mut self` setters.

use crate::encoding::FileSizes;
use crate::error::FormatError;

/// Default metadata cache size: 2 MiB.
pub const DEFAULT_METADATA_CACHE_BYTES: usize = 2 * 1024 * 1024;

/// Maximum metadata cache size: 32 MiB.
pub const MAX_METADATA_CACHE_BYTES: usize = 32 * 1024 * 1024;

/// File creation properties.
///
/// Fixed for the life of the file and recorded in the superblock.
#[derive(Debug, Clone, PartialEq)]
pub struct FileCreateProps {
    /// Bytes per file address (2, 4 or 8).
    pub offset_size: u8,
    /// Bytes per file length (2, 4 or 8).
    pub length_size: u8,
    /// Symbol table leaf K; a leaf node holds up to `2 * sym_leaf_k` entries.
    pub sym_leaf_k: u16,
    /// Group B-tree K; an internal node holds up to `2 * btree_k` children.
    pub btree_k: u16,
}

impl Default for FileCreateProps {
    fn default() -> Self {
        Self {
            offset_size: 8,
            length_size: 8,
            sym_leaf_k: 4,
            btree_k: 16,
        }
    }
}

impl FileCreateProps {
    /// Create default file creation properties.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set address and length widths.
    pub fn sizes(mut self, offset_size: u8, length_size: u8) -> Self {
        self.offset_size = offset_size;
        self.length_size = length_size;
        self
    }

    /// Set the symbol table leaf K.
    pub fn sym_leaf_k(mut self, k: u16) -> Self {
        self.sym_leaf_k = k;
        self
    }

    /// Set the group B-tree internal node K.
    pub fn btree_k(mut self, k: u16) -> Self {
        self.btree_k = k;
        self
    }

    /// Reject widths and K values the format cannot represent.
    pub fn validate(&self) -> Result<FileSizes, FormatError> {
        let sizes = FileSizes::new(self.offset_size, self.length_size)?;
        if self.sym_leaf_k == 0 || self.sym_leaf_k > u16::MAX / 2 {
            return Err(FormatError::InvalidArgument(format!(
                "symbol table leaf K out of range: {}",
                self.sym_leaf_k
            )));
        }
        if self.btree_k == 0 || self.btree_k > u16::MAX / 2 {
            return Err(FormatError::InvalidArgument(format!(
                "B-tree K out of range: {}",
                self.btree_k
            )));
        }
        Ok(sizes)
    }
}

/// File access properties.
#[derive(Debug, Clone, PartialEq)]
pub struct FileAccessProps {
    /// Maximum bytes held by unprotected metadata cache entries.
    pub metadata_cache_bytes: usize,
}

impl Default for FileAccessProps {
    fn default() -> Self {
        Self {
            metadata_cache_bytes: DEFAULT_METADATA_CACHE_BYTES,
        }
    }
}

impl FileAccessProps {
    /// Create default file access properties.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the metadata cache budget, clamped to [`MAX_METADATA_CACHE_BYTES`].
    pub fn metadata_cache(mut self, bytes: usize) -> Self {
        self.metadata_cache_bytes = bytes.min(MAX_METADATA_CACHE_BYTES);
        self
    }
}

/// Data transfer properties consulted by B-tree mutations.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferProps {
    /// Fraction of a full node kept on the left when splitting the
    /// leftmost node, an interior node and the rightmost node.
    pub btree_split_ratios: [f64; 3],
}

impl Default for TransferProps {
    fn default() -> Self {
        Self {
            btree_split_ratios: [0.1, 0.5, 0.9],
        }
    }
}

impl TransferProps {
    /// Create default transfer properties.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the left, middle and right split ratios.
    pub fn split_ratios(mut self, left: f64, middle: f64, right: f64) -> Self {
        self.btree_split_ratios = [left, middle, right];
        self
    }

    /// Reject ratios outside `[0, 1]`.
    pub fn validate(&self) -> Result<(), FormatError> {
        if self
            .btree_split_ratios
            .iter()
            .any(|r| !(0.0..=1.0).contains(r))
        {
            return Err(FormatError::InvalidArgument(format!(
                "split ratios must lie in [0, 1]: {:?}",
                self.btree_split_ratios
            )));
        }
        Ok(())
    }
}

/// Group creation properties.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupCreateProps {
    /// Initial local heap size; 0 derives it from the estimates below.
    pub local_heap_size_hint: u64,
    /// Expected number of links.
    pub est_num_entries: u16,
    /// Expected link name length.
    pub est_name_len: u16,
}

impl Default for GroupCreateProps {
    fn default() -> Self {
        Self {
            local_heap_size_hint: 0,
            est_num_entries: 4,
            est_name_len: 8,
        }
    }
}

impl GroupCreateProps {
    /// Create default group creation properties.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an explicit local heap size hint.
    pub fn local_heap_size_hint(mut self, bytes: u64) -> Self {
        self.local_heap_size_hint = bytes;
        self
    }

    /// Set link count and name length estimates.
    pub fn estimates(mut self, num_entries: u16, name_len: u16) -> Self {
        self.est_num_entries = num_entries;
        self.est_name_len = name_len;
        self
    }
}

/// Object copy properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CopyProps {
    /// Replace soft links with copies of the objects they resolve to.
    pub expand_soft_links: bool,
}

impl CopyProps {
    /// Create default copy properties.
    pub fn new() -> Self {
        Self::default()
    }

    /// Expand soft links while copying.
    pub fn expand_soft_links(mut self) -> Self {
        self.expand_soft_links = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_create_defaults() {
        let fcpl = FileCreateProps::new();
        assert_eq!(fcpl.sym_leaf_k, 4);
        assert_eq!(fcpl.btree_k, 16);
        assert_eq!(fcpl.validate().unwrap(), FileSizes::default());
    }

    #[test]
    fn file_create_rejects_zero_k() {
        let err = FileCreateProps::new().sym_leaf_k(0).validate().unwrap_err();
        assert!(matches!(err, FormatError::InvalidArgument(_)));
    }

    #[test]
    fn metadata_cache_clamped() {
        let fapl = FileAccessProps::new().metadata_cache(usize::MAX);
        assert_eq!(fapl.metadata_cache_bytes, MAX_METADATA_CACHE_BYTES);
    }

    #[test]
    fn split_ratio_validation() {
        assert!(TransferProps::new().validate().is_ok());
        assert!(TransferProps::new()
            .split_ratios(0.1, 1.5, 0.9)
            .validate()
            .is_err());
    }
}
