//! Error types for the group index.

/// Coarse classification of a [`FormatError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A name was absent during lookup or removal.
    NotFound,
    /// An insertion collided with an existing name.
    DuplicateName,
    /// On-disk bytes did not describe a well-formed structure.
    CorruptStructure,
    /// File space or memory could not be allocated.
    AllocationFailure,
    /// A protect or unprotect request on the metadata cache failed.
    CacheProtocolFailure,
    /// A link kind other than hard or soft reached code handling only those.
    LinkTypeUnsupported,
    /// The caller passed an argument outside the accepted range.
    InvalidArgument,
}

/// Errors raised while reading, writing or mutating a group index.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FormatError {
    /// The superblock signature was not found.
    #[error("HDF5 signature not found")]
    SignatureNotFound,
    /// The superblock version is not supported.
    #[error("unsupported superblock version: {0}")]
    UnsupportedVersion(u8),
    /// Unexpected end of data.
    #[error("unexpected EOF: need {expected} bytes, have {available}")]
    UnexpectedEof {
        /// Number of bytes expected.
        expected: usize,
        /// Number of bytes actually available.
        available: usize,
    },
    /// Invalid offset size (must be 2, 4, or 8).
    #[error("invalid offset size: {0} (must be 2, 4, or 8)")]
    InvalidOffsetSize(u8),
    /// Invalid length size (must be 2, 4, or 8).
    #[error("invalid length size: {0} (must be 2, 4, or 8)")]
    InvalidLengthSize(u8),
    /// A B-tree node did not start with `TREE`.
    #[error("invalid B-tree node signature")]
    InvalidBTreeSignature,
    /// A B-tree node belongs to a different tree class.
    #[error("invalid B-tree node type: {0}")]
    InvalidBTreeNodeType(u8),
    /// A local heap did not start with `HEAP`.
    #[error("invalid local heap signature")]
    InvalidLocalHeapSignature,
    /// Unsupported local heap version.
    #[error("invalid local heap version: {0}")]
    InvalidLocalHeapVersion(u8),
    /// A symbol table node did not start with `SNOD`.
    #[error("invalid symbol table node signature")]
    InvalidSymbolTableNodeSignature,
    /// Unsupported symbol table node version.
    #[error("invalid symbol table node version: {0}")]
    InvalidSymbolTableNodeVersion(u8),
    /// Unsupported object header version.
    #[error("invalid object header version: {0}")]
    InvalidObjectHeaderVersion(u8),
    /// A directory entry carried a cache type outside the known set.
    #[error("unknown symbol table entry cache type: {0}")]
    UnknownCacheType(u32),
    /// A structure decoded cleanly but its contents are inconsistent.
    #[error("corrupt structure: {0}")]
    Corrupt(String),
    /// Name not present in the group.
    #[error("name not found: {0:?}")]
    NotFound(String),
    /// Name already present in the group.
    #[error("name already exists: {0:?}")]
    DuplicateName(String),
    /// File space allocation failed.
    #[error("unable to allocate {size} bytes of file space")]
    AllocationFailed {
        /// Requested size in bytes.
        size: u64,
    },
    /// The metadata cache refused to protect an entry.
    #[error("unable to protect metadata at {address:#x}: {reason}")]
    Protect {
        /// File address of the entry.
        address: u64,
        /// Why the protect failed.
        reason: &'static str,
    },
    /// The metadata cache refused to release an entry.
    #[error("unable to unprotect metadata at {address:#x}: {reason}")]
    Unprotect {
        /// File address of the entry.
        address: u64,
        /// Why the unprotect failed.
        reason: &'static str,
    },
    /// A string could not be stored in the local heap.
    #[error("unable to insert into local heap: {0}")]
    HeapInsert(Box<FormatError>),
    /// The link kind is not representable in a symbol table entry.
    #[error("unsupported link type: {0}")]
    UnsupportedLinkType(&'static str),
    /// Argument out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// An operation failed and releasing its protected metadata failed too.
    #[error("{error} (while cleaning up: {cleanup})")]
    Cleanup {
        /// The failure that aborted the operation.
        error: Box<FormatError>,
        /// The failure raised while releasing protected entries.
        cleanup: Box<FormatError>,
    },
}

impl FormatError {
    /// Classify this error.
    ///
    /// A [`FormatError::Cleanup`] reports the kind of the original failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FormatError::NotFound(_) => ErrorKind::NotFound,
            FormatError::DuplicateName(_) => ErrorKind::DuplicateName,
            FormatError::AllocationFailed { .. } => ErrorKind::AllocationFailure,
            FormatError::Protect { .. } | FormatError::Unprotect { .. } => {
                ErrorKind::CacheProtocolFailure
            }
            FormatError::HeapInsert(inner) => inner.kind(),
            FormatError::UnsupportedLinkType(_) => ErrorKind::LinkTypeUnsupported,
            FormatError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            FormatError::Cleanup { error, .. } => error.kind(),
            _ => ErrorKind::CorruptStructure,
        }
    }

    /// Combine a primary failure with the outcome of releasing resources.
    pub(crate) fn with_cleanup(self, cleanup: Result<(), FormatError>) -> FormatError {
        match cleanup {
            Ok(()) => self,
            Err(cleanup) => FormatError::Cleanup {
                error: Box::new(self),
                cleanup: Box::new(cleanup),
            },
        }
    }
}

/// Join the result of an operation body with the result of its cleanup.
///
/// The body's error takes precedence; a cleanup failure after a successful
/// body is returned on its own.
pub(crate) fn finish<T>(
    body: Result<T, FormatError>,
    cleanup: Result<(), FormatError>,
) -> Result<T, FormatError> {
    match body {
        Ok(value) => cleanup.map(|()| value),
        Err(error) => Err(error.with_cleanup(cleanup)),
    }
}
