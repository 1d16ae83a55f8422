//! Link views handed to callers of the group index.

use crate::encoding::Address;

/// What a link points to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkTarget {
    /// Hard link pointing to an object header address.
    Hard { object_header_address: Address },
    /// Soft (symbolic) link with a target path string.
    Soft { target_path: String },
    /// External link pointing to a file and object path within it.
    ///
    /// Symbol table entries cannot represent these.
    External {
        filename: String,
        object_path: String,
    },
}

impl LinkTarget {
    /// Short name of the link kind.
    pub fn kind_name(&self) -> &'static str {
        match self {
            LinkTarget::Hard { .. } => "hard",
            LinkTarget::Soft { .. } => "soft",
            LinkTarget::External { .. } => "external",
        }
    }
}

/// A named link inside a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    /// Name of this link.
    pub name: String,
    /// What this link points to.
    pub target: LinkTarget,
}

impl Link {
    /// Hard link named `name`.
    pub fn hard(name: impl Into<String>, object_header_address: Address) -> Self {
        Self {
            name: name.into(),
            target: LinkTarget::Hard {
                object_header_address,
            },
        }
    }

    /// Soft link named `name`.
    pub fn soft(name: impl Into<String>, target_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: LinkTarget::Soft {
                target_path: target_path.into(),
            },
        }
    }
}

/// Kind of object a link resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    /// Not known without reading the object header.
    Unknown,
    /// A group.
    Group,
    /// A dataset.
    Dataset,
    /// A committed datatype.
    NamedDatatype,
}
