//! Listing and stat entries

use crate::{Address, Metadata};
use serde::{Deserialize, Serialize};

/// Entry kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Directory,
}

/// A resource known to a backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub address: Address,
    pub kind: EntryKind,
    pub metadata: Metadata,
}

impl Entry {
    pub fn file(address: Address, metadata: Metadata) -> Self {
        Self { address, kind: EntryKind::File, metadata }
    }

    pub fn directory(address: Address, metadata: Metadata) -> Self {
        Self { address, kind: EntryKind::Directory, metadata }
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    pub fn is_directory(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn name(&self) -> Option<&str> {
        self.address.name()
    }

    pub fn size(&self) -> Option<u64> {
        self.metadata.size
    }
}
