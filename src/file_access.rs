//! File accesses and output content as reported by the execution sandbox.

use crate::fingerprint::ContentHash;
use crate::paths::PathId;
use crate::pip::{DirectoryArtifact, FileArtifact, PipId};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum RequestedAccess {
    Read,
    /// Existence check, possibly of an absent path.
    Probe,
    Enumerate,
    Write,
}

impl RequestedAccess {
    pub fn is_write(self) -> bool {
        self == RequestedAccess::Write
    }
}

/// One observed access by one pip run.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ReportedFileAccess {
    pub path: PathId,
    pub access: RequestedAccess,
    pub pip: PipId,
}

impl ReportedFileAccess {
    pub fn read(pip: PipId, path: PathId) -> Self {
        ReportedFileAccess {
            path,
            access: RequestedAccess::Read,
            pip,
        }
    }

    pub fn write(pip: PipId, path: PathId) -> Self {
        ReportedFileAccess {
            path,
            access: RequestedAccess::Write,
            pip,
        }
    }
}

/// An access that matched an allowlist entry.  Matches of non-cacheable
/// entries are permitted but make the run ineligible for caching.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AllowlistedAccess {
    pub access: ReportedFileAccess,
    pub cacheable: bool,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct FileMaterializationInfo {
    pub hash: ContentHash,
    pub length: u64,
}

impl FileMaterializationInfo {
    pub fn of(bytes: &[u8]) -> Self {
        FileMaterializationInfo {
            hash: ContentHash::of(bytes),
            length: bytes.len() as u64,
        }
    }
}

/// Where an output's content came from.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum PipOutputOrigin {
    /// Freshly written by executing the pip.
    Produced,
    /// Already present and up to date on disk.
    UpToDate,
    /// Placed from the cache.
    DeployedFromCache,
    /// Known by content hash only; not on disk.
    NotMaterialized,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct OutputContent {
    pub file: FileArtifact,
    pub info: FileMaterializationInfo,
    pub origin: PipOutputOrigin,
}

/// Files a pip produced under one of its opaque output directories.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DynamicOutputs {
    pub directory: DirectoryArtifact,
    pub files: Vec<FileArtifact>,
}
