//! Firmware archive access.
//!
//! Container extraction happens elsewhere; the restore flow only needs to
//! read component bytes by their in-archive path and load the build
//! manifest.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::manifest::{BuildManifest, ManifestError};

pub const BUILD_MANIFEST_PATH: &str = "BuildManifest.plist";

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("{0} not found in firmware archive")]
    NotFound(String),

    #[error("Invalid archive path {0:?}")]
    InvalidPath(String),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Manifest(#[from] ManifestError),
}

/// Read access to an unpacked firmware bundle.
pub trait FirmwareArchive {
    fn component_bytes(&self, path: &str) -> Result<Vec<u8>, ArchiveError>;

    fn build_manifest(&self) -> Result<BuildManifest, ArchiveError> {
        let bytes = self.component_bytes(BUILD_MANIFEST_PATH)?;
        Ok(BuildManifest::from_bytes(&bytes)?)
    }
}

/// Firmware bundle already extracted to a directory.
#[derive(Debug, Clone)]
pub struct ExtractedArchive {
    root: PathBuf,
}

impl ExtractedArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve an in-archive path, refusing anything that escapes the root.
    fn resolve(&self, path: &str) -> Result<PathBuf, ArchiveError> {
        let rel = Path::new(path);
        let safe = rel
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if path.is_empty() || !safe {
            return Err(ArchiveError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(rel))
    }
}

impl FirmwareArchive for ExtractedArchive {
    fn component_bytes(&self, path: &str) -> Result<Vec<u8>, ArchiveError> {
        let full = self.resolve(path)?;
        match fs::read(&full) {
            Ok(bytes) => {
                debug!(path, bytes = bytes.len(), "Read archive entry");
                Ok(bytes)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(ArchiveError::NotFound(path.to_string()))
            }
            Err(source) => Err(ArchiveError::Io { path: full, source }),
        }
    }
}

/// In-memory archive.
#[derive(Debug, Clone, Default)]
pub struct MemoryArchive {
    entries: HashMap<String, Vec<u8>>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.entries.insert(path.into(), bytes.into());
    }

    pub fn with(mut self, path: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.insert(path, bytes);
        self
    }

    pub fn remove(&mut self, path: &str) -> Option<Vec<u8>> {
        self.entries.remove(path)
    }
}

impl FirmwareArchive for MemoryArchive {
    fn component_bytes(&self, path: &str) -> Result<Vec<u8>, ArchiveError> {
        self.entries
            .get(path)
            .cloned()
            .ok_or_else(|| ArchiveError::NotFound(path.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracted_archive_reads_entries() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("Firmware/all_flash")).unwrap();
        fs::write(dir.path().join("Firmware/all_flash/logo.img3"), b"logo").unwrap();

        let archive = ExtractedArchive::new(dir.path());
        assert_eq!(
            archive.component_bytes("Firmware/all_flash/logo.img3").unwrap(),
            b"logo"
        );
        assert!(matches!(
            archive.component_bytes("Firmware/missing.img3"),
            Err(ArchiveError::NotFound(_))
        ));
    }

    #[test]
    fn test_extracted_archive_rejects_escape() {
        let archive = ExtractedArchive::new("/tmp/fw");
        for bad in ["../etc/passwd", "/etc/passwd", "a/../../b", ""] {
            assert!(
                matches!(archive.component_bytes(bad), Err(ArchiveError::InvalidPath(_))),
                "{bad}"
            );
        }
    }

    #[test]
    fn test_manifest_from_archive() {
        let mut xml = Vec::new();
        plist::Value::Dictionary(crate::manifest::fixtures::manifest_dict("9A334"))
            .to_writer_xml(&mut xml)
            .unwrap();
        let archive = MemoryArchive::new().with(BUILD_MANIFEST_PATH, xml);
        let manifest = archive.build_manifest().unwrap();
        assert_eq!(manifest.build_version(), "9A334");

        let empty = MemoryArchive::new();
        assert!(matches!(
            empty.build_manifest(),
            Err(ArchiveError::NotFound(_))
        ));
    }
}
