//! Build manifest and build identity access.
//!
//! A firmware bundle's `BuildManifest.plist` lists one build identity per
//! board/restore-behaviour combination. Each identity maps component names
//! to archive paths and digest metadata under its `Manifest` dictionary.

use std::io::Cursor;

use plist::{Dictionary, Value};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Failed to parse build manifest: {0}")]
    Parse(#[from] plist::Error),

    #[error("Build manifest is missing {0}")]
    Missing(&'static str),

    #[error("No build identity for chip {chip_id:x?} board {board_id:x?} with behavior {behavior}")]
    NoIdentity {
        chip_id: Option<u32>,
        board_id: Option<u32>,
        behavior: String,
    },
}

/// Restore flavor, selecting between erase and update identities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreBehavior {
    Erase,
    Update,
}

impl RestoreBehavior {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestoreBehavior::Erase => "Erase",
            RestoreBehavior::Update => "Update",
        }
    }
}

/// One build variant from the manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildIdentity {
    dict: Dictionary,
}

impl BuildIdentity {
    pub fn new(dict: Dictionary) -> Self {
        Self { dict }
    }

    pub fn as_dictionary(&self) -> &Dictionary {
        &self.dict
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.dict.get(key)
    }

    pub fn data(&self, key: &str) -> Option<&[u8]> {
        self.dict.get(key).and_then(Value::as_data)
    }

    /// Hex-string identifier such as `ApChipID = "0x8930"`.
    pub fn hex_field(&self, key: &str) -> Option<u64> {
        let text = self.dict.get(key)?.as_string()?;
        let digits = text
            .strip_prefix("0x")
            .or_else(|| text.strip_prefix("0X"))
            .unwrap_or(text);
        u64::from_str_radix(digits, 16).ok()
    }

    pub fn chip_id(&self) -> Option<u32> {
        self.hex_field("ApChipID").map(|v| v as u32)
    }

    pub fn board_id(&self) -> Option<u32> {
        self.hex_field("ApBoardID").map(|v| v as u32)
    }

    pub fn unique_build_id(&self) -> Option<&[u8]> {
        self.data("UniqueBuildID")
    }

    pub fn manifest(&self) -> Option<&Dictionary> {
        self.dict.get("Manifest").and_then(Value::as_dictionary)
    }

    fn info(&self) -> Option<&Dictionary> {
        self.dict.get("Info").and_then(Value::as_dictionary)
    }

    pub fn restore_behavior(&self) -> Option<&str> {
        self.info()?.get("RestoreBehavior")?.as_string()
    }

    pub fn variant(&self) -> Option<&str> {
        self.info()?.get("Variant")?.as_string()
    }

    pub fn component(&self, name: &str) -> Option<&Dictionary> {
        self.manifest()?.get(name)?.as_dictionary()
    }

    /// Archive path of a component (`Manifest/<name>/Info/Path`).
    pub fn component_path(&self, name: &str) -> Option<&str> {
        self.component(name)?
            .get("Info")?
            .as_dictionary()?
            .get("Path")?
            .as_string()
    }

    pub fn component_names(&self) -> Vec<&str> {
        self.manifest()
            .map(|m| m.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }
}

/// Parsed `BuildManifest.plist`.
#[derive(Debug, Clone)]
pub struct BuildManifest {
    product_version: String,
    build_version: String,
    identities: Vec<BuildIdentity>,
}

impl BuildManifest {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ManifestError> {
        let value = Value::from_reader(Cursor::new(bytes))?;
        let root = value
            .as_dictionary()
            .ok_or(ManifestError::Missing("root dictionary"))?;
        Self::from_dictionary(root)
    }

    pub fn from_dictionary(root: &Dictionary) -> Result<Self, ManifestError> {
        let product_version = root
            .get("ProductVersion")
            .and_then(Value::as_string)
            .ok_or(ManifestError::Missing("ProductVersion"))?
            .to_string();
        let build_version = root
            .get("ProductBuildVersion")
            .and_then(Value::as_string)
            .ok_or(ManifestError::Missing("ProductBuildVersion"))?
            .to_string();
        let identities = root
            .get("BuildIdentities")
            .and_then(Value::as_array)
            .ok_or(ManifestError::Missing("BuildIdentities"))?
            .iter()
            .filter_map(Value::as_dictionary)
            .map(|d| BuildIdentity::new(d.clone()))
            .collect::<Vec<_>>();

        debug!(
            product_version = %product_version,
            build_version = %build_version,
            identities = identities.len(),
            "Loaded build manifest"
        );

        Ok(Self {
            product_version,
            build_version,
            identities,
        })
    }

    pub fn product_version(&self) -> &str {
        &self.product_version
    }

    pub fn build_version(&self) -> &str {
        &self.build_version
    }

    /// Leading digits of the build version ("9A405" -> 9).
    pub fn build_major(&self) -> u32 {
        build_major(&self.build_version)
    }

    pub fn identities(&self) -> &[BuildIdentity] {
        &self.identities
    }

    /// Pick the identity for a device and restore behavior. An unknown
    /// chip or board ID matches any identity.
    pub fn select_identity(
        &self,
        chip_id: Option<u32>,
        board_id: Option<u32>,
        behavior: RestoreBehavior,
    ) -> Result<&BuildIdentity, ManifestError> {
        let hw_matches = |id: &BuildIdentity| {
            chip_id.is_none_or(|chip| id.chip_id() == Some(chip))
                && board_id.is_none_or(|board| id.board_id() == Some(board))
        };

        self.identities
            .iter()
            .filter(|id| hw_matches(id))
            .find(|id| id.restore_behavior() == Some(behavior.as_str()))
            // Older manifests carry a single identity without Info.
            .or_else(|| {
                self.identities
                    .iter()
                    .find(|id| hw_matches(id) && id.restore_behavior().is_none())
            })
            .ok_or_else(|| ManifestError::NoIdentity {
                chip_id,
                board_id,
                behavior: behavior.as_str().to_string(),
            })
    }
}

pub fn build_major(build_version: &str) -> u32 {
    let digits: String = build_version
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().unwrap_or(0)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_major() {
        assert_eq!(build_major("9A405"), 9);
        assert_eq!(build_major("10B329"), 10);
        assert_eq!(build_major("x"), 0);
    }

    #[test]
    fn test_identity_accessors() {
        let id = fixtures::identity("Erase");
        assert_eq!(id.chip_id(), Some(0x8930));
        assert_eq!(id.board_id(), Some(2));
        assert_eq!(
            id.component_path("RestoreRamDisk"),
            Some("038-1234-001.dmg")
        );
        assert_eq!(id.restore_behavior(), Some("Erase"));
        assert!(id.component_names().contains(&"iBEC"));
        assert!(id.component_path("Missing").is_none());
    }

    #[test]
    fn test_manifest_roundtrip_and_select() {
        let mut xml = Vec::new();
        Value::Dictionary(fixtures::manifest_dict("9A405"))
            .to_writer_xml(&mut xml)
            .unwrap();
        let manifest = BuildManifest::from_bytes(&xml).unwrap();
        assert_eq!(manifest.build_major(), 9);
        assert_eq!(manifest.identities().len(), 2);

        let update = manifest
            .select_identity(Some(0x8930), None, RestoreBehavior::Update)
            .unwrap();
        assert_eq!(update.restore_behavior(), Some("Update"));

        assert!(matches!(
            manifest.select_identity(Some(0x8940), None, RestoreBehavior::Erase),
            Err(ManifestError::NoIdentity { .. })
        ));
    }

    #[test]
    fn test_select_identity_by_board() {
        let root = fixtures::manifest_with(
            "9A405",
            &[
                fixtures::identity_on_board("Erase", 0x00, "board00/"),
                fixtures::identity_on_board("Erase", 0x02, "board02/"),
            ],
        );
        let manifest = BuildManifest::from_dictionary(&root).unwrap();

        let chosen = manifest
            .select_identity(Some(0x8930), Some(0x02), RestoreBehavior::Erase)
            .unwrap();
        assert_eq!(chosen.board_id(), Some(0x02));
        assert_eq!(
            chosen.component_path("AppleLogo"),
            Some("board02/Firmware/all_flash/applelogo.img3")
        );

        // Board 0x00 is a real board, not a wildcard.
        let zero = manifest
            .select_identity(Some(0x8930), Some(0x00), RestoreBehavior::Erase)
            .unwrap();
        assert_eq!(zero.board_id(), Some(0x00));

        assert!(matches!(
            manifest.select_identity(Some(0x8930), Some(0x05), RestoreBehavior::Erase),
            Err(ManifestError::NoIdentity {
                board_id: Some(0x05),
                ..
            })
        ));
    }

    #[test]
    fn test_manifest_missing_fields() {
        let root = Dictionary::new();
        assert!(matches!(
            BuildManifest::from_dictionary(&root),
            Err(ManifestError::Missing("ProductVersion"))
        ));
    }
}
