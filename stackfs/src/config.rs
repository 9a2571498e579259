use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::Result;

/// The stackfs configuration.
///
/// All state lives under three directories: `images` (one subdirectory per
/// image, holding the instance layers), `mounts` (one public mountpoint per
/// stackpoint) and `metadata` (the persisted manifest). A configuration file
/// is optional; when absent every field keeps its default.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct StackConfig {
    version: usize,
    /// Directory holding the image trees.
    #[serde(default = "StackConfig::default_images_dir")]
    pub images_dir: PathBuf,
    /// Directory holding the public stackpoint mountpoints.
    #[serde(default = "StackConfig::default_mounts_dir")]
    pub mounts_dir: PathBuf,
    /// Directory holding the persisted manifest documents.
    #[serde(default = "StackConfig::default_metadata_dir")]
    pub metadata_dir: PathBuf,
    /// Path of the advisory lock serializing mutating sessions.
    #[serde(default = "StackConfig::default_lock_path")]
    pub lock_path: PathBuf,
    /// Forces the legacy (single-lower) mount strategy on or off.
    ///
    /// When unset, the strategy is detected from the running kernel.
    #[serde(default)]
    pub legacy: Option<bool>,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            images_dir: Self::default_images_dir(),
            mounts_dir: Self::default_mounts_dir(),
            metadata_dir: Self::default_metadata_dir(),
            lock_path: Self::default_lock_path(),
            legacy: None,
        }
    }
}

impl StackConfig {
    /// The default path for the configuration file.
    pub const PATH: &str = "stackfs.toml";

    /// The current version of the configuration format.
    pub const CURRENT_VERSION: usize = 1;

    fn default_images_dir() -> PathBuf {
        PathBuf::from("images")
    }

    fn default_mounts_dir() -> PathBuf {
        PathBuf::from("mounts")
    }

    fn default_metadata_dir() -> PathBuf {
        PathBuf::from("metadata")
    }

    fn default_lock_path() -> PathBuf {
        PathBuf::from("/tmp/stacksDb.lock")
    }

    /// Loads the configuration from the given file path, falling back to
    /// the defaults when the file does not exist.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            fs::read_to_string(path)?.as_str().try_into()
        } else {
            Ok(Self::default())
        }
    }

    /// Deserializes a configuration TOML.
    pub fn parse(config: &str) -> Result<Self> {
        let config = toml::from_str::<Self>(config)?;
        Ok(config)
    }

    /// Serializes the configuration into TOML.
    pub fn serialize(&self) -> Result<String> {
        Ok(toml::to_string_pretty(&self)?)
    }
}

impl TryFrom<&str> for StackConfig {
    type Error = crate::Error;

    fn try_from(value: &str) -> std::result::Result<Self, Self::Error> {
        Self::parse(value)
    }
}
