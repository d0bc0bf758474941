use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{PackError, Result};
use crate::manifest::Labels;

/// Search path used to resolve a bare exec name inside the image.
pub const DEFAULT_PATH_ENV: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Default gzip level for image archives.
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

/// Location of the tool's own working area inside the tree being imaged.
///
/// Everything below `dir` belongs to the builder (bundled decompressor,
/// run data, build sources, output) and is never packed into an image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolLayout {
    /// Top-level reserved directory (default `/baci`)
    pub dir: PathBuf,
}

impl Default for ToolLayout {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/baci"),
        }
    }
}

impl ToolLayout {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Minimal root holding the bundled decompressor and its libraries.
    pub fn root_dir(&self) -> PathBuf {
        self.dir.join("root")
    }

    /// Where finished images are written.
    pub fn dest_dir(&self) -> PathBuf {
        self.dir.join("dest")
    }

    /// Bundled xz executable.
    pub fn xz_path(&self) -> PathBuf {
        self.root_dir().join("usr/bin/xz")
    }

    /// Name of the reserved top-level entry, as seen relative to the tree root.
    pub fn reserved_name(&self) -> String {
        self.dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Environment for processes run from the bundled root.
    ///
    /// `lib/` holds the decoder's libraries under a fixed name since host
    /// distributions disagree on where they live (`/lib64`, `/lib/x86_64-linux-gnu`...).
    pub fn decoder_env(&self) -> Vec<(String, String)> {
        let root = self.root_dir();
        vec![
            (
                "PATH".to_string(),
                root.join("usr/bin").to_string_lossy().into_owned(),
            ),
            (
                "LD_LIBRARY_PATH".to_string(),
                root.join("lib").to_string_lossy().into_owned(),
            ),
        ]
    }
}

/// How a diff build derives its path whitelist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WhitelistSource {
    /// Walk the whole new tree again after diffing.
    #[default]
    Rewalk,
    /// Take Added, Modified and Unchanged paths from the change set.
    ChangeSet,
}

/// Options shared by the image builders.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildOptions {
    /// gzip level, 0-9
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,

    /// Whitelist derivation for diff builds
    #[serde(default)]
    pub whitelist_source: WhitelistSource,

    /// Extra exclude patterns, matched against tree-relative paths
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
}

fn default_compression_level() -> u32 {
    DEFAULT_COMPRESSION_LEVEL
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            whitelist_source: WhitelistSource::default(),
            exclude_patterns: Vec::new(),
        }
    }
}

impl BuildOptions {
    pub fn validate(&self) -> Result<()> {
        if self.compression_level > 9 {
            return Err(PackError::ConfigError(format!(
                "compression level must be between 0 and 9, got {}",
                self.compression_level
            )));
        }
        Ok(())
    }
}

/// Run configuration handed to the builder.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigData {
    /// File name of the image written into the dest directory
    pub out_file: String,

    /// Image name
    pub app_name: String,

    /// Image labels
    #[serde(default)]
    pub labels: Labels,

    /// Whether a base image must be extracted before building
    #[serde(default)]
    pub has_base: bool,
}

impl ConfigData {
    /// Load config data from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            PackError::ConfigError(format!(
                "cannot read the config data file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: ConfigData = serde_json::from_str(&data).map_err(|e| {
            PackError::ConfigError(format!("cannot unmarshal config data: {}", e))
        })?;

        if config.out_file.is_empty() {
            return Err(PackError::ConfigError("outFile is empty".to_string()));
        }

        Ok(config)
    }

    /// Where the finished image goes: `out_file` inside the layout's dest dir.
    pub fn out_path(&self, layout: &ToolLayout) -> PathBuf {
        layout.dest_dir().join(&self.out_file)
    }
}
