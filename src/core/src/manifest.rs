//! Image manifest schema.
//!
//! The manifest is serialized as JSON and stored as the first entry of
//! every image archive. Its layout follows the appc image manifest:
//!
//! ```json
//! {
//!   "acKind": "ImageManifest",
//!   "acVersion": "0.5.1",
//!   "name": "example.com/app",
//!   "labels": [{"name": "version", "value": "1.0.0"}],
//!   "app": {
//!     "exec": ["/usr/bin/app"],
//!     "user": "0",
//!     "group": "0",
//!     "environment": [{"name": "PATH", "value": "/usr/bin"}],
//!     "workingDirectory": "/srv",
//!     "ports": [{"name": "http", "protocol": "tcp", "port": 80, "count": 1, "socketActivated": false}],
//!     "mountPoints": [{"name": "data", "path": "/data", "readOnly": false}]
//!   },
//!   "annotations": [{"name": "author", "value": "someone"}],
//!   "pathWhitelist": ["/", "/usr", "/usr/bin/app"]
//! }
//! ```
//!
//! An absent or empty `pathWhitelist` means the image deletes nothing from
//! the image it is layered on.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{PackError, Result};

/// Manifest kind written into every image.
pub const IMAGE_MANIFEST_KIND: &str = "ImageManifest";

/// Manifest schema version written into every image.
pub const MANIFEST_VERSION: &str = "0.5.1";

/// Label set by [`AppName`] from the `:tag` suffix.
pub const VERSION_LABEL: &str = "version";

/// Annotation holding the image maintainer.
pub const AUTHOR_ANNOTATION: &str = "author";

/// A single name/value pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameValue {
    pub name: String,
    pub value: String,
}

/// Ordered name/value pairs, unique by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<NameValue>", into = "Vec<NameValue>")]
pub struct NameValues(Vec<NameValue>);

pub type Labels = NameValues;
pub type Environment = NameValues;
pub type Annotations = NameValues;

impl NameValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `name` to `value`, replacing an existing pair in place.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|nv| nv.name == name) {
            Some(existing) => existing.value = value,
            None => self.0.push(NameValue { name, value }),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|nv| nv.name == name)
            .map(|nv| nv.value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &NameValue> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TryFrom<Vec<NameValue>> for NameValues {
    type Error = String;

    fn try_from(pairs: Vec<NameValue>) -> std::result::Result<Self, Self::Error> {
        let mut out = NameValues::new();
        for pair in pairs {
            if pair.name.is_empty() {
                return Err("empty name in name/value list".to_string());
            }
            if out.get(&pair.name).is_some() {
                return Err(format!("duplicate name: {}", pair.name));
            }
            out.0.push(pair);
        }
        Ok(out)
    }
}

impl From<NameValues> for Vec<NameValue> {
    fn from(values: NameValues) -> Self {
        values.0
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for NameValues {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut out = NameValues::new();
        for (k, v) in iter {
            out.set(k, v);
        }
        out
    }
}

/// A port the application listens on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Port {
    pub name: String,
    pub protocol: String,
    pub port: u16,
    #[serde(default)]
    pub count: u32,
    #[serde(default)]
    pub socket_activated: bool,
}

/// A location where the application expects external data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountPoint {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub read_only: bool,
}

/// How to run the image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct App {
    pub exec: Vec<String>,
    pub user: String,
    pub group: String,
    #[serde(default, skip_serializing_if = "NameValues::is_empty")]
    pub environment: Environment,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub working_directory: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<Port>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mount_points: Vec<MountPoint>,
}

/// Image manifest stored at the head of every image archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub ac_kind: String,
    pub ac_version: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "NameValues::is_empty")]
    pub labels: Labels,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app: Option<App>,
    #[serde(default, skip_serializing_if = "NameValues::is_empty")]
    pub annotations: Annotations,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path_whitelist: Vec<String>,
}

impl ImageManifest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            ac_kind: IMAGE_MANIFEST_KIND.to_string(),
            ac_version: MANIFEST_VERSION.to_string(),
            name: name.into(),
            labels: Labels::new(),
            app: None,
            annotations: Annotations::new(),
            path_whitelist: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.ac_kind != IMAGE_MANIFEST_KIND {
            return Err(PackError::ManifestError(format!(
                "unexpected acKind {:?}, want {:?}",
                self.ac_kind, IMAGE_MANIFEST_KIND
            )));
        }
        if self.name.is_empty() {
            return Err(PackError::ManifestError("name is empty".to_string()));
        }
        if self.path_whitelist.iter().any(|p| !p.starts_with('/')) {
            return Err(PackError::ManifestError(
                "pathWhitelist entries must be absolute".to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        self.validate()?;
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        let manifest: ImageManifest = serde_json::from_slice(data)?;
        manifest.validate()?;
        Ok(manifest)
    }
}

/// An image name with its labels, as written `name[:version][,key=value...]`.
///
/// ```text
/// example.com/reduce-worker:1.0.2,os=linux,arch=amd64
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppName {
    pub name: String,
    pub labels: Labels,
}

impl AppName {
    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.split(',');
        let head = parts.next().unwrap_or_default().trim();

        let (name, version) = match head.rsplit_once(':') {
            Some((name, version)) if !version.contains('/') => (name, Some(version)),
            _ => (head, None),
        };
        if name.is_empty() {
            return Err(PackError::ManifestError(format!("empty image name in {:?}", s)));
        }

        let mut labels = Labels::new();
        if let Some(version) = version {
            if version.is_empty() {
                return Err(PackError::ManifestError(format!("empty version in {:?}", s)));
            }
            labels.set(VERSION_LABEL, version);
        }

        for pair in parts {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                PackError::ManifestError(format!("malformed label {:?}, want key=value", pair))
            })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(PackError::ManifestError(format!("empty label name in {:?}", pair)));
            }
            if labels.get(key).is_some() {
                return Err(PackError::ManifestError(format!("duplicate label {:?}", key)));
            }
            labels.set(key, value.trim());
        }

        Ok(Self {
            name: name.to_string(),
            labels,
        })
    }
}

impl FromStr for AppName {
    type Err = PackError;

    fn from_str(s: &str) -> Result<Self> {
        AppName::parse(s)
    }
}
