//! acipack core - shared types for building and unpacking container images.
//!
//! This crate holds what every acipack component agrees on: the error type,
//! the run configuration, the image manifest schema and logging setup.

pub mod config;
pub mod error;
pub mod logging;
pub mod manifest;

// Re-export commonly used types
pub use config::{BuildOptions, ConfigData, ToolLayout, WhitelistSource, DEFAULT_PATH_ENV};
pub use error::{PackError, Result};
pub use manifest::{
    Annotations, App, AppName, Environment, ImageManifest, Labels, MountPoint, NameValue,
    NameValues, Port,
};

/// acipack version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
