//! Exclude predicates.
//!
//! An exclude predicate decides, per node, whether it stays out of the
//! image. It sees the path relative to the tree root (`usr/bin/ls`, no
//! leading slash) and the node metadata, and nothing else.

use std::path::Path;

use regex::Regex;

use acipack_core::config::ToolLayout;
use acipack_core::error::{PackError, Result};

use super::entry::NodeInfo;

/// Predicate called for every node; `Ok(true)` leaves the node out.
///
/// It is evaluated per node and does not prune: children of an excluded
/// directory are still visited and judged on their own path.
pub type ExcludeFn = dyn Fn(&Path, &NodeInfo) -> Result<bool> + Send + Sync;

/// Predicate leaving a node out when either `first` or `second` does.
pub fn either(first: Option<Box<ExcludeFn>>, second: Box<ExcludeFn>) -> Box<ExcludeFn> {
    match first {
        None => second,
        Some(first) => Box::new(move |rel: &Path, info: &NodeInfo| {
            Ok(first(rel, info)? || second(rel, info)?)
        }),
    }
}

/// Pseudo-filesystems whose contents never belong in an image.
const PSEUDO_FS_PATTERNS: &[&str] = &["^dev/.+", "^proc/.+", "^sys/.+"];

/// Regex-based exclude rules matched against tree-relative paths.
#[derive(Debug, Clone)]
pub struct ExcludeRules {
    patterns: Vec<Regex>,
}

impl ExcludeRules {
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| {
                Regex::new(p.as_ref()).map_err(|e| {
                    PackError::ConfigError(format!("invalid exclude pattern {:?}: {}", p.as_ref(), e))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    /// Rules for imaging a root that hosts the tool itself: the contents of
    /// `dev`, `proc` and `sys`, plus the reserved working area and
    /// everything below it.
    pub fn for_layout(layout: &ToolLayout) -> Result<Self> {
        let reserved = regex::escape(&layout.reserved_name());
        let mut patterns: Vec<String> = PSEUDO_FS_PATTERNS.iter().map(|p| p.to_string()).collect();
        if !reserved.is_empty() {
            patterns.push(format!("^{}$", reserved));
            patterns.push(format!("^{}/.+", reserved));
        }
        Self::new(patterns)
    }

    /// Add more patterns.
    pub fn with_patterns<I, S>(mut self, patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.patterns.extend(Self::new(patterns)?.patterns);
        Ok(self)
    }

    pub fn is_excluded(&self, rel: &Path) -> bool {
        let path = rel.to_string_lossy();
        self.patterns.iter().any(|re| re.is_match(&path))
    }

    pub fn into_fn(self) -> Box<ExcludeFn> {
        Box::new(move |rel: &Path, _info: &NodeInfo| Ok(self.is_excluded(rel)))
    }
}
