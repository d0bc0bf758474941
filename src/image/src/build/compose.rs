//! Manifest composition from the outcome of a build run.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use acipack_core::config::{ConfigData, DEFAULT_PATH_ENV};
use acipack_core::error::Result;
use acipack_core::manifest::{
    Annotations, App, AppName, Environment, ImageManifest, MountPoint, Port, AUTHOR_ANNOTATION,
};

/// Default command when the build declares none.
pub const DEFAULT_EXEC: &str = "/bin/bash";

/// Maximum symlinks followed while resolving one path.
const MAX_SYMLINK_HOPS: usize = 40;

/// What a build run reports about the app it produced.
pub trait AppSource {
    fn exec(&self) -> Result<Vec<String>>;
    fn user(&self) -> String;
    fn group(&self) -> String;
    fn env(&self) -> Vec<(String, String)>;
    fn working_dir(&self) -> String;
    fn ports(&self) -> Result<Vec<Port>>;
    fn mount_points(&self) -> Result<Vec<MountPoint>>;
    fn maintainer(&self) -> Result<String>;
}

/// Compose the manifest for an image of the tree at `root`.
///
/// Image labels come from the app name's version and inline pairs, then
/// from `config.labels`, later values winning.
pub fn compose_manifest(
    config: &ConfigData,
    source: &dyn AppSource,
    root: &Path,
) -> Result<ImageManifest> {
    let app_name = AppName::parse(&config.app_name)?;
    let mut manifest = ImageManifest::new(app_name.name);

    manifest.labels = app_name.labels;
    for label in config.labels.iter() {
        manifest.labels.set(label.name.clone(), label.value.clone());
    }

    let working_directory = source.working_dir();
    let exec = resolve_exec(source.exec()?, root, &working_directory);

    let mut user = source.user();
    if user.is_empty() {
        user = "0".to_string();
    }
    let mut group = source.group();
    if group.is_empty() {
        group = "0".to_string();
    }

    let environment: Environment = source.env().into_iter().collect();
    let ports = source.ports()?;
    let mount_points = source.mount_points()?;

    let maintainer = source.maintainer()?;
    let mut annotations = Annotations::new();
    if !maintainer.is_empty() {
        annotations.set(AUTHOR_ANNOTATION, maintainer);
    }
    manifest.annotations = annotations;

    manifest.app = Some(App {
        exec,
        user,
        group,
        environment,
        working_directory,
        ports,
        mount_points,
    });

    Ok(manifest)
}

/// Make the command's executable absolute by looking it up inside `root`.
///
/// Commands that cannot be resolved are wrapped as `/bin/sh -c "<argv>"` so
/// the shell gets to interpret them at run time.
pub fn resolve_exec(mut exec: Vec<String>, root: &Path, working_dir: &str) -> Vec<String> {
    if exec.is_empty() {
        exec = vec![DEFAULT_EXEC.to_string()];
    }

    match look_path(root, &exec[0], DEFAULT_PATH_ENV, working_dir) {
        Some(path) => {
            exec[0] = path;
            exec
        }
        None => {
            tracing::debug!(exec = %exec[0], "Executable not found in image, wrapping in a shell");
            vec!["/bin/sh".to_string(), "-c".to_string(), exec.join(" ")]
        }
    }
}

/// `PATH` lookup of `name` in the tree at `root`.
///
/// Names containing a slash are taken as is, relative ones against
/// `working_dir` (or `/`). Returns the path as seen from inside the tree.
fn look_path(root: &Path, name: &str, path_env: &str, working_dir: &str) -> Option<String> {
    if name.is_empty() {
        return None;
    }

    if name.contains('/') {
        let base = if working_dir.starts_with('/') { working_dir } else { "/" };
        let candidate = Path::new(base).join(name);
        return is_executable(root, &candidate).then(|| candidate.to_string_lossy().into_owned());
    }

    path_env
        .split(':')
        .filter(|dir| dir.starts_with('/'))
        .map(|dir| Path::new(dir).join(name))
        .find(|candidate| is_executable(root, candidate))
        .map(|candidate| candidate.to_string_lossy().into_owned())
}

fn is_executable(root: &Path, path: &Path) -> bool {
    let Some(resolved) = resolve_in_root(root, path) else {
        return false;
    };
    match std::fs::metadata(host_path(root, &resolved)) {
        Ok(md) => md.is_file() && md.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

/// Resolve every symlink along `path` as if `root` were `/`.
///
/// Absolute link targets restart from the tree root and `..` never climbs
/// above it. `None` when a component is missing or links loop.
pub fn resolve_in_root(root: &Path, path: &Path) -> Option<PathBuf> {
    let mut pending: VecDeque<Option<OsString>> = components(path).collect();
    let mut resolved = PathBuf::from("/");
    let mut hops = 0;

    while let Some(component) = pending.pop_front() {
        let Some(name) = component else {
            resolved.pop();
            continue;
        };

        let candidate = resolved.join(&name);
        let md = std::fs::symlink_metadata(host_path(root, &candidate)).ok()?;
        if !md.file_type().is_symlink() {
            resolved = candidate;
            continue;
        }

        hops += 1;
        if hops > MAX_SYMLINK_HOPS {
            return None;
        }
        let target = std::fs::read_link(host_path(root, &candidate)).ok()?;
        if target.is_absolute() {
            resolved = PathBuf::from("/");
        }
        for c in components(&target).collect::<Vec<_>>().into_iter().rev() {
            pending.push_front(c);
        }
    }

    Some(resolved)
}

/// Normal components as `Some(name)`, `..` as `None`.
fn components(path: &Path) -> impl Iterator<Item = Option<OsString>> + '_ {
    path.components().filter_map(|c| match c {
        Component::Normal(name) => Some(Some(name.to_os_string())),
        Component::ParentDir => Some(None),
        _ => None,
    })
}

fn host_path(root: &Path, inner: &Path) -> PathBuf {
    root.join(inner.strip_prefix("/").unwrap_or(inner))
}
