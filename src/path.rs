// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path algebra.
//!
//! Pure helpers to combine persistent roots with ephemeral paths, and to walk
//! the ancestor chain of a path one component at a time. Nothing in here ever
//! touches the file system.
//!
//! All inputs are expected to be absolute. Parent directory components are
//! rejected outright rather than resolved, because resolving `..` without the
//! file system at hand can silently escape a persistent root.

use std::{
    ffi::OsStr,
    path::{Component, Components, Path, PathBuf},
};

/// Normalize an absolute path.
///
/// Collapses repeated separators, drops `.` components, and strips trailing
/// separators.
///
/// # Errors
///
/// - Return [`MalformedPathError`] if path is empty, relative, or contains a
///   `..` component.
pub fn normalize(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    let mut normal = PathBuf::from("/");
    for segment in segments(path)? {
        normal.push(segment);
    }

    Ok(normal)
}

/// Join ephemeral path onto a base path.
///
/// Unlike [`Path::join`], an absolute `rel` does not replace `base`. Instead,
/// `rel` is concatenated onto `base`, such that `join("/state/", "/etc/ssh")`
/// yields `/state/etc/ssh`.
///
/// # Errors
///
/// - Return [`MalformedPathError`] if either path is malformed.
pub fn join(base: impl AsRef<Path>, rel: impl AsRef<Path>) -> Result<PathBuf> {
    let mut joined = normalize(base)?;
    for segment in segments(rel.as_ref())? {
        joined.push(segment);
    }

    Ok(joined)
}

/// Split absolute path into its ordered components.
///
/// The root itself is not yielded, so `/` produces an empty sequence. The
/// returned iterator is cheap to clone, so it can be walked more than once.
///
/// # Errors
///
/// - Return [`MalformedPathError`] if path is malformed. The whole path is
///   checked before anything is yielded.
pub fn segments(path: &Path) -> Result<Segments<'_>> {
    if path.as_os_str().is_empty() {
        return Err(MalformedPathError::Empty);
    }

    if !path.is_absolute() {
        return Err(MalformedPathError::NotAbsolute(path.to_path_buf()));
    }

    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(MalformedPathError::ParentComponent(path.to_path_buf()));
    }

    Ok(Segments {
        components: path.components(),
    })
}

/// Ordered sequence of normal path components.
///
/// See [`segments`].
#[derive(Clone, Debug)]
pub struct Segments<'a> {
    components: Components<'a>,
}

impl<'a> Iterator for Segments<'a> {
    type Item = &'a OsStr;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.components.next()? {
                Component::Normal(segment) => return Some(segment),
                _ => continue,
            }
        }
    }
}

/// One level of an ancestor walk.
///
/// Pairs a path prefix on the ephemeral side with its counterpart on the
/// persistent side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AncestorStep {
    /// Path prefix on the persistent root.
    pub source: PathBuf,

    /// Same prefix on the ephemeral root.
    pub target: PathBuf,
}

/// Walk every ancestor of `path`, including `path` itself.
///
/// Steps are produced from the top-most ancestor down. The source side of
/// each step lives under `source_root`, the target side lives under
/// `target_root`.
///
/// # Errors
///
/// - Return [`MalformedPathError`] if any given path is malformed.
pub fn ancestors(
    source_root: impl AsRef<Path>,
    target_root: impl AsRef<Path>,
    path: impl AsRef<Path>,
) -> Result<Vec<AncestorStep>> {
    let mut source = normalize(source_root)?;
    let mut target = normalize(target_root)?;
    let mut steps = Vec::new();

    for segment in segments(path.as_ref())? {
        source.push(segment);
        target.push(segment);
        steps.push(AncestorStep {
            source: source.clone(),
            target: target.clone(),
        });
    }

    Ok(steps)
}

/// Derive execution unit name from persistent root path.
///
/// Each run of characters that are not ASCII alphanumeric becomes a single
/// dash, leading and trailing dashes are dropped, and the result is prefixed
/// with `anchorage-`. The file system root maps to `anchorage-root`.
pub fn unit_name(root: impl AsRef<Path>) -> String {
    let raw = root.as_ref().to_string_lossy();
    let mut name = String::with_capacity(raw.len());
    let mut pending_dash = false;

    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !name.is_empty() {
                name.push('-');
            }
            pending_dash = false;
            name.push(ch);
        } else {
            pending_dash = true;
        }
    }

    if name.is_empty() {
        name.push_str("root");
    }

    format!("anchorage-{name}")
}

/// Path cannot be used as an absolute, `..`-free path.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum MalformedPathError {
    /// Path has no components at all.
    #[error("path is empty")]
    Empty,

    /// Path does not start at the file system root.
    #[error("path {:?} is not absolute", .0.display())]
    NotAbsolute(PathBuf),

    /// Path tries to climb through a parent directory.
    #[error("path {:?} contains a parent directory component", .0.display())]
    ParentComponent(PathBuf),
}

/// Friendly result alias :3
pub type Result<T, E = MalformedPathError> = std::result::Result<T, E>;
