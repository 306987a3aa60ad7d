// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Directory scaffolding replication.
//!
//! Before anything gets bind mounted or linked onto the ephemeral root, every
//! ancestor directory of the ephemeral path must exist, and must carry the
//! same owner, group, and permission bits as its counterpart on the
//! persistent root. A directory like `/etc/ssh` that is created with the wrong
//! owner is a vulnerability, so the ephemeral side is never trusted: its
//! metadata is always overwritten from the persistent side.
//!
//! # Resolution
//!
//! Each persistent-side ancestor is resolved to its real path before its
//! metadata is read. A symlink on the persistent root is never mistaken for
//! the directory it points to, nor is its own metadata ever copied.
//!
//! # Idempotence
//!
//! Directories that already exist are left alone, and metadata is only
//! written when it differs. Running replication on a converged tree performs
//! no mutations at all. A failure part way through leaves the ancestors that
//! were already handled in their corrected state, which a later run picks up
//! from.

use crate::{
    config::MissingSource,
    path::{ancestors, AncestorStep, MalformedPathError},
};

use std::{
    fs::{canonicalize, metadata, set_permissions, symlink_metadata, DirBuilder, Metadata},
    io::ErrorKind,
    os::unix::fs::{chown, DirBuilderExt, MetadataExt, PermissionsExt},
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument};

/// Mode given to persistent-side directories created under
/// [`MissingSource::Create`].
pub const CREATED_SOURCE_MODE: u32 = 0o755;

const PERMISSION_BITS: u32 = 0o7777;

/// Replicate persistent-side directory scaffolding onto the ephemeral side.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectoryReplicator {
    missing_source: MissingSource,
}

impl DirectoryReplicator {
    /// Construct new replicator using given missing source policy.
    pub fn new(missing_source: MissingSource) -> Self {
        Self { missing_source }
    }

    /// Ensure every ancestor of target directory exists with mirrored
    /// metadata.
    ///
    /// Walks `target_dir` from the top-most ancestor down to `target_dir`
    /// itself. Persistent-side ancestors live under `persistent_root`, while
    /// ephemeral-side ancestors live under `target_root`.
    ///
    /// # Errors
    ///
    /// - Return [`ReplicateError::MissingSource`] if a persistent-side
    ///   ancestor does not exist under [`MissingSource::Strict`].
    /// - Return [`ReplicateError::SourceNotDirectory`] or
    ///   [`ReplicateError::TargetNotDirectory`] if either side has something
    ///   other than a directory in the way.
    /// - Return I/O flavored variants if the file system refuses an operation.
    #[instrument(skip(self), level = "debug")]
    pub fn replicate(
        &self,
        persistent_root: &Path,
        target_root: &Path,
        target_dir: &Path,
    ) -> Result<Replication> {
        let mut replication = Replication::default();
        let mut parent = canonicalize(persistent_root).ok();
        for step in ancestors(persistent_root, target_root, target_dir)? {
            let resolved = self.replicate_step(&step, parent.as_deref(), &mut replication)?;
            parent = Some(resolved);
        }

        Ok(replication)
    }

    fn replicate_step(
        &self,
        step: &AncestorStep,
        parent: Option<&Path>,
        replication: &mut Replication,
    ) -> Result<PathBuf> {
        let resolved = self.resolve_source(&step.source, parent)?;
        let source_meta = metadata(&resolved).map_err(|err| ReplicateError::Metadata {
            source: err,
            path: resolved.clone(),
        })?;

        if !source_meta.is_dir() {
            return Err(ReplicateError::SourceNotDirectory { path: resolved });
        }

        if ensure_target_dir(&step.target)? {
            info!("created directory {}", step.target.display());
            replication.created += 1;
        }

        if mirror_metadata(&source_meta, &step.target)? {
            info!(
                "mirrored {}:{} {:o} from {} onto {}",
                source_meta.uid(),
                source_meta.gid(),
                source_meta.mode() & PERMISSION_BITS,
                resolved.display(),
                step.target.display()
            );
            replication.updated += 1;
        } else {
            debug!("{} already mirrors {}", step.target.display(), resolved.display());
        }

        Ok(resolved)
    }

    /// Resolve persistent-side directory, where `parent` is the resolved
    /// path of the previous ancestor.
    fn resolve_source(&self, source: &Path, parent: Option<&Path>) -> Result<PathBuf> {
        match canonicalize(source) {
            Ok(resolved) => return Ok(resolved),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                return Err(ReplicateError::Resolve {
                    source: err,
                    path: source.to_path_buf(),
                })
            }
        }

        // Name the missing directory where it would really live.
        let missing = match (parent, source.file_name()) {
            (Some(parent), Some(name)) => parent.join(name),
            _ => source.to_path_buf(),
        };

        match self.missing_source {
            MissingSource::Strict => Err(ReplicateError::MissingSource { path: missing }),
            MissingSource::Create => {
                info!("creating missing source directory {}", missing.display());
                match DirBuilder::new().mode(CREATED_SOURCE_MODE).create(source) {
                    Ok(()) => {}
                    Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
                    Err(err) => {
                        return Err(ReplicateError::CreateSource {
                            source: err,
                            path: source.to_path_buf(),
                        })
                    }
                }

                canonicalize(source).map_err(|err| ReplicateError::Resolve {
                    source: err,
                    path: source.to_path_buf(),
                })
            }
        }
    }
}

/// Mutations performed by a replication pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Replication {
    /// Number of ephemeral directories created.
    pub created: usize,

    /// Number of ephemeral directories whose metadata was rewritten.
    pub updated: usize,
}

impl Replication {
    /// Total number of mutations.
    pub fn mutations(&self) -> usize {
        self.created + self.updated
    }
}

// Returns true if the directory had to be created.
fn ensure_target_dir(target: &Path) -> Result<bool> {
    match symlink_metadata(target) {
        Ok(meta) if meta.is_dir() => return Ok(false),
        Ok(_) => {
            return Err(ReplicateError::TargetNotDirectory {
                path: target.to_path_buf(),
            })
        }
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => {
            return Err(ReplicateError::Metadata {
                source: err,
                path: target.to_path_buf(),
            })
        }
    }

    match DirBuilder::new().create(target) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::AlreadyExists => ensure_target_dir(target),
        Err(err) => Err(ReplicateError::CreateTarget {
            source: err,
            path: target.to_path_buf(),
        }),
    }
}

// Returns true if any metadata had to be rewritten.
fn mirror_metadata(source_meta: &Metadata, target: &Path) -> Result<bool> {
    let target_meta = symlink_metadata(target).map_err(|err| ReplicateError::Metadata {
        source: err,
        path: target.to_path_buf(),
    })?;
    let mut changed = false;

    // INVARIANT: Ownership goes first, chown(2) may clear setuid/setgid bits.
    if target_meta.uid() != source_meta.uid() || target_meta.gid() != source_meta.gid() {
        chown(target, Some(source_meta.uid()), Some(source_meta.gid())).map_err(|err| {
            ReplicateError::Chown {
                source: err,
                path: target.to_path_buf(),
            }
        })?;
        changed = true;
    }

    let mode = source_meta.mode() & PERMISSION_BITS;
    if changed || target_meta.mode() & PERMISSION_BITS != mode {
        set_permissions(target, PermissionsExt::from_mode(mode)).map_err(|err| {
            ReplicateError::Chmod {
                source: err,
                path: target.to_path_buf(),
            }
        })?;
        changed = true;
    }

    Ok(changed)
}

/// All possible error types for directory replication.
#[derive(Debug, thiserror::Error)]
pub enum ReplicateError {
    /// Persistent-side directory does not exist.
    #[error("persistent source directory {:?} does not exist", path.display())]
    MissingSource { path: PathBuf },

    /// Persistent-side path resolves to something other than a directory.
    #[error("persistent source {:?} is not a directory", path.display())]
    SourceNotDirectory { path: PathBuf },

    /// Ephemeral-side path is occupied by something other than a directory.
    #[error("ephemeral target {:?} exists but is not a directory", path.display())]
    TargetNotDirectory { path: PathBuf },

    /// Persistent-side path cannot be resolved.
    #[error("failed to resolve persistent source {:?}", path.display())]
    Resolve {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Missing persistent-side directory cannot be created.
    #[error("failed to create persistent source directory {:?}", path.display())]
    CreateSource {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Ephemeral-side directory cannot be created.
    #[error("failed to create ephemeral directory {:?}", path.display())]
    CreateTarget {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Metadata cannot be read.
    #[error("failed to read metadata of {:?}", path.display())]
    Metadata {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Ownership cannot be changed.
    #[error("failed to change ownership of {:?}", path.display())]
    Chown {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Permission bits cannot be changed.
    #[error("failed to change permissions of {:?}", path.display())]
    Chmod {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    #[error(transparent)]
    MalformedPath(#[from] MalformedPathError),
}

/// Friendly result alias :3
pub type Result<T, E = ReplicateError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;
    use std::{
        env::current_dir,
        fs::{create_dir_all, write, Permissions},
        os::unix::fs::symlink,
    };

    fn mode_of(path: impl AsRef<Path>) -> u32 {
        symlink_metadata(path).unwrap().mode() & PERMISSION_BITS
    }

    fn make_dir(path: impl AsRef<Path>, mode: u32) {
        create_dir_all(path.as_ref()).unwrap();
        set_permissions(path.as_ref(), Permissions::from_mode(mode)).unwrap();
    }

    #[sealed_test]
    fn replicate_mirrors_every_ancestor() -> anyhow::Result<()> {
        let cwd = current_dir()?;
        let (state, eph) = (cwd.join("state"), cwd.join("eph"));
        make_dir(state.join("var"), 0o755);
        make_dir(state.join("var/lib"), 0o751);
        make_dir(state.join("var/lib/iwd"), 0o700);
        make_dir(&eph, 0o755);

        let replicator = DirectoryReplicator::new(MissingSource::Strict);
        let result = replicator.replicate(&state, &eph, Path::new("/var/lib/iwd"))?;

        assert_eq!(result.created, 3);
        assert_eq!(mode_of(eph.join("var")), 0o755);
        assert_eq!(mode_of(eph.join("var/lib")), 0o751);
        assert_eq!(mode_of(eph.join("var/lib/iwd")), 0o700);

        let source = metadata(state.join("var/lib/iwd"))?;
        let target = metadata(eph.join("var/lib/iwd"))?;
        assert_eq!((target.uid(), target.gid()), (source.uid(), source.gid()));

        Ok(())
    }

    #[sealed_test]
    fn replicate_is_idempotent() -> anyhow::Result<()> {
        let cwd = current_dir()?;
        let (state, eph) = (cwd.join("state"), cwd.join("eph"));
        make_dir(state.join("etc/ssh"), 0o755);
        make_dir(&eph, 0o755);

        let replicator = DirectoryReplicator::new(MissingSource::Strict);
        let first = replicator.replicate(&state, &eph, Path::new("/etc/ssh"))?;
        let second = replicator.replicate(&state, &eph, Path::new("/etc/ssh"))?;

        assert!(first.mutations() > 0);
        assert_eq!(second, Replication::default());

        Ok(())
    }

    #[sealed_test]
    fn replicate_refreshes_drifted_permissions() -> anyhow::Result<()> {
        let cwd = current_dir()?;
        let (state, eph) = (cwd.join("state"), cwd.join("eph"));
        make_dir(state.join("etc/ssh"), 0o700);
        make_dir(eph.join("etc/ssh"), 0o777);
        set_permissions(eph.join("etc"), Permissions::from_mode(mode_of(state.join("etc"))))?;

        let replicator = DirectoryReplicator::new(MissingSource::Strict);
        let result = replicator.replicate(&state, &eph, Path::new("/etc/ssh"))?;

        assert_eq!(result, Replication { created: 0, updated: 1 });
        assert_eq!(mode_of(eph.join("etc/ssh")), 0o700);

        Ok(())
    }

    #[sealed_test]
    fn replicate_uses_resolved_symlink_metadata() -> anyhow::Result<()> {
        let cwd = current_dir()?;
        let (state, eph) = (cwd.join("state"), cwd.join("eph"));
        make_dir(state.join("real-etc/ssh"), 0o710);
        set_permissions(state.join("real-etc"), Permissions::from_mode(0o750))?;
        symlink(state.join("real-etc"), state.join("etc"))?;
        make_dir(&eph, 0o755);

        let replicator = DirectoryReplicator::new(MissingSource::Strict);
        replicator.replicate(&state, &eph, Path::new("/etc/ssh"))?;

        // Symlinks themselves always report 0777.
        assert_eq!(mode_of(state.join("etc")), 0o777);
        assert_eq!(mode_of(eph.join("etc")), 0o750);
        assert_eq!(mode_of(eph.join("etc/ssh")), 0o710);
        assert!(symlink_metadata(eph.join("etc"))?.is_dir());

        Ok(())
    }

    #[sealed_test]
    fn replicate_strict_reports_missing_source() -> anyhow::Result<()> {
        let cwd = current_dir()?;
        let (state, eph) = (cwd.join("state"), cwd.join("eph"));
        make_dir(state.join("var/lib"), 0o755);
        make_dir(&eph, 0o755);

        let replicator = DirectoryReplicator::new(MissingSource::Strict);
        let result = replicator.replicate(&state, &eph, Path::new("/var/lib/iwd"));

        match result {
            Err(ReplicateError::MissingSource { path }) => {
                assert_eq!(path, canonicalize(state.join("var/lib"))?.join("iwd"))
            }
            other => panic!("expected missing source, got {other:?}"),
        }

        // Partial progress stays in place.
        assert!(eph.join("var/lib").is_dir());
        assert!(!eph.join("var/lib/iwd").exists());
        assert!(!state.join("var/lib/iwd").exists());

        Ok(())
    }

    #[sealed_test]
    fn replicate_strict_names_resolved_missing_source() -> anyhow::Result<()> {
        let cwd = current_dir()?;
        let (state, eph) = (cwd.join("state"), cwd.join("eph"));
        make_dir(state.join("data/lib"), 0o755);
        make_dir(state.join("var"), 0o755);
        symlink(state.join("data/lib"), state.join("var/lib"))?;
        make_dir(&eph, 0o755);

        let replicator = DirectoryReplicator::new(MissingSource::Strict);
        let result = replicator.replicate(&state, &eph, Path::new("/var/lib/iwd"));

        let expect = canonicalize(state.join("data/lib"))?.join("iwd");
        match result {
            Err(ReplicateError::MissingSource { path }) => assert_eq!(path, expect),
            other => panic!("expected missing source, got {other:?}"),
        }

        let message = ReplicateError::MissingSource { path: expect.clone() }.to_string();
        assert!(message.contains("data/lib/iwd"));
        assert!(!message.contains("var/lib/iwd"));

        Ok(())
    }

    #[sealed_test]
    fn replicate_create_builds_missing_source() -> anyhow::Result<()> {
        let cwd = current_dir()?;
        let (state, eph) = (cwd.join("state"), cwd.join("eph"));
        make_dir(&state, 0o755);
        make_dir(&eph, 0o755);

        let replicator = DirectoryReplicator::new(MissingSource::Create);
        let result = replicator.replicate(&state, &eph, Path::new("/var/log"))?;

        assert_eq!(result.created, 2);
        assert!(state.join("var/log").is_dir());
        assert_eq!(mode_of(eph.join("var/log")), mode_of(state.join("var/log")));

        Ok(())
    }

    #[sealed_test]
    fn replicate_refuses_occupied_target() -> anyhow::Result<()> {
        let cwd = current_dir()?;
        let (state, eph) = (cwd.join("state"), cwd.join("eph"));
        make_dir(state.join("etc/ssh"), 0o755);
        make_dir(&eph, 0o755);
        write(eph.join("etc"), "not a directory")?;

        let replicator = DirectoryReplicator::new(MissingSource::Strict);
        let result = replicator.replicate(&state, &eph, Path::new("/etc/ssh"));

        assert!(matches!(
            result,
            Err(ReplicateError::TargetNotDirectory { path }) if path == eph.join("etc")
        ));

        Ok(())
    }

    #[sealed_test]
    fn replicate_refuses_source_file() -> anyhow::Result<()> {
        let cwd = current_dir()?;
        let (state, eph) = (cwd.join("state"), cwd.join("eph"));
        make_dir(&state, 0o755);
        make_dir(&eph, 0o755);
        write(state.join("etc"), "not a directory")?;

        let replicator = DirectoryReplicator::new(MissingSource::Strict);
        let result = replicator.replicate(&state, &eph, Path::new("/etc/ssh"));

        assert!(matches!(result, Err(ReplicateError::SourceNotDirectory { .. })));
        assert!(!eph.join("etc").exists());

        Ok(())
    }
}
