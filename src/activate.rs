// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Activation.
//!
//! Carry out an activation [`Plan`](crate::plan::Plan) against the ephemeral root. Activation is
//! split into one execution unit per persistent root. Within a unit, every
//! bind mount is handled first, then every link, each in configuration order.
//!
//! # Entry Life Cycle
//!
//! Every planned mount or link moves through the following states:
//!
//! ```text
//! Pending -> DirectoryReady -> Mounted | Linked -> Done
//! ```
//!
//! Any state can fall into `Failed`. Failures stay contained to their entry,
//! so one broken path never keeps the others from being restored. Nothing is
//! retried within a run. Instead, every step is idempotent, so running
//! activation again, e.g., on next boot, converges from whatever state the
//! previous run left behind.
//!
//! # Fail Closed
//!
//! The configuration is validated before a plan is even derived. If any rule
//! is violated, activation refuses to touch the file system at all.

use crate::{
    config::ConfigModel,
    mount::{Fstab, MountError, Mounter, SysMounter},
    path::{join, MalformedPathError},
    plan::{LinkDescriptor, LinkStrategy, MountDescriptor, MountPlanner, UnitPlan},
    replicate::{DirectoryReplicator, ReplicateError},
    validate::{ValidationError, Validator},
};

use std::{
    error::Error as StdError,
    fmt::{Display, Formatter, Result as FmtResult},
    fs::{create_dir_all, read_link, symlink_metadata},
    io::ErrorKind,
    os::unix::fs::symlink,
    path::{Path, PathBuf},
};
use tracing::{debug, info, info_span, instrument, warn};

/// Run activation for a configuration.
#[derive(Debug)]
pub struct ActivationRunner<'cfg, M = SysMounter>
where
    M: Mounter,
{
    config: &'cfg ConfigModel,
    replicator: DirectoryReplicator,
    mounter: M,
}

impl<'cfg, M> ActivationRunner<'cfg, M>
where
    M: Mounter,
{
    /// Construct new activation runner.
    pub fn new(config: &'cfg ConfigModel, mounter: M) -> Self {
        Self {
            config,
            replicator: DirectoryReplicator::new(config.missing_source),
            mounter,
        }
    }

    /// Borrow mount primitive.
    pub fn mounter(&self) -> &M {
        &self.mounter
    }

    /// Validate configuration, then activate every unit.
    ///
    /// # Errors
    ///
    /// - Return [`ActivateError::Validation`] if configuration violates any
    ///   rule. Nothing is mutated in this case.
    /// - Return [`ActivateError::Plan`] if plan cannot be derived.
    ///
    /// Per-entry failures do not surface as errors. They are recorded in the
    /// returned [`Report`] instead.
    pub fn activate(&self, fstab: &Fstab) -> Result<Report> {
        self.activate_units(fstab, &[] as &[&str])
    }

    /// Validate configuration, then activate the named units only.
    ///
    /// An empty listing of names selects every unit.
    ///
    /// # Errors
    ///
    /// - Return [`ActivateError::UnknownUnit`] if a name matches no unit.
    /// - Return any error [`ActivationRunner::activate`] may return.
    pub fn activate_units(
        &self,
        fstab: &Fstab,
        names: &[impl AsRef<str>],
    ) -> Result<Report> {
        Validator::new(self.config).validate(fstab)?;
        let plan = MountPlanner::new(self.config).plan()?;

        let names: Vec<&str> = names.iter().map(AsRef::as_ref).collect();
        for name in &names {
            if plan.unit(name).is_none() {
                return Err(ActivateError::UnknownUnit {
                    name: name.to_string(),
                });
            }
        }

        let units = plan
            .units
            .iter()
            .filter(|unit| names.is_empty() || names.contains(&unit.name.as_str()))
            .map(|unit| self.run_unit(unit))
            .collect();

        Ok(Report { units })
    }

    /// Carry out a single execution unit.
    pub fn run_unit(&self, unit: &UnitPlan) -> UnitReport {
        let span = info_span!("unit", name = %unit.name);
        let _enter = span.enter();
        info!("activating {} from {}", unit.name, unit.root.display());

        let mut entries = Vec::with_capacity(unit.mounts.len() + unit.links.len());
        for mount in &unit.mounts {
            let mut outcome = EntryOutcome::new(EntryKind::Mount, &mount.source, &mount.target);
            if let Err(error) = self.run_mount(&unit.root, mount, &mut outcome) {
                warn!("bind mount {} failed: {}", mount.target.display(), error);
                outcome.advance(EntryState::Failed(error));
            }
            entries.push(outcome);
        }

        for link in &unit.links {
            let mut outcome = EntryOutcome::new(EntryKind::Link, &link.source, &link.target);
            if let Err(error) = self.run_link(&unit.root, link, &mut outcome) {
                warn!("link {} failed: {}", link.target.display(), error);
                outcome.advance(EntryState::Failed(error));
            }
            entries.push(outcome);
        }

        UnitReport {
            name: unit.name.clone(),
            root: unit.root.clone(),
            entries,
        }
    }

    #[instrument(skip(self, outcome), level = "debug")]
    fn run_mount(
        &self,
        root: &Path,
        mount: &MountDescriptor,
        outcome: &mut EntryOutcome,
    ) -> Result<(), EntryError> {
        let ephemeral_root = self.config.ephemeral_root.as_path();
        let replication = self
            .replicator
            .replicate(root, ephemeral_root, &mount.target)?;
        outcome.mutations += replication.mutations();
        outcome.advance(EntryState::DirectoryReady);

        let target = join(ephemeral_root, &mount.target)?;
        if self.mounter.is_mounted(&target)? {
            debug!("{} is already mounted", target.display());
        } else {
            self.mounter.bind(&mount.source, &target)?;
            info!("bind mounted {} onto {}", mount.source.display(), target.display());
            outcome.mutations += 1;
        }

        outcome.advance(EntryState::Mounted);
        outcome.advance(EntryState::Done);

        Ok(())
    }

    #[instrument(skip(self, outcome), level = "debug")]
    fn run_link(
        &self,
        root: &Path,
        link: &LinkDescriptor,
        outcome: &mut EntryOutcome,
    ) -> Result<(), EntryError> {
        let ephemeral_root = self.config.ephemeral_root.as_path();
        let scaffold_root = link.scaffold_root(ephemeral_root);

        if let LinkStrategy::Overlay { root: overlay } = &link.strategy {
            if !overlay.is_dir() {
                create_dir_all(overlay).map_err(|err| LinkError::Scaffold {
                    source: err,
                    path: overlay.clone(),
                })?;
                info!("created overlay staging directory {}", overlay.display());
                outcome.mutations += 1;
            }
        }

        // INVARIANT: Only the parent is replicated, the file itself is linked.
        if let Some(parent) = link.target.parent() {
            let replication = self.replicator.replicate(root, scaffold_root, parent)?;
            outcome.mutations += replication.mutations();
        }
        outcome.advance(EntryState::DirectoryReady);

        if symlink_metadata(&link.source).is_err() {
            warn!(
                "persistent file {} does not exist yet, link will dangle",
                link.source.display()
            );
        }

        let location = link.location(ephemeral_root)?;
        if ensure_symlink(&link.source, &location)? {
            info!("linked {} to {}", location.display(), link.source.display());
            outcome.mutations += 1;
        } else {
            debug!("{} already links to {}", location.display(), link.source.display());
        }

        outcome.advance(EntryState::Linked);
        outcome.advance(EntryState::Done);

        Ok(())
    }
}

// Returns true if the link had to be created.
fn ensure_symlink(source: &Path, location: &Path) -> Result<bool, LinkError> {
    match symlink_metadata(location) {
        Ok(meta) if meta.file_type().is_symlink() => {
            let found = read_link(location).map_err(|err| LinkError::Inspect {
                source: err,
                location: location.to_path_buf(),
            })?;

            if found == source {
                return Ok(false);
            }

            Err(LinkError::Occupied {
                location: location.to_path_buf(),
                found: Some(found),
            })
        }
        Ok(_) => Err(LinkError::Occupied {
            location: location.to_path_buf(),
            found: None,
        }),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            symlink(source, location).map_err(|err| LinkError::Create {
                source: err,
                location: location.to_path_buf(),
            })?;

            Ok(true)
        }
        Err(err) => Err(LinkError::Inspect {
            source: err,
            location: location.to_path_buf(),
        }),
    }
}

/// Outcome of activating every selected unit.
#[derive(Debug, Default)]
pub struct Report {
    /// Outcome of each unit in plan order.
    pub units: Vec<UnitReport>,
}

impl Report {
    /// Check that every entry finished.
    pub fn is_success(&self) -> bool {
        self.units.iter().all(UnitReport::is_success)
    }

    /// Total number of file system mutations.
    pub fn mutations(&self) -> usize {
        self.units.iter().map(UnitReport::mutations).sum()
    }

    /// Iterate over failed entries.
    pub fn failures(&self) -> impl Iterator<Item = &EntryOutcome> {
        self.units
            .iter()
            .flat_map(|unit| unit.entries.iter())
            .filter(|entry| entry.is_failed())
    }
}

impl Display for Report {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        for unit in &self.units {
            write!(fmt, "{unit}")?;
        }

        Ok(())
    }
}

/// Outcome of a single execution unit.
#[derive(Debug)]
pub struct UnitReport {
    /// Execution unit name.
    pub name: String,

    /// Persistent root of unit.
    pub root: PathBuf,

    /// Outcome of each entry, mounts first.
    pub entries: Vec<EntryOutcome>,
}

impl UnitReport {
    /// Check that every entry finished.
    pub fn is_success(&self) -> bool {
        self.entries.iter().all(|entry| entry.state == EntryState::Done)
    }

    /// Total number of file system mutations.
    pub fn mutations(&self) -> usize {
        self.entries.iter().map(|entry| entry.mutations).sum()
    }
}

impl Display for UnitReport {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        writeln!(fmt, "{} ({}):", self.name, self.root.display())?;
        for entry in &self.entries {
            writeln!(fmt, "    {entry}")?;
        }

        Ok(())
    }
}

/// Kind of planned entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Mount,
    Link,
}

/// Outcome of a single planned mount or link.
#[derive(Debug)]
pub struct EntryOutcome {
    /// Kind of entry.
    pub kind: EntryKind,

    /// Path on persistent root.
    pub source: PathBuf,

    /// Ephemeral path.
    pub target: PathBuf,

    /// Last state reached.
    pub state: EntryState,

    /// Number of file system mutations performed for entry.
    pub mutations: usize,
}

impl EntryOutcome {
    fn new(kind: EntryKind, source: &Path, target: &Path) -> Self {
        Self {
            kind,
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            state: EntryState::Pending,
            mutations: 0,
        }
    }

    fn advance(&mut self, next: EntryState) {
        debug!("{}: {} -> {}", self.target.display(), self.state, next);
        self.state = next;
    }

    /// Check if entry failed.
    pub fn is_failed(&self) -> bool {
        matches!(self.state, EntryState::Failed(_))
    }
}

impl Display for EntryOutcome {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let kind = match self.kind {
            EntryKind::Mount => "bind",
            EntryKind::Link => "link",
        };

        write!(fmt, "[{}] {kind} {}", self.state, self.target.display())?;
        match &self.state {
            EntryState::Failed(error) => write!(fmt, ": {}", error_chain(error)),
            _ if self.mutations == 0 => write!(fmt, " (unchanged)"),
            _ => write!(fmt, " ({} changes)", self.mutations),
        }
    }
}

/// State of a planned entry.
#[derive(Debug)]
pub enum EntryState {
    Pending,
    DirectoryReady,
    Mounted,
    Linked,
    Done,
    Failed(EntryError),
}

impl PartialEq for EntryState {
    fn eq(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

impl Display for EntryState {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(match self {
            Self::Pending => "pending",
            Self::DirectoryReady => "directory-ready",
            Self::Mounted => "mounted",
            Self::Linked => "linked",
            Self::Done => "done",
            Self::Failed(_) => "failed",
        })
    }
}

fn error_chain(error: &dyn StdError) -> String {
    let mut chain = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        chain.push_str(": ");
        chain.push_str(cause.to_string().as_str());
        source = cause.source();
    }

    chain
}

/// Link primitive error types.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// Something other than the expected link sits at link location.
    #[error(
        "link location {:?} is occupied{}",
        location.display(),
        found.as_ref().map(|path| format!(" by a link to {:?}", path.display())).unwrap_or_default()
    )]
    Occupied {
        location: PathBuf,
        found: Option<PathBuf>,
    },

    /// Link location cannot be inspected.
    #[error("failed to inspect link location {:?}", location.display())]
    Inspect {
        #[source]
        source: std::io::Error,
        location: PathBuf,
    },

    /// Symlink cannot be created.
    #[error("failed to create symlink at {:?}", location.display())]
    Create {
        #[source]
        source: std::io::Error,
        location: PathBuf,
    },

    /// Overlay staging directory cannot be created.
    #[error("failed to create overlay staging directory {:?}", path.display())]
    Scaffold {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
}

/// Failure of a single planned entry.
#[derive(Debug, thiserror::Error)]
pub enum EntryError {
    #[error(transparent)]
    Replicate(#[from] ReplicateError),

    #[error(transparent)]
    Mount(#[from] MountError),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    MalformedPath(#[from] MalformedPathError),
}

/// Activation-wide error types.
#[derive(Debug, thiserror::Error)]
pub enum ActivateError {
    /// Configuration violates a rule, nothing was touched.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Plan cannot be derived from configuration.
    #[error(transparent)]
    Plan(#[from] MalformedPathError),

    /// Requested unit does not exist.
    #[error("no execution unit named {name:?}")]
    UnknownUnit { name: String },
}

/// Friendly result alias :3
pub type Result<T, E = ActivateError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;

    /// Mounter that must never be reached.
    #[derive(Debug, Default)]
    struct UnreachableMounter;

    impl Mounter for UnreachableMounter {
        fn is_mounted(&self, target: &Path) -> crate::mount::Result<bool> {
            panic!("mount table consulted for {}", target.display())
        }

        fn bind(&self, _: &Path, target: &Path) -> crate::mount::Result<()> {
            panic!("bind mounted onto {}", target.display())
        }
    }

    #[test]
    fn entry_state_display() {
        assert_eq!(EntryState::DirectoryReady.to_string(), "directory-ready");
        assert_eq!(EntryState::Done, EntryState::Done);
        assert_ne!(EntryState::Mounted, EntryState::Linked);
    }

    #[sealed_test]
    fn ensure_symlink_refuses_foreign_link() -> anyhow::Result<()> {
        let location = std::env::current_dir()?.join("key");
        symlink("/somewhere/else", &location)?;

        let result = ensure_symlink(Path::new("/state/etc/key"), &location);
        assert!(matches!(
            result,
            Err(LinkError::Occupied { found: Some(ref found), .. }) if found == Path::new("/somewhere/else")
        ));
        assert!(!ensure_symlink(Path::new("/somewhere/else"), &location)?);

        Ok(())
    }

    #[sealed_test]
    fn ensure_symlink_refuses_regular_file() -> anyhow::Result<()> {
        let location = std::env::current_dir()?.join("machine-id");
        std::fs::write(&location, "0123456789abcdef")?;

        let result = ensure_symlink(Path::new("/state/etc/machine-id"), &location);
        assert!(matches!(result, Err(LinkError::Occupied { found: None, .. })));
        assert_eq!(std::fs::read_to_string(&location)?, "0123456789abcdef");

        Ok(())
    }

    #[test]
    fn validation_failure_touches_nothing() {
        let mut config = ConfigModel::default();
        let mut root = crate::config::PersistentRoot::new("/nonexistent-root");
        root.directories.push("/var/lib/iwd".into());
        config.roots.insert("/nonexistent-root".into(), root);

        let runner = ActivationRunner::new(&config, UnreachableMounter);
        let result = runner.activate(&Fstab::default());

        assert!(matches!(result, Err(ActivateError::Validation(_))));
    }

    #[test]
    fn unknown_unit_is_rejected() {
        let config = ConfigModel::default();
        let runner = ActivationRunner::new(&config, UnreachableMounter);
        let result = runner.activate_units(&Fstab::default(), &["anchorage-nope"][..]);

        assert!(matches!(
            result,
            Err(ActivateError::UnknownUnit { name }) if name == "anchorage-nope"
        ));
    }
}
