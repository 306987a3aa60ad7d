// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration validation.
//!
//! Checks a [`ConfigModel`] before anything touches the file system. Every
//! rule is evaluated over the whole configuration, and every violation gets
//! reported at once, so an operator can fix everything in one pass.
//!
//! # Rules
//!
//! 1. Every persisted file lives strictly under the allowed prefix.
//! 2. Every persistent root is mounted unconditionally at boot according to
//!    the system mount table.
//! 3. No two persistent roots map to the same execution unit name.
//!
//! Persisting the same ephemeral path from more than one root is not a
//! violation, but it is a hazard, so it gets logged.

use crate::{config::ConfigModel, mount::Fstab, path::unit_name};

use std::{
    collections::BTreeMap,
    fmt::{Display, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
};
use tracing::{instrument, warn};

/// Validate configuration model.
#[derive(Debug, Clone, Copy)]
pub struct Validator<'cfg> {
    config: &'cfg ConfigModel,
}

impl<'cfg> Validator<'cfg> {
    /// Construct new validator over configuration.
    pub fn new(config: &'cfg ConfigModel) -> Self {
        Self { config }
    }

    /// Check every rule against configuration.
    ///
    /// # Errors
    ///
    /// - Return [`ValidationError`] listing every violated rule along with
    ///   every offending path.
    #[instrument(skip(self, fstab), level = "debug")]
    pub fn validate(&self, fstab: &Fstab) -> Result<(), ValidationError> {
        let mut violations = Vec::new();

        let paths = self.files_outside_prefix();
        if !paths.is_empty() {
            violations.push(Violation::OutsidePrefix {
                prefix: self.config.allowed_prefix.clone(),
                paths,
            });
        }

        let roots = self.roots_not_required(fstab);
        if !roots.is_empty() {
            violations.push(Violation::NotRequiredAtBoot { roots });
        }

        for (name, roots) in self.unit_name_clashes() {
            violations.push(Violation::UnitNameClash {
                name,
                roots: roots.into_iter().map(Path::to_path_buf).collect(),
            });
        }

        for (target, roots) in self.duplicate_targets() {
            warn!(
                "{} is persisted by more than one root: {}",
                target.display(),
                roots
                    .iter()
                    .map(|root| root.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ValidationError { violations })
        }
    }

    /// List every configured file that is not under the allowed prefix.
    pub fn files_outside_prefix(&self) -> Vec<PathBuf> {
        let prefix = self.config.allowed_prefix.as_path();
        self.config
            .roots()
            .flat_map(|root| root.files.iter())
            .filter(|path| !is_strictly_under(path, prefix))
            .cloned()
            .collect()
    }

    /// List every persistent root that is not required at boot.
    pub fn roots_not_required(&self, fstab: &Fstab) -> Vec<PathBuf> {
        self.config
            .roots()
            .filter(|root| !fstab.is_required_at_boot(&root.path))
            .map(|root| root.path.clone())
            .collect()
    }

    /// Map every unit name shared by more than one root to those roots.
    pub fn unit_name_clashes(&self) -> BTreeMap<String, Vec<&'cfg Path>> {
        let mut units: BTreeMap<String, Vec<&Path>> = BTreeMap::new();
        for root in self.config.roots() {
            units
                .entry(unit_name(&root.path))
                .or_default()
                .push(root.path.as_path());
        }

        units.retain(|_, roots| roots.len() > 1);
        units
    }

    /// Map every ephemeral path persisted by more than one root to those roots.
    pub fn duplicate_targets(&self) -> BTreeMap<&'cfg Path, Vec<&'cfg Path>> {
        let mut targets: BTreeMap<&Path, Vec<&Path>> = BTreeMap::new();
        for root in self.config.roots() {
            for entry in root.entries() {
                let owners = targets.entry(entry.path()).or_default();
                if !owners.contains(&root.path.as_path()) {
                    owners.push(root.path.as_path());
                }
            }
        }

        targets.retain(|_, owners| owners.len() > 1);
        targets
    }
}

fn is_strictly_under(path: &Path, prefix: &Path) -> bool {
    path != prefix && path.starts_with(prefix)
}

/// Single violated rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// Files that fall outside the allowed prefix.
    OutsidePrefix { prefix: PathBuf, paths: Vec<PathBuf> },

    /// Persistent roots that are not mounted unconditionally at boot.
    NotRequiredAtBoot { roots: Vec<PathBuf> },

    /// Persistent roots that share one unit name.
    UnitNameClash { name: String, roots: Vec<PathBuf> },
}

impl Display for Violation {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let paths = match self {
            Self::OutsidePrefix { prefix, paths } => {
                write!(fmt, "file outside allowed prefix {}:", prefix.display())?;
                paths
            }
            Self::NotRequiredAtBoot { roots } => {
                write!(fmt, "root not required at boot:")?;
                roots
            }
            Self::UnitNameClash { name, roots } => {
                write!(fmt, "unit name {name} shared by roots:")?;
                roots
            }
        };

        for path in paths {
            write!(fmt, "\n    {}", path.display())?;
        }

        Ok(())
    }
}

/// Configuration violates one or more rules.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "invalid persistence configuration{}",
    .violations.iter().map(|violation| format!("\n{violation}")).collect::<String>()
)]
pub struct ValidationError {
    /// Every violated rule.
    pub violations: Vec<Violation>,
}
