// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout of the persistence configuration file, and the
//! normalized in-memory model that the rest of Anchorage works from.
//!
//! # General Layout
//!
//! A configuration file is composed of a handful of global settings, and one
//! `[persist."<root>"]` table per persistent storage root. Each persistent
//! root lists the directories that should be bind mounted, and the files that
//! should be linked back onto the ephemeral root:
//!
//! ```toml
//! allowed_prefix = "/etc"
//! missing_source = "strict"
//!
//! [link]
//! mode = "direct"
//!
//! [persist."/state"]
//! directories = ["/var/lib/iwd"]
//! files = ["/etc/ssh/ssh_host_rsa_key"]
//! ```
//!
//! Every path-valued field goes through shell expansion, and is then
//! normalized. Once a [`ConfigModel`] is built it is never mutated.

use crate::path::{normalize, MalformedPathError};

use serde::{Deserialize, Serialize};
use std::{
    collections::{btree_map::Entry, BTreeMap},
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    fs::read_to_string,
    path::{Path, PathBuf},
    str::FromStr,
};

/// Default location of configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/anchorage.toml";

/// Normalized persistence configuration.
///
/// Maps each persistent root to the entries that it persists, along with the
/// settings that control how activation treats them.
#[derive(Debug, PartialEq, Eq, Clone, Serialize)]
pub struct ConfigModel {
    /// Prefix that every persisted file must live under.
    pub allowed_prefix: PathBuf,

    /// Root of the ephemeral file system as seen by the activation process.
    pub ephemeral_root: PathBuf,

    /// What to do about persistent-side directories that do not exist.
    pub missing_source: MissingSource,

    /// Mount table consulted to check that persistent roots are required at
    /// boot.
    pub fstab: PathBuf,

    /// Strategy used to link persisted files.
    pub link: LinkSettings,

    /// Persistent roots keyed by their path.
    #[serde(rename = "persist")]
    pub roots: BTreeMap<PathBuf, PersistentRoot>,
}

/// Configuration file exactly as written.
///
/// Root keys stay raw strings, because `"/state"` and `"/state/"` compare
/// equal as paths and would replace each other before they can be merged.
#[derive(Debug, Deserialize)]
struct ConfigLayout {
    #[serde(default = "default_allowed_prefix")]
    allowed_prefix: PathBuf,

    #[serde(default = "default_ephemeral_root")]
    ephemeral_root: PathBuf,

    #[serde(default)]
    missing_source: MissingSource,

    #[serde(default = "default_fstab")]
    fstab: PathBuf,

    #[serde(default)]
    link: LinkSettings,

    #[serde(default)]
    persist: BTreeMap<String, PersistentRoot>,
}

impl ConfigModel {
    /// Load and normalize configuration file.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Read`] if file cannot be read.
    /// - Return any error [`ConfigModel::from_str`] may return.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = read_to_string(path).map_err(|err| ConfigError::Read {
            source: err,
            path: path.to_path_buf(),
        })?;

        data.parse()
    }

    /// Iterate over persistent roots in a stable order.
    pub fn roots(&self) -> impl Iterator<Item = &PersistentRoot> {
        self.roots.values()
    }
}

impl Default for ConfigModel {
    fn default() -> Self {
        Self {
            allowed_prefix: default_allowed_prefix(),
            ephemeral_root: default_ephemeral_root(),
            missing_source: MissingSource::default(),
            fstab: default_fstab(),
            link: LinkSettings::default(),
            roots: BTreeMap::new(),
        }
    }
}

impl FromStr for ConfigModel {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let raw: ConfigLayout = toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Every path is shell expanded and normalized exactly once.
        let mut model = ConfigModel {
            allowed_prefix: expand_path(&raw.allowed_prefix)?,
            ephemeral_root: expand_path(&raw.ephemeral_root)?,
            missing_source: raw.missing_source,
            fstab: expand_path(&raw.fstab)?,
            link: LinkSettings {
                mode: raw.link.mode,
                overlay_root: raw.link.overlay_root.as_deref().map(expand_path).transpose()?,
            },
            roots: BTreeMap::new(),
        };

        if model.link.mode == LinkMode::Overlay && model.link.overlay_root.is_none() {
            return Err(ConfigError::MissingOverlayRoot);
        }

        for (key, root) in raw.persist {
            let path = expand_path(Path::new(&key))?;
            let root = PersistentRoot {
                path: path.clone(),
                directories: root
                    .directories
                    .iter()
                    .map(|entry| expand_path(entry))
                    .collect::<Result<Vec<_>>>()?,
                files: root
                    .files
                    .iter()
                    .map(|entry| expand_path(entry))
                    .collect::<Result<Vec<_>>>()?,
            };

            // INVARIANT: Two keys that normalize to the same root are merged.
            match model.roots.entry(path) {
                Entry::Occupied(mut existing) => {
                    let existing = existing.get_mut();
                    existing.directories.extend(root.directories);
                    existing.files.extend(root.files);
                }
                Entry::Vacant(slot) => {
                    slot.insert(root);
                }
            }
        }

        Ok(model)
    }
}

impl Display for ConfigModel {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

/// Persistent storage root.
///
/// Identified by its path. Owns the directory and file entries that are
/// persisted on it.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct PersistentRoot {
    /// Mount point of persistent storage. Filled in from the table key.
    #[serde(skip)]
    pub path: PathBuf,

    /// Ephemeral directories to bind mount from this root.
    #[serde(default)]
    pub directories: Vec<PathBuf>,

    /// Ephemeral files to link from this root.
    #[serde(default)]
    pub files: Vec<PathBuf>,
}

impl PersistentRoot {
    /// Construct new persistent root without entries.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Iterate over every entry of the root, directories first.
    pub fn entries(&self) -> impl Iterator<Item = PersistenceEntry<'_>> {
        self.directories
            .iter()
            .map(|path| PersistenceEntry::Directory(path))
            .chain(self.files.iter().map(|path| PersistenceEntry::File(path)))
    }
}

/// Single persisted path.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum PersistenceEntry<'a> {
    Directory(&'a Path),
    File(&'a Path),
}

impl<'a> PersistenceEntry<'a> {
    /// Ephemeral-side path of entry.
    pub fn path(&self) -> &'a Path {
        match self {
            Self::Directory(path) | Self::File(path) => path,
        }
    }
}

/// Policy for persistent-side directories that do not exist.
#[derive(Default, Debug, PartialEq, Eq, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingSource {
    /// Fail replication of the affected entry.
    #[default]
    Strict,

    /// Create the missing directory on the persistent root.
    Create,
}

/// How persisted files get exposed on the ephemeral root.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct LinkSettings {
    /// Selected linking strategy.
    #[serde(default)]
    pub mode: LinkMode,

    /// Staging directory of overlay layer. Required by overlay mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlay_root: Option<PathBuf>,
}

/// Linking strategy for persisted files.
#[derive(Default, Debug, PartialEq, Eq, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkMode {
    /// Symlink directly at the ephemeral path.
    #[default]
    Direct,

    /// Register link inside overlay staging directory.
    Overlay,
}

fn default_allowed_prefix() -> PathBuf {
    PathBuf::from("/etc")
}

fn default_ephemeral_root() -> PathBuf {
    PathBuf::from("/")
}

fn default_fstab() -> PathBuf {
    PathBuf::from("/etc/fstab")
}

fn expand_path(path: &Path) -> Result<PathBuf> {
    let expanded = shellexpand::full(path.to_string_lossy().as_ref())
        .map_err(ConfigError::ShellExpansion)?
        .into_owned();

    Ok(normalize(expanded)?)
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read configuration file {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),

    /// Configured path is not usable.
    #[error(transparent)]
    MalformedPath(#[from] MalformedPathError),

    /// Overlay mode selected without a staging directory.
    #[error("link mode \"overlay\" requires link.overlay_root to be set")]
    MissingOverlayRoot,
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;
