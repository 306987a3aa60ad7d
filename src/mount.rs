// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Mount primitives and mount tables.
//!
//! Anchorage never talks to the mount system call directly outside of this
//! module. Activation goes through the [`Mounter`] trait, so that it can be
//! exercised without privileges, and the Validator goes through [`Fstab`] to
//! learn which persistent roots the system treats as required at boot.
//!
//! # Mount Table Formats
//!
//! Two formats are understood:
//!
//! 1. __fstab__, i.e., `fs_spec fs_file fs_vfstype fs_mntops fs_freq fs_passno`
//!    separated by whitespace, with `#` comments.
//! 2. __mountinfo__, i.e., the per-process view of the kernel mount table at
//!    `/proc/self/mountinfo`, where the fifth field is the mount point.
//!
//! Both formats escape whitespace inside paths as octal sequences like
//! `\040`, which get decoded here.

use std::{
    fs::read_to_string,
    path::{Path, PathBuf},
};
use sys_mount::{Mount, MountFlags};
use tracing::debug;

/// Location of the kernel mount table for the current process.
pub const MOUNTINFO_PATH: &str = "/proc/self/mountinfo";

/// Bind mount primitive.
pub trait Mounter {
    /// Check if something is already mounted at target.
    fn is_mounted(&self, target: &Path) -> Result<bool>;

    /// Bind mount source directory onto target directory.
    fn bind(&self, source: &Path, target: &Path) -> Result<()>;
}

/// Mount through the host kernel.
#[derive(Debug, Clone)]
pub struct SysMounter {
    mountinfo: PathBuf,
}

impl SysMounter {
    /// Construct new system mounter reading [`MOUNTINFO_PATH`].
    pub fn new() -> Self {
        Self::with_mountinfo(MOUNTINFO_PATH)
    }

    /// Construct new system mounter reading mount table at given path.
    pub fn with_mountinfo(path: impl Into<PathBuf>) -> Self {
        Self {
            mountinfo: path.into(),
        }
    }
}

impl Default for SysMounter {
    fn default() -> Self {
        Self::new()
    }
}

impl Mounter for SysMounter {
    fn is_mounted(&self, target: &Path) -> Result<bool> {
        let data = read_to_string(&self.mountinfo).map_err(|err| MountError::ReadTable {
            source: err,
            table: self.mountinfo.clone(),
        })?;

        let mounted = mountinfo_targets(&data).any(|mount_point| mount_point == target);
        Ok(mounted)
    }

    fn bind(&self, source: &Path, target: &Path) -> Result<()> {
        debug!("bind mount {} onto {}", source.display(), target.display());
        Mount::builder()
            .flags(MountFlags::BIND)
            .mount(source, target)
            .map_err(|err| MountError::Bind {
                source: err,
                from: source.to_path_buf(),
                target: target.to_path_buf(),
            })?;

        Ok(())
    }
}

/// Iterate over the mount points listed in mountinfo data.
pub fn mountinfo_targets(data: &str) -> impl Iterator<Item = PathBuf> + '_ {
    data.lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .map(|field| PathBuf::from(unescape(field)))
}

/// Parsed fstab mount table.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Fstab {
    entries: Vec<FstabEntry>,
}

impl Fstab {
    /// Load mount table from file.
    ///
    /// # Errors
    ///
    /// - Return [`MountError::ReadTable`] if file cannot be read.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        read_to_string(path)
            .map_err(|err| MountError::ReadTable {
                source: err,
                table: path.to_path_buf(),
            })
            .map(|data| Self::from(data.as_str()))
    }

    /// Mount table entries in file order.
    pub fn entries(&self) -> &[FstabEntry] {
        &self.entries
    }

    /// Check that mount point will be mounted unconditionally at boot.
    ///
    /// A mount point qualifies if some entry mounts exactly that path, and
    /// carries neither `noauto` nor `nofail`.
    pub fn is_required_at_boot(&self, mount_point: &Path) -> bool {
        self.entries
            .iter()
            .filter(|entry| entry.file == mount_point)
            .any(|entry| {
                !entry
                    .options
                    .iter()
                    .any(|opt| opt == "noauto" || opt == "nofail")
            })
    }
}

impl From<&str> for Fstab {
    fn from(data: &str) -> Self {
        let entries = data
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let spec = unescape(fields.next()?);
                let file = unescape(fields.next()?);
                let vfstype = fields.next().unwrap_or("auto").to_string();
                let options = fields
                    .next()
                    .unwrap_or("defaults")
                    .split(',')
                    .map(str::to_string)
                    .collect();

                Some(FstabEntry {
                    spec,
                    file: PathBuf::from(file).components().collect(),
                    vfstype,
                    options,
                })
            })
            .collect();

        Self { entries }
    }
}

/// Single line of fstab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FstabEntry {
    /// Device or source being mounted.
    pub spec: String,

    /// Mount point.
    pub file: PathBuf,

    /// File system type.
    pub vfstype: String,

    /// Mount options.
    pub options: Vec<String>,
}

/// Escape whitespace and backslashes in a mount table path field.
pub fn escape(field: &str) -> String {
    let mut escaped = String::with_capacity(field.len());
    for ch in field.chars() {
        match ch {
            ' ' => escaped.push_str("\\040"),
            '\t' => escaped.push_str("\\011"),
            '\n' => escaped.push_str("\\012"),
            '\\' => escaped.push_str("\\134"),
            _ => escaped.push(ch),
        }
    }

    escaped
}

/// Decode octal escapes of a mount table path field.
pub fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut idx = 0;

    while idx < bytes.len() {
        if bytes[idx] == b'\\' && idx + 3 < bytes.len() {
            let octal = &bytes[idx + 1..idx + 4];
            if octal.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = octal
                    .iter()
                    .fold(0u16, |acc, b| acc * 8 + u16::from(b - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    decoded.push(value);
                    idx += 4;
                    continue;
                }
            }
        }

        decoded.push(bytes[idx]);
        idx += 1;
    }

    String::from_utf8_lossy(&decoded).into_owned()
}

/// Mount primitive error types.
#[derive(Debug, thiserror::Error)]
pub enum MountError {
    /// Mount table cannot be read.
    #[error("failed to read mount table {:?}", table.display())]
    ReadTable {
        #[source]
        source: std::io::Error,
        table: PathBuf,
    },

    /// Bind mount system call failed.
    #[error("failed to bind mount {:?} onto {:?}", from.display(), target.display())]
    Bind {
        #[source]
        source: std::io::Error,
        from: PathBuf,
        target: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = MountError> = std::result::Result<T, E>;
