// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT


use anchorage::{
    config::{ConfigModel, PersistentRoot},
    mount::{self, Fstab, MountError, Mounter},
};

use anyhow::Result;
use std::{
    cell::RefCell,
    env::current_dir,
    fs::{create_dir_all, set_permissions, symlink_metadata, write, Permissions},
    io::Error,
    os::unix::fs::{MetadataExt, PermissionsExt},
    path::{Path, PathBuf},
};

/// Record bind mounts instead of performing them.
#[derive(Debug, Default)]
pub(crate) struct RecordingMounter {
    mounted: RefCell<Vec<(PathBuf, PathBuf)>>,
}

impl RecordingMounter {
    pub(crate) fn mounted(&self) -> Vec<(PathBuf, PathBuf)> {
        self.mounted.borrow().clone()
    }
}

impl Mounter for RecordingMounter {
    fn is_mounted(&self, target: &Path) -> mount::Result<bool> {
        Ok(self.mounted.borrow().iter().any(|(_, t)| t == target))
    }

    fn bind(&self, source: &Path, target: &Path) -> mount::Result<()> {
        self.mounted
            .borrow_mut()
            .push((source.to_path_buf(), target.to_path_buf()));
        Ok(())
    }
}

/// Refuse every bind mount as if the target were busy.
#[derive(Debug, Default)]
pub(crate) struct FailingMounter;

impl Mounter for FailingMounter {
    fn is_mounted(&self, _: &Path) -> mount::Result<bool> {
        Ok(false)
    }

    fn bind(&self, source: &Path, target: &Path) -> mount::Result<()> {
        Err(MountError::Bind {
            // EBUSY
            source: Error::from_raw_os_error(16),
            from: source.to_path_buf(),
            target: target.to_path_buf(),
        })
    }
}

/// Persistent root and ephemeral root laid out inside the sealed working
/// directory.
pub(crate) struct PersistFixture {
    pub(crate) state: PathBuf,
    pub(crate) eph: PathBuf,
    pub(crate) config: ConfigModel,
}

impl PersistFixture {
    pub(crate) fn new() -> Result<Self> {
        let cwd = current_dir()?;
        let state = cwd.join("state");
        let eph = cwd.join("eph");
        create_dir_all(&state)?;
        create_dir_all(&eph)?;

        let config = ConfigModel {
            ephemeral_root: eph.clone(),
            fstab: cwd.join("fstab"),
            ..Default::default()
        };

        let fixture = Self { state, eph, config };
        fixture.write_fstab(&[fixture.state.as_path()])?;

        Ok(fixture)
    }

    /// Mark given roots as required at boot.
    pub(crate) fn write_fstab(&self, roots: &[&Path]) -> Result<()> {
        let data = roots
            .iter()
            .map(|root| format!("/dev/disk/by-label/persist {} ext4 defaults 0 2\n", root.display()))
            .collect::<String>();
        write(&self.config.fstab, data)?;

        Ok(())
    }

    pub(crate) fn fstab(&self) -> Result<Fstab> {
        Ok(Fstab::load(&self.config.fstab)?)
    }

    pub(crate) fn persist_dir(&mut self, path: &str) {
        let state = self.state.clone();
        self.root_entry(&state).directories.push(path.into());
    }

    pub(crate) fn persist_file(&mut self, path: &str) {
        let state = self.state.clone();
        self.root_entry(&state).files.push(path.into());
    }

    pub(crate) fn root_entry(&mut self, root: &Path) -> &mut PersistentRoot {
        self.config
            .roots
            .entry(root.to_path_buf())
            .or_insert_with(|| PersistentRoot::new(root))
    }

    /// Create directory on the persistent root with given mode.
    pub(crate) fn source_dir(&self, path: &str, mode: u32) -> Result<PathBuf> {
        let full = self.state.join(path.trim_start_matches('/'));
        create_dir_all(&full)?;
        set_permissions(&full, Permissions::from_mode(mode))?;

        Ok(full)
    }

    /// Create file on the persistent root.
    pub(crate) fn source_file(&self, path: &str, contents: &str) -> Result<PathBuf> {
        let full = self.state.join(path.trim_start_matches('/'));
        write(&full, contents)?;

        Ok(full)
    }

    pub(crate) fn eph_path(&self, path: &str) -> PathBuf {
        self.eph.join(path.trim_start_matches('/'))
    }
}

pub(crate) fn mode_of(path: impl AsRef<Path>) -> u32 {
    symlink_metadata(path).unwrap().mode() & 0o7777
}

pub(crate) fn owner_of(path: impl AsRef<Path>) -> (u32, u32) {
    let meta = symlink_metadata(path).unwrap();
    (meta.uid(), meta.gid())
}
