// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Mount and link planning.
//!
//! Turn a [`ConfigModel`] into the exact set of bind mounts and links that
//! activation needs to perform, grouped into one execution unit per
//! persistent root. Planning is pure: no file system access happens here, and
//! the same configuration always yields the same plan, in the same order.
//!
//! # Link Strategies
//!
//! Persisted files are exposed through a [`LinkDescriptor`] in one of two
//! ways. In direct mode, a symlink gets placed right at the ephemeral path. In
//! overlay mode, the symlink gets registered inside an overlay staging
//! directory instead, which is composed over the ephemeral prefix by whoever
//! owns that overlay. Both strategies share the same descriptor, and only
//! differ in where [`LinkDescriptor::location`] puts the link.

use crate::{
    config::{ConfigModel, LinkMode, PersistentRoot},
    mount::escape,
    path::{join, normalize, unit_name, MalformedPathError},
};

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
};

/// Mount options of every planned bind mount.
pub const BIND_OPTIONS: &[&str] = &["bind"];

/// Bind mount to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountDescriptor {
    /// Directory on the persistent root.
    pub source: PathBuf,

    /// Ephemeral path to expose it at.
    pub target: PathBuf,

    /// Mount options.
    pub options: Vec<String>,
}

impl MountDescriptor {
    /// Render descriptor as an fstab line.
    ///
    /// The file system check pass is always zero, since the target does not
    /// need to exist before activation runs.
    pub fn to_fstab_line(&self) -> String {
        format!(
            "{} {} none {} 0 0",
            escape(self.source.to_string_lossy().as_ref()),
            escape(self.target.to_string_lossy().as_ref()),
            self.options.join(",")
        )
    }
}

/// Link to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkDescriptor {
    /// File on the persistent root that the link points to.
    pub source: PathBuf,

    /// Ephemeral path of the linked file.
    pub target: PathBuf,

    /// Where the link gets registered.
    pub strategy: LinkStrategy,
}

impl LinkDescriptor {
    /// Directory that the link location and its ancestors live under.
    pub fn scaffold_root<'a>(&'a self, ephemeral_root: &'a Path) -> &'a Path {
        match &self.strategy {
            LinkStrategy::Direct => ephemeral_root,
            LinkStrategy::Overlay { root } => root.as_path(),
        }
    }

    /// On-disk location of the link itself.
    ///
    /// # Errors
    ///
    /// - Return [`MalformedPathError`] if paths cannot be joined.
    pub fn location(&self, ephemeral_root: &Path) -> Result<PathBuf> {
        join(self.scaffold_root(ephemeral_root), &self.target)
    }
}

/// Tagged linking strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStrategy {
    /// Symlink placed at the ephemeral path.
    Direct,

    /// Symlink registered under overlay staging directory.
    Overlay { root: PathBuf },
}

/// Planned work for a single persistent root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitPlan {
    /// Execution unit name derived from root path.
    pub name: String,

    /// Persistent root path.
    pub root: PathBuf,

    /// Bind mounts in configuration order.
    pub mounts: Vec<MountDescriptor>,

    /// Links in configuration order.
    pub links: Vec<LinkDescriptor>,
}

impl Display for UnitPlan {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        writeln!(fmt, "{} ({}):", self.name, self.root.display())?;
        for mount in &self.mounts {
            writeln!(
                fmt,
                "    bind {} -> {}",
                mount.source.display(),
                mount.target.display()
            )?;
        }

        for link in &self.links {
            write!(
                fmt,
                "    link {} -> {}",
                link.target.display(),
                link.source.display()
            )?;
            match &link.strategy {
                LinkStrategy::Direct => writeln!(fmt)?,
                LinkStrategy::Overlay { root } => writeln!(fmt, " (overlay {})", root.display())?,
            }
        }

        Ok(())
    }
}

/// Complete activation plan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    /// One unit per persistent root, ordered by root path.
    pub units: Vec<UnitPlan>,
}

impl Plan {
    /// Find unit by name.
    pub fn unit(&self, name: &str) -> Option<&UnitPlan> {
        self.units.iter().find(|unit| unit.name == name)
    }

    /// Render every planned bind mount as fstab.
    pub fn to_fstab(&self) -> String {
        let mut fstab = String::new();
        for unit in &self.units {
            fstab.push_str(format!("# {}\n", unit.name).as_str());
            for mount in &unit.mounts {
                fstab.push_str(mount.to_fstab_line().as_str());
                fstab.push('\n');
            }
        }

        fstab
    }
}

impl Display for Plan {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        for unit in &self.units {
            write!(fmt, "{unit}")?;
        }

        Ok(())
    }
}

/// Derive activation plan from configuration.
#[derive(Debug, Clone, Copy)]
pub struct MountPlanner<'cfg> {
    config: &'cfg ConfigModel,
}

impl<'cfg> MountPlanner<'cfg> {
    /// Construct new planner over configuration.
    pub fn new(config: &'cfg ConfigModel) -> Self {
        Self { config }
    }

    /// Plan every persistent root.
    ///
    /// # Errors
    ///
    /// - Return [`MalformedPathError`] if a configured path cannot be joined
    ///   onto its persistent root.
    pub fn plan(&self) -> Result<Plan> {
        let units = self
            .config
            .roots()
            .map(|root| self.plan_root(root))
            .collect::<Result<Vec<_>>>()?;

        Ok(Plan { units })
    }

    /// Plan single persistent root.
    ///
    /// # Errors
    ///
    /// - Return [`MalformedPathError`] if a configured path cannot be joined
    ///   onto its persistent root.
    pub fn plan_root(&self, root: &PersistentRoot) -> Result<UnitPlan> {
        let strategy = self.strategy()?;
        let mounts = root
            .directories
            .iter()
            .map(|path| -> Result<MountDescriptor> {
                Ok(MountDescriptor {
                    source: join(&root.path, path)?,
                    target: normalize(path)?,
                    options: BIND_OPTIONS.iter().map(ToString::to_string).collect(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let links = root
            .files
            .iter()
            .map(|path| -> Result<LinkDescriptor> {
                Ok(LinkDescriptor {
                    source: join(&root.path, path)?,
                    target: normalize(path)?,
                    strategy: strategy.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(UnitPlan {
            name: unit_name(&root.path),
            root: normalize(&root.path)?,
            mounts,
            links,
        })
    }

    fn strategy(&self) -> Result<LinkStrategy> {
        match (&self.config.link.mode, &self.config.link.overlay_root) {
            (LinkMode::Overlay, Some(root)) => Ok(LinkStrategy::Overlay {
                root: normalize(root)?,
            }),
            // INVARIANT: Configuration parsing rejects overlay mode without a root.
            (LinkMode::Overlay, None) | (LinkMode::Direct, _) => Ok(LinkStrategy::Direct),
        }
    }
}

/// Friendly result alias :3
type Result<T, E = MalformedPathError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkSettings;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    fn config(mode: LinkMode) -> ConfigModel {
        let mut config = ConfigModel {
            link: LinkSettings {
                mode,
                overlay_root: Some("/run/anchorage/etc-overlay".into()),
            },
            ..Default::default()
        };

        let mut state = PersistentRoot::new("/state");
        state.directories.push("/var/lib/iwd".into());
        state.files.push("/etc/ssh/ssh_host_rsa_key".into());
        config.roots.insert("/state".into(), state);

        let mut persist = PersistentRoot::new("/nix/persist");
        persist.directories.push("/var/log".into());
        persist.directories.push("/var/lib/nixos".into());
        config.roots.insert("/nix/persist".into(), persist);

        config
    }

    #[test]
    fn plan_direct_mode() -> anyhow::Result<()> {
        let config = config(LinkMode::Direct);
        let result = MountPlanner::new(&config).plan()?;

        let expect = Plan {
            units: vec![
                UnitPlan {
                    name: "anchorage-nix-persist".into(),
                    root: "/nix/persist".into(),
                    mounts: vec![
                        MountDescriptor {
                            source: "/nix/persist/var/log".into(),
                            target: "/var/log".into(),
                            options: vec!["bind".into()],
                        },
                        MountDescriptor {
                            source: "/nix/persist/var/lib/nixos".into(),
                            target: "/var/lib/nixos".into(),
                            options: vec!["bind".into()],
                        },
                    ],
                    links: vec![],
                },
                UnitPlan {
                    name: "anchorage-state".into(),
                    root: "/state".into(),
                    mounts: vec![MountDescriptor {
                        source: "/state/var/lib/iwd".into(),
                        target: "/var/lib/iwd".into(),
                        options: vec!["bind".into()],
                    }],
                    links: vec![LinkDescriptor {
                        source: "/state/etc/ssh/ssh_host_rsa_key".into(),
                        target: "/etc/ssh/ssh_host_rsa_key".into(),
                        strategy: LinkStrategy::Direct,
                    }],
                },
            ],
        };

        assert_eq!(result, expect);
        assert_eq!(MountPlanner::new(&config).plan()?, result);

        Ok(())
    }

    #[test]
    fn plan_overlay_mode_moves_link_location() -> anyhow::Result<()> {
        let config = config(LinkMode::Overlay);
        let plan = MountPlanner::new(&config).plan()?;
        let link = &plan.unit("anchorage-state").unwrap().links[0];

        assert_eq!(
            link.strategy,
            LinkStrategy::Overlay {
                root: "/run/anchorage/etc-overlay".into()
            }
        );
        assert_eq!(
            link.location(Path::new("/"))?,
            PathBuf::from("/run/anchorage/etc-overlay/etc/ssh/ssh_host_rsa_key")
        );

        let direct = LinkDescriptor {
            strategy: LinkStrategy::Direct,
            ..link.clone()
        };
        assert_eq!(
            direct.location(Path::new("/sysroot"))?,
            PathBuf::from("/sysroot/etc/ssh/ssh_host_rsa_key")
        );

        Ok(())
    }

    #[test]
    fn plan_renders_fstab_and_summary() -> anyhow::Result<()> {
        let mut config = config(LinkMode::Overlay);
        config
            .roots
            .get_mut(Path::new("/state"))
            .unwrap()
            .directories
            .push("/var/lib/my app".into());
        let plan = MountPlanner::new(&config).plan()?;

        let expect = indoc! {r#"
            # anchorage-nix-persist
            /nix/persist/var/log /var/log none bind 0 0
            /nix/persist/var/lib/nixos /var/lib/nixos none bind 0 0
            # anchorage-state
            /state/var/lib/iwd /var/lib/iwd none bind 0 0
            /state/var/lib/my\040app /var/lib/my\040app none bind 0 0
        "#};
        assert_eq!(plan.to_fstab(), expect);

        let expect = indoc! {r#"
            anchorage-nix-persist (/nix/persist):
                bind /nix/persist/var/log -> /var/log
                bind /nix/persist/var/lib/nixos -> /var/lib/nixos
            anchorage-state (/state):
                bind /state/var/lib/iwd -> /var/lib/iwd
                bind /state/var/lib/my app -> /var/lib/my app
                link /etc/ssh/ssh_host_rsa_key -> /state/etc/ssh/ssh_host_rsa_key (overlay /run/anchorage/etc-overlay)
        "#};
        assert_eq!(plan.to_string(), expect);

        Ok(())
    }
}
