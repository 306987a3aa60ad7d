// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Keep select paths of an ephemeral root durable across reboots.
//!
//! A machine whose root file system is wiped on every boot can still keep a
//! designated set of files and directories around, by storing their real
//! contents on one or more __persistent roots__, and exposing them back at
//! their original paths. Directories get bind mounted, files get linked.
//!
//! Before a directory is mounted or a file is linked, every ancestor
//! directory on the ephemeral side is recreated with the exact owner, group,
//! and permission bits of its counterpart on the persistent side.
//!
//! # Pipeline
//!
//! 1. [`ConfigModel`](config::ConfigModel) is loaded once per run.
//! 2. [`Validator`](validate::Validator) checks it, refusing to continue on any
//!    violation.
//! 3. [`MountPlanner`](plan::MountPlanner) derives one unit of work per
//!    persistent root.
//! 4. [`ActivationRunner`](activate::ActivationRunner) carries out each unit,
//!    using [`DirectoryReplicator`](replicate::DirectoryReplicator) for the
//!    directory scaffolding.

pub mod activate;
pub mod config;
pub mod mount;
pub mod path;
pub mod plan;
pub mod replicate;
pub mod validate;
