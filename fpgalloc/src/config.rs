// This file is part of fpgalloc, an application to share PCIe FPGA cards between the users of a host.
//
// Copyright 2025 Canonical Ltd.
//
// SPDX-License-Identifier: GPL-3.0-only
//
// fpgalloc is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License version 3, as published by the Free Software Foundation.
//
// fpgalloc is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranties of MERCHANTABILITY, SATISFACTORY QUALITY, or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with this program.  If not, see http://www.gnu.org/licenses/.

//! System paths used by fpgalloc.
//!
//! Every kernel interface and runtime location is a field of [`SystemConfig`] rather than a
//! hardcoded path, so the whole tool can be pointed at a fake sysfs tree. Values come from
//! `/etc/fpgalloc/config.toml` (user), then `/usr/lib/fpgalloc/config.toml` (vendor), then the
//! hardcoded defaults below:
//!
//! ```toml
//! [system_paths]
//! pci_bus_dir = "/sys/bus/pci"
//! dev_dir = "/dev"
//! ledger_dir = "/run/lock/fpga-util"
//! lock_file = "/run/lock/fpga-util.lock"
//! mapping_file = "/etc/fpgalloc/mapping"
//! ```

pub(crate) mod config_files;

use crate::config::config_files::{SystemPaths, system_paths_config_from_file};
use log::{trace, warn};
use std::path::{Path, PathBuf};

/// The kernel's PCI bus directory. Typically `/sys/bus/pci`.
pub static PCI_BUS_DIR: &str = "/sys/bus/pci";

/// Where device nodes announced through `DEVNAME` in uevent files live.
pub static DEV_DIR: &str = "/dev";

/// Directory holding one marker file per allocated device.
pub static LEDGER_DIR: &str = "/run/lock/fpga-util";

/// The lock file serializing every mutating command on the host.
pub static LOCK_FILE: &str = "/run/lock/fpga-util.lock";

/// System wide location of the device mapping file.
pub static MAPPING_FILE: &str = "/etc/fpgalloc/mapping";

pub static VENDOR_CONFIG_FILE: &str = "/usr/lib/fpgalloc/config.toml";
pub static USER_CONFIG_FILE: &str = "/etc/fpgalloc/config.toml";

/// Resolved system paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemConfig {
    pub pci_bus_dir: PathBuf,
    pub dev_dir: PathBuf,
    pub ledger_dir: PathBuf,
    pub lock_file: PathBuf,
    /// `None` when no mapping file was configured and none of the default locations exist.
    pub mapping_file: Option<PathBuf>,
}

impl SystemConfig {
    /// `<pci_bus_dir>/devices`, one symlink per PCI function.
    pub fn pci_devices_dir(&self) -> PathBuf {
        self.pci_bus_dir.join("devices")
    }

    /// `<pci_bus_dir>/rescan`, the bus-wide rescan control.
    pub fn pci_rescan_path(&self) -> PathBuf {
        self.pci_bus_dir.join("rescan")
    }

    /// Place every path below `root`, mirroring the layout of a real system.
    ///
    /// Used to run against a fake sysfs tree.
    pub fn rooted_at(root: &Path) -> SystemConfig {
        let strip = |p: &str| root.join(p.trim_start_matches('/'));
        SystemConfig {
            pci_bus_dir: strip(PCI_BUS_DIR),
            dev_dir: strip(DEV_DIR),
            ledger_dir: strip(LEDGER_DIR),
            lock_file: strip(LOCK_FILE),
            mapping_file: Some(strip(MAPPING_FILE)),
        }
    }
}

/// First existing mapping file out of `<executable dir>/mapping` and [`MAPPING_FILE`].
pub(crate) fn default_mapping_file() -> Option<PathBuf> {
    let next_to_exe = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("mapping")));
    next_to_exe
        .into_iter()
        .chain(std::iter::once(PathBuf::from(MAPPING_FILE)))
        .find(|candidate| candidate.is_file())
}

/// Load the system configuration.
///
/// User config overrides vendor config and vendor config overrides hardcoded defaults.
/// `user_config` replaces the default user config location when given. A config file that
/// fails to parse is reported and skipped.
pub fn system_config(user_config: Option<&Path>) -> SystemConfig {
    let vendor_config = system_paths_config_from_file(Path::new(VENDOR_CONFIG_FILE))
        .unwrap_or_else(|e| {
            warn!("Using hardcoded paths for vendor config because loading config failed: {e}");
            SystemPaths::default()
        });
    let user_config = system_paths_config_from_file(
        user_config.unwrap_or_else(|| Path::new(USER_CONFIG_FILE)),
    )
    .unwrap_or_else(|e| {
        warn!("Using hardcoded paths for user config because loading config failed: {e}");
        SystemPaths::default()
    });
    trace!("Merging user_config: {user_config:?} with vendor_config {vendor_config:?}");
    let ret: SystemConfig = user_config.merge(vendor_config).into();
    trace!("Resulting config: {ret:?}");
    ret
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rooted_at_keeps_layout() {
        let config = SystemConfig::rooted_at(Path::new("/tmp/root"));
        assert_eq!(
            config.pci_devices_dir(),
            PathBuf::from("/tmp/root/sys/bus/pci/devices")
        );
        assert_eq!(
            config.pci_rescan_path(),
            PathBuf::from("/tmp/root/sys/bus/pci/rescan")
        );
        assert_eq!(
            config.lock_file,
            PathBuf::from("/tmp/root/run/lock/fpga-util.lock")
        );
    }

    #[test]
    fn test_explicit_user_config_is_used() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("config.toml");
        std::fs::write(&file, "[system_paths]\nledger_dir = \"/srv/ledger\"\n").unwrap();
        let config = system_config(Some(&file));
        assert_eq!(config.ledger_dir, PathBuf::from("/srv/ledger"));
    }
}
