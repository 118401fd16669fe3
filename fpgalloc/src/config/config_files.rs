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

use crate::config::{self, SystemConfig};
use crate::error::FpgallocError;
use crate::system_io::fs_read;
use log::trace;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// This is the top level struct which holds all sections
#[derive(Debug, Deserialize)]
pub(crate) struct TomlConfig {
    system_paths: Option<SystemPaths>,
}

/// This is the "system_paths" section struct
#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub(crate) struct SystemPaths {
    pub(crate) pci_bus_dir: Option<PathBuf>,
    pub(crate) dev_dir: Option<PathBuf>,
    pub(crate) ledger_dir: Option<PathBuf>,
    pub(crate) lock_file: Option<PathBuf>,
    pub(crate) mapping_file: Option<PathBuf>,
}

impl From<SystemPaths> for SystemConfig {
    fn from(value: SystemPaths) -> Self {
        trace!("Creating SystemConfig from {value:?}");
        SystemConfig {
            pci_bus_dir: value.pci_bus_dir.unwrap_or_else(|| {
                trace!("No pci_bus_dir provided. Using hardcoded value.");
                PathBuf::from(config::PCI_BUS_DIR)
            }),
            dev_dir: value.dev_dir.unwrap_or_else(|| {
                trace!("No dev_dir provided. Using hardcoded value.");
                PathBuf::from(config::DEV_DIR)
            }),
            ledger_dir: value.ledger_dir.unwrap_or_else(|| {
                trace!("No ledger_dir provided. Using hardcoded value.");
                PathBuf::from(config::LEDGER_DIR)
            }),
            lock_file: value.lock_file.unwrap_or_else(|| {
                trace!("No lock_file provided. Using hardcoded value.");
                PathBuf::from(config::LOCK_FILE)
            }),
            mapping_file: value.mapping_file.or_else(|| {
                trace!("No mapping_file provided. Searching the default locations.");
                config::default_mapping_file()
            }),
        }
    }
}

impl SystemPaths {
    pub(crate) fn merge(self, fallback: SystemPaths) -> SystemPaths {
        SystemPaths {
            pci_bus_dir: self.pci_bus_dir.or(fallback.pci_bus_dir),
            dev_dir: self.dev_dir.or(fallback.dev_dir),
            ledger_dir: self.ledger_dir.or(fallback.ledger_dir),
            lock_file: self.lock_file.or(fallback.lock_file),
            mapping_file: self.mapping_file.or(fallback.mapping_file),
        }
    }
}

fn toml_str_to_config(file_path: &Path, toml_string: &str) -> Result<TomlConfig, FpgallocError> {
    toml::from_str(toml_string).map_err(|e| FpgallocError::TomlDe {
        file: file_path.into(),
        e,
    })
}

/// Load the `[system_paths]` section of a config file.
///
/// A file that does not exist, or that has no `[system_paths]` section, yields an empty
/// section so that the next layer (or the hardcoded defaults) applies.
pub(crate) fn system_paths_config_from_file(
    file_path: &Path,
) -> Result<SystemPaths, FpgallocError> {
    if !file_path.is_file() {
        trace!("Config file {file_path:?} not present");
        return Ok(SystemPaths::default());
    }
    let config = toml_str_to_config(file_path, &fs_read(file_path)?)?;
    Ok(config.system_paths.unwrap_or_else(|| {
        trace!("{file_path:?} has no `[system_paths]` section");
        SystemPaths::default()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_values_override_vendor_values() {
        let user = SystemPaths {
            ledger_dir: Some("/tmp/ledger".into()),
            ..Default::default()
        };
        let vendor = SystemPaths {
            ledger_dir: Some("/vendor/ledger".into()),
            dev_dir: Some("/vendor/dev".into()),
            ..Default::default()
        };
        let merged = user.merge(vendor);
        assert_eq!(merged.ledger_dir, Some(PathBuf::from("/tmp/ledger")));
        assert_eq!(merged.dev_dir, Some(PathBuf::from("/vendor/dev")));
        assert_eq!(merged.lock_file, None);
    }

    #[test]
    fn test_missing_values_use_hardcoded_defaults() {
        let config: SystemConfig = SystemPaths {
            mapping_file: Some("/srv/mapping".into()),
            ..Default::default()
        }
        .into();
        assert_eq!(config.pci_bus_dir, PathBuf::from(config::PCI_BUS_DIR));
        assert_eq!(config.lock_file, PathBuf::from(config::LOCK_FILE));
        assert_eq!(config.mapping_file, Some(PathBuf::from("/srv/mapping")));
    }

    #[test]
    fn test_parse_system_paths_section() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("config.toml");
        std::fs::write(
            &file,
            "[system_paths]\npci_bus_dir = \"/fake/sys/bus/pci\"\nlock_file = \"/fake/lock\"\n",
        )
        .unwrap();
        let paths = system_paths_config_from_file(&file).unwrap();
        assert_eq!(paths.pci_bus_dir, Some(PathBuf::from("/fake/sys/bus/pci")));
        assert_eq!(paths.lock_file, Some(PathBuf::from("/fake/lock")));
        assert_eq!(paths.dev_dir, None);
    }

    #[test]
    fn test_missing_file_is_empty_section() {
        let dir = tempfile::tempdir().unwrap();
        let paths = system_paths_config_from_file(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(paths, SystemPaths::default());
    }

    #[test]
    fn test_malformed_file_is_toml_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("config.toml");
        std::fs::write(&file, "[system_paths\nledger_dir = 3").unwrap();
        let err = system_paths_config_from_file(&file).unwrap_err();
        assert!(err.to_string().contains("FpgallocError::TomlDe"));
    }
}
