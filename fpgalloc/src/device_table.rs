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

//! The table of FPGA cards known to the host.
//!
//! The mapping file has one card per line, five whitespace separated fields:
//!
//! ```text
//! # serial        pci  quirk               board   program script
//! 21770297400LA   3b   xilinx-alveo-quirk  u250    program_u250.tcl
//! 500202A30FAAA   d8   -                   vcu118  /opt/scripts/program_vcu118.tcl
//! ```
//!
//! Relative script paths are resolved against the directory of the mapping file. Lines whose
//! script does not exist are dropped with a diagnostic; the rest of the table stays usable.

use crate::error::FpgallocError;
use crate::system_io::fs_read;
use log::{error, trace, warn};
use std::path::{Component, Path, PathBuf};

/// A serial names the card's ledger marker, so it must be a single plain file name.
pub fn is_valid_serial(serial: &str) -> bool {
    let mut components = Path::new(serial).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(name)), None) if name == serial
    )
}

/// One FPGA card as described by the mapping file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Stable unique id of the card, also the name of its ledger marker.
    pub serial: String,
    /// PCI bus of the card; its functions are `0000:<pci_prefix>:<dd>.<f>`.
    pub pci_prefix: String,
    /// Name of the bus quirk applied around flashing. May name a quirk that is not registered.
    pub quirk: String,
    pub board: String,
    /// Absolute path of the Tcl script handed to the programming tool.
    pub program_script: PathBuf,
}

#[derive(Debug, Default, Clone)]
pub struct DeviceTable {
    devices: Vec<DeviceDescriptor>,
}

impl DeviceTable {
    /// Read and parse a mapping file.
    ///
    /// # Returns: `Result<DeviceTable, FpgallocError>`
    /// * `Ok(DeviceTable)` - Every valid line of the file, possibly empty
    /// * `Err(FpgallocError::IORead)` - The mapping file cannot be read
    pub fn from_file(mapping_file: &Path) -> Result<DeviceTable, FpgallocError> {
        let contents = fs_read(mapping_file)?;
        let base_dir = mapping_file.parent().unwrap_or_else(|| Path::new("."));
        Ok(DeviceTable::parse(&contents, base_dir))
    }

    /// Parse mapping file contents; relative script paths are joined onto `base_dir`.
    pub fn parse(contents: &str, base_dir: &Path) -> DeviceTable {
        let mut table = DeviceTable::default();
        for (number, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            let [serial, pci_prefix, quirk, board, script] = fields[..] else {
                warn!(
                    "line {} of the mapping file has {} fields instead of 5, skipping it",
                    number + 1,
                    fields.len()
                );
                continue;
            };
            if !is_valid_serial(serial) {
                error!(
                    "line {} of the mapping file has serial {serial:?}, which is not a plain name, skipping it",
                    number + 1
                );
                continue;
            }
            let program_script = match Path::new(script) {
                p if p.is_absolute() => p.to_path_buf(),
                p => base_dir.join(p),
            };
            if !program_script.is_file() {
                error!(
                    "program script {program_script:?} of device {serial} was not found, skipping it"
                );
                continue;
            }
            trace!("mapping line {}: {serial} on bus {pci_prefix}", number + 1);
            table.insert(DeviceDescriptor {
                serial: serial.to_owned(),
                pci_prefix: pci_prefix.to_owned(),
                quirk: quirk.to_owned(),
                board: board.to_owned(),
                program_script,
            });
        }
        table
    }

    /// Add a device, replacing an earlier one with the same serial in place.
    pub fn insert(&mut self, device: DeviceDescriptor) {
        match self.devices.iter_mut().find(|d| d.serial == device.serial) {
            Some(existing) => {
                warn!("device {} is listed twice, using the later line", device.serial);
                *existing = device;
            }
            None => self.devices.push(device),
        }
    }

    pub fn get(&self, serial: &str) -> Option<&DeviceDescriptor> {
        self.devices.iter().find(|d| d.serial == serial)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceDescriptor> {
        self.devices.iter()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
