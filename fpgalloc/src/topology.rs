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

//! PCI topology of a card as currently seen by the kernel.
//!
//! Nothing here is cached: functions disappear while a card is being reprogrammed and come
//! back (possibly bound to a different driver) after a rescan, so every query re-reads sysfs.
//!
//! # A sysfs map of a card behind a bridge
//!
//! ```text
//! /sys/bus/pci/devices
//! ├── 0000:00:01.1 -> ../../../devices/pci0000:00/0000:00:01.1              <- bridge
//! ├── 0000:3b:00.0 -> ../../../devices/pci0000:00/0000:00:01.1/0000:3b:00.0 <- card, function 0
//! └── 0000:3b:00.1 -> ../../../devices/pci0000:00/0000:00:01.1/0000:3b:00.1 <- card, function 1
//! ```
//!
//! The functions of a card are the entries `0000:<pci_prefix>:<dd>.<f>`; its upstream bridge is
//! the parent directory of a function once the symlink is resolved.

pub mod resolvers;

use crate::config::SystemConfig;
use crate::device_table::DeviceDescriptor;
use crate::system_io::{fs_canonicalize, fs_read, fs_read_dir};
use crate::topology::resolvers::{NodeResolver, XdmaResolver};
use log::{debug, trace};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// A PCI address in sysfs notation, `DDDD:BB:DD.F`.
///
/// Used both for the functions of a card and for its upstream bridge.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PciAddress(String);

impl PciAddress {
    /// Parse a sysfs entry name, rejecting anything that is not a full PCI address
    /// (root bus directories such as `pci0000:00` included).
    pub fn parse(s: &str) -> Option<PciAddress> {
        let b = s.as_bytes();
        let hex = |r: std::ops::Range<usize>| b[r].iter().all(u8::is_ascii_hexdigit);
        let well_formed = b.len() == 12
            && hex(0..4)
            && b[4] == b':'
            && hex(5..7)
            && b[7] == b':'
            && hex(8..10)
            && b[10] == b'.'
            && (b'0'..=b'7').contains(&b[11]);
        well_formed.then(|| PciAddress(s.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is a function of the card on bus `pci_prefix` in PCI domain 0.
    fn belongs_to(&self, pci_prefix: &str) -> bool {
        self.0
            .strip_prefix("0000:")
            .and_then(|rest| rest.strip_prefix(pci_prefix))
            .and_then(|rest| rest.strip_prefix(':'))
            .is_some_and(|slot| slot.len() == 4)
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parse a `KEY=VALUE` uevent file. A missing file reads as empty.
pub(crate) fn read_uevent(dir: &Path) -> HashMap<String, String> {
    let Ok(contents) = fs_read(&dir.join("uevent")) else {
        return HashMap::new();
    };
    contents
        .lines()
        .filter_map(|line| line.trim().split_once('='))
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect()
}

/// Resolves the PCI functions, bridge and device nodes of cards.
pub struct Topology {
    pci_devices_dir: PathBuf,
    pci_rescan_path: PathBuf,
    dev_dir: PathBuf,
    resolvers: HashMap<&'static str, Box<dyn NodeResolver>>,
}

impl fmt::Debug for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topology")
            .field("pci_devices_dir", &self.pci_devices_dir)
            .field("pci_rescan_path", &self.pci_rescan_path)
            .field("dev_dir", &self.dev_dir)
            .field("resolvers", &self.resolvers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Topology {
    /// A topology reading the sysfs tree of `config`, with the built-in `xdma` resolver.
    pub fn new(config: &SystemConfig) -> Topology {
        let mut topology = Topology {
            pci_devices_dir: config.pci_devices_dir(),
            pci_rescan_path: config.pci_rescan_path(),
            dev_dir: config.dev_dir.clone(),
            resolvers: HashMap::new(),
        };
        topology.register_resolver("xdma", Box::new(XdmaResolver));
        topology
    }

    /// Register (or replace) the node resolver for functions bound to `driver`.
    pub fn register_resolver(&mut self, driver: &'static str, resolver: Box<dyn NodeResolver>) {
        self.resolvers.insert(driver, resolver);
    }

    pub fn pci_devices_dir(&self) -> &Path {
        &self.pci_devices_dir
    }

    /// The bus-wide rescan control.
    pub fn pci_rescan_path(&self) -> &Path {
        &self.pci_rescan_path
    }

    /// `<pci devices dir>/<address>`, the sysfs directory (symlink) of a function or bridge.
    pub fn function_dir(&self, address: &PciAddress) -> PathBuf {
        self.pci_devices_dir.join(address.as_str())
    }

    /// All functions of `device` currently enumerated by the kernel, sorted by address.
    ///
    /// An unreadable PCI device directory reads as "no functions".
    pub fn list_functions(&self, device: &DeviceDescriptor) -> Vec<PciAddress> {
        let entries = match fs_read_dir(&self.pci_devices_dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("no PCI functions can be listed: {e}");
                return Vec::new();
            }
        };
        let mut functions: Vec<PciAddress> = entries
            .iter()
            .filter_map(|entry| PciAddress::parse(entry))
            .filter(|address| address.belongs_to(&device.pci_prefix))
            .collect();
        functions.sort();
        trace!("functions of {}: {functions:?}", device.serial);
        functions
    }

    /// The bridge directly upstream of `device`, if the card is currently enumerated and sits
    /// behind one.
    ///
    /// A card attached straight to a root bus has no bridge.
    pub fn find_upstream_bridge(&self, device: &DeviceDescriptor) -> Option<PciAddress> {
        let function = self.list_functions(device).into_iter().next()?;
        let resolved = fs_canonicalize(&self.function_dir(&function))
            .inspect_err(|e| debug!("{function} vanished while resolving its bridge: {e}"))
            .ok()?;
        let parent = resolved.parent()?;
        if !parent.exists() {
            return None;
        }
        let bridge = parent
            .file_name()
            .and_then(|name| PciAddress::parse(&name.to_string_lossy()));
        trace!("upstream bridge of {}: {bridge:?}", device.serial);
        bridge
    }

    /// Device nodes currently exposed by the drivers bound to the functions of `device`.
    ///
    /// Functions without a driver, or bound to a driver without a registered resolver,
    /// contribute nothing.
    pub fn resolve_device_nodes(&self, device: &DeviceDescriptor) -> Vec<PathBuf> {
        let mut nodes = Vec::new();
        for function in self.list_functions(device) {
            let function_dir = self.function_dir(&function);
            let uevent = read_uevent(&function_dir);
            let Some(driver) = uevent.get("DRIVER") else {
                trace!("{function} has no driver bound");
                continue;
            };
            let Some(resolver) = self.resolvers.get(driver.as_str()) else {
                trace!("{function} is bound to {driver}, which has no resolver");
                continue;
            };
            let Ok(function_dir) = fs_canonicalize(&function_dir) else {
                trace!("{function} vanished while resolving its nodes");
                continue;
            };
            nodes.extend(resolver.resolve(&function_dir, &self.dev_dir));
        }
        debug!("device nodes of {}: {nodes:?}", device.serial);
        nodes
    }
}
