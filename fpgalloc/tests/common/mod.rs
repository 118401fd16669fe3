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

//! A fake host for tests: a sysfs/dev tree below a temporary directory plus recording stand-ins
//! for the parts that need root.

#![allow(dead_code)]

use fpgalloc::config::SystemConfig;
use fpgalloc::device_table::DeviceDescriptor;
use fpgalloc::error::FpgallocError;
use fpgalloc::flash::FlashTool;
use fpgalloc::identity::Identity;
use fpgalloc::ownership::NodeOwner;
use fpgalloc::quirks::{Quirk, QuirkPhase};
use fpgalloc::topology::Topology;
use std::fs;
use std::os::unix::fs::{MetadataExt, symlink};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::process::Command;

pub const ROOT_BUS: &str = "pci0000:00";

/// Configuration space of a bridge: SERR# enabled in COMMAND, Express capability at 0x40 with
/// every error reporting bit set in Device Control.
pub fn bridge_config() -> Vec<u8> {
    let mut bytes = vec![0u8; 256];
    bytes[0x04] = 0x07;
    bytes[0x05] = 0x01;
    bytes[0x06] = 0x10;
    bytes[0x34] = 0x40;
    bytes[0x40] = 0x10;
    bytes[0x41] = 0x00;
    bytes[0x48] = 0x0f;
    bytes
}

pub struct FakeHost {
    pub root: TempDir,
    pub config: SystemConfig,
}

impl FakeHost {
    pub fn new() -> FakeHost {
        let root = tempfile::tempdir().expect("failed to create fake host root");
        let config = SystemConfig::rooted_at(root.path());
        fs::create_dir_all(config.pci_devices_dir()).unwrap();
        fs::create_dir_all(root.path().join("sys/devices").join(ROOT_BUS)).unwrap();
        fs::create_dir_all(&config.dev_dir).unwrap();
        FakeHost { root, config }
    }

    pub fn path(&self) -> &Path {
        self.root.path()
    }

    pub fn topology(&self) -> Topology {
        Topology::new(&self.config)
    }

    /// Real sysfs directory of `address` below `parent` (`None` for the root bus).
    fn real_dir(&self, parent: Option<&str>, address: &str) -> PathBuf {
        let bus_dir = self.path().join("sys/devices").join(ROOT_BUS);
        match parent {
            Some(bridge) => bus_dir.join(bridge).join(address),
            None => bus_dir.join(address),
        }
    }

    fn link(&self, address: &str, real_dir: &Path) {
        symlink(real_dir, self.config.pci_devices_dir().join(address)).unwrap();
    }

    /// A bridge on the root bus, with a `rescan` control.
    pub fn add_bridge(&self, address: &str) -> PathBuf {
        let dir = self.real_dir(None, address);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("config"), bridge_config()).unwrap();
        fs::write(dir.join("rescan"), "").unwrap();
        self.link(address, &dir);
        dir
    }

    /// A card function below `bridge` (or directly on the root bus), optionally bound to
    /// `driver`.
    pub fn add_function(&self, bridge: Option<&str>, address: &str, driver: Option<&str>) -> PathBuf {
        let dir = self.real_dir(bridge, address);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("config"), vec![0u8; 256]).unwrap();
        fs::write(dir.join("remove"), "").unwrap();
        let uevent = match driver {
            Some(driver) => format!("DRIVER={driver}\nPCI_SLOT_NAME={address}\n"),
            None => format!("PCI_SLOT_NAME={address}\n"),
        };
        fs::write(dir.join("uevent"), uevent).unwrap();
        self.link(address, &dir);
        dir
    }

    /// A BAR resource file plus an xdma character device announced by `function_dir`.
    pub fn add_xdma_node(&self, function_dir: &Path, devname: &str) -> Vec<PathBuf> {
        let resource = function_dir.join("resource0");
        fs::write(&resource, "").unwrap();
        let child = function_dir.join("xdma").join(devname);
        fs::create_dir_all(&child).unwrap();
        fs::write(child.join("uevent"), format!("MAJOR=511\nDEVNAME={devname}\n")).unwrap();
        let node = self.config.dev_dir.join(devname);
        fs::write(&node, "").unwrap();
        vec![resource, node]
    }

    /// The bus-wide rescan control.
    pub fn add_bus_rescan(&self) {
        fs::write(self.config.pci_rescan_path(), "").unwrap();
    }

    /// A card on bus `pci_prefix` with a programming script next to the mapping file.
    pub fn device(&self, serial: &str, pci_prefix: &str, quirk: &str) -> DeviceDescriptor {
        let script = self.path().join("program.tcl");
        if !script.exists() {
            fs::write(&script, "# program\n").unwrap();
        }
        DeviceDescriptor {
            serial: serial.to_owned(),
            pci_prefix: pci_prefix.to_owned(),
            quirk: quirk.to_owned(),
            board: "au280".to_owned(),
            program_script: script,
        }
    }

    /// A fully enumerated xdma card behind its own bridge; returns its device nodes.
    pub fn add_card(&self, bridge: &str, pci_prefix: &str, devname: &str) -> Vec<PathBuf> {
        self.add_bridge(bridge);
        let function = self.add_function(Some(bridge), &format!("0000:{pci_prefix}:00.0"), Some("xdma"));
        self.add_xdma_node(&function, devname)
    }

    pub fn read_u16(&self, address: &str, offset: usize) -> u16 {
        let bytes = fs::read(self.config.pci_devices_dir().join(address).join("config")).unwrap();
        u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
    }

    /// The user running the tests, who is allowed to start children as itself.
    pub fn current_user(&self) -> Identity {
        let meta = fs::metadata(self.path()).unwrap();
        Identity {
            uid: meta.uid(),
            gid: meta.gid(),
            name: "tester".to_owned(),
            home: self.path().to_path_buf(),
        }
    }
}

/// Records ownership changes instead of performing them.
#[derive(Debug, Default, Clone)]
pub struct RecordingOwner {
    pub changes: Arc<Mutex<Vec<(PathBuf, u32)>>>,
}

impl RecordingOwner {
    pub fn changes(&self) -> Vec<(PathBuf, u32)> {
        self.changes.lock().unwrap().clone()
    }

    pub fn owner_of(&self, node: &Path) -> Option<u32> {
        self.changes()
            .iter()
            .rev()
            .find(|(n, _)| n == node)
            .map(|(_, uid)| *uid)
    }
}

impl NodeOwner for RecordingOwner {
    fn set_owner(&self, node: &Path, identity: &Identity) -> Result<(), FpgallocError> {
        self.changes
            .lock()
            .unwrap()
            .push((node.to_path_buf(), identity.uid));
        Ok(())
    }
}

/// Refuses every ownership change.
#[derive(Debug, Default)]
pub struct RefusingOwner;

impl NodeOwner for RefusingOwner {
    fn set_owner(&self, node: &Path, identity: &Identity) -> Result<(), FpgallocError> {
        Err(FpgallocError::Ownership {
            file: node.into(),
            uid: identity.uid,
            gid: identity.gid,
            e: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        })
    }
}

pub const RECORDING_QUIRK: &str = "recording-quirk";

/// Remembers which phases ran for which card.
#[derive(Debug, Default, Clone)]
pub struct RecordingQuirk {
    pub calls: Arc<Mutex<Vec<(QuirkPhase, String)>>>,
}

impl RecordingQuirk {
    pub fn calls(&self) -> Vec<(QuirkPhase, String)> {
        self.calls.lock().unwrap().clone()
    }
}

impl Quirk for RecordingQuirk {
    fn apply(&self, phase: QuirkPhase, device: &DeviceDescriptor, _topology: &Topology) -> bool {
        self.calls
            .lock()
            .unwrap()
            .push((phase, device.serial.clone()));
        true
    }
}

/// Runs a shell snippet in place of the programming tool; `$1` is the serial, `$2` the image.
#[derive(Debug, Clone)]
pub struct ShellTool {
    pub script: String,
}

impl ShellTool {
    pub fn new(script: impl Into<String>) -> ShellTool {
        ShellTool {
            script: script.into(),
        }
    }
}

impl FlashTool for ShellTool {
    fn command(&self, device: &DeviceDescriptor, image: &Path) -> Command {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&self.script)
            .arg("fpga-flash")
            .arg(&device.serial)
            .arg(image);
        command
    }
}
