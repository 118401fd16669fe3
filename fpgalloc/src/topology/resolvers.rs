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

//! Driver specific device node resolvers.
//!
//! A resolver is looked up by the `DRIVER` key of a PCI function's uevent and maps the
//! function's sysfs directory to the files a user needs access to in order to talk to the
//! card.
//!
//! # The xdma layout
//!
//! ```text
//! /sys/devices/pci0000:00/0000:00:01.1/0000:3b:00.0
//! ├── resource0            <- BAR mappings, handed out directly
//! ├── resource1
//! ├── uevent               <- DRIVER=xdma
//! └── xdma
//!     ├── xdma0_c2h_0
//!     │   └── uevent       <- DEVNAME=xdma0_c2h_0 -> /dev/xdma0_c2h_0
//!     └── xdma0_user
//!         └── uevent       <- DEVNAME=xdma0_user  -> /dev/xdma0_user
//! ```

use crate::system_io::fs_read_dir;
use crate::topology::read_uevent;
use log::{trace, warn};
use std::path::{Component, Path, PathBuf};

/// Maps the sysfs directory of a PCI function to the device nodes its driver exposes.
pub trait NodeResolver: Send + Sync {
    /// Every node currently exposed through `function_dir`.
    ///
    /// Missing entries are part of normal operation (driver still probing, bus mid-rescan) and
    /// are skipped; a resolver never fails.
    fn resolve(&self, function_dir: &Path, dev_dir: &Path) -> Vec<PathBuf>;
}

/// `DEVNAME` is relative to the dev directory and may name subdirectories, never leave it.
fn stays_below(devname: &str) -> bool {
    let path = Path::new(devname);
    path.components().all(|c| matches!(c, Component::Normal(_))) && !devname.is_empty()
}

/// BAR resource files the xdma driver users need to mmap.
const XDMA_RESOURCE_FILES: [&str; 3] = ["resource", "resource0", "resource1"];

/// Resolver for the Xilinx DMA/Bridge subsystem driver (`xdma`).
#[derive(Debug, Default)]
pub struct XdmaResolver;

impl NodeResolver for XdmaResolver {
    fn resolve(&self, function_dir: &Path, dev_dir: &Path) -> Vec<PathBuf> {
        let mut nodes: Vec<PathBuf> = XDMA_RESOURCE_FILES
            .iter()
            .map(|f| function_dir.join(f))
            .filter(|p| p.exists())
            .collect();

        let xdma_dir = function_dir.join("xdma");
        let Ok(mut children) = fs_read_dir(&xdma_dir) else {
            trace!("{xdma_dir:?} not present");
            return nodes;
        };
        children.sort();
        for child in children {
            let child_dir = xdma_dir.join(&child);
            if !child_dir.is_dir() {
                continue;
            }
            match read_uevent(&child_dir).get("DEVNAME") {
                Some(devname) if !stays_below(devname) => {
                    warn!("{child_dir:?} announces DEVNAME {devname:?} outside the dev directory");
                }
                Some(devname) => {
                    let node = dev_dir.join(devname);
                    if node.exists() {
                        nodes.push(node);
                    } else {
                        trace!("{node:?} announced by {child_dir:?} does not exist (yet)");
                    }
                }
                None => trace!("{child_dir:?} has no DEVNAME"),
            }
        }
        nodes
    }
}
