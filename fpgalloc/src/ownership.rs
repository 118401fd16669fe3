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

//! Handing the device nodes of a card to a user.

use crate::device_table::DeviceDescriptor;
use crate::error::FpgallocError;
use crate::identity::Identity;
use crate::topology::Topology;
use log::{debug, error, trace};
use std::path::Path;

/// Changes the owner of a device node.
pub trait NodeOwner: Send + Sync {
    fn set_owner(&self, node: &Path, identity: &Identity) -> Result<(), FpgallocError>;
}

/// `chown(2)` on the node, following symlinks.
#[derive(Debug, Default)]
pub struct ChownNodeOwner;

impl NodeOwner for ChownNodeOwner {
    fn set_owner(&self, node: &Path, identity: &Identity) -> Result<(), FpgallocError> {
        trace!("chown {}:{} {node:?}", identity.uid, identity.gid);
        std::os::unix::fs::chown(node, Some(identity.uid), Some(identity.gid)).map_err(|e| {
            FpgallocError::Ownership {
                file: node.into(),
                uid: identity.uid,
                gid: identity.gid,
                e,
            }
        })
    }
}

/// Give every device node currently resolved for `device` to `identity`.
///
/// All nodes are attempted. Nodes that vanish between resolution and the ownership change are
/// skipped.
///
/// # Returns: `Result<usize, FpgallocError>`
/// * `Ok(usize)` - Number of nodes now owned by `identity`
/// * `Err(FpgallocError::Ownership)` - The first node whose owner could not be changed
pub fn transfer_ownership(
    topology: &Topology,
    owner: &dyn NodeOwner,
    device: &DeviceDescriptor,
    identity: &Identity,
) -> Result<usize, FpgallocError> {
    let mut changed = 0;
    let mut first_error = None;
    for node in topology.resolve_device_nodes(device) {
        match owner.set_owner(&node, identity) {
            Ok(()) => changed += 1,
            Err(FpgallocError::Ownership { e, .. }) if e.kind() == std::io::ErrorKind::NotFound => {
                trace!("{node:?} vanished before its owner could be changed");
            }
            Err(e) => {
                error!("{e}");
                first_error.get_or_insert(e);
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => {
            debug!(
                "{changed} device node(s) of {} now belong to {}",
                device.serial, identity.name
            );
            Ok(changed)
        }
    }
}
