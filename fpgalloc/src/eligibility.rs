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

//! Which cards a command may act on.

use crate::device_table::DeviceTable;
use crate::ledger::Ownership;
use std::fmt;

/// The actions requested in one invocation. Several may be combined, e.g. allocate and flash.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Actions {
    pub allocate: bool,
    pub flash: bool,
    pub release: bool,
    pub devices: bool,
}

impl Actions {
    pub fn is_empty(&self) -> bool {
        !(self.allocate || self.flash || self.release || self.devices)
    }

    /// Actions only the owner of a card may perform.
    fn needs_ownership(&self) -> bool {
        self.flash || self.release || self.devices
    }
}

/// Why a requested id was dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Refusal {
    Unknown(String),
    InUse(String),
    NotOwned(String),
}

impl fmt::Display for Refusal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Refusal::Unknown(id) => write!(f, "device id {id} unknown!"),
            Refusal::InUse(id) => write!(f, "device id {id} is in use!"),
            Refusal::NotOwned(id) => write!(f, "device id {id} is not owned by you!"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    /// Serials to act on, in request (or table) order.
    pub targets: Vec<String>,
    pub refusals: Vec<Refusal>,
}

/// Filter the requested `ids` down to the cards `caller_uid` may act on.
///
/// Without explicit ids the candidates are every card when forcing, the free cards when
/// allocating, and the caller's own cards otherwise. `force` skips all ownership checks but
/// never makes an unknown id valid.
pub fn select_targets(
    table: &DeviceTable,
    ids: &[String],
    actions: Actions,
    caller_uid: u32,
    force: bool,
    status: impl Fn(&str) -> Ownership,
) -> Selection {
    let candidates: Vec<String> = if !ids.is_empty() {
        ids.to_vec()
    } else if force {
        table.iter().map(|d| d.serial.clone()).collect()
    } else if actions.allocate {
        table
            .iter()
            .filter(|d| status(&d.serial).is_free())
            .map(|d| d.serial.clone())
            .collect()
    } else if actions.needs_ownership() {
        table
            .iter()
            .filter(|d| status(&d.serial).is_owned_by(caller_uid))
            .map(|d| d.serial.clone())
            .collect()
    } else {
        Vec::new()
    };

    let mut selection = Selection::default();
    for id in candidates {
        if selection.targets.contains(&id) {
            continue;
        }
        if table.get(&id).is_none() {
            selection.refusals.push(Refusal::Unknown(id));
            continue;
        }
        if !force {
            let ownership = status(&id);
            if actions.allocate && !ownership.is_free() {
                selection.refusals.push(Refusal::InUse(id));
                continue;
            }
            if actions.needs_ownership() && !ownership.is_owned_by(caller_uid) {
                selection.refusals.push(Refusal::NotOwned(id));
                continue;
            }
        }
        selection.targets.push(id);
    }
    selection
}
