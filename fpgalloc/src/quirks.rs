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

//! Bus quirks applied around reprogramming a card.
//!
//! A card vanishes from the bus while its configuration is replaced. Some cards need help so
//! that the host neither treats this as a fatal bus error nor forgets about the card
//! afterwards. A quirk is a named procedure with two phases, run right before and right after
//! the programming tool.
//!
//! Phases are built as an ordered list of [`QuirkStep`]s. Every step is executed even when an
//! earlier one failed, and the phase succeeds only if all of them did.
//!
//! # Registration
//!
//! Quirks are looked up by the name given in the mapping file:
//!
//! ```rust,no_run
//! # use fpgalloc::quirks::QuirkRegistry;
//! # use fpgalloc::quirks::xilinx_alveo::XilinxAlveoQuirk;
//! let mut registry = QuirkRegistry::new();
//! registry.register(XilinxAlveoQuirk::NAME, Box::new(XilinxAlveoQuirk));
//! ```

pub mod xilinx_alveo;

use crate::device_table::DeviceDescriptor;
use crate::pci_config::{ConfigRegister, ConfigSpace};
use crate::quirks::xilinx_alveo::XilinxAlveoQuirk;
use crate::system_io::fs_write;
use crate::topology::{PciAddress, Topology};
use log::{info, trace, warn};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuirkPhase {
    PreFlash = 0,
    PostFlash = 1,
}

impl fmt::Display for QuirkPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuirkPhase::PreFlash => f.write_str("pre-flash"),
            QuirkPhase::PostFlash => f.write_str("post-flash"),
        }
    }
}

/// A bus workaround applied around flashing.
pub trait Quirk: Send + Sync {
    /// Run `phase` for `device`.
    ///
    /// # Returns: `bool`
    /// * `true` - Every step of the phase succeeded
    /// * `false` - The phase does not apply to the device's current topology, or a step failed
    fn apply(&self, phase: QuirkPhase, device: &DeviceDescriptor, topology: &Topology) -> bool;
}

/// One independent action of a quirk phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuirkStep {
    /// Masked write of a configuration register of `target`.
    WriteConfig {
        target: PciAddress,
        register: ConfigRegister,
        value: u16,
        mask: u16,
    },
    /// Hot-remove `function` through its `remove` control below the bridge.
    Remove {
        function: PciAddress,
        control: PathBuf,
    },
    /// Trigger a rescan control, either a bridge's or the bus-wide one.
    Rescan { control: PathBuf },
}

impl fmt::Display for QuirkStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuirkStep::WriteConfig {
                target,
                register,
                value,
                mask,
            } => write!(f, "setpci -s {target} {register}={value:04x}:{mask:04x}"),
            QuirkStep::Remove { control, .. } | QuirkStep::Rescan { control } => {
                write!(f, "1 > {}", control.display())
            }
        }
    }
}

impl QuirkStep {
    /// Execute the step, reporting failures as warnings.
    ///
    /// A `remove` control that does not exist means the function is already gone, which is
    /// what the step wants, so it counts as success.
    pub fn run(&self, topology: &Topology) -> bool {
        info!("{self}");
        let result = match self {
            QuirkStep::WriteConfig {
                target,
                register,
                value,
                mask,
            } => ConfigSpace::of(topology, target).write_register(*register, *value, *mask),
            QuirkStep::Remove { function, control } => {
                if !control.exists() {
                    trace!("{function} has no remove control at {control:?}, skipping");
                    return true;
                }
                fs_write(control, false, "1\n")
            }
            QuirkStep::Rescan { control } => fs_write(control, false, "1\n"),
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!("quirk step `{self}` failed: {e}");
                false
            }
        }
    }
}

/// Run every step in order; true only if all of them succeeded.
pub fn run_steps(steps: &[QuirkStep], topology: &Topology) -> bool {
    steps
        .iter()
        .map(|step| step.run(topology))
        .fold(true, |all_ok, ok| all_ok & ok)
}

/// Quirks by name.
#[derive(Default)]
pub struct QuirkRegistry {
    quirks: HashMap<&'static str, Box<dyn Quirk>>,
}

impl fmt::Debug for QuirkRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.quirks.keys()).finish()
    }
}

impl QuirkRegistry {
    /// An empty registry.
    pub fn new() -> QuirkRegistry {
        QuirkRegistry::default()
    }

    /// A registry holding every quirk shipped with fpgalloc.
    pub fn with_builtin() -> QuirkRegistry {
        let mut registry = QuirkRegistry::new();
        registry.register(XilinxAlveoQuirk::NAME, Box::new(XilinxAlveoQuirk));
        registry
    }

    /// Register (or replace) the quirk called `name`.
    pub fn register(&mut self, name: &'static str, quirk: Box<dyn Quirk>) {
        self.quirks.insert(name, quirk);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Quirk> {
        self.quirks.get(name).map(|q| q.as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.quirks.contains_key(name)
    }
}
