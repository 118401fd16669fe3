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

//! Bridge masking quirk for Xilinx Alveo cards.
//!
//! When an Alveo card drops off the link during reprogramming, the upstream bridge reports a
//! fatal error and the host may take the whole machine down. Before flashing, SERR# and
//! fatal error reporting are masked on the bridge. After flashing, the card's functions are
//! removed and the bridge is rescanned so that the kernel picks up the new design, and memory
//! decoding is switched back on for every function.

use crate::device_table::DeviceDescriptor;
use crate::pci_config::{
    ConfigRegister, PCI_COMMAND_MEMORY, PCI_COMMAND_SERR, PCI_EXP_DEVCTL, PCI_EXP_DEVCTL_FERE,
};
use crate::quirks::{Quirk, QuirkPhase, QuirkStep, run_steps};
use crate::topology::Topology;
use log::debug;

#[derive(Debug, Default)]
pub struct XilinxAlveoQuirk;

impl XilinxAlveoQuirk {
    pub const NAME: &'static str = "xilinx-alveo-quirk";

    /// The steps of `phase` for the current topology of `device`.
    ///
    /// `None` when the phase does not apply: flashing prep without an upstream bridge.
    pub fn plan(
        &self,
        phase: QuirkPhase,
        device: &DeviceDescriptor,
        topology: &Topology,
    ) -> Option<Vec<QuirkStep>> {
        let bridge = topology.find_upstream_bridge(device);
        match phase {
            QuirkPhase::PreFlash => {
                let bridge = bridge?;
                Some(vec![
                    QuirkStep::WriteConfig {
                        target: bridge.clone(),
                        register: ConfigRegister::Command,
                        value: 0x0000,
                        mask: PCI_COMMAND_SERR,
                    },
                    QuirkStep::WriteConfig {
                        target: bridge,
                        register: ConfigRegister::Express {
                            offset: PCI_EXP_DEVCTL,
                        },
                        value: 0x0000,
                        mask: PCI_EXP_DEVCTL_FERE,
                    },
                ])
            }
            QuirkPhase::PostFlash => {
                let functions = topology.list_functions(device);
                let mut steps = Vec::with_capacity(2 * functions.len() + 1);
                match bridge {
                    Some(bridge) => {
                        let bridge_dir = topology.function_dir(&bridge);
                        steps.extend(functions.iter().map(|function| QuirkStep::Remove {
                            function: function.clone(),
                            control: bridge_dir.join(function.as_str()).join("remove"),
                        }));
                        steps.push(QuirkStep::Rescan {
                            control: bridge_dir.join("rescan"),
                        });
                    }
                    None => steps.push(QuirkStep::Rescan {
                        control: topology.pci_rescan_path().to_path_buf(),
                    }),
                }
                steps.extend(functions.into_iter().map(|function| QuirkStep::WriteConfig {
                    target: function,
                    register: ConfigRegister::Command,
                    value: PCI_COMMAND_MEMORY,
                    mask: 0xffff,
                }));
                Some(steps)
            }
        }
    }
}

impl Quirk for XilinxAlveoQuirk {
    fn apply(&self, phase: QuirkPhase, device: &DeviceDescriptor, topology: &Topology) -> bool {
        match self.plan(phase, device, topology) {
            Some(steps) => run_steps(&steps, topology),
            None => {
                debug!("{} {phase} does not apply to {}", Self::NAME, device.serial);
                false
            }
        }
    }
}
