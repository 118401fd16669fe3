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

//! fpgalloc - sharing PCIe FPGA cards between the users of a host.
//!
//! A host with several accelerator cards is shared by several users. Each card is allocated
//! to at most one user at a time, who then owns the card's device nodes and may flash
//! bitstreams onto it. Flashing takes the card off the PCI bus for a while, so it is wrapped in
//! bus quirks that keep the host from treating that as a fatal error.
//!
//! # Architecture
//!
//! - [`device_table`] - The cards of the host, read from the mapping file
//! - [`topology`] - PCI functions, upstream bridge and device nodes of a card, from sysfs
//! - [`quirks`] - Named pre/post-flash bus workarounds
//! - [`ledger`] - Who owns which card, guarded by a host-wide lock
//! - [`eligibility`] - Which cards a command may act on
//! - [`flash`] - Sequential, interruptible flashing of a batch of cards
//!
//! Every invocation of the `fpga-util` binary is an independent process; the host-wide lock
//! in [`ledger`] is the only coordination between them.
//!
//! # Environment Variables
//!
//! - `RUST_LOG` - Controls logging level (`trace`, `debug`, `info`, `warn`, `error`
//!   or `off`). Defaults to `info`
//! - `SUDO_UID` - The user a command runs for when started through sudo

pub mod config;
pub mod device_table;
pub mod eligibility;
pub mod error;
pub mod flash;
pub mod identity;
pub mod ledger;
pub mod ownership;
pub mod pci_config;
pub mod quirks;
pub mod system_io;
pub mod topology;
