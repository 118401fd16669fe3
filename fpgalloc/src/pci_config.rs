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

//! PCI configuration space access through the sysfs `config` file of a function.
//!
//! Registers are little endian. Writes are masked the same way `setpci REG=value:mask` works:
//! only the bits set in `mask` take the corresponding bits of `value`, all others keep their
//! current content.

use crate::error::FpgallocError;
use crate::system_io::{fs_read_at, fs_write_at};
use crate::topology::{PciAddress, Topology};
use log::{debug, trace};
use std::fmt;
use std::path::PathBuf;

pub const PCI_COMMAND: u64 = 0x04;
pub const PCI_STATUS: u64 = 0x06;
pub const PCI_STATUS_CAP_LIST: u16 = 0x0010;
pub const PCI_CAPABILITY_LIST: u64 = 0x34;
pub const PCI_CAP_ID_EXP: u8 = 0x10;

/// Memory space decoding enable bit of the command register.
pub const PCI_COMMAND_MEMORY: u16 = 0x0002;
/// SERR# enable bit of the command register.
pub const PCI_COMMAND_SERR: u16 = 0x0100;
/// Device Control register, relative to the PCI Express capability.
pub const PCI_EXP_DEVCTL: u64 = 0x08;
/// Fatal error reporting enable bit of the Device Control register.
pub const PCI_EXP_DEVCTL_FERE: u16 = 0x0004;

/// A 16 bit register, addressed either directly or relative to a capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigRegister {
    Command,
    /// `CAP_EXP+<offset>`
    Express { offset: u64 },
}

impl fmt::Display for ConfigRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigRegister::Command => f.write_str("COMMAND"),
            ConfigRegister::Express { offset } => write!(f, "CAP_EXP+{offset:#x}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigSpace {
    path: PathBuf,
}

impl ConfigSpace {
    /// Configuration space of `address` as exposed under the topology's PCI device directory.
    pub fn of(topology: &Topology, address: &PciAddress) -> ConfigSpace {
        ConfigSpace {
            path: topology.function_dir(address).join("config"),
        }
    }

    pub fn read_u8(&self, offset: u64) -> Result<u8, FpgallocError> {
        let mut buf = [0u8; 1];
        fs_read_at(&self.path, offset, &mut buf)?;
        Ok(buf[0])
    }

    pub fn read_u16(&self, offset: u64) -> Result<u16, FpgallocError> {
        let mut buf = [0u8; 2];
        fs_read_at(&self.path, offset, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    /// Replace the bits of `mask` at `offset` with those of `value`.
    ///
    /// A full mask writes without reading first.
    pub fn write_u16_masked(
        &self,
        offset: u64,
        value: u16,
        mask: u16,
    ) -> Result<(), FpgallocError> {
        let new = match mask {
            0xffff => value,
            _ => (self.read_u16(offset)? & !mask) | (value & mask),
        };
        trace!("{:?} @ {offset:#x} <- {new:#06x}", self.path);
        fs_write_at(&self.path, offset, &new.to_le_bytes())
    }

    /// Offset of the first capability with `id`, walking the standard capability list.
    ///
    /// # Returns: `Result<Option<u64>, FpgallocError>`
    /// * `Ok(Some(offset))` - The capability header offset
    /// * `Ok(None)` - The function has no capability list or no such capability
    /// * `Err(FpgallocError::IORead)` - Configuration space could not be read
    pub fn find_capability(&self, id: u8) -> Result<Option<u64>, FpgallocError> {
        if self.read_u16(PCI_STATUS)? & PCI_STATUS_CAP_LIST == 0 {
            return Ok(None);
        }
        let mut pointer = self.read_u8(PCI_CAPABILITY_LIST)? & 0xfc;
        // 48 capabilities fit into the 192 bytes after the header; more means a loop.
        for _ in 0..48 {
            if pointer < 0x40 {
                break;
            }
            let cap_id = self.read_u8(u64::from(pointer))?;
            if cap_id == 0xff {
                break;
            }
            if cap_id == id {
                return Ok(Some(u64::from(pointer)));
            }
            pointer = self.read_u8(u64::from(pointer) + 1)? & 0xfc;
        }
        Ok(None)
    }

    /// Absolute offset of `register` in this configuration space.
    pub fn register_offset(&self, register: ConfigRegister) -> Result<u64, FpgallocError> {
        match register {
            ConfigRegister::Command => Ok(PCI_COMMAND),
            ConfigRegister::Express { offset } => {
                let base = self.find_capability(PCI_CAP_ID_EXP)?.ok_or_else(|| {
                    FpgallocError::PciConfig(format!(
                        "{:?} has no PCI Express capability",
                        self.path
                    ))
                })?;
                Ok(base + offset)
            }
        }
    }

    /// Masked write of `register`, see [`ConfigSpace::write_u16_masked`].
    pub fn write_register(
        &self,
        register: ConfigRegister,
        value: u16,
        mask: u16,
    ) -> Result<(), FpgallocError> {
        let offset = self.register_offset(register)?;
        debug!(
            "{:?}: {register}={value:04x}:{mask:04x} (offset {offset:#x})",
            self.path
        );
        self.write_u16_masked(offset, value, mask)
    }
}
