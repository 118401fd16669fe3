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

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum FpgallocError {
    #[error("FpgallocError::Argument: {0}")]
    Argument(String),
    #[error("FpgallocError::Config: {0}")]
    Config(String),
    #[error("FpgallocError::TomlDe: Failed to parse {file:?}: {e}")]
    TomlDe {
        file: PathBuf,
        e: toml::de::Error,
    },
    #[error("FpgallocError::Lock: Failed to lock {file:?}: {e}")]
    Lock { file: PathBuf, e: std::io::Error },
    #[error("FpgallocError::Identity: {0}")]
    Identity(String),
    #[error("FpgallocError::Ownership: Failed to change owner of {file:?} to {uid}:{gid}: {e}")]
    Ownership {
        file: PathBuf,
        uid: u32,
        gid: u32,
        e: std::io::Error,
    },
    #[error("FpgallocError::Tool: {0}")]
    Tool(String),
    #[error("FpgallocError::PciConfig: {0}")]
    PciConfig(String),
    #[error("FpgallocError::IORead: An IO error occurred when reading from {file:?}: {e}")]
    IORead { file: PathBuf, e: std::io::Error },
    #[error("FpgallocError::IOWrite: An IO error occurred when writing {data:?} to {file:?}: {e}")]
    IOWrite {
        data: String,
        file: PathBuf,
        e: std::io::Error,
    },
    #[error("FpgallocError::IOCreate: An IO error occurred when creating {file:?}: {e}")]
    IOCreate { file: PathBuf, e: std::io::Error },
    #[error("FpgallocError::IODelete: An IO error occurred when deleting {file:?}: {e}")]
    IODelete { file: PathBuf, e: std::io::Error },
    #[error("FpgallocError::IOReadDir: An IO error occurred when reading directory {dir:?}: {e}")]
    IOReadDir { dir: PathBuf, e: std::io::Error },
    #[error("FpgallocError::Internal: An Internal error occurred: {0}")]
    Internal(String),
}

impl FpgallocError {
    /// True when the underlying IO error means the file or directory is simply not there.
    ///
    /// Sysfs entries come and go while a bus is being rescanned, so callers use this to tell a
    /// transient gap apart from a real failure.
    pub fn is_not_found(&self) -> bool {
        let e = match self {
            FpgallocError::IORead { e, .. }
            | FpgallocError::IOWrite { e, .. }
            | FpgallocError::IODelete { e, .. }
            | FpgallocError::IOReadDir { e, .. } => e,
            _ => return false,
        };
        e.kind() == std::io::ErrorKind::NotFound
    }
}
