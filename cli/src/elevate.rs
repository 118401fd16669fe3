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

//! Running the tool as root through sudo.
//!
//! Changing ledger markers and device node owners needs root, so an ordinary user's invocation
//! replaces itself with `sudo fpga-util <same arguments>`. sudo sets `SUDO_UID`, which keeps the
//! original user as the one the command acts for.

use fpgalloc::error::FpgallocError;
use log::debug;
use std::ffi::OsString;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

pub const SUDO: &str = "/usr/bin/sudo";

/// Tool binaries found in the user's environment, which root's `PATH` may not contain.
#[derive(Debug, Clone)]
pub struct ToolPaths {
    pub vivado: PathBuf,
    pub hw_server: PathBuf,
}

pub fn running_as_root() -> bool {
    // SAFETY: getuid has no preconditions and cannot fail.
    unsafe { libc::getuid() == 0 }
}

/// `sudo <exe> <args> [--vivado-bin <vivado> --hwserver-bin <hw_server>]`
pub fn sudo_command(
    exe: &Path,
    args: impl IntoIterator<Item = OsString>,
    tools: Option<&ToolPaths>,
) -> Command {
    let mut command = Command::new(SUDO);
    command.arg(exe).args(args);
    if let Some(tools) = tools {
        command
            .arg("--vivado-bin")
            .arg(&tools.vivado)
            .arg("--hwserver-bin")
            .arg(&tools.hw_server);
    }
    command
}

/// Replace this process with the same invocation under sudo.
///
/// Only returns if the replacement could not be started.
pub fn reexec_with_sudo(tools: Option<&ToolPaths>) -> FpgallocError {
    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => {
            return FpgallocError::Internal(format!("cannot locate the running executable: {e}"));
        }
    };
    let mut command = sudo_command(&exe, std::env::args_os().skip(1), tools);
    debug!("re-executing as {command:?}");
    let e = command.exec();
    FpgallocError::Internal(format!("failed to re-execute through {SUDO}: {e}"))
}
