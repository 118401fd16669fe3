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

//! Users on whose behalf cards are allocated and flashed.

use crate::error::FpgallocError;
use log::trace;
use std::ffi::{CStr, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

/// A user account as found in the password database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
    pub name: String,
    pub home: PathBuf,
}

impl Identity {
    /// The identity device nodes are handed back to on release.
    pub fn system() -> Identity {
        Identity {
            uid: 0,
            gid: 0,
            name: "root".to_owned(),
            home: PathBuf::from("/root"),
        }
    }

    /// Look `uid` up in the password database.
    ///
    /// # Returns: `Result<Identity, FpgallocError>`
    /// * `Ok(Identity)` - The account of `uid`
    /// * `Err(FpgallocError::Identity)` - No such account, or the lookup itself failed
    pub fn from_uid(uid: u32) -> Result<Identity, FpgallocError> {
        let mut buf: Vec<libc::c_char> = vec![0; 1024];
        // SAFETY: passwd is a plain C struct, all-zero is a valid (empty) value.
        let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
        let mut result: *mut libc::passwd = std::ptr::null_mut();
        loop {
            // SAFETY: every pointer refers to a live local; buf.len() is the capacity of buf.
            let rc = unsafe {
                libc::getpwuid_r(uid, &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result)
            };
            match rc {
                0 => break,
                libc::ERANGE if buf.len() < 1 << 20 => buf.resize(buf.len() * 2, 0),
                _ => {
                    return Err(FpgallocError::Identity(format!(
                        "looking up uid {uid} failed: {}",
                        std::io::Error::from_raw_os_error(rc)
                    )));
                }
            }
        }
        if result.is_null() {
            return Err(FpgallocError::Identity(format!(
                "uid {uid} has no password database entry"
            )));
        }
        // SAFETY: on success pw_name and pw_dir are NUL terminated strings stored in buf, which
        // outlives both borrows.
        let (name, home) = unsafe {
            (
                CStr::from_ptr(pwd.pw_name).to_string_lossy().into_owned(),
                PathBuf::from(OsStr::from_bytes(CStr::from_ptr(pwd.pw_dir).to_bytes())),
            )
        };
        trace!("uid {uid} is {name} (gid {}, home {home:?})", pwd.pw_gid);
        Ok(Identity {
            uid,
            gid: pwd.pw_gid,
            name,
            home,
        })
    }
}

/// The user a command runs for.
#[derive(Debug, Clone)]
pub struct Caller {
    pub identity: Identity,
    /// Root acting as itself (not through sudo). Only administrators may force actions.
    pub is_admin: bool,
}

impl Caller {
    /// Resolve the caller from the real uid of the process and `SUDO_UID`.
    pub fn resolve() -> Result<Caller, FpgallocError> {
        // SAFETY: getuid has no preconditions and cannot fail.
        let real_uid = unsafe { libc::getuid() };
        let sudo_uid = std::env::var("SUDO_UID").ok();
        let (uid, is_admin) = caller_uid(real_uid, sudo_uid.as_deref())?;
        Ok(Caller {
            identity: Identity::from_uid(uid)?,
            is_admin,
        })
    }
}

/// The uid a command acts for and whether it runs with administrative rights.
///
/// Under sudo the invoking user (`SUDO_UID`) is the caller, otherwise the real uid is.
pub fn caller_uid(real_uid: u32, sudo_uid: Option<&str>) -> Result<(u32, bool), FpgallocError> {
    match sudo_uid {
        Some(s) => s
            .trim()
            .parse::<u32>()
            .map(|uid| (uid, false))
            .map_err(|e| FpgallocError::Identity(format!("SUDO_UID {s:?} is not a uid: {e}"))),
        None => Ok((real_uid, real_uid == 0)),
    }
}
