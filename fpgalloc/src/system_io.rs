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

//! Error Wrapping File System I/O Helpers
//!
//! This module provides convenient wrappers around standard Rust file system operations,
//! with automatic conversion to `FpgallocError` types. All functions include trace logging
//! for debugging and provide detailed error context including file paths and operation types.
//!
//! Includes: read, write, positional read/write (for PCI configuration space), directory
//! listing, path resolution and removal.
//!
//! # Examples
//!
//! ```rust,no_run
//! # use fpgalloc::system_io::{fs_read, fs_write};
//! # use std::path::Path;
//!
//! # fn example() -> Result<(), fpgalloc::error::FpgallocError> {
//! // Read the uevent of a PCI function
//! let content = fs_read(Path::new("/sys/bus/pci/devices/0000:3b:00.0/uevent"))?;
//!
//! // Trigger a bus-wide rescan
//! fs_write(Path::new("/sys/bus/pci/rescan"), false, "1\n")?;
//! # Ok(())
//! # }
//! ```

use crate::error::FpgallocError;
use log::trace;
use std::fs::OpenOptions;
use std::fs::{create_dir_all, remove_file};
use std::io::{Read, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

/// Read the contents of a file to a String.
///
/// # Arguments
///
/// * `file_path` - Path to the file to read
///
/// # Returns: `Result<String, FpgallocError>`
/// * `Ok(String)` - The complete contents of the file
/// * `Err(FpgallocError::IORead)` - If the file cannot be read (doesn't exist, permissions, etc.)
pub fn fs_read(file_path: &Path) -> Result<String, FpgallocError> {
    trace!("Attempting to read from {file_path:?}");
    let mut buf: String = String::new();
    let result = OpenOptions::new()
        .read(true)
        .open(file_path)
        .and_then(|mut f| f.read_to_string(&mut buf));

    match result {
        Ok(_) => {
            trace!("Reading done");
            Ok(buf)
        }
        Err(e) => Err(FpgallocError::IORead {
            file: file_path.into(),
            e,
        }),
    }
}

/// Write a string value to a file.
///
/// When `create` is set the file is created if missing and truncated otherwise, which is what
/// ledger marker files need. Kernel control files (`remove`, `rescan`) are written with
/// `create = false` so that a control which has disappeared shows up as an error instead of a
/// stray regular file.
///
/// # Arguments
///
/// * `file_path` - Path to the file to write
/// * `create` - If `true`, create (or truncate) the file; if `false`, file must already exist
/// * `value` - The string value to write (implements `AsRef<str>`)
///
/// # Returns: `Result<(), FpgallocError>`
/// * `Ok(())` - Write succeeded
/// * `Err(FpgallocError::IOWrite)` - If the write fails (permissions, file doesn't exist when create=false, etc.)
pub fn fs_write(
    file_path: &Path,
    create: bool,
    value: impl AsRef<str>,
) -> Result<(), FpgallocError> {
    trace!(
        "Attempting to write {:?} to {:?}",
        value.as_ref(),
        file_path
    );
    let result = OpenOptions::new()
        .create(create)
        .truncate(create)
        .read(false)
        .write(true)
        .open(file_path)
        .and_then(|mut f| write!(f, "{}", value.as_ref()));
    match result {
        Ok(_) => {
            trace!("Write done.");
            Ok(())
        }
        Err(e) => Err(FpgallocError::IOWrite {
            data: value.as_ref().to_owned(),
            file: file_path.into(),
            e,
        }),
    }
}

/// Read `buf.len()` bytes starting at `offset` without moving any file cursor.
///
/// Used for PCI configuration space, where the sysfs `config` file is addressed by register
/// offset.
///
/// # Returns: `Result<(), FpgallocError>`
/// * `Ok(())` - `buf` was filled completely
/// * `Err(FpgallocError::IORead)` - Open failed or the file is shorter than `offset + buf.len()`
pub fn fs_read_at(file_path: &Path, offset: u64, buf: &mut [u8]) -> Result<(), FpgallocError> {
    trace!(
        "Attempting to read {} bytes at {offset:#x} from {file_path:?}",
        buf.len()
    );
    OpenOptions::new()
        .read(true)
        .open(file_path)
        .and_then(|f| f.read_exact_at(buf, offset))
        .map_err(|e| FpgallocError::IORead {
            file: file_path.into(),
            e,
        })
}

/// Write all of `data` at `offset` of an existing file.
///
/// # Returns: `Result<(), FpgallocError>`
/// * `Ok(())` - Write succeeded
/// * `Err(FpgallocError::IOWrite)` - Open or positional write failed
pub fn fs_write_at(file_path: &Path, offset: u64, data: &[u8]) -> Result<(), FpgallocError> {
    trace!("Attempting to write {data:02x?} at {offset:#x} to {file_path:?}");
    let result = OpenOptions::new()
        .write(true)
        .open(file_path)
        .and_then(|f| f.write_all_at(data, offset));
    match result {
        Ok(_) => {
            trace!("Write done.");
            Ok(())
        }
        Err(e) => Err(FpgallocError::IOWrite {
            data: format!("{data:02x?} @ {offset:#x}"),
            file: file_path.into(),
            e,
        }),
    }
}

/// Recursively create directories up to the specified path.
///
/// # Returns: `Result<(), FpgallocError>`
/// * `Ok(())` - Directory created (or already existed)
/// * `Err(FpgallocError::IOCreate)` - If directory creation fails (permissions, etc.)
pub fn fs_create_dir(path: &Path) -> Result<(), FpgallocError> {
    trace!("Attempting to Create '{path:?}'");
    let result = create_dir_all(path);
    match result {
        Ok(_) => {
            trace!("Directory created at {path:?}.");
            Ok(())
        }
        Err(e) => Err(FpgallocError::IOCreate {
            file: path.into(),
            e,
        }),
    }
}

/// Remove a file.
///
/// # Returns: `Result<(), FpgallocError>`
/// * `Ok(())` - File removed
/// * `Err(FpgallocError::IODelete)` - If removal fails (doesn't exist, permissions, etc.)
pub fn fs_remove_file(path: &Path) -> Result<(), FpgallocError> {
    trace!("Attempting to delete '{path:?}'");
    match remove_file(path) {
        Ok(_) => {
            trace!("Deleted {path:?}");
            Ok(())
        }
        Err(e) => Err(FpgallocError::IODelete {
            file: path.into(),
            e,
        }),
    }
}

/// Resolve all symlinks of `path`.
///
/// Sysfs exposes PCI functions under `/sys/bus/pci/devices` as symlinks into the device
/// hierarchy; resolving them is how the parent bridge of a function is found.
///
/// # Returns: `Result<PathBuf, FpgallocError>`
/// * `Ok(PathBuf)` - Absolute path with every component resolved
/// * `Err(FpgallocError::IORead)` - A component does not exist
pub fn fs_canonicalize(path: &Path) -> Result<PathBuf, FpgallocError> {
    trace!("Attempting to resolve '{path:?}'");
    std::fs::canonicalize(path).map_err(|e| FpgallocError::IORead {
        file: path.into(),
        e,
    })
}

/// Read the contents of a directory and return entry names.
///
/// Returns a vector of entry names (not full paths). Entries that cannot be read are silently
/// skipped.
///
/// # Arguments
///
/// * `dir` - The directory path to list
///
/// # Returns: `Result<Vec<String>, FpgallocError>`
/// * `Ok(Vec<String>)` - List of entry names in the directory (files and subdirectories)
/// * `Err(FpgallocError::IOReadDir)` - If the directory cannot be read (doesn't exist, permissions, etc.)
///
/// # Examples
///
/// ```rust,no_run
/// # use fpgalloc::system_io::fs_read_dir;
/// # use std::path::Path;
///
/// # fn example() -> Result<(), fpgalloc::error::FpgallocError> {
/// for function in fs_read_dir(Path::new("/sys/bus/pci/devices"))? {
///     println!("Found PCI function: {}", function);
/// }
/// # Ok(())
/// # }
/// ```
pub fn fs_read_dir(dir: &Path) -> Result<Vec<String>, FpgallocError> {
    trace!("Attempting to read directory '{dir:?}'");
    std::fs::read_dir(dir).map_or_else(
        |e| {
            Err(FpgallocError::IOReadDir {
                dir: dir.to_owned(),
                e,
            })
        },
        |iter| {
            let ret = iter
                .filter_map(Result::ok)
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .collect();
            trace!("Dir reading done.");
            Ok(ret)
        },
    )
}
