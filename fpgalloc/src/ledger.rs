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

//! The allocation ledger.
//!
//! Which user owns which card is recorded by marker files, one per serial, in the ledger
//! directory. A marker holds the owner's uid in decimal; no marker means the card is free.
//!
//! Every invocation of the tool is its own process, so the ledger is shared state between
//! processes. All changes happen under one host-wide lock ([`GlobalLock`], an `flock(2)` on
//! the lock file). The lock is coarse on purpose: a long flash of one card also holds back
//! allocations of every other card.
//!
//! Changing the ledger is only possible through a [`LedgerGuard`], which can only be obtained
//! by taking the lock:
//!
//! ```rust,no_run
//! # use fpgalloc::ledger::Ledger;
//! # use fpgalloc::device_table::DeviceDescriptor;
//! # use fpgalloc::identity::Identity;
//! # fn example(ledger: &Ledger, device: &DeviceDescriptor, me: &Identity) -> Result<(), fpgalloc::error::FpgallocError> {
//! let guard = ledger.lock()?;
//! guard.allocate(device, me)?;
//! // lock released when `guard` goes out of scope
//! # Ok(())
//! # }
//! ```

use crate::config::SystemConfig;
use crate::device_table::{DeviceDescriptor, is_valid_serial};
use crate::error::FpgallocError;
use crate::identity::Identity;
use crate::ownership::{NodeOwner, transfer_ownership};
use crate::system_io::{fs_create_dir, fs_read, fs_remove_file, fs_write};
use crate::topology::Topology;
use log::{debug, info, trace, warn};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// Who a card belongs to according to its marker file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    Free,
    Owned(u32),
    /// A marker exists but its content is unreadable. Such a card is neither free nor owned
    /// by anyone who asks.
    Unknown,
}

impl Ownership {
    pub fn is_free(&self) -> bool {
        matches!(self, Ownership::Free)
    }

    pub fn is_owned_by(&self, uid: u32) -> bool {
        matches!(self, Ownership::Owned(owner) if *owner == uid)
    }
}

/// Host-wide exclusive lock, held until dropped.
#[derive(Debug)]
pub struct GlobalLock {
    file: File,
    path: PathBuf,
}

fn flock(file: &File, operation: libc::c_int) -> io::Result<()> {
    loop {
        // SAFETY: the descriptor is owned by `file`, which outlives the call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), operation) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

impl GlobalLock {
    fn open(path: &Path) -> Result<File, FpgallocError> {
        if let Some(parent) = path.parent() {
            fs_create_dir(parent)?;
        }
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|e| FpgallocError::Lock {
                file: path.into(),
                e,
            })
    }

    /// Wait for and take the lock at `path`, creating the file if needed.
    ///
    /// There is no timeout: a caller queues behind a running flash for as long as it takes.
    pub fn acquire(path: &Path) -> Result<GlobalLock, FpgallocError> {
        let file = Self::open(path)?;
        debug!("waiting for {path:?}");
        flock(&file, libc::LOCK_EX).map_err(|e| FpgallocError::Lock {
            file: path.into(),
            e,
        })?;
        debug!("holding {path:?}");
        Ok(GlobalLock {
            file,
            path: path.into(),
        })
    }

    /// Take the lock at `path` only if nobody holds it.
    pub fn try_acquire(path: &Path) -> Result<Option<GlobalLock>, FpgallocError> {
        let file = Self::open(path)?;
        match flock(&file, libc::LOCK_EX | libc::LOCK_NB) {
            Ok(()) => Ok(Some(GlobalLock {
                file,
                path: path.into(),
            })),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(FpgallocError::Lock {
                file: path.into(),
                e,
            }),
        }
    }
}

impl Drop for GlobalLock {
    fn drop(&mut self) {
        // Closing the descriptor drops the lock as well; unlocking first just makes it explicit.
        if let Err(e) = flock(&self.file, libc::LOCK_UN) {
            warn!("failed to unlock {:?}: {e}", self.path);
        }
        trace!("released {:?}", self.path);
    }
}

/// Marker files plus what is needed to move device node ownership along with them.
pub struct Ledger {
    ledger_dir: PathBuf,
    lock_file: PathBuf,
    topology: Topology,
    owner: Box<dyn NodeOwner>,
}

impl fmt::Debug for Ledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ledger")
            .field("ledger_dir", &self.ledger_dir)
            .field("lock_file", &self.lock_file)
            .field("topology", &self.topology)
            .finish_non_exhaustive()
    }
}

impl Ledger {
    pub fn new(config: &SystemConfig, topology: Topology, owner: Box<dyn NodeOwner>) -> Ledger {
        Ledger {
            ledger_dir: config.ledger_dir.clone(),
            lock_file: config.lock_file.clone(),
            topology,
            owner,
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    fn marker_path(&self, serial: &str) -> Result<PathBuf, FpgallocError> {
        if !is_valid_serial(serial) {
            return Err(FpgallocError::Argument(format!(
                "device id {serial:?} cannot name a ledger marker"
            )));
        }
        Ok(self.ledger_dir.join(serial))
    }

    /// Current owner of `serial`.
    ///
    /// Reading does not need the lock; a listing may race with a concurrent change.
    pub fn status(&self, serial: &str) -> Ownership {
        let marker = match self.marker_path(serial) {
            Ok(marker) => marker,
            Err(e) => {
                warn!("{e}");
                return Ownership::Unknown;
            }
        };
        match fs_read(&marker) {
            Ok(contents) => match contents.lines().next().map(str::trim).map(str::parse::<u32>) {
                Some(Ok(uid)) => Ownership::Owned(uid),
                _ => {
                    warn!("marker {marker:?} does not hold a uid: {contents:?}");
                    Ownership::Unknown
                }
            },
            Err(e) if e.is_not_found() => Ownership::Free,
            Err(e) => {
                warn!("{e}");
                Ownership::Unknown
            }
        }
    }

    /// Take the host-wide lock, blocking until it is available.
    pub fn lock(&self) -> Result<LedgerGuard<'_>, FpgallocError> {
        let lock = GlobalLock::acquire(&self.lock_file)?;
        fs_create_dir(&self.ledger_dir)?;
        Ok(LedgerGuard {
            ledger: self,
            _lock: lock,
        })
    }
}

/// The ledger while the host-wide lock is held.
#[derive(Debug)]
pub struct LedgerGuard<'a> {
    ledger: &'a Ledger,
    _lock: GlobalLock,
}

impl LedgerGuard<'_> {
    pub fn ledger(&self) -> &Ledger {
        self.ledger
    }

    pub fn topology(&self) -> &Topology {
        &self.ledger.topology
    }

    pub fn status(&self, serial: &str) -> Ownership {
        self.ledger.status(serial)
    }

    /// Record `identity` as owner of `device` and hand it the device nodes.
    ///
    /// Eligibility is the caller's business; re-allocating to the current owner is harmless.
    /// The marker is written before the nodes change hands, so for a moment the ledger already
    /// names the new owner while the nodes still belong to the previous one.
    pub fn allocate(
        &self,
        device: &DeviceDescriptor,
        identity: &Identity,
    ) -> Result<(), FpgallocError> {
        fs_write(
            &self.ledger.marker_path(&device.serial)?,
            true,
            identity.uid.to_string(),
        )?;
        self.transfer_ownership(device, identity)?;
        info!(
            "allocated device id {} to {} and changed ownership of attached devices",
            device.serial, identity.name
        );
        Ok(())
    }

    /// Give the device nodes back to the system and forget the owner.
    ///
    /// # Returns: `Result<bool, FpgallocError>`
    /// * `Ok(true)` - The device was allocated and is free now
    /// * `Ok(false)` - The device was not allocated, nothing changed
    /// * `Err(FpgallocError)` - Ownership transfer or marker removal failed; the marker stays
    pub fn release(&self, device: &DeviceDescriptor) -> Result<bool, FpgallocError> {
        let marker = self.ledger.marker_path(&device.serial)?;
        if !marker.exists() {
            debug!("device id {} is not allocated", device.serial);
            return Ok(false);
        }
        self.transfer_ownership(device, &Identity::system())?;
        fs_remove_file(&marker)?;
        info!(
            "released device id {} and changed ownership of attached devices",
            device.serial
        );
        Ok(true)
    }

    /// Hand the currently resolved device nodes of `device` to `identity`.
    pub fn transfer_ownership(
        &self,
        device: &DeviceDescriptor,
        identity: &Identity,
    ) -> Result<usize, FpgallocError> {
        transfer_ownership(
            &self.ledger.topology,
            self.ledger.owner.as_ref(),
            device,
            identity,
        )
    }
}
