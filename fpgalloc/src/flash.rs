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

//! Flashing a bitstream onto a batch of cards.
//!
//! Cards are programmed one after the other by an external tool running as the card's owner.
//! Around every tool run the card's quirk is applied, and afterwards the freshly enumerated
//! device nodes are handed to the owner.
//!
//! An interrupt never kills a running tool: a half-written card is worse than a late exit. It
//! is recorded, the current card is finished and nothing after it is started.

use crate::device_table::DeviceDescriptor;
use crate::error::FpgallocError;
use crate::identity::Identity;
use crate::ledger::LedgerGuard;
use crate::quirks::{QuirkPhase, QuirkRegistry};
use crate::topology::Topology;
use log::{error, info, warn};
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Builds the command that programs a card.
///
/// The orchestrator adds the user, environment and stdio settings; implementations only
/// provide program and arguments.
pub trait FlashTool: Send + Sync {
    fn command(&self, device: &DeviceDescriptor, image: &Path) -> Command;
}

/// Vivado in batch mode, sourcing the card's programming script.
#[derive(Debug, Clone)]
pub struct VivadoTool {
    bin: PathBuf,
}

impl VivadoTool {
    pub fn new(bin: impl Into<PathBuf>) -> VivadoTool {
        VivadoTool { bin: bin.into() }
    }

    /// `-mode batch -nolog -nojournal -source <script> -notrace -tclargs <serial> <pci_prefix>
    /// <board> <image>`
    pub fn args(device: &DeviceDescriptor, image: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = ["-mode", "batch", "-nolog", "-nojournal", "-source"]
            .into_iter()
            .map(OsString::from)
            .collect();
        args.push(device.program_script.clone().into_os_string());
        args.extend(
            [
                "-notrace",
                "-tclargs",
                device.serial.as_str(),
                device.pci_prefix.as_str(),
                device.board.as_str(),
            ]
            .into_iter()
            .map(OsString::from),
        );
        args.push(image.as_os_str().to_owned());
        args
    }
}

impl FlashTool for VivadoTool {
    fn command(&self, device: &DeviceDescriptor, image: &Path) -> Command {
        let mut command = Command::new(&self.bin);
        command.args(VivadoTool::args(device, image));
        command
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceOutcome {
    Succeeded,
    Failed,
    /// An interrupt arrived while the card was being programmed.
    Cancelled,
}

impl fmt::Display for DeviceOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceOutcome::Succeeded => f.write_str("succeeded"),
            DeviceOutcome::Failed => f.write_str("failed"),
            DeviceOutcome::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// What happened to the cards of one batch. Cards after a failure are not listed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub outcomes: Vec<(String, DeviceOutcome)>,
    pub cancelled: bool,
    targeted: usize,
}

impl BatchReport {
    fn new(targeted: usize) -> BatchReport {
        BatchReport {
            outcomes: Vec::with_capacity(targeted),
            cancelled: false,
            targeted,
        }
    }

    /// Every targeted card was flashed and nothing was interrupted.
    pub fn is_success(&self) -> bool {
        !self.cancelled
            && self.outcomes.len() == self.targeted
            && self
                .outcomes
                .iter()
                .all(|(_, outcome)| *outcome == DeviceOutcome::Succeeded)
    }

    /// Serials of the cards that were flashed.
    pub fn succeeded(&self) -> impl Iterator<Item = &str> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| *outcome == DeviceOutcome::Succeeded)
            .map(|(serial, _)| serial.as_str())
    }
}

/// Flashes cards on behalf of one user.
pub struct FlashOrchestrator {
    quirks: QuirkRegistry,
    tool: Box<dyn FlashTool>,
    identity: Identity,
    quiet: bool,
    cancel: CancellationToken,
}

impl fmt::Debug for FlashOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlashOrchestrator")
            .field("quirks", &self.quirks)
            .field("identity", &self.identity)
            .field("quiet", &self.quiet)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl FlashOrchestrator {
    pub fn new(
        quirks: QuirkRegistry,
        tool: Box<dyn FlashTool>,
        identity: Identity,
        cancel: CancellationToken,
    ) -> FlashOrchestrator {
        FlashOrchestrator {
            quirks,
            tool,
            identity,
            quiet: false,
            cancel,
        }
    }

    /// Discard the tool's stdout and stderr.
    pub fn quiet(mut self, quiet: bool) -> FlashOrchestrator {
        self.quiet = quiet;
        self
    }

    /// Flash `image` onto `devices` in order, stopping at the first card that fails or is
    /// interrupted.
    pub async fn run(
        &self,
        guard: &LedgerGuard<'_>,
        devices: &[&DeviceDescriptor],
        image: &Path,
    ) -> BatchReport {
        let mut report = BatchReport::new(devices.len());
        for device in devices {
            if self.cancel.is_cancelled() {
                info!(
                    "interrupted, device id {} and later ones are not flashed",
                    device.serial
                );
                report.cancelled = true;
                break;
            }
            let outcome = self.flash_device(guard, device, image).await;
            report.outcomes.push((device.serial.clone(), outcome));
            match outcome {
                DeviceOutcome::Succeeded => {}
                DeviceOutcome::Failed => break,
                DeviceOutcome::Cancelled => {
                    report.cancelled = true;
                    break;
                }
            }
        }
        report
    }

    async fn flash_device(
        &self,
        guard: &LedgerGuard<'_>,
        device: &DeviceDescriptor,
        image: &Path,
    ) -> DeviceOutcome {
        self.apply_quirk(QuirkPhase::PreFlash, device, guard.topology());

        info!(
            "starting hardware server and vivado to flash device id {}",
            device.serial
        );
        let (tool_ok, interrupted) = match self.supervise(device, image).await {
            Ok((status, interrupted)) => {
                if !status.success() {
                    error!("could not flash device id {}: {status}", device.serial);
                }
                (status.success(), interrupted)
            }
            Err(e) => {
                error!("could not flash device id {}: {e}", device.serial);
                (false, self.cancel.is_cancelled())
            }
        };

        self.apply_quirk(QuirkPhase::PostFlash, device, guard.topology());

        // A tool that finished cleanly has rewritten the card even when an interrupt arrived
        // meanwhile, so its new nodes go to the owner before the device reports Cancelled.
        if tool_ok {
            // The card has been re-enumerated; its nodes are new and belong to root again.
            if let Err(e) = guard.transfer_ownership(device, &self.identity) {
                error!(
                    "flashed device id {} but could not hand it to {}: {e}",
                    device.serial, self.identity.name
                );
                return DeviceOutcome::Failed;
            }
        }
        match (tool_ok, interrupted) {
            (_, true) => DeviceOutcome::Cancelled,
            (false, false) => DeviceOutcome::Failed,
            (true, false) => {
                info!(
                    "flashed bitstream to device id {} and changed ownership of attached devices",
                    device.serial
                );
                DeviceOutcome::Succeeded
            }
        }
    }

    fn apply_quirk(&self, phase: QuirkPhase, device: &DeviceDescriptor, topology: &Topology) {
        let Some(quirk) = self.quirks.get(&device.quirk) else {
            info!(
                "no quirk called {} is known, skipping {phase} quirk of device id {}",
                device.quirk, device.serial
            );
            return;
        };
        info!(
            "apply {phase} quirk {} on device id {}",
            device.quirk, device.serial
        );
        if !quirk.apply(phase, device, topology) {
            warn!(
                "could not apply {phase} quirk for device id {}",
                device.serial
            );
        }
    }

    /// Run the tool to completion as the target user.
    ///
    /// # Returns: `Result<(ExitStatus, bool), FpgallocError>`
    /// * `Ok((ExitStatus, bool))` - Exit status and whether an interrupt arrived meanwhile
    /// * `Err(FpgallocError::Tool)` - The tool could not be started or waited for
    async fn supervise(
        &self,
        device: &DeviceDescriptor,
        image: &Path,
    ) -> Result<(ExitStatus, bool), FpgallocError> {
        let mut command = self.tool.command(device, image);
        command
            .uid(self.identity.uid)
            .gid(self.identity.gid)
            .env("HOME", &self.identity.home)
            .env("LOGNAME", &self.identity.name)
            .env("USER", &self.identity.name)
            .stdin(Stdio::null())
            .kill_on_drop(false);
        if self.quiet {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }
        let program = command.as_std().get_program().to_owned();
        let mut child = command.spawn().map_err(|e| {
            FpgallocError::Tool(format!("failed to start {program:?} as {}: {e}", self.identity.name))
        })?;

        let mut interrupted = false;
        let status = tokio::select! {
            status = child.wait() => status,
            () = self.cancel.cancelled() => {
                interrupted = true;
                info!(
                    "interrupt received, waiting for the flash of device id {} to finish",
                    device.serial
                );
                child.wait().await
            }
        }
        .map_err(|e| FpgallocError::Tool(format!("failed to wait for {program:?}: {e}")))?;
        Ok((status, interrupted || self.cancel.is_cancelled()))
    }
}

/// Cancel `token` on the first SIGINT or SIGTERM.
///
/// Must be called from within a tokio runtime. Once installed, the signals no longer terminate
/// the process; abort the returned task when it is no longer needed.
pub fn cancel_on_signals(token: CancellationToken) -> Result<JoinHandle<()>, FpgallocError> {
    let listen = |kind: SignalKind| {
        signal(kind).map_err(|e| {
            FpgallocError::Internal(format!("cannot listen for signal {}: {e}", kind.as_raw_value()))
        })
    };
    let mut interrupt = listen(SignalKind::interrupt())?;
    let mut terminate = listen(SignalKind::terminate())?;
    Ok(tokio::spawn(async move {
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
        info!("interrupt received, exiting gracefully...");
        token.cancel();
    }))
}
