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

//! fpga-util - allocate, flash and release the shared FPGA cards of a host.
//!
//! Without an action the status of every card is listed. Actions can be combined and run in
//! the order allocate, flash, release, devices.
//!
//! # Environment Variables
//!
//! - `RUST_LOG` - Controls logging level (`trace`, `debug`, `info`, `warn`, `error`
//!   or `off`). Defaults to `info`, or `off` with `--quiet`

mod elevate;
mod list;

use crate::elevate::{ToolPaths, reexec_with_sudo, running_as_root};
use clap::{Parser, arg, command};
use fpgalloc::config::system_config;
use fpgalloc::device_table::{DeviceDescriptor, DeviceTable};
use fpgalloc::eligibility::{Actions, select_targets};
use fpgalloc::error::FpgallocError;
use fpgalloc::flash::{FlashOrchestrator, VivadoTool, cancel_on_signals};
use fpgalloc::identity::{Caller, Identity};
use fpgalloc::ledger::{Ledger, LedgerGuard};
use fpgalloc::ownership::ChownNodeOwner;
use fpgalloc::quirks::QuirkRegistry;
use fpgalloc::topology::Topology;
use log::{debug, error};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "fpga-util")]
#[command(bin_name = "fpga-util")]
#[command(about = "FPGA Utils")]
#[command(args_override_self = true)]
struct Cli {
    #[arg(help = "FPGA ids (all if not specified)")]
    ids: Vec<String>,
    #[arg(short, long, help = "list all FPGAs and their status")]
    list: bool,
    #[arg(short, long, help = "allocate FPGAs")]
    allocate: bool,
    #[arg(short, long, help = "flash vivado bitstream to FPGAs")]
    flash: bool,
    #[arg(short, long, help = "release FPGAs")]
    release: bool,
    #[arg(
        short,
        long,
        help = "list devices attached to PCIe of currently allocated FPGAs"
    )]
    devices: bool,
    #[arg(short, long, value_name = "FILE", help = "use this bitstream for flashing")]
    bitstream: Option<PathBuf>,
    #[arg(long, value_name = "FILE", help = "set hardware server executable explicitly")]
    hwserver_bin: Option<PathBuf>,
    #[arg(long, value_name = "FILE", help = "set vivado executable explicitly")]
    vivado_bin: Option<PathBuf>,
    #[arg(short, long, help = "only print the ids acted on")]
    quiet: bool,
    #[arg(long, help = "force actions (root only)")]
    force: bool,
    #[arg(long, value_name = "FILE", help = "use this mapping file instead of the configured one (root only)")]
    mapping: Option<PathBuf>,
    #[arg(
        long,
        value_name = "FILE",
        help = "read paths from this config file instead of /etc/fpgalloc/config.toml (root only)"
    )]
    config: Option<PathBuf>,
    #[arg(long, help = "do not re-execute through sudo when not running as root")]
    no_elevate: bool,
}

impl Cli {
    fn actions(&self) -> Actions {
        Actions {
            allocate: self.allocate,
            flash: self.flash,
            release: self.release,
            devices: self.devices,
        }
    }
}

/// An explicitly given or `PATH`-resolved executable, made absolute.
fn resolve_tool(explicit: Option<&Path>, name: &str) -> Result<PathBuf, FpgallocError> {
    let found = match explicit {
        Some(path) => path.to_path_buf(),
        None => which::which(name)
            .map_err(|e| FpgallocError::Argument(format!("could not find {name}: {e}")))?,
    };
    if !found.is_file() {
        return Err(FpgallocError::Argument(format!(
            "{name} executable {found:?} does not exist"
        )));
    }
    std::path::absolute(&found).map_err(|e| FpgallocError::IORead { file: found, e })
}

/// Bitstream and tools for `--flash`, checked before anything else happens.
fn flash_inputs(cli: &Cli) -> Result<(PathBuf, ToolPaths), FpgallocError> {
    let bitstream = match &cli.bitstream {
        Some(b) if b.is_file() => {
            std::path::absolute(b).map_err(|e| FpgallocError::IORead { file: b.clone(), e })?
        }
        _ => {
            return Err(FpgallocError::Argument(
                "a bitstream is required for flashing!".to_owned(),
            ));
        }
    };
    let tools = ToolPaths {
        hw_server: resolve_tool(cli.hwserver_bin.as_deref(), "hw_server")?,
        vivado: resolve_tool(cli.vivado_bin.as_deref(), "vivado")?,
    };
    Ok((bitstream, tools))
}

/// Options that bypass the ledger rules or redirect the paths root works on.
///
/// The whole command line of an ordinary user is re-run through sudo, so these are refused
/// before elevation for anyone but root.
fn check_privileged_options(cli: &Cli, is_admin: bool) -> Result<(), FpgallocError> {
    if is_admin {
        return Ok(());
    }
    let given = [
        ("--force", cli.force),
        ("--config", cli.config.is_some()),
        ("--mapping", cli.mapping.is_some()),
    ];
    match given.iter().find(|(_, set)| *set) {
        Some((option, _)) => Err(FpgallocError::Argument(format!(
            "{option} is only available to root"
        ))),
        None => Ok(()),
    }
}

fn allocate(guard: &LedgerGuard, targets: &[&DeviceDescriptor], identity: &Identity, quiet: bool) -> bool {
    let mut ok = true;
    for device in targets {
        match guard.allocate(device, identity) {
            Ok(()) if quiet => println!("{}", device.serial),
            Ok(()) => {}
            Err(e) => {
                error!("could not allocate device id {}: {e}", device.serial);
                ok = false;
            }
        }
    }
    ok
}

async fn flash(
    guard: &LedgerGuard<'_>,
    targets: &[&DeviceDescriptor],
    identity: &Identity,
    (bitstream, tools): (PathBuf, ToolPaths),
    quiet: bool,
) -> Result<bool, FpgallocError> {
    debug!(
        "flashing {bitstream:?} with {:?}, hardware server {:?}",
        tools.vivado, tools.hw_server
    );
    let cancel = CancellationToken::new();
    let listener = cancel_on_signals(cancel.clone())?;
    let orchestrator = FlashOrchestrator::new(
        QuirkRegistry::with_builtin(),
        Box::new(VivadoTool::new(tools.vivado)),
        identity.clone(),
        cancel,
    )
    .quiet(quiet);
    let report = orchestrator.run(guard, targets, &bitstream).await;
    listener.abort();

    for (serial, outcome) in &report.outcomes {
        debug!("device id {serial}: {outcome}");
    }
    if quiet {
        report.succeeded().for_each(|serial| println!("{serial}"));
    }
    Ok(report.is_success())
}

fn release(guard: &LedgerGuard, targets: &[&DeviceDescriptor], quiet: bool) -> bool {
    let mut ok = true;
    for device in targets {
        match guard.release(device) {
            Ok(true) if quiet => println!("{}", device.serial),
            Ok(_) => {}
            Err(e) => {
                error!("could not release device id {}: {e}", device.serial);
                ok = false;
            }
        }
    }
    ok
}

fn devices(guard: &LedgerGuard, targets: &[&DeviceDescriptor]) {
    for device in targets {
        for node in guard.topology().resolve_device_nodes(device) {
            println!("{}", node.display());
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, FpgallocError> {
    let caller = Caller::resolve()?;
    check_privileged_options(&cli, caller.is_admin)?;
    let actions = cli.actions();
    let to_flash = if actions.flash {
        Some(flash_inputs(&cli)?)
    } else {
        None
    };

    if !running_as_root() && !cli.no_elevate {
        return Err(reexec_with_sudo(to_flash.as_ref().map(|(_, tools)| tools)));
    }

    let config = system_config(cli.config.as_deref());
    let mapping_file = cli
        .mapping
        .clone()
        .or(config.mapping_file.clone())
        .ok_or_else(|| FpgallocError::Config("could not find fpga mapping files".to_owned()))?;
    let table = DeviceTable::from_file(&mapping_file)?;
    if table.is_empty() {
        return Err(FpgallocError::Config(
            "could not find any FPGAs on the system!".to_owned(),
        ));
    }
    let ledger = Ledger::new(&config, Topology::new(&config), Box::new(ChownNodeOwner));
    let uid = caller.identity.uid;

    if cli.list || actions.is_empty() {
        print!(
            "{}",
            list::render_table(
                &table,
                |serial| ledger.status(serial),
                uid,
                caller.is_admin,
                list::user_name
            )
        );
    }
    if actions.is_empty() {
        return Ok(ExitCode::SUCCESS);
    }

    let guard = ledger.lock()?;
    let selection = select_targets(&table, &cli.ids, actions, uid, cli.force, |serial| {
        guard.status(serial)
    });
    for refusal in &selection.refusals {
        error!("{refusal}");
    }
    let targets: Vec<&DeviceDescriptor> = selection
        .targets
        .iter()
        .filter_map(|serial| table.get(serial))
        .collect();
    if targets.is_empty() {
        error!("no devices available!");
        return Ok(ExitCode::FAILURE);
    }

    let mut ok = true;
    if actions.allocate {
        ok &= allocate(&guard, &targets, &caller.identity, cli.quiet);
    }
    if let Some(inputs) = to_flash {
        if !flash(&guard, &targets, &caller.identity, inputs, cli.quiet).await? {
            return Ok(ExitCode::FAILURE);
        }
    }
    if actions.release {
        ok &= release(&guard, &targets, cli.quiet);
    }
    if actions.devices {
        devices(&guard, &targets);
    }
    Ok(if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let default_filter = if cli.quiet { "off" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();
    debug!("parsed cli command with {cli:?}");
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
