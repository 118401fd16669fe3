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

mod common;

use crate::common::{
    FakeHost, RECORDING_QUIRK, RecordingOwner, RecordingQuirk, RefusingOwner, ShellTool,
};
use fpgalloc::device_table::DeviceDescriptor;
use fpgalloc::flash::{DeviceOutcome, FlashOrchestrator, FlashTool};
use fpgalloc::ledger::Ledger;
use fpgalloc::ownership::NodeOwner;
use fpgalloc::quirks::{QuirkPhase, QuirkRegistry};
use googletest::prelude::*;
use rstest::*;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Three cards A, B and C on buses 3b, 5e and d8, each behind its own bridge.
struct Rack {
    host: FakeHost,
    devices: Vec<DeviceDescriptor>,
    nodes: Vec<Vec<PathBuf>>,
    quirk: RecordingQuirk,
    owner: RecordingOwner,
}

#[fixture]
fn rack() -> Rack {
    let host = FakeHost::new();
    let cards = [
        ("A", "0000:00:01.1", "3b", "xdma0_user"),
        ("B", "0000:00:02.1", "5e", "xdma1_user"),
        ("C", "0000:00:03.1", "d8", "xdma2_user"),
    ];
    let mut devices = Vec::new();
    let mut nodes = Vec::new();
    for (serial, bridge, pci_prefix, devname) in cards {
        nodes.push(host.add_card(bridge, pci_prefix, devname));
        devices.push(host.device(serial, pci_prefix, RECORDING_QUIRK));
    }
    Rack {
        host,
        devices,
        nodes,
        quirk: RecordingQuirk::default(),
        owner: RecordingOwner::default(),
    }
}

impl Rack {
    fn ledger(&self, owner: Box<dyn NodeOwner>) -> Ledger {
        Ledger::new(&self.host.config, self.host.topology(), owner)
    }

    fn orchestrator(&self, tool: Box<dyn FlashTool>, cancel: CancellationToken) -> FlashOrchestrator {
        let mut quirks = QuirkRegistry::new();
        quirks.register(RECORDING_QUIRK, Box::new(self.quirk.clone()));
        FlashOrchestrator::new(quirks, tool, self.host.current_user(), cancel).quiet(true)
    }

    fn image(&self) -> PathBuf {
        let image = self.host.path().join("top.bit");
        std::fs::write(&image, "bitstream").unwrap();
        image
    }

    fn targets(&self) -> Vec<&DeviceDescriptor> {
        self.devices.iter().collect()
    }

    fn quirk_calls(&self, serial: &str) -> Vec<QuirkPhase> {
        self.quirk
            .calls()
            .into_iter()
            .filter(|(_, s)| s == serial)
            .map(|(phase, _)| phase)
            .collect()
    }
}

#[gtest]
#[tokio::test]
#[rstest]
async fn test_whole_batch_succeeds(rack: Rack) {
    let ledger = rack.ledger(Box::new(rack.owner.clone()));
    let guard = ledger.lock().unwrap();
    let orchestrator = rack.orchestrator(Box::new(ShellTool::new("true")), CancellationToken::new());

    let report = orchestrator.run(&guard, &rack.targets(), &rack.image()).await;

    expect_true!(report.is_success());
    expect_that!(
        report.succeeded().collect::<Vec<_>>(),
        elements_are![eq(&"A"), eq(&"B"), eq(&"C")]
    );
    let uid = rack.host.current_user().uid;
    for node in rack.nodes.iter().flatten() {
        expect_that!(rack.owner.owner_of(node), some(eq(uid)));
    }
}

#[gtest]
#[tokio::test]
#[rstest]
async fn test_failure_stops_the_batch(rack: Rack) {
    let ledger = rack.ledger(Box::new(rack.owner.clone()));
    let guard = ledger.lock().unwrap();
    let tool = ShellTool::new(r#"test "$1" != B"#);
    let orchestrator = rack.orchestrator(Box::new(tool), CancellationToken::new());

    let report = orchestrator.run(&guard, &rack.targets(), &rack.image()).await;

    expect_false!(report.is_success());
    expect_false!(report.cancelled);
    expect_that!(
        report.outcomes,
        elements_are![
            eq(&("A".to_owned(), DeviceOutcome::Succeeded)),
            eq(&("B".to_owned(), DeviceOutcome::Failed)),
        ]
    );
    let uid = rack.host.current_user().uid;
    for node in &rack.nodes[0] {
        expect_that!(rack.owner.owner_of(node), some(eq(uid)));
    }
    for node in rack.nodes[1].iter().chain(&rack.nodes[2]) {
        expect_that!(rack.owner.owner_of(node), none());
    }
    // the failed card still gets its bus put back in order
    expect_that!(
        rack.quirk_calls("B"),
        elements_are![eq(&QuirkPhase::PreFlash), eq(&QuirkPhase::PostFlash)]
    );
    expect_that!(rack.quirk_calls("C"), is_empty());
}

#[gtest]
#[tokio::test]
#[rstest]
async fn test_interrupt_waits_for_the_running_tool(rack: Rack) {
    let ledger = rack.ledger(Box::new(rack.owner.clone()));
    let guard = ledger.lock().unwrap();
    let done_dir = rack.host.path().join("done");
    std::fs::create_dir(&done_dir).unwrap();
    let tool = ShellTool::new(format!(r#"sleep 1; touch "{}/$1""#, done_dir.display()));
    let cancel = CancellationToken::new();
    let orchestrator = rack.orchestrator(Box::new(tool), cancel.clone());

    let interrupt = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
    });
    let report = orchestrator.run(&guard, &rack.targets(), &rack.image()).await;
    interrupt.await.unwrap();

    expect_true!(report.cancelled);
    expect_false!(report.is_success());
    expect_that!(
        report.outcomes,
        elements_are![eq(&("A".to_owned(), DeviceOutcome::Cancelled))]
    );
    // the tool ran to completion, then the bus was restored
    expect_true!(done_dir.join("A").exists());
    expect_that!(
        rack.quirk_calls("A"),
        elements_are![eq(&QuirkPhase::PreFlash), eq(&QuirkPhase::PostFlash)]
    );
    expect_that!(rack.quirk_calls("B"), is_empty());
    expect_false!(done_dir.join("B").exists());
    // the finished card still changes hands, the untouched one does not
    let uid = rack.host.current_user().uid;
    for node in &rack.nodes[0] {
        expect_that!(rack.owner.owner_of(node), some(eq(uid)));
    }
    for node in &rack.nodes[1] {
        expect_that!(rack.owner.owner_of(node), none());
    }
}

#[gtest]
#[tokio::test]
#[rstest]
async fn test_interrupt_before_start_attempts_nothing(rack: Rack) {
    let ledger = rack.ledger(Box::new(rack.owner.clone()));
    let guard = ledger.lock().unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let orchestrator = rack.orchestrator(Box::new(ShellTool::new("true")), cancel);

    let report = orchestrator.run(&guard, &rack.targets(), &rack.image()).await;

    expect_true!(report.cancelled);
    expect_that!(report.outcomes, is_empty());
    expect_that!(rack.quirk.calls(), is_empty());
}

struct MissingTool;

impl FlashTool for MissingTool {
    fn command(&self, _device: &DeviceDescriptor, _image: &std::path::Path) -> tokio::process::Command {
        tokio::process::Command::new("/nonexistent/bin/vivado")
    }
}

#[gtest]
#[tokio::test]
#[rstest]
async fn test_tool_that_cannot_start_fails_the_device(rack: Rack) {
    let ledger = rack.ledger(Box::new(rack.owner.clone()));
    let guard = ledger.lock().unwrap();
    let orchestrator = rack.orchestrator(Box::new(MissingTool), CancellationToken::new());

    let report = orchestrator.run(&guard, &rack.targets(), &rack.image()).await;

    expect_that!(
        report.outcomes,
        elements_are![eq(&("A".to_owned(), DeviceOutcome::Failed))]
    );
    expect_that!(
        rack.quirk_calls("A"),
        elements_are![eq(&QuirkPhase::PreFlash), eq(&QuirkPhase::PostFlash)]
    );
    expect_that!(rack.owner.changes(), is_empty());
}

#[gtest]
#[tokio::test]
#[rstest]
async fn test_ownership_failure_fails_the_device(rack: Rack) {
    let ledger = rack.ledger(Box::new(RefusingOwner));
    let guard = ledger.lock().unwrap();
    let orchestrator = rack.orchestrator(Box::new(ShellTool::new("true")), CancellationToken::new());

    let report = orchestrator.run(&guard, &rack.targets(), &rack.image()).await;

    expect_that!(
        report.outcomes,
        elements_are![eq(&("A".to_owned(), DeviceOutcome::Failed))]
    );
}

#[gtest]
#[tokio::test]
#[rstest]
async fn test_unknown_quirk_is_skipped(rack: Rack) {
    let ledger = rack.ledger(Box::new(rack.owner.clone()));
    let guard = ledger.lock().unwrap();
    let orchestrator = rack.orchestrator(Box::new(ShellTool::new("true")), CancellationToken::new());
    let device = rack.host.device("A", "3b", "no-such-quirk");

    let report = orchestrator.run(&guard, &[&device], &rack.image()).await;

    expect_true!(report.is_success());
    expect_that!(rack.quirk.calls(), is_empty());
}

#[gtest]
#[tokio::test]
#[rstest]
async fn test_tool_sees_owner_environment(rack: Rack) {
    let ledger = rack.ledger(Box::new(rack.owner.clone()));
    let guard = ledger.lock().unwrap();
    let out = rack.host.path().join("env");
    let tool = ShellTool::new(format!(
        r#"echo "$USER $LOGNAME $HOME $1 $2" > "{}""#,
        out.display()
    ));
    let orchestrator = rack.orchestrator(Box::new(tool), CancellationToken::new());
    let image = rack.image();

    orchestrator.run(&guard, &[&rack.devices[0]], &image).await;

    let env = std::fs::read_to_string(&out).unwrap();
    let expected = format!(
        "tester tester {} A {}",
        rack.host.path().display(),
        image.display()
    );
    expect_that!(env.trim(), eq(expected.as_str()));
}
