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

use fpgalloc::device_table::DeviceTable;
use fpgalloc::identity::Identity;
use fpgalloc::ledger::Ownership;

/// Name shown for the owner of a card; falls back to the bare uid for unknown accounts.
pub fn user_name(uid: u32) -> String {
    Identity::from_uid(uid)
        .map(|identity| identity.name)
        .unwrap_or_else(|_| uid.to_string())
}

/// The status table of every card, one line per card plus a header.
///
/// Owners are only named to administrators and to the owners themselves.
pub fn render_table(
    table: &DeviceTable,
    status: impl Fn(&str) -> Ownership,
    viewer_uid: u32,
    is_admin: bool,
    user_name: impl Fn(u32) -> String,
) -> String {
    let mut out = format!(
        "{:<3} {:<16} {:<10} {:<12} {:<22} {:<10} {}\n",
        "#", "Serial", "PCIe-ID", "Board", "Quirk", "Status", "User"
    );
    for (number, device) in table.iter().enumerate() {
        let ownership = status(&device.serial);
        let state = if ownership.is_free() { "free" } else { "in use" };
        let user = match ownership {
            Ownership::Owned(uid) if is_admin || uid == viewer_uid => user_name(uid),
            _ => String::new(),
        };
        let line = format!(
            "{number:<3} {:<16} {:<10} {:<12} {:<22} {state:<10} {user}",
            device.serial, device.pci_prefix, device.board, device.quirk
        );
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use googletest::prelude::*;
    use rstest::*;
    use std::path::Path;

    fn table() -> DeviceTable {
        DeviceTable::parse(
            "21770297400LA 3b xilinx-alveo-quirk au280 /bin/sh\n\
             21770297401MB 5e xilinx-alveo-quirk au280 /bin/sh\n\
             21770297402NC d8 none au55c /bin/sh\n",
            Path::new("/"),
        )
    }

    fn status(serial: &str) -> Ownership {
        match serial {
            "21770297400LA" => Ownership::Owned(1000),
            "21770297401MB" => Ownership::Unknown,
            _ => Ownership::Free,
        }
    }

    #[gtest]
    #[rstest]
    #[case::owner(1000, false, "alice")]
    #[case::admin(0, true, "alice")]
    #[case::stranger(1001, false, "")]
    fn test_owner_visibility(#[case] viewer: u32, #[case] admin: bool, #[case] shown: &str) {
        let out = render_table(&table(), status, viewer, admin, |_| "alice".to_owned());
        let lines: Vec<&str> = out.lines().collect();
        expect_that!(lines.len(), eq(4));
        expect_that!(lines[1], starts_with("0   21770297400LA"));
        let expected = format!("in use     {shown}");
        expect_that!(lines[1], ends_with(expected.trim_end()));
    }

    #[gtest]
    fn test_header_and_free_rows() {
        let out = render_table(&table(), status, 1000, false, |_| "alice".to_owned());
        let lines: Vec<&str> = out.lines().collect();
        expect_that!(lines[0], starts_with("#   Serial           PCIe-ID    Board        Quirk"));
        expect_that!(lines[2], ends_with("in use"));
        expect_that!(lines[3], ends_with("free"));
        expect_that!(lines[3], contains_substring("none"));
    }
}
