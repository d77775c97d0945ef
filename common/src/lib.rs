// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Types and utilities shared by the crates in this workspace.

pub mod bytestring;
pub mod chassis;
pub mod logging;
pub mod p4info;
pub mod p4rt;
