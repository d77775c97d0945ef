// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

#[cfg(not(feature = "tofino_stub"))]
compile_error! {"must set the tofino_stub feature"}

cfg_if::cfg_if! {
    if #[cfg(feature = "tofino_stub")] {
        pub mod tofino_stub;
        mod plat {
            pub use super::tofino_stub::AsicConfig;
            pub use super::tofino_stub::StubHandle as Handle;
        }
    }
}

pub use plat::AsicConfig;
pub use plat::Handle;
