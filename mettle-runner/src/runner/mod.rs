// Copyright (c) The mettle Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The test runner.
//!
//! The main structure in this module is [`TestRunner`].

mod dispatcher;
mod imp;

#[cfg(unix)]
#[path = "unix.rs"]
mod os;

pub use imp::*;
