// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-node agent reconciling block-device resources.
//!
//! For each block-device resource naming the local node, the
//! [`controller::Controller`] drives the underlying disk through format,
//! mount, registration on the storage orchestrator's node resource, tag
//! synchronization, and eventual de-registration. The embedding process
//! supplies the store clients and the scanner (see [`facilities`]) and feeds
//! events through the [`dispatcher`].

pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod facilities;
pub mod format_gate;
pub mod path_resolver;
pub mod planner;
pub mod tag_cache;

pub use config::Config;
pub use controller::{Controller, ControllerError};
pub use dispatcher::{Event, WorkQueue};

/// The only filesystem the agent creates and mounts.
pub const SUPPORTED_FILESYSTEM: &str = "ext4";
