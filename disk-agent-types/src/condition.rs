// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Named status conditions on a block-device resource.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
pub enum ConditionType {
    /// The agent is (or failed while) formatting the device.
    DeviceFormatting,
    /// The device is mounted at its expected mount point.
    DeviceMounted,
    /// The device is registered as a disk on the orchestrator node.
    DiskAddedToNode,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub status: bool,
    /// Machine-oriented error string; empty when healthy.
    #[serde(default)]
    pub error: String,
    /// Human-oriented progress message.
    #[serde(default)]
    pub message: String,
}

impl Default for ConditionType {
    fn default() -> Self {
        ConditionType::DeviceFormatting
    }
}

/// An update to fold into a condition list.
///
/// The reconciler computes these as values; [`apply`] is the only place
/// that mutates the stored conditions.
#[derive(Clone, Debug, PartialEq)]
pub enum ConditionUpdate {
    Ok { status: bool, message: String },
    Error { error: String },
}

impl ConditionUpdate {
    pub fn ok(status: bool, message: impl Into<String>) -> Self {
        ConditionUpdate::Ok { status, message: message.into() }
    }

    pub fn error(error: impl std::fmt::Display) -> Self {
        ConditionUpdate::Error { error: error.to_string() }
    }
}

/// Folds `update` into the condition named by `which`, inserting the
/// condition if the resource has never carried it.
///
/// An `Ok` update clears any recorded error; an `Error` update sets the
/// condition false and leaves the last human message in place.
pub fn apply(
    conditions: &mut Vec<Condition>,
    which: ConditionType,
    update: ConditionUpdate,
) {
    let idx = match conditions.iter().position(|c| c.condition_type == which) {
        Some(idx) => idx,
        None => {
            conditions.push(Condition {
                condition_type: which,
                ..Default::default()
            });
            conditions.len() - 1
        }
    };
    let condition = &mut conditions[idx];
    match update {
        ConditionUpdate::Ok { status, message } => {
            condition.status = status;
            condition.error = String::new();
            condition.message = message;
        }
        ConditionUpdate::Error { error } => {
            condition.status = false;
            condition.error = error;
        }
    }
}
