// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Error types for device backends.

/// Errors surfaced by a device backend.
///
/// Subrequest execution failures are *recoverable* — the executor catches
/// them in its failover loop and retries on the next device. They become
/// fatal only when no devices remain.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// A subrequest failed to execute on its device.
    #[error("inference failed on device '{device}': {detail}")]
    InferFailed { device: String, detail: String },

    /// No device is available for the subgraph.
    #[error("no device available: {0}")]
    NoDevice(String),

    /// Subrequest creation failed.
    #[error("cannot create subrequest for subgraph {index}: {detail}")]
    CreateFailed { index: usize, detail: String },
}
