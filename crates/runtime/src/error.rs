// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Error types for the inference executor.

use accel_backend::BackendError;
use partition_ir::IrError;

/// Errors that can occur during inference execution.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The link table refers to an optimized-out producer whose consumer
    /// still exists. The partitioner must have replaced the parameter with
    /// a constant or erased the link upstream.
    #[error(
        "fatal: producer subgraph {producer} in the link table was optimized out, \
         but its consumer subgraph {consumer} was not"
    )]
    OptimizedOutProducer { producer: usize, consumer: usize },

    /// A subgraph exhausted its device list. Individual execution
    /// failures are retried on the next device and only become fatal
    /// through this variant.
    #[error("subgraph {index}: failed to compile; no more devices are left")]
    NoDeviceLeft { index: usize },

    /// The backend collaborator reported an error outside execution.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// The descriptor set is inconsistent.
    #[error("descriptor error: {0}")]
    Ir(#[from] IrError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}
