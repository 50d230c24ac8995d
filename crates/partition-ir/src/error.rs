// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Error types for the descriptor set.

/// Errors that can occur while assembling or validating a descriptor set.
#[derive(Debug, thiserror::Error)]
pub enum IrError {
    /// A subgraph descriptor is internally inconsistent.
    #[error("invalid descriptor for subgraph {index}: {detail}")]
    InvalidDescriptor { index: usize, detail: String },

    /// A link table refers to endpoints that do not exist.
    #[error("invalid link: {0}")]
    InvalidLink(String),

    /// A closure tensor could not be loaded from the store.
    #[error("closure '{name}' failed to load: {detail}")]
    ClosureLoad { name: String, detail: String },
}
