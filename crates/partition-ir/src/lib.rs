// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! # partition-ir
//!
//! The compiled-model descriptor set consumed by the partitioned inference
//! executor.
//!
//! A large model arrives pre-partitioned into an ordered list of
//! *subgraphs*. Some subgraphs are *function calls* that reuse a single
//! compiled *function body* with per-call constant tensors (*closures*).
//! This crate models that structure:
//!
//! - [`SubgraphDescriptor`] — one partition: its compiled I/O signature,
//!   function-call target, device list, closure tensors, and optional
//!   spatial (tiled) execution parameters.
//! - [`DescriptorSet`] — the ordered descriptors plus the link tables that
//!   map global inputs/outputs and inter-subgraph edges.
//! - [`ClosureStore`] — SafeTensors-backed loading of closure tensors,
//!   with a synthetic fallback for runs without weight files.
//!
//! # Type-State Validation
//! The descriptor set transitions through states enforced at compile time:
//!
//! ```text
//! DescriptorSet<Loaded>     — tables assembled, not yet checked.
//!       │  .validate()
//!       ▼
//! DescriptorSet<Validated>  — structure verified, ready for execution.
//! ```
//!
//! This prevents the executor from ever receiving an inconsistent
//! partitioning. The transition consumes the old state and returns the new
//! one at zero runtime cost.

mod closure_store;
mod descriptor;
mod error;
pub mod model;

pub use closure_store::ClosureStore;
pub use descriptor::{CompiledIo, HostGather, Spatial, SpatialParam, SubgraphDescriptor};
pub use error::IrError;
pub use model::{DescriptorSet, Loaded, SetState, Validated};
