// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! # runtime
//!
//! The partitioned inference executor. It owns all per-inference state and
//! drives one end-to-end forward pass over a pre-partitioned model:
//!
//! - binds global inputs and results into per-subgraph *subrequests*,
//! - streams tensors across subgraph boundaries in place (wiring),
//! - pipelines function bodies against their closures so that unpacking
//!   for call `k + 1` overlaps execution of call `k`,
//! - runs *spatial* (tiled) execution for bodies compiled to a fixed tile
//!   size,
//! - and falls over to the next device when a subgraph fails to execute.
//!
//! Each top-level inference call is a synchronous operation; the only
//! internal concurrency is a scoped helper task that overlaps execution
//! with next-step preparation, plus bounded parallel fan-outs for tensor
//! copies.
//!
//! Compilation, partitioning, and device runtimes live behind the
//! `accel-backend` contracts; the descriptor set comes from `partition-ir`.

mod config;
mod error;
mod request;
mod weights_bank;

pub use config::ExecutorConfig;
pub use error::RuntimeError;
pub use request::{InferRequest, LinkFrom};
pub use weights_bank::DeviceWeightsBank;
