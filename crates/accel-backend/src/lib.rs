// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! # accel-backend
//!
//! Contracts between the partitioned inference executor and the device
//! runtime it schedules work on.
//!
//! The executor never talks to an accelerator directly. It drives:
//! - [`Subrequest`] — one executable handle for a compiled subgraph, with
//!   the capability set `{set_tensor, get_tensor, start_async, wait, infer,
//!   cancel, set_callback, query_state, get_profiling_info}`.
//! - [`Backend`] — the subrequest factory, the compile-for-success
//!   fallback, and the copy-required policy.
//! - [`WeightsBank`] — read-only provider of device-resident constant
//!   tensors.
//! - [`DeviceCursor`] — a fallback-ordered device list with a monotonic
//!   failure cursor.
//!
//! The [`loopback`] module provides an in-process backend that executes
//! subgraph bodies as host closures, with instrumented counters and
//! per-device failure injection. It backs the test suite and examples the
//! same way a synthetic weight loader backs runs without model files.

mod backend;
mod device;
mod error;
pub mod loopback;
mod subrequest;

pub use backend::{Backend, WeightsBank};
pub use device::DeviceCursor;
pub use error::BackendError;
pub use subrequest::{
    CompletionCallback, Port, PortInfo, PortKind, ProfilingRecord, Subrequest, VariableState,
};
