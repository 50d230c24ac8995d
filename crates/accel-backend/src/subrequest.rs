// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The subrequest capability set.
//!
//! A subrequest is one executable handle for a compiled subgraph. Different
//! devices provide different concrete implementations behind `dyn
//! Subrequest`; the executor only relies on the capability set below.

use crate::BackendError;
use std::time::Duration;
use tensor_core::{DType, Shape, Tensor};

/// Which side of a subrequest a port lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortKind {
    Input,
    Output,
}

/// Identifies a single input or output port of a subrequest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Port {
    pub kind: PortKind,
    pub index: usize,
}

impl Port {
    /// Input port at `index`.
    pub fn input(index: usize) -> Self {
        Self {
            kind: PortKind::Input,
            index,
        }
    }

    /// Output port at `index`.
    pub fn output(index: usize) -> Self {
        Self {
            kind: PortKind::Output,
            index,
        }
    }
}

/// Static description of a port: name, element type, and shape.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PortInfo {
    pub name: String,
    pub dtype: DType,
    pub shape: Shape,
}

impl PortInfo {
    pub fn new(name: impl Into<String>, dtype: DType, shape: Shape) -> Self {
        Self {
            name: name.into(),
            dtype,
            shape,
        }
    }
}

/// One profiling record reported by a subrequest.
#[derive(Debug, Clone)]
pub struct ProfilingRecord {
    /// Name of the executed node; the executor prefixes it with the
    /// subgraph index when flattening records.
    pub node_name: String,
    /// Wall-clock time spent in the node.
    pub real_time: Duration,
}

/// A named mutable state tensor owned by a subrequest.
#[derive(Debug, Clone)]
pub struct VariableState {
    pub name: String,
    pub tensor: Tensor,
}

/// Completion callback invoked when an async run finishes.
pub type CompletionCallback = Box<dyn FnOnce(Result<(), String>) + Send>;

/// One executable handle for a compiled subgraph.
///
/// All methods take `&self`: implementations are internally synchronised,
/// and handles are shared between the executor's main loop and the
/// `unsafe_during` helper task.
pub trait Subrequest: Send + Sync {
    /// Input port descriptions, in port order.
    fn inputs(&self) -> &[PortInfo];

    /// Output port descriptions, in port order.
    fn outputs(&self) -> &[PortInfo];

    /// Binds `tensor` to the given port.
    fn set_tensor(&self, port: Port, tensor: Tensor);

    /// Returns the tensor currently bound to the given port.
    fn get_tensor(&self, port: Port) -> Tensor;

    /// Starts an asynchronous inference.
    fn start_async(&self);

    /// Blocks until the asynchronous inference completes.
    fn wait(&self) -> Result<(), BackendError>;

    /// Runs one synchronous inference.
    fn infer(&self) -> Result<(), BackendError>;

    /// Requests cooperative cancellation of an in-flight inference.
    fn cancel(&self);

    /// Registers a completion callback for the next async run.
    fn set_callback(&self, callback: CompletionCallback);

    /// Returns the subrequest's variable states.
    fn query_state(&self) -> Vec<VariableState>;

    /// Returns per-node profiling records for the last run.
    fn get_profiling_info(&self) -> Vec<ProfilingRecord>;

    /// The device this subrequest was created on.
    fn device(&self) -> &str;
}
