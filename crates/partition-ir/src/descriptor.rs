// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Per-subgraph descriptors.
//!
//! A descriptor carries everything the executor needs to know about one
//! partition *before* any subrequest exists: whether it has a compiled
//! executable at all, whether it is a function call into another
//! descriptor's body, which devices it may run on, and the closure tensors
//! appended to the body's parameter list for this particular call site.

use accel_backend::{DeviceCursor, PortInfo};
use std::sync::Arc;
use tensor_core::Tensor;

/// The I/O signature of a compiled subgraph executable.
#[derive(Debug, Clone)]
pub struct CompiledIo {
    pub inputs: Vec<PortInfo>,
    pub outputs: Vec<PortInfo>,
}

/// One spatial input parameter: body input `idx`, sliced along `dim`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SpatialParam {
    pub idx: usize,
    pub dim: usize,
}

/// Tiled-execution parameters for a function body.
///
/// The body is compiled to consume and produce `nway` elements along the
/// relevant dimensions; the full `range` is covered by `nway_iters` whole
/// tiles plus a `tail_size` remainder staged through scratch buffers.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Spatial {
    pub params: Vec<SpatialParam>,
    /// The sliced dimension on every output.
    pub out_dim: usize,
    /// Full extent of the sliced dimension.
    pub range: usize,
    /// Tile size the body was compiled for.
    pub nway: usize,
    /// Number of whole tiles: `range / nway`.
    pub nway_iters: usize,
    /// Remainder: `range - nway * nway_iters`.
    pub tail_size: usize,
}

impl Spatial {
    /// Builds the tiling for a full `range` at tile size `nway`.
    pub fn over(params: Vec<SpatialParam>, out_dim: usize, range: usize, nway: usize) -> Self {
        Self {
            params,
            out_dim,
            range,
            nway,
            nway_iters: range / nway,
            tail_size: range % nway,
        }
    }
}

/// Directs a host-side gather into a closure slot before each call.
///
/// Indices are absolute body-input indices: `dst_idx` and `src_idx` address
/// closure slots (at or past `param_base`), `idx_idx` addresses the lookup
/// tensor among the activation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct HostGather {
    pub dst_idx: usize,
    pub src_idx: usize,
    pub idx_idx: usize,
}

/// Everything the executor knows about one subgraph, immutable per compile.
#[derive(Clone)]
pub struct SubgraphDescriptor {
    /// I/O signature of the compiled executable. Absent together with
    /// `replaced_by` means the subgraph was optimized out entirely.
    pub compiled: Option<CompiledIo>,
    /// Index of the descriptor whose compiled body this subgraph invokes.
    /// `replaced_by == self` marks the function body itself.
    pub replaced_by: Option<usize>,
    /// Fallback-ordered device list; the cursor advances on failure and is
    /// shared across inference requests.
    pub devices: Arc<DeviceCursor>,
    /// Number of activation parameters before the closure slots.
    pub param_base: usize,
    /// Constant parameter tensors appended after `param_base`.
    pub closure: Vec<Tensor>,
    /// Whether `closure[i]` must be rebound per inference. Slots with
    /// `false` are bound once at request construction and never again.
    pub update_required: Vec<bool>,
    /// Optional dequantisation scales, parallel to `closure`.
    pub scales: Vec<Option<Tensor>>,
    /// Optional dequantisation zero-points, parallel to `closure`.
    pub zerops: Vec<Option<Tensor>>,
    /// Host-side gather to run before unpacking closures.
    pub host_gather: Option<HostGather>,
    /// Tiled execution parameters; presence makes execution iterative.
    pub spatial: Option<Spatial>,
}

impl SubgraphDescriptor {
    /// A plain compiled subgraph: no function call, no closures.
    pub fn normal(compiled: CompiledIo, devices: Arc<DeviceCursor>) -> Self {
        Self {
            compiled: Some(compiled),
            replaced_by: None,
            devices,
            param_base: 0,
            closure: Vec::new(),
            update_required: Vec::new(),
            scales: Vec::new(),
            zerops: Vec::new(),
            host_gather: None,
            spatial: None,
        }
    }

    /// A subgraph that was optimized out by the partitioner.
    pub fn optimized_out(devices: Arc<DeviceCursor>) -> Self {
        Self {
            compiled: None,
            replaced_by: None,
            devices,
            param_base: 0,
            closure: Vec::new(),
            update_required: Vec::new(),
            scales: Vec::new(),
            zerops: Vec::new(),
            host_gather: None,
            spatial: None,
        }
    }

    /// `true` when there is neither an executable nor a function body to
    /// borrow — nothing to run.
    pub fn is_optimized_out(&self) -> bool {
        self.compiled.is_none() && self.replaced_by.is_none()
    }

    /// `true` when this descriptor invokes a function body (possibly its
    /// own — the body itself also answers `true`).
    pub fn is_function_call(&self) -> bool {
        self.replaced_by.is_some()
    }

    /// The index whose compiled body executes for this subgraph.
    pub fn real(&self, self_idx: usize) -> usize {
        self.replaced_by.unwrap_or(self_idx)
    }
}

impl std::fmt::Debug for SubgraphDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubgraphDescriptor")
            .field("compiled", &self.compiled.is_some())
            .field("replaced_by", &self.replaced_by)
            .field("param_base", &self.param_base)
            .field("closures", &self.closure.len())
            .field("spatial", &self.spatial.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tensor_core::{DType, Shape};

    fn devices() -> Arc<DeviceCursor> {
        Arc::new(DeviceCursor::new(vec!["cpu".into()]))
    }

    fn io() -> CompiledIo {
        CompiledIo {
            inputs: vec![PortInfo::new("in", DType::F32, Shape::vector(4))],
            outputs: vec![PortInfo::new("out", DType::F32, Shape::vector(4))],
        }
    }

    #[test]
    fn test_normal_descriptor() {
        let d = SubgraphDescriptor::normal(io(), devices());
        assert!(!d.is_optimized_out());
        assert!(!d.is_function_call());
        assert_eq!(d.real(3), 3);
    }

    #[test]
    fn test_optimized_out() {
        let d = SubgraphDescriptor::optimized_out(devices());
        assert!(d.is_optimized_out());
    }

    #[test]
    fn test_function_call_real() {
        let mut d = SubgraphDescriptor::normal(io(), devices());
        d.replaced_by = Some(1);
        assert!(d.is_function_call());
        assert_eq!(d.real(2), 1);
    }

    #[test]
    fn test_spatial_over() {
        let s = Spatial::over(vec![SpatialParam { idx: 0, dim: 1 }], 1, 10, 4);
        assert_eq!(s.nway_iters, 2);
        assert_eq!(s.tail_size, 2);
        assert_eq!(s.nway * s.nway_iters + s.tail_size, s.range);
    }
}
