// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The descriptor set: ordered subgraphs plus their link tables.
//!
//! # Type-State Pattern
//!
//! ```text
//! DescriptorSet<Loaded>     — tables assembled, not yet checked.
//!       │  .validate()
//!       ▼
//! DescriptorSet<Validated>  — structure verified, ready for execution.
//! ```
//!
//! The executor only accepts a `DescriptorSet<Validated>`, so a broken
//! partitioning is rejected before any subrequest is created.

use crate::{IrError, SubgraphDescriptor};
use accel_backend::PortInfo;
use std::collections::BTreeMap;
use std::fmt;

// ── Type-state markers ─────────────────────────────────────────────

/// Marker: tables assembled but not validated.
#[derive(Debug, Clone)]
pub struct Loaded;

/// Marker: structure verified, ready for execution.
#[derive(Debug, Clone)]
pub struct Validated;

/// Sealed trait for descriptor-set states.
pub trait SetState: fmt::Debug + Clone {}
impl SetState for Loaded {}
impl SetState for Validated {}

// ── DescriptorSet ──────────────────────────────────────────────────

/// The complete partitioned model as the executor consumes it.
///
/// Link-table conventions:
/// - `inputs_to_submodels_inputs[g]` — where global input `g` lands, or
///   `None` when it has no direct consumer.
/// - `param_subscribers[g]` — additional `(subgraph, port)` consumers when
///   one global input fans out to several subgraphs.
/// - `outputs_to_submodels_outputs[g]` — which `(subgraph, port)` produces
///   global output `g`.
/// - `submodels_input_to_prev_output[(to_sub, to_port)] = (from_sub,
///   from_port)` — every inter-subgraph edge.
#[derive(Debug, Clone)]
pub struct DescriptorSet<S: SetState = Loaded> {
    /// Human-readable model name.
    pub name: String,
    /// Ordered subgraph descriptors.
    pub subgraphs: Vec<SubgraphDescriptor>,
    /// Global input ports of the whole network.
    pub inputs: Vec<PortInfo>,
    /// Global output ports of the whole network.
    pub outputs: Vec<PortInfo>,
    /// Global input index -> primary `(subgraph, input port)` consumer.
    pub inputs_to_submodels_inputs: Vec<Option<(usize, usize)>>,
    /// Global input index -> additional subscribed consumers.
    pub param_subscribers: BTreeMap<usize, Vec<(usize, usize)>>,
    /// Global output index -> `(subgraph, output port)` producer.
    pub outputs_to_submodels_outputs: Vec<(usize, usize)>,
    /// Inter-subgraph edges: consumer `(sub, port)` -> producer `(sub, port)`.
    pub submodels_input_to_prev_output: BTreeMap<(usize, usize), (usize, usize)>,
    _state: std::marker::PhantomData<S>,
}

// ── Loaded state ───────────────────────────────────────────────────

impl DescriptorSet<Loaded> {
    /// Creates a new set in the `Loaded` state with empty link tables.
    pub fn new(
        name: String,
        subgraphs: Vec<SubgraphDescriptor>,
        inputs: Vec<PortInfo>,
        outputs: Vec<PortInfo>,
    ) -> Self {
        let n_inputs = inputs.len();
        Self {
            name,
            subgraphs,
            inputs,
            outputs,
            inputs_to_submodels_inputs: vec![None; n_inputs],
            param_subscribers: BTreeMap::new(),
            outputs_to_submodels_outputs: Vec::new(),
            submodels_input_to_prev_output: BTreeMap::new(),
            _state: std::marker::PhantomData,
        }
    }

    /// Validates the set and transitions to the `Validated` state.
    ///
    /// # Checks
    /// - Function-call targets exist, designate themselves as bodies, and
    ///   carry a compiled executable.
    /// - Closure companion vectors (`update_required`, `scales`, `zerops`)
    ///   are sized consistently, and the body's input count equals
    ///   `param_base + closure.len()` at every call site.
    /// - Spatial tilings cover their range exactly and address in-bounds
    ///   parameters and output dimensions.
    /// - Host-gather indices address closure slots (source, destination)
    ///   and an activation parameter (lookup).
    /// - Link tables address existing subgraphs.
    pub fn validate(self) -> Result<DescriptorSet<Validated>, IrError> {
        let n = self.subgraphs.len();
        if n == 0 {
            return Err(IrError::InvalidLink("descriptor set is empty".into()));
        }

        for (i, desc) in self.subgraphs.iter().enumerate() {
            if let Some(real) = desc.replaced_by {
                if real >= n {
                    return Err(IrError::InvalidDescriptor {
                        index: i,
                        detail: format!("function body index {real} out of range"),
                    });
                }
                let body = &self.subgraphs[real];
                if body.replaced_by != Some(real) {
                    return Err(IrError::InvalidDescriptor {
                        index: i,
                        detail: format!("subgraph {real} is not a function body"),
                    });
                }
                let Some(body_io) = &body.compiled else {
                    return Err(IrError::InvalidDescriptor {
                        index: i,
                        detail: format!("function body {real} has no compiled executable"),
                    });
                };

                if desc.update_required.len() != desc.closure.len() {
                    return Err(IrError::InvalidDescriptor {
                        index: i,
                        detail: format!(
                            "update_required has {} entries for {} closures",
                            desc.update_required.len(),
                            desc.closure.len()
                        ),
                    });
                }
                for (what, v) in [("scales", &desc.scales), ("zerops", &desc.zerops)] {
                    if !v.is_empty() && v.len() != desc.closure.len() {
                        return Err(IrError::InvalidDescriptor {
                            index: i,
                            detail: format!(
                                "{what} has {} entries for {} closures",
                                v.len(),
                                desc.closure.len()
                            ),
                        });
                    }
                }
                if body_io.inputs.len() != desc.param_base + desc.closure.len() {
                    return Err(IrError::InvalidDescriptor {
                        index: i,
                        detail: format!(
                            "body has {} inputs; call site binds {} + {} closures",
                            body_io.inputs.len(),
                            desc.param_base,
                            desc.closure.len()
                        ),
                    });
                }

                if let Some(hg) = &desc.host_gather {
                    let closure_end = desc.param_base + desc.closure.len();
                    if hg.dst_idx < desc.param_base
                        || hg.dst_idx >= closure_end
                        || hg.src_idx < desc.param_base
                        || hg.src_idx >= closure_end
                        || hg.idx_idx >= desc.param_base
                    {
                        return Err(IrError::InvalidDescriptor {
                            index: i,
                            detail: format!(
                                "host_gather indices ({}, {}, {}) out of range",
                                hg.dst_idx, hg.src_idx, hg.idx_idx
                            ),
                        });
                    }
                }
            }

            if let Some(spatial) = &desc.spatial {
                if spatial.nway == 0
                    || spatial.nway * spatial.nway_iters + spatial.tail_size != spatial.range
                {
                    return Err(IrError::InvalidDescriptor {
                        index: i,
                        detail: format!(
                            "spatial tiling {}x{}+{} does not cover range {}",
                            spatial.nway, spatial.nway_iters, spatial.tail_size, spatial.range
                        ),
                    });
                }
                for p in &spatial.params {
                    if p.idx >= desc.param_base {
                        return Err(IrError::InvalidDescriptor {
                            index: i,
                            detail: format!(
                                "spatial param {} is not an activation parameter",
                                p.idx
                            ),
                        });
                    }
                }
            }
        }

        // Link tables must address existing subgraphs. Optimized-out
        // endpoints are a runtime concern: the wiring phase decides which
        // of those are fatal.
        for (g, link) in self.inputs_to_submodels_inputs.iter().enumerate() {
            if let Some((sub, _)) = link {
                if *sub >= n {
                    return Err(IrError::InvalidLink(format!(
                        "global input {g} maps to missing subgraph {sub}"
                    )));
                }
            }
        }
        for (g, (sub, _)) in self.outputs_to_submodels_outputs.iter().enumerate() {
            if *sub >= n {
                return Err(IrError::InvalidLink(format!(
                    "global output {g} maps to missing subgraph {sub}"
                )));
            }
        }
        for (&(to_sub, _), &(from_sub, _)) in &self.submodels_input_to_prev_output {
            if to_sub >= n || from_sub >= n {
                return Err(IrError::InvalidLink(format!(
                    "edge {from_sub} -> {to_sub} addresses a missing subgraph"
                )));
            }
        }

        tracing::debug!("descriptor set '{}' validated: {} subgraphs", self.name, n);
        Ok(DescriptorSet {
            name: self.name,
            subgraphs: self.subgraphs,
            inputs: self.inputs,
            outputs: self.outputs,
            inputs_to_submodels_inputs: self.inputs_to_submodels_inputs,
            param_subscribers: self.param_subscribers,
            outputs_to_submodels_outputs: self.outputs_to_submodels_outputs,
            submodels_input_to_prev_output: self.submodels_input_to_prev_output,
            _state: std::marker::PhantomData,
        })
    }
}

// ── Validated state ────────────────────────────────────────────────

impl DescriptorSet<Validated> {
    /// Returns the number of subgraphs.
    pub fn num_subgraphs(&self) -> usize {
        self.subgraphs.len()
    }

    /// Returns the descriptor at `idx`.
    pub fn descriptor(&self, idx: usize) -> &SubgraphDescriptor {
        &self.subgraphs[idx]
    }

    /// Returns the index whose compiled body executes for subgraph `idx`.
    pub fn real(&self, idx: usize) -> usize {
        self.subgraphs[idx].real(idx)
    }

    /// Returns `true` when subgraph `idx` is a function call (or body).
    pub fn is_function_call(&self, idx: usize) -> bool {
        self.subgraphs[idx].is_function_call()
    }

    /// Returns the compiled I/O signature backing subgraph `idx`,
    /// resolving function calls to their body.
    pub fn compiled_io(&self, idx: usize) -> Option<&crate::CompiledIo> {
        self.subgraphs[self.real(idx)].compiled.as_ref()
    }

    /// Returns a summary string describing the partitioning.
    pub fn summary(&self) -> String {
        let funcalls = self
            .subgraphs
            .iter()
            .filter(|d| d.is_function_call())
            .count();
        let optimized_out = self.subgraphs.iter().filter(|d| d.is_optimized_out()).count();
        format!(
            "Model '{}': {} subgraphs ({} function calls, {} optimized out), {} inputs, {} outputs",
            self.name,
            self.subgraphs.len(),
            funcalls,
            optimized_out,
            self.inputs.len(),
            self.outputs.len(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CompiledIo, Spatial, SpatialParam};
    use accel_backend::DeviceCursor;
    use std::sync::Arc;
    use tensor_core::{DType, Shape, Tensor};

    fn devices() -> Arc<DeviceCursor> {
        Arc::new(DeviceCursor::new(vec!["cpu".into()]))
    }

    fn io(n_in: usize, n_out: usize) -> CompiledIo {
        CompiledIo {
            inputs: (0..n_in)
                .map(|i| PortInfo::new(format!("in{i}"), DType::F32, Shape::vector(4)))
                .collect(),
            outputs: (0..n_out)
                .map(|i| PortInfo::new(format!("out{i}"), DType::F32, Shape::vector(4)))
                .collect(),
        }
    }

    fn globals(n: usize) -> Vec<PortInfo> {
        (0..n)
            .map(|i| PortInfo::new(format!("g{i}"), DType::F32, Shape::vector(4)))
            .collect()
    }

    #[test]
    fn test_validate_plain_chain() {
        let subgraphs = vec![
            SubgraphDescriptor::normal(io(1, 1), devices()),
            SubgraphDescriptor::normal(io(1, 1), devices()),
        ];
        let mut set = DescriptorSet::new("chain".into(), subgraphs, globals(1), globals(1));
        set.inputs_to_submodels_inputs = vec![Some((0, 0))];
        set.outputs_to_submodels_outputs = vec![(1, 0)];
        set.submodels_input_to_prev_output.insert((1, 0), (0, 0));

        let validated = set.validate().unwrap();
        assert_eq!(validated.num_subgraphs(), 2);
        assert!(!validated.is_function_call(0));
        assert_eq!(validated.real(1), 1);
    }

    #[test]
    fn test_validate_rejects_missing_body() {
        let mut call = SubgraphDescriptor::normal(io(1, 1), devices());
        call.replaced_by = Some(1); // 1 is not a body
        let subgraphs = vec![call, SubgraphDescriptor::normal(io(1, 1), devices())];
        let set = DescriptorSet::new("bad".into(), subgraphs, globals(1), globals(1));
        assert!(set.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_closure_arity() {
        let mut body = SubgraphDescriptor::normal(io(2, 1), devices());
        body.replaced_by = Some(0);
        body.param_base = 1;
        body.closure = vec![Tensor::zeros(Shape::vector(4), DType::F32)];
        body.update_required = vec![true, false]; // wrong length
        let set = DescriptorSet::new("bad".into(), vec![body], globals(1), globals(1));
        assert!(set.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_spatial() {
        let mut body = SubgraphDescriptor::normal(io(1, 1), devices());
        body.replaced_by = Some(0);
        body.param_base = 1;
        body.spatial = Some(Spatial {
            params: vec![SpatialParam { idx: 0, dim: 1 }],
            out_dim: 1,
            range: 10,
            nway: 4,
            nway_iters: 2,
            tail_size: 1, // 4*2+1 != 10
        });
        let set = DescriptorSet::new("bad".into(), vec![body], globals(1), globals(1));
        assert!(set.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_dangling_edge() {
        let subgraphs = vec![SubgraphDescriptor::normal(io(1, 1), devices())];
        let mut set = DescriptorSet::new("bad".into(), subgraphs, globals(1), globals(1));
        set.submodels_input_to_prev_output.insert((0, 0), (7, 0));
        assert!(set.validate().is_err());
    }

    #[test]
    fn test_summary() {
        let mut body = SubgraphDescriptor::normal(io(0, 1), devices());
        body.replaced_by = Some(1);
        let subgraphs = vec![SubgraphDescriptor::normal(io(1, 1), devices()), body];
        let mut set = DescriptorSet::new("m".into(), subgraphs, globals(1), globals(1));
        set.outputs_to_submodels_outputs = vec![(1, 0)];
        let validated = set.validate().unwrap();
        let s = validated.summary();
        assert!(s.contains("'m'"));
        assert!(s.contains("2 subgraphs"));
        assert!(s.contains("1 function calls"));
    }
}
