// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The per-inference request: one object owning all runtime state for one
//! end-to-end forward pass over a partitioned model.
//!
//! ```text
//! global inputs ──> bind_global_parameters ──┐
//!                                            ▼
//!            ┌─────────────── subrequest[0] ── ... ── subrequest[N-1]
//!            │ wiring: consumer.input = producer.output (in place)
//!            │ function calls: outputs land in FuncallResult[call site]
//!            │ spatial bodies: tiled loop over views of SpatialIo
//!            ▼
//! global outputs (bound to the last producers before execution)
//! ```
//!
//! Execution is strictly in subgraph-index order. While subgraph `k`
//! executes, the caller's thread (or a scoped helper task, for spatial
//! bodies) prepares subgraph `k + 1`: global parameters are bound, and —
//! with function pipelining on — the next call's closures are unpacked
//! into the body's reserve subrequest. On failure the device cursor
//! advances, the body is recompiled, the subrequests are recreated and
//! rewired, and the step is retried.

use crate::{ExecutorConfig, RuntimeError};
use accel_backend::{
    Backend, BackendError, CompletionCallback, Port, ProfilingRecord, Subrequest, VariableState,
    WeightsBank,
};
use partition_ir::{DescriptorSet, SubgraphDescriptor, Validated};
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tensor_core::Tensor;

/// Identifies any tensor produced in-network: `(subgraph, output port)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkFrom {
    pub sub_idx: usize,
    pub out_idx: usize,
}

/// Sentinel for "no subgraph is executing right now".
const NO_SUBGRAPH: usize = usize::MAX;

/// Reserve handle and successor link for one function body.
struct PipelineSlot {
    /// The reserve subrequest, prepared while the primary executes.
    subrequest: Option<Arc<dyn Subrequest>>,
    /// The next subgraph that will invoke the same body, if any.
    next: Option<usize>,
}

/// Deferred bindings for one spatial body.
#[derive(Default)]
struct SpatialIo {
    inputs: Vec<Option<Tensor>>,
    input_tails: Vec<Option<Tensor>>,
    outputs: Vec<Option<Tensor>>,
    output_tails: Vec<Option<Tensor>>,
}

/// Global-to-subrequest port maps for one subgraph.
#[derive(Default)]
struct GlobalIo {
    /// global input index -> subrequest input index
    global_params: BTreeMap<usize, usize>,
    /// global output index -> subrequest output index
    global_results: BTreeMap<usize, usize>,
}

/// A bound global port tensor and whether this request allocated it.
struct TensorStorage {
    tensor: Tensor,
    owned: bool,
}

/// The per-inference executor state.
pub struct InferRequest {
    model: Arc<DescriptorSet<Validated>>,
    backend: Arc<dyn Backend>,
    bank: Arc<dyn WeightsBank>,
    config: ExecutorConfig,
    use_function_pipelining: bool,

    /// One executable handle per subgraph *body* index. Function-call
    /// sites hold `None` and borrow the slot at their `real` index.
    subrequests: Vec<Option<Arc<dyn Subrequest>>>,
    /// Device each live slot was created on, to detect recompiles made by
    /// sibling requests.
    subrequest_devices: Vec<Option<String>>,
    funcall_pipeline: Vec<PipelineSlot>,
    /// First call site of each function body, in subgraph order.
    funcall_heads: Vec<usize>,
    /// Preallocated output tensors per function-call site. Downstream
    /// consumers read from here, never from the (reused) body subrequest.
    funcall_result: HashMap<LinkFrom, Tensor>,
    spatial_io: Vec<Mutex<SpatialIo>>,
    subrequests_gio: Vec<GlobalIo>,
    input_tensors: Vec<TensorStorage>,
    output_tensors: Vec<TensorStorage>,
    /// Index of the subgraph currently executing (`NO_SUBGRAPH` when idle);
    /// read by the helper task to pick primary vs reserve.
    now_idx: AtomicUsize,
}

impl InferRequest {
    /// Builds the full per-inference state: subrequests, funcall result
    /// tensors, spatial scratch buffers, pipeline links, global I/O
    /// tensors and maps, wiring, and the one-time closure bindings.
    pub fn new(
        model: Arc<DescriptorSet<Validated>>,
        backend: Arc<dyn Backend>,
        bank: Arc<dyn WeightsBank>,
        config: ExecutorConfig,
    ) -> Result<Self, RuntimeError> {
        let n = model.num_subgraphs();
        let use_function_pipelining = config.funcall_pipelining;
        if use_function_pipelining {
            tracing::warn!(
                "function call pipelining is enabled for '{}', expect higher memory consumption",
                model.name,
            );
        }

        let mut request = Self {
            model: Arc::clone(&model),
            backend,
            bank,
            config,
            use_function_pipelining,
            subrequests: vec![None; n],
            subrequest_devices: vec![None; n],
            funcall_pipeline: (0..n)
                .map(|_| PipelineSlot {
                    subrequest: None,
                    next: None,
                })
                .collect(),
            funcall_heads: Vec::new(),
            funcall_result: HashMap::new(),
            spatial_io: (0..n).map(|_| Mutex::new(SpatialIo::default())).collect(),
            subrequests_gio: (0..n).map(|_| GlobalIo::default()).collect(),
            input_tensors: Vec::new(),
            output_tensors: Vec::new(),
            now_idx: AtomicUsize::new(NO_SUBGRAPH),
        };

        // Create subrequests; preallocate funcall result tensors and
        // spatial scratch buffers as we go.
        let mut failover_happened = false;
        for i in 0..n {
            let desc = model.descriptor(i);
            if desc.is_optimized_out() {
                tracing::info!("subgraph {i}: optimized out");
                continue;
            }

            if let Some(real_idx) = desc.replaced_by {
                let proto_desc = model.descriptor(real_idx);
                let proto_io = proto_desc
                    .compiled
                    .as_ref()
                    .expect("validated function body has compiled I/O");
                let num_outputs = proto_io.outputs.len();

                // Initialise the spatial I/O placeholders, if required.
                if let Some(spatial) = &proto_desc.spatial {
                    let mut sio = request.spatial_io[real_idx]
                        .lock()
                        .expect("spatial I/O lock poisoned");
                    sio.inputs = vec![None; proto_desc.param_base];
                    sio.input_tails = vec![None; proto_desc.param_base];
                    sio.outputs = vec![None; num_outputs];
                    sio.output_tails = vec![None; num_outputs];

                    if spatial.tail_size > 0 {
                        // Tail scratch buffers cover the entire NWAY even
                        // though only tail_size elements are meaningful.
                        for p in &spatial.params {
                            let iport = &proto_io.inputs[p.idx];
                            sio.input_tails[p.idx] =
                                Some(Tensor::zeros(iport.shape.clone(), iport.dtype));
                        }
                        for (out_idx, oport) in proto_io.outputs.iter().enumerate() {
                            sio.output_tails[out_idx] =
                                Some(Tensor::zeros(oport.shape.clone(), oport.dtype));
                        }
                    }
                }

                // Preallocate this call site's result tensors. For spatial
                // bodies the sliced dimension is promoted to the full range.
                for (out_idx, oport) in proto_io.outputs.iter().enumerate() {
                    let mut shape = oport.shape.clone();
                    if let Some(spatial) = &proto_desc.spatial {
                        shape = shape.with_dim(spatial.out_dim, spatial.range);
                    }
                    request.funcall_result.insert(
                        LinkFrom {
                            sub_idx: i,
                            out_idx,
                        },
                        Tensor::zeros(shape, oport.dtype),
                    );
                }

                if real_idx != i {
                    // Not the function body: the body's subrequest is used.
                    tracing::info!("subgraph {i}: reuses body {real_idx}");
                    continue;
                }
            }

            tracing::info!("subgraph {i}: creating subrequest(s)");
            let count = if desc.is_function_call() && use_function_pipelining {
                2
            } else {
                1
            };
            let mut recompiled = false;
            let rqs = request
                .backend
                .create_subrequests(i, count, &mut recompiled)?;
            failover_happened |= recompiled;
            request.subrequests[i] = Some(Arc::clone(&rqs[0]));
            request.subrequest_devices[i] = desc.devices.current();
            if desc.is_function_call() && use_function_pipelining {
                request.funcall_pipeline[i].subrequest = Some(Arc::clone(&rqs[1]));
            }
        }

        if failover_happened {
            tracing::info!("refined device distribution:");
            request.backend.log_device_distribution();
        }

        // Identify connections for the funcall pipeline, if needed.
        if use_function_pipelining {
            tracing::info!("setting up the funcall pipeline...");
            let mut prevs: Vec<Option<usize>> = vec![None; n];
            for i in 0..n {
                let desc = model.descriptor(i);
                if let Some(real_idx) = desc.replaced_by {
                    if let Some(prev) = prevs[real_idx] {
                        tracing::info!(
                            "subgraph {i}: successor of subgraph {prev} in the function pipeline"
                        );
                        request.funcall_pipeline[prev].next = Some(i);
                    } else {
                        tracing::info!("subgraph {i}: head of a function pipeline");
                        request.funcall_heads.push(i);
                    }
                    prevs[real_idx] = Some(i);
                }
            }
        }

        // Preallocate global input tensors.
        for port in &model.inputs {
            request.input_tensors.push(TensorStorage {
                tensor: Tensor::zeros(port.shape.clone(), port.dtype),
                owned: true,
            });
        }

        // Preallocate global output tensors. Outputs produced by function
        // calls already have their tensors in funcall_result — reuse them.
        for (g, port) in model.outputs.iter().enumerate() {
            let (sub_idx, out_idx) = model.outputs_to_submodels_outputs[g];
            let tensor = request
                .funcall_result
                .get(&LinkFrom { sub_idx, out_idx })
                .cloned()
                .unwrap_or_else(|| Tensor::zeros(port.shape.clone(), port.dtype));
            request.output_tensors.push(TensorStorage {
                tensor,
                owned: true,
            });
        }

        request.connect_subrequests()?;

        // Build the parameter/result mapping.
        for (g, link) in model.inputs_to_submodels_inputs.iter().enumerate() {
            if let Some((sub_idx, in_idx)) = link {
                request.subrequests_gio[*sub_idx].global_params.insert(g, *in_idx);
            }
        }
        for (&param_idx, subscribers) in &model.param_subscribers {
            for &(sub_idx, in_idx) in subscribers {
                request.subrequests_gio[sub_idx]
                    .global_params
                    .insert(param_idx, in_idx);
            }
        }
        for (g, &(sub_idx, out_idx)) in model.outputs_to_submodels_outputs.iter().enumerate() {
            request.subrequests_gio[sub_idx].global_results.insert(g, out_idx);
        }

        // Closures that never change are resolved exactly once, right here.
        for i in 0..n {
            request.preset_static_closures(i);
        }

        Ok(request)
    }

    // ── Wiring ─────────────────────────────────────────────────

    /// Materialises the link table: points every consumer input port at
    /// its producer's output tensor. Idempotent; re-run after any
    /// subrequest recreation.
    fn connect_subrequests(&self) -> Result<(), RuntimeError> {
        tracing::info!("connecting subrequests...");
        for (&(to_sub, to_port), &(from_sub, from_port)) in
            &self.model.submodels_input_to_prev_output
        {
            tracing::debug!("subgraph {from_sub}/{from_port} --> subgraph {to_sub}/{to_port}");

            let from_is_funcall = self.model.is_function_call(from_sub);
            let to_is_funcall = self.model.is_function_call(to_sub);

            if from_is_funcall && to_is_funcall {
                // Resolved per-invocation in the function prologue.
                tracing::debug!("skip: both are function calls");
            } else if from_is_funcall {
                // Consumer reads the call site's preallocated result tensor.
                let Some(to_rq) = &self.subrequests[to_sub] else {
                    tracing::warn!(
                        "link consumer subgraph {to_sub} was optimized out; skipping"
                    );
                    continue;
                };
                let tensor = self
                    .funcall_result
                    .get(&LinkFrom {
                        sub_idx: from_sub,
                        out_idx: from_port,
                    })
                    .expect("funcall result preallocated for every body output")
                    .clone();
                to_rq.set_tensor(Port::input(to_port), tensor);
            } else if to_is_funcall {
                // Resolved per-invocation in the function prologue.
                tracing::debug!("skip: consumer is a function call");
            } else if self.subrequests[from_sub].is_none() && self.subrequests[to_sub].is_some() {
                // A live consumer fed by an optimized-out producer: the
                // partitioner should have erased the link or folded the
                // parameter into a constant.
                return Err(RuntimeError::OptimizedOutProducer {
                    producer: from_sub,
                    consumer: to_sub,
                });
            } else if self.subrequests[to_sub].is_none() {
                // Historical: such links should not be in the table at all.
                tracing::warn!("link consumer subgraph {to_sub} was optimized out; skipping");
            } else {
                let from_rq = self.subrequests[from_sub]
                    .as_ref()
                    .expect("producer subrequest exists");
                let to_rq = self.subrequests[to_sub]
                    .as_ref()
                    .expect("consumer subrequest exists");
                let tensor = from_rq.get_tensor(Port::output(from_port));
                to_rq.set_tensor(Port::input(to_port), tensor);
            }
        }
        Ok(())
    }

    // ── Closures ───────────────────────────────────────────────

    /// Resolves the `update_required = false` closure slots of call site
    /// `idx` once: type-matching closures bind through the weights bank;
    /// type-mismatching ones are dequantised into the port's tensor.
    /// Re-run only when the body's subrequests are recreated.
    fn preset_static_closures(&self, idx: usize) {
        let desc = self.model.descriptor(idx);
        if !desc.is_function_call() || desc.closure.is_empty() {
            return;
        }
        let real_idx = self.model.real(idx);
        let func_desc = self.model.descriptor(real_idx);
        let Some(func_io) = &func_desc.compiled else {
            return;
        };
        let device = func_desc.devices.current().unwrap_or_default();

        let mut targets: Vec<Arc<dyn Subrequest>> = Vec::with_capacity(2);
        if let Some(rq) = &self.subrequests[real_idx] {
            targets.push(Arc::clone(rq));
        }
        if let Some(rq) = &self.funcall_pipeline[real_idx].subrequest {
            targets.push(Arc::clone(rq));
        }

        for (cidx, closure) in desc.closure.iter().enumerate() {
            if desc.update_required[cidx] {
                continue;
            }
            let port = Port::input(desc.param_base + cidx);
            let port_dtype = func_io.inputs[desc.param_base + cidx].dtype;
            for rq in &targets {
                if closure.dtype() != port_dtype {
                    let clparam = rq.get_tensor(port);
                    unpack_into(desc, cidx, closure, &clparam);
                } else {
                    rq.set_tensor(port, self.bank.get(closure, &device));
                }
            }
        }
    }

    /// Binds the runtime-updatable closure slots of call site `idx` into
    /// `request`: rebind by handle where the device allows it, deep-copy
    /// in parallel where it does not, dequantise where the element types
    /// differ.
    fn unpack_closure(&self, idx: usize, request: &Arc<dyn Subrequest>) {
        let desc = self.model.descriptor(idx);
        debug_assert!(desc.is_function_call(), "unpack_closure on a non-function call");
        let do_copy = self.backend.needs_copy(idx);

        // First do the easy rebinds and sort the heavy work.
        let mut closure_unpack_required: Vec<usize> = Vec::new();
        let mut closure_copy_required: Vec<usize> = Vec::new();
        for cidx in 0..desc.closure.len() {
            if !desc.update_required[cidx] {
                continue; // bound once at construction
            }
            let port = Port::input(desc.param_base + cidx);
            let clparam = request.get_tensor(port);
            if desc.closure[cidx].dtype() != clparam.dtype() {
                closure_unpack_required.push(cidx);
            } else if do_copy {
                closure_copy_required.push(cidx);
            } else {
                request.set_tensor(port, desc.closure[cidx].clone());
            }
        }

        closure_copy_required.par_iter().for_each(|&cidx| {
            let clparam = request.get_tensor(Port::input(desc.param_base + cidx));
            desc.closure[cidx].copy_to(&clparam);
        });

        for &cidx in &closure_unpack_required {
            let clparam = request.get_tensor(Port::input(desc.param_base + cidx));
            unpack_into(desc, cidx, &desc.closure[cidx], &clparam);
        }
    }

    // ── Global I/O binding ─────────────────────────────────────

    /// Binds the global input tensors subscribed to subgraph `idx`.
    ///
    /// Spatial parameters are registered in `SpatialIo` instead of being
    /// bound directly — the tiled loop rebinds sliced views per iteration.
    /// When the target body is the one executing right now and pipelining
    /// is on, the reserve subrequest is prepared instead of the primary.
    fn bind_global_parameters(&self, idx: usize) {
        tracing::debug!("binding parameters for subgraph {idx}");
        let desc = self.model.descriptor(idx);
        let real_idx = self.model.real(idx);
        let do_copy = self.backend.needs_copy(idx);
        let proto_desc = self.model.descriptor(real_idx);
        let spatial = proto_desc.spatial.as_ref();

        let now = self.now_idx.load(Ordering::Acquire);
        let subr: Arc<dyn Subrequest> = if now != NO_SUBGRAPH
            && real_idx == self.model.real(now)
            && self.use_function_pipelining
        {
            tracing::debug!("accessing the reserve subrequest");
            self.funcall_pipeline[real_idx]
                .subrequest
                .clone()
                .expect("reserve subrequest exists when pipelining")
        } else {
            tracing::debug!("accessing the primary subrequest");
            self.subrequests[real_idx]
                .clone()
                .expect("live subgraph has a subrequest")
        };

        let is_spatial_param = |sub_in_idx: usize| {
            spatial.is_some_and(|s| s.params.iter().any(|p| p.idx == sub_in_idx))
        };

        // A list of tensors to copy, if the device cannot share memory.
        let mut copy_list: Vec<(Tensor, Port)> = Vec::new();
        for (&param_idx, &sub_in_idx) in &self.subrequests_gio[idx].global_params {
            tracing::debug!("processing global input {param_idx} -> port {sub_in_idx}");
            let g_tnsr = self.input_tensors[param_idx].tensor.clone();
            if !is_spatial_param(sub_in_idx) {
                if do_copy {
                    copy_list.push((g_tnsr, Port::input(sub_in_idx)));
                } else {
                    subr.set_tensor(Port::input(sub_in_idx), g_tnsr);
                }
            } else {
                // Register for the tiled loop.
                self.spatial_io[real_idx]
                    .lock()
                    .expect("spatial I/O lock poisoned")
                    .inputs[sub_in_idx] = Some(g_tnsr);
            }
        }

        copy_list.par_iter().for_each(|(src, port)| {
            let dst = subr.get_tensor(*port);
            src.copy_to(&dst);
        });

        // Run the host-side gather, if required.
        if let Some(hg) = &desc.host_gather {
            let dst = &desc.closure[hg.dst_idx - desc.param_base];
            let vocab = &desc.closure[hg.src_idx - desc.param_base];
            let lookup = subr.get_tensor(Port::input(hg.idx_idx));
            tensor_core::gather(vocab, &lookup, dst);
        }
    }

    /// Points subgraph `idx`'s output ports at the global result tensors.
    /// Function calls are skipped — the prologue binds their results.
    fn bind_global_results(&self, idx: usize) {
        let desc = self.model.descriptor(idx);
        if desc.is_function_call() {
            tracing::debug!("subgraph {idx}: function binds its own results");
            return;
        }
        let Some(rq) = &self.subrequests[idx] else {
            return;
        };
        for (&result_idx, &sub_out_idx) in &self.subrequests_gio[idx].global_results {
            rq.set_tensor(
                Port::output(sub_out_idx),
                self.output_tensors[result_idx].tensor.clone(),
            );
        }
    }

    // ── Function calls ─────────────────────────────────────────

    /// Prepares the body for one invocation from call site `idx`:
    /// resolves the activation parameters from their producers, unpacks
    /// closures inline when pipelining is off, and points the body's
    /// outputs at this call's result tensors.
    fn function_prologue(&self, idx: usize) {
        tracing::debug!("subgraph {idx}: function prologue");
        let desc = self.model.descriptor(idx);
        let real_idx = desc.replaced_by.expect("prologue is only for function calls");
        let func_desc = self.model.descriptor(real_idx);
        let is_spatial = func_desc.spatial.is_some();
        let rq = self.subrequests[real_idx]
            .clone()
            .expect("function body has a subrequest");

        for i in 0..func_desc.param_base {
            let Some(&(prod_idx, prod_port)) =
                self.model.submodels_input_to_prev_output.get(&(idx, i))
            else {
                continue;
            };
            let tensor = if !self.model.is_function_call(prod_idx) {
                // Producer is a normal subgraph: take its tensor directly.
                self.subrequests[prod_idx]
                    .as_ref()
                    .expect("producer subrequest exists")
                    .get_tensor(Port::output(prod_port))
            } else {
                // Producer is a function call, possibly the same body we
                // are about to run: read its call-site result tensor.
                self.funcall_result
                    .get(&LinkFrom {
                        sub_idx: prod_idx,
                        out_idx: prod_port,
                    })
                    .expect("funcall result preallocated for every body output")
                    .clone()
            };
            if is_spatial {
                self.spatial_io[real_idx]
                    .lock()
                    .expect("spatial I/O lock poisoned")
                    .inputs[i] = Some(tensor);
            } else {
                rq.set_tensor(Port::input(i), tensor);
            }
        }

        // With pipelining the closures were unpacked while the previous
        // subgraph executed; see unsafe_run_this_prep_next.
        if !self.use_function_pipelining {
            tracing::debug!("unpacking closures...");
            self.unpack_closure(idx, &rq);
        }

        // Tell the body which results to produce this time. This covers
        // both internal tensors read by other subgraphs and the Result
        // tensors of the entire network, since global outputs produced by
        // function calls are the funcall_result tensors themselves.
        let num_outputs = func_desc
            .compiled
            .as_ref()
            .expect("validated function body has compiled I/O")
            .outputs
            .len();
        for out_idx in 0..num_outputs {
            let tensor = self
                .funcall_result
                .get(&LinkFrom {
                    sub_idx: idx,
                    out_idx,
                })
                .expect("funcall result preallocated for every body output")
                .clone();
            if is_spatial {
                self.spatial_io[real_idx]
                    .lock()
                    .expect("spatial I/O lock poisoned")
                    .outputs[out_idx] = Some(tensor);
            } else {
                rq.set_tensor(Port::output(out_idx), tensor);
            }
        }
    }

    // ── Execution ──────────────────────────────────────────────

    /// Binds global parameters for the first live subgraph and pre-fills
    /// the head of every function pipeline with its closures.
    pub fn prepare_for_infer(&self) -> Result<(), RuntimeError> {
        tracing::debug!("preparing to infer...");
        self.bind_global_parameters(self.next_valid(0));

        for &head in &self.funcall_heads {
            tracing::debug!("pre-initialising closures for subgraph {head}");
            let rq = self.subrequests[self.model.real(head)]
                .clone()
                .expect("pipeline head body has a subrequest");
            self.unpack_closure(head, &rq);
        }
        Ok(())
    }

    /// Runs every subgraph in index order. The standard entry point.
    pub fn infer(&mut self) -> Result<(), RuntimeError> {
        self.prepare_for_infer()?;
        for idx in 0..self.model.num_subgraphs() {
            if !self.valid_subrequest(idx) {
                tracing::debug!("subgraph {idx}: nothing to run");
                continue;
            }
            let failover = self.run_subrequest_for_success(idx)?;
            if failover {
                tracing::info!("refined device distribution:");
                self.backend.log_device_distribution();
            }
        }
        Ok(())
    }

    /// Executes subgraph `idx`, retrying across devices until it succeeds
    /// or the device list is exhausted. Returns `true` if a failover
    /// happened.
    pub fn run_subrequest_for_success(&mut self, idx: usize) -> Result<bool, RuntimeError> {
        let mut failover = false;
        let real_idx = self.model.real(idx);
        self.now_idx.store(idx, Ordering::Release);

        let mut dumped_in = false;
        let mut next_prepared = false;
        let mut recreated = false;
        loop {
            // Another inference request over the same model may have
            // recompiled this body for a different device already.
            let active_device = self.model.descriptor(real_idx).devices.current();
            if self.subrequest_devices[real_idx] != active_device {
                tracing::info!(
                    "subgraph {real_idx}: recreating subrequest; body was recompiled for '{}'",
                    active_device.as_deref().unwrap_or("<none>"),
                );
                self.recreate_subrequests(real_idx)?;
                recreated = true;
            }

            // Feeding the global parameters is part of the common
            // execution pipeline (see unsafe_run_this_prep_next); here we
            // only bind this subgraph's outputs to global results.
            self.bind_global_results(idx);
            if self.model.is_function_call(idx) {
                self.function_prologue(idx);
            }
            if recreated && self.use_function_pipelining && self.model.is_function_call(idx) {
                // With pipelining the prologue does not unpack: this
                // call's closures lived on the retired primary and must be
                // reloaded into the fresh one.
                recreated = false;
                let rq = self.subrequests[real_idx]
                    .clone()
                    .expect("recreated body has a subrequest");
                self.unpack_closure(idx, &rq);
            }
            if !dumped_in {
                dumped_in = true;
                self.dump_input_tensors(idx);
            }

            tracing::debug!("trying to run subgraph {idx}...");
            match self.unsafe_run_this_prep_next(idx, &mut next_prepared) {
                Ok(()) => break,
                Err(err) => {
                    tracing::error!("subgraph {idx}: failed to run subrequest: {err}");
                    failover = true;
                    tracing::info!("subgraph {idx}: trying next device...");
                    self.model.descriptor(idx).devices.advance();
                    if !self.backend.compile_for_success(real_idx) {
                        self.now_idx.store(NO_SUBGRAPH, Ordering::Release);
                        return Err(RuntimeError::NoDeviceLeft { index: real_idx });
                    }
                    self.recreate_subrequests(idx)?;
                    recreated = true;
                }
            }
        }

        self.dump_output_tensors(idx);
        if self.use_function_pipelining && self.funcall_pipeline[idx].next.is_some() {
            // The reserve was prepared for the next call while we ran;
            // promote it to primary.
            let primary = self.subrequests[real_idx].take();
            let reserve = self.funcall_pipeline[real_idx].subrequest.take();
            self.subrequests[real_idx] = reserve;
            self.funcall_pipeline[real_idx].subrequest = primary;
        }
        self.now_idx.store(NO_SUBGRAPH, Ordering::Release);
        Ok(failover)
    }

    /// Executes subgraph `idx` while preparing `idx + 1` on the side.
    ///
    /// The preparation work depends on what follows:
    /// - next is a call to the *same* body, pipelining on — overlap the
    ///   run with binding globals and unpacking closures into the reserve;
    /// - same body, pipelining off — run, then bind globals inline;
    /// - wrap-around to subgraph 0 — just run;
    /// - anything else — overlap the run with binding globals (and, when
    ///   this call has a pipeline successor, its reserve closures).
    fn unsafe_run_this_prep_next(
        &self,
        idx: usize,
        next_prepared: &mut bool,
    ) -> Result<(), BackendError> {
        let real_idx = self.model.real(idx);
        let next_idx = self.next_valid(idx + 1);

        if self.model.is_function_call(idx) {
            if real_idx == self.model.real(next_idx) {
                // The next subgraph is a call to the same function.
                if self.use_function_pipelining {
                    debug_assert_eq!(self.funcall_pipeline[idx].next, Some(next_idx));
                    let reserve = self.funcall_pipeline[real_idx]
                        .subrequest
                        .clone()
                        .expect("reserve subrequest exists when pipelining");
                    self.unsafe_during(real_idx, || {
                        tracing::debug!("preparing the next subrequest {next_idx}...");
                        // Done unconditionally: if this run fails, the
                        // recompiled pair gets all data resubmitted anyway.
                        self.bind_global_parameters(next_idx);
                        self.unpack_closure(next_idx, &reserve);
                    })
                } else {
                    // This subrequest IS also the next one.
                    self.unsafe_infer(real_idx)?;
                    self.bind_global_parameters(next_idx);
                    Ok(())
                }
            } else if next_idx == 0 {
                // Even with pipelining on, no swap happens on wrap-around;
                // see the .next check after the run.
                self.unsafe_infer(real_idx)
            } else {
                self.unsafe_during(real_idx, || {
                    if !*next_prepared {
                        self.bind_global_parameters(next_idx);
                        *next_prepared = true;
                    }
                    if self.use_function_pipelining {
                        if let Some(my_next_idx) = self.funcall_pipeline[idx].next {
                            tracing::debug!("preparing the next subrequest {my_next_idx}...");
                            let reserve = self.funcall_pipeline[real_idx]
                                .subrequest
                                .clone()
                                .expect("reserve subrequest exists when pipelining");
                            self.unpack_closure(my_next_idx, &reserve);
                        }
                    }
                })
            }
        } else if next_idx == 0 {
            self.unsafe_infer(real_idx)
        } else {
            // A regular subgraph: run it while binding the next one's
            // global parameters.
            self.unsafe_during(real_idx, || {
                if !*next_prepared {
                    self.bind_global_parameters(next_idx);
                    *next_prepared = true;
                }
            })
        }
    }

    /// Runs body `real_idx` while `f` executes concurrently.
    ///
    /// Non-spatial: the subrequest runs asynchronously and `f` runs on the
    /// caller's thread. Spatial: `f` runs on a scoped helper task while
    /// the tiled loop occupies the caller's thread. Either way the two
    /// join before returning.
    fn unsafe_during<F>(&self, real_idx: usize, f: F) -> Result<(), BackendError>
    where
        F: FnOnce() + Send,
    {
        if self.model.descriptor(real_idx).spatial.is_none() {
            let rq = self.subrequests[real_idx]
                .clone()
                .expect("live subgraph has a subrequest");
            rq.start_async();
            f();
            rq.wait()
        } else {
            std::thread::scope(|scope| {
                let helper = scope.spawn(f);
                let result = self.unsafe_infer(real_idx);
                helper.join().expect("preparation task panicked");
                result
            })
        }
    }

    /// Runs body `real_idx` synchronously: one inference, or the full
    /// tiled loop for spatial bodies.
    fn unsafe_infer(&self, real_idx: usize) -> Result<(), BackendError> {
        let desc = self.model.descriptor(real_idx);
        let rq = self.subrequests[real_idx]
            .clone()
            .expect("live subgraph has a subrequest");
        let Some(spatial) = &desc.spatial else {
            return rq.infer();
        };

        // The full inputs/outputs must be registered in SpatialIo by now.
        let num_outputs = desc
            .compiled
            .as_ref()
            .expect("spatial body has compiled I/O")
            .outputs
            .len();
        let (inputs, input_tails, outputs, output_tails) = {
            let sio = self.spatial_io[real_idx]
                .lock()
                .expect("spatial I/O lock poisoned");
            (
                sio.inputs.clone(),
                sio.input_tails.clone(),
                sio.outputs.clone(),
                sio.output_tails.clone(),
            )
        };

        // Cover the range in whole NWAY tiles, then handle the remainder:
        //
        // |<- - - - full range  - - - ->|
        // +------+------+------+------+-+
        // | nway | nway | nway | nway | |
        // +------+------+------+------+-+
        //                              ^tail
        //
        // The body always consumes and produces nway. The tail is staged
        // through scratch buffers addressed at offset 0.
        let mut offset = 0usize;
        for _ in 0..spatial.nway_iters {
            for p in &spatial.params {
                let full = inputs[p.idx].as_ref().expect("spatial input registered");
                rq.set_tensor(Port::input(p.idx), full.view(p.dim, offset, spatial.nway));
            }
            for out_idx in 0..num_outputs {
                let full = outputs[out_idx].as_ref().expect("spatial output registered");
                rq.set_tensor(
                    Port::output(out_idx),
                    full.view(spatial.out_dim, offset, spatial.nway),
                );
            }
            rq.infer()?;
            offset += spatial.nway;
        }

        if spatial.tail_size > 0 {
            for p in &spatial.params {
                let full = inputs[p.idx].as_ref().expect("spatial input registered");
                let tail = input_tails[p.idx]
                    .as_ref()
                    .expect("input tail buffer preallocated");
                full.view(p.dim, offset, spatial.tail_size)
                    .copy_to(&tail.view(p.dim, 0, spatial.tail_size));
                rq.set_tensor(Port::input(p.idx), tail.clone());
            }
            for out_idx in 0..num_outputs {
                let tail = output_tails[out_idx]
                    .as_ref()
                    .expect("output tail buffer preallocated");
                rq.set_tensor(Port::output(out_idx), tail.clone());
            }
            rq.infer()?;
            for out_idx in 0..num_outputs {
                let tail = output_tails[out_idx]
                    .as_ref()
                    .expect("output tail buffer preallocated");
                let full = outputs[out_idx].as_ref().expect("spatial output registered");
                tail.view(spatial.out_dim, 0, spatial.tail_size)
                    .copy_to(&full.view(spatial.out_dim, offset, spatial.tail_size));
            }
        }
        Ok(())
    }

    // ── Failover ───────────────────────────────────────────────

    /// Recreates the subrequest(s) backing subgraph `idx` on its current
    /// device and restores every binding that lived on the old handles:
    /// wiring, and the one-time closure bindings of every call site of
    /// this body.
    fn recreate_subrequests(&mut self, idx: usize) -> Result<(), RuntimeError> {
        let desc = self.model.descriptor(idx);
        let real_idx = self.model.real(idx);
        let count = if desc.is_function_call() && self.use_function_pipelining {
            2
        } else {
            1
        };
        let mut recompiled = false;
        let rqs = self
            .backend
            .create_subrequests(real_idx, count, &mut recompiled)?;

        // Always update the real index: for function calls the body slot
        // holds the handle, while the call-site slots stay empty.
        self.subrequests[real_idx] = Some(Arc::clone(&rqs[0]));
        if desc.is_function_call() && self.use_function_pipelining {
            self.funcall_pipeline[real_idx].subrequest = Some(Arc::clone(&rqs[1]));
        }

        // Fresh handles carry none of the previous bindings.
        self.connect_subrequests()?;
        let device = self.model.descriptor(real_idx).devices.current();
        self.subrequest_devices[idx] = device.clone();
        self.subrequest_devices[real_idx] = device;
        for i in 0..self.model.num_subgraphs() {
            if self.model.is_function_call(i) && self.model.real(i) == real_idx {
                self.preset_static_closures(i);
            }
        }
        Ok(())
    }

    // ── Subrequest access ──────────────────────────────────────

    /// The executing handle for subgraph `idx` (the body's, for calls).
    fn get_real_subrequest(&self, idx: usize) -> Option<Arc<dyn Subrequest>> {
        self.subrequests[self.model.real(idx)].clone()
    }

    /// `true` when subgraph `idx` has something to run.
    pub fn valid_subrequest(&self, idx: usize) -> bool {
        self.get_real_subrequest(idx).is_some()
    }

    /// First valid subgraph index at or after `from`, wrapping around.
    fn next_valid(&self, from: usize) -> usize {
        let n = self.model.num_subgraphs();
        let mut idx = from % n;
        for _ in 0..n {
            if self.valid_subrequest(idx) {
                return idx;
            }
            idx = (idx + 1) % n;
        }
        idx
    }

    // ── Public surface ─────────────────────────────────────────

    /// Starts subgraph `idx` asynchronously on its own handle.
    pub fn start_subrequest(&self, idx: usize) {
        self.subrequests[idx]
            .as_ref()
            .expect("live subgraph has a subrequest")
            .start_async();
    }

    /// No-op, kept for interface symmetry with pipelined executors.
    pub fn complete_subrequest(&self, _idx: usize) {}

    /// Forwards cancellation to the executing handle. For a function call
    /// that is the body's subrequest, not the (empty) call-site slot.
    pub fn cancel_subrequest(&self, idx: usize) {
        if let Some(rq) = self.get_real_subrequest(idx) {
            rq.cancel();
        }
    }

    /// Registers a completion callback on the executing handle.
    pub fn subscribe_subrequest(&self, idx: usize, callback: CompletionCallback) {
        self.get_real_subrequest(idx)
            .expect("live subgraph has a subrequest")
            .set_callback(callback);
    }

    /// Aggregates variable states across all live subrequests.
    pub fn query_state(&self) -> Vec<VariableState> {
        let mut states = Vec::new();
        for rq in self.subrequests.iter().flatten() {
            states.extend(rq.query_state());
        }
        states
    }

    /// Flattens profiling records across subrequests, prefixing each node
    /// name with its subgraph index.
    pub fn get_profiling_info(&self) -> Vec<ProfilingRecord> {
        let mut info = Vec::new();
        for (i, rq) in self.subrequests.iter().enumerate() {
            let Some(rq) = rq else { continue };
            for mut rec in rq.get_profiling_info() {
                rec.node_name = format!("subgraph{i}: {}", rec.node_name);
                info.push(rec);
            }
        }
        info
    }

    /// Number of subrequest slots (including empty ones).
    pub fn total_subrequests(&self) -> usize {
        self.subrequests.len()
    }

    /// This executor serialises its own subgraphs; the host must not
    /// pipeline multiple inferences into it.
    pub fn supports_async_pipeline(&self) -> bool {
        false
    }

    /// Re-runs the wiring, e.g. after the host replaced a subrequest.
    pub fn update_subrequest_links(&self) -> Result<(), RuntimeError> {
        self.connect_subrequests()
    }

    /// The tensor behind global input `idx`.
    pub fn get_input_tensor(&self, idx: usize) -> Tensor {
        self.input_tensors[idx].tensor.clone()
    }

    /// Replaces global input `idx` with a caller-provided tensor.
    pub fn set_input_tensor(&mut self, idx: usize, tensor: Tensor) {
        self.input_tensors[idx] = TensorStorage {
            tensor,
            owned: false,
        };
    }

    /// The tensor behind global output `idx`.
    pub fn get_output_tensor(&self, idx: usize) -> Tensor {
        self.output_tensors[idx].tensor.clone()
    }

    /// Replaces global output `idx` with a caller-provided tensor.
    pub fn set_output_tensor(&mut self, idx: usize, tensor: Tensor) {
        self.output_tensors[idx] = TensorStorage {
            tensor,
            owned: false,
        };
    }

    /// `true` when this request allocated the tensor behind global input
    /// `idx` (as opposed to the caller binding their own).
    pub fn owns_input_tensor(&self, idx: usize) -> bool {
        self.input_tensors[idx].owned
    }

    // ── Tensor dumps ───────────────────────────────────────────

    fn dump_input_tensors(&self, idx: usize) {
        let Some(dir) = &self.config.dump_dir else { return };
        let Some(rq) = self.get_real_subrequest(idx) else { return };
        let total = self.model.num_subgraphs();
        let num_inputs = rq.inputs().len();
        for k in 0..num_inputs {
            let tensor = rq.get_tensor(Port::input(k));
            let path = dir.join(format!(
                "subgraph{}_input{}.bin",
                fmt_index(idx, total),
                fmt_index(k, num_inputs),
            ));
            if let Err(e) = std::fs::write(&path, tensor.to_bytes()) {
                tracing::warn!("cannot dump input tensor to '{}': {e}", path.display());
            }
        }
    }

    fn dump_output_tensors(&self, idx: usize) {
        let Some(dir) = &self.config.dump_dir else { return };
        let Some(rq) = self.get_real_subrequest(idx) else { return };
        let total = self.model.num_subgraphs();
        let num_outputs = rq.outputs().len();
        for k in 0..num_outputs {
            let tensor = rq.get_tensor(Port::output(k));
            let path = dir.join(format!(
                "subgraph{}_output{}.bin",
                fmt_index(idx, total),
                fmt_index(k, num_outputs),
            ));
            if let Err(e) = std::fs::write(&path, tensor.to_bytes()) {
                tracing::warn!("cannot dump output tensor to '{}': {e}", path.display());
            }
        }
    }
}

impl std::fmt::Debug for InferRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferRequest")
            .field("model", &self.model.name)
            .field("subgraphs", &self.subrequests.len())
            .field("pipelining", &self.use_function_pipelining)
            .field("funcall_heads", &self.funcall_heads)
            .field("inputs", &self.input_tensors.len())
            .field("outputs", &self.output_tensors.len())
            .finish()
    }
}

/// Picks the dequantisation kernel for closure slot `cidx` and runs it,
/// writing into the subrequest's port tensor.
fn unpack_into(desc: &SubgraphDescriptor, cidx: usize, closure: &Tensor, clparam: &Tensor) {
    let scale = desc.scales.get(cidx).and_then(|s| s.as_ref());
    let zerop = desc.zerops.get(cidx).and_then(|z| z.as_ref());
    match (scale, zerop) {
        (Some(scale), Some(zerop)) => tensor_core::unpack2(closure, zerop, scale, clparam),
        (Some(scale), None) => tensor_core::unpack1(closure, scale, clparam),
        _ => tensor_core::unpack(closure, clparam),
    }
}

/// Zero-pads `number` to the digit width of `total`.
fn fmt_index(number: usize, total: usize) -> String {
    let mut regs = 1;
    let mut t = total;
    while t >= 10 {
        regs += 1;
        t /= 10;
    }
    format!("{number:0regs$}")
}
