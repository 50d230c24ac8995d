// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! In-process backend executing subgraph bodies as host closures.
//!
//! `LoopbackBackend` plays the role of a device runtime without any
//! hardware: each subgraph body is a plain function over its bound input
//! and output tensors. Subrequests count every capability call and can be
//! told to fail on specific devices, which is how the test suite exercises
//! the executor's failover and pipelining paths.

use crate::{
    Backend, BackendError, CompletionCallback, Port, PortInfo, PortKind, ProfilingRecord,
    Subrequest, VariableState, WeightsBank,
};
use crate::DeviceCursor;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tensor_core::Tensor;

/// A subgraph body: reads the bound input tensors, writes the bound outputs.
pub type BodyFn = Arc<dyn Fn(&[Tensor], &[Tensor]) + Send + Sync>;

/// Copies input `k` into output `k` for every output port.
pub fn identity_body() -> BodyFn {
    Arc::new(|inputs, outputs| {
        for (i, o) in inputs.iter().zip(outputs.iter()) {
            i.copy_to(o);
        }
    })
}

/// One compiled subgraph as the loopback backend sees it.
pub struct LoopbackModel {
    pub inputs: Vec<PortInfo>,
    pub outputs: Vec<PortInfo>,
    pub body: BodyFn,
    /// Fallback-ordered device list, shared with the descriptor set.
    pub devices: Arc<DeviceCursor>,
    /// Devices on which `infer` fails (drives runtime failover).
    pub failing_devices: HashSet<String>,
    /// Devices on which compilation fails (drives construction failover).
    pub uncompilable_devices: HashSet<String>,
}

impl LoopbackModel {
    /// A model with an identity body and no failure injection.
    pub fn new(inputs: Vec<PortInfo>, outputs: Vec<PortInfo>, devices: Arc<DeviceCursor>) -> Self {
        Self {
            inputs,
            outputs,
            body: identity_body(),
            devices,
            failing_devices: HashSet::new(),
            uncompilable_devices: HashSet::new(),
        }
    }
}

/// The in-process backend.
pub struct LoopbackBackend {
    /// One entry per subgraph index; `None` for optimized-out subgraphs
    /// and for function-call sites that borrow another index's body.
    models: Vec<Option<LoopbackModel>>,
    /// Devices whose subrequests cannot retain caller memory.
    copy_devices: HashSet<String>,
    /// Every subrequest ever created, for test instrumentation.
    created: Mutex<Vec<(usize, Arc<LoopbackSubrequest>)>>,
}

impl LoopbackBackend {
    pub fn new(models: Vec<Option<LoopbackModel>>) -> Self {
        Self {
            models,
            copy_devices: HashSet::new(),
            created: Mutex::new(Vec::new()),
        }
    }

    /// Marks devices whose bound tensors must be deep-copied.
    pub fn with_copy_devices(mut self, devices: impl IntoIterator<Item = String>) -> Self {
        self.copy_devices = devices.into_iter().collect();
        self
    }

    /// Returns every subrequest created for subgraph `sub_idx`, in creation
    /// order. Used by tests to observe counters on retired handles.
    pub fn created_subrequests(&self, sub_idx: usize) -> Vec<Arc<LoopbackSubrequest>> {
        self.created
            .lock()
            .expect("created registry lock poisoned")
            .iter()
            .filter(|(i, _)| *i == sub_idx)
            .map(|(_, r)| Arc::clone(r))
            .collect()
    }
}

impl Backend for LoopbackBackend {
    fn create_subrequests(
        &self,
        sub_idx: usize,
        count: usize,
        recompiled: &mut bool,
    ) -> Result<Vec<Arc<dyn Subrequest>>, BackendError> {
        let model = self
            .models
            .get(sub_idx)
            .and_then(|m| m.as_ref())
            .ok_or_else(|| BackendError::CreateFailed {
                index: sub_idx,
                detail: "no compiled body at this index".into(),
            })?;

        let device = loop {
            let device = model.devices.current().ok_or_else(|| {
                BackendError::NoDevice(format!("subgraph {sub_idx}: device list exhausted"))
            })?;
            if model.uncompilable_devices.contains(&device) {
                tracing::warn!("subgraph {sub_idx}: cannot compile for '{device}', falling over");
                model.devices.advance();
                *recompiled = true;
                continue;
            }
            break device;
        };

        let mut out: Vec<Arc<dyn Subrequest>> = Vec::with_capacity(count);
        let mut registry = self.created.lock().expect("created registry lock poisoned");
        for _ in 0..count {
            let rq = Arc::new(LoopbackSubrequest::new(
                model.inputs.clone(),
                model.outputs.clone(),
                Arc::clone(&model.body),
                device.clone(),
                model.failing_devices.contains(&device),
            ));
            registry.push((sub_idx, Arc::clone(&rq)));
            out.push(rq);
        }
        Ok(out)
    }

    fn compile_for_success(&self, real_idx: usize) -> bool {
        let Some(model) = self.models.get(real_idx).and_then(|m| m.as_ref()) else {
            return false;
        };
        loop {
            match model.devices.current() {
                None => return false,
                Some(device) if model.uncompilable_devices.contains(&device) => {
                    model.devices.advance();
                }
                Some(device) => {
                    tracing::info!("subgraph {real_idx}: compiled for '{device}'");
                    return true;
                }
            }
        }
    }

    fn needs_copy(&self, sub_idx: usize) -> bool {
        let Some(model) = self.models.get(sub_idx).and_then(|m| m.as_ref()) else {
            return false;
        };
        model
            .devices
            .current()
            .map(|d| self.copy_devices.contains(&d))
            .unwrap_or(false)
    }

    fn log_device_distribution(&self) {
        for (i, model) in self.models.iter().enumerate() {
            if let Some(m) = model {
                tracing::info!(
                    "subgraph {i} -> {}",
                    m.devices.current().as_deref().unwrap_or("<none>")
                );
            }
        }
    }
}

/// A trivial weights bank that hands closures back unchanged.
pub struct PassthroughBank;

impl WeightsBank for PassthroughBank {
    fn get(&self, closure: &Tensor, _device: &str) -> Tensor {
        closure.clone()
    }
}

struct IoTable {
    inputs: Vec<Tensor>,
    outputs: Vec<Tensor>,
}

/// An instrumented in-process subrequest.
pub struct LoopbackSubrequest {
    inputs: Vec<PortInfo>,
    outputs: Vec<PortInfo>,
    body: BodyFn,
    device: String,
    fails: bool,
    io: Mutex<IoTable>,
    pending: Mutex<Option<Result<(), BackendError>>>,
    callback: Mutex<Option<CompletionCallback>>,
    last_duration: Mutex<Duration>,
    set_tensor_calls: AtomicUsize,
    get_tensor_calls: AtomicUsize,
    infer_calls: AtomicUsize,
    cancel_calls: AtomicUsize,
}

impl LoopbackSubrequest {
    fn new(
        inputs: Vec<PortInfo>,
        outputs: Vec<PortInfo>,
        body: BodyFn,
        device: String,
        fails: bool,
    ) -> Self {
        // Every port starts with a zeroed tensor of its declared shape, so
        // get_tensor is total and unpack kernels have a destination.
        let io = IoTable {
            inputs: inputs
                .iter()
                .map(|p| Tensor::zeros(p.shape.clone(), p.dtype))
                .collect(),
            outputs: outputs
                .iter()
                .map(|p| Tensor::zeros(p.shape.clone(), p.dtype))
                .collect(),
        };
        Self {
            inputs,
            outputs,
            body,
            device,
            fails,
            io: Mutex::new(io),
            pending: Mutex::new(None),
            callback: Mutex::new(None),
            last_duration: Mutex::new(Duration::ZERO),
            set_tensor_calls: AtomicUsize::new(0),
            get_tensor_calls: AtomicUsize::new(0),
            infer_calls: AtomicUsize::new(0),
            cancel_calls: AtomicUsize::new(0),
        }
    }

    fn run_once(&self) -> Result<(), BackendError> {
        self.infer_calls.fetch_add(1, Ordering::AcqRel);
        if self.fails {
            return Err(BackendError::InferFailed {
                device: self.device.clone(),
                detail: "injected failure".into(),
            });
        }
        let (inputs, outputs) = {
            let io = self.io.lock().expect("io table lock poisoned");
            (io.inputs.clone(), io.outputs.clone())
        };
        let start = Instant::now();
        (self.body)(&inputs, &outputs);
        *self.last_duration.lock().expect("duration lock poisoned") = start.elapsed();
        Ok(())
    }

    // ── Test instrumentation ───────────────────────────────────

    pub fn set_tensor_count(&self) -> usize {
        self.set_tensor_calls.load(Ordering::Acquire)
    }

    pub fn get_tensor_count(&self) -> usize {
        self.get_tensor_calls.load(Ordering::Acquire)
    }

    pub fn infer_count(&self) -> usize {
        self.infer_calls.load(Ordering::Acquire)
    }

    pub fn cancel_count(&self) -> usize {
        self.cancel_calls.load(Ordering::Acquire)
    }
}

impl Subrequest for LoopbackSubrequest {
    fn inputs(&self) -> &[PortInfo] {
        &self.inputs
    }

    fn outputs(&self) -> &[PortInfo] {
        &self.outputs
    }

    fn set_tensor(&self, port: Port, tensor: Tensor) {
        self.set_tensor_calls.fetch_add(1, Ordering::AcqRel);
        let mut io = self.io.lock().expect("io table lock poisoned");
        match port.kind {
            PortKind::Input => io.inputs[port.index] = tensor,
            PortKind::Output => io.outputs[port.index] = tensor,
        }
    }

    fn get_tensor(&self, port: Port) -> Tensor {
        self.get_tensor_calls.fetch_add(1, Ordering::AcqRel);
        let io = self.io.lock().expect("io table lock poisoned");
        match port.kind {
            PortKind::Input => io.inputs[port.index].clone(),
            PortKind::Output => io.outputs[port.index].clone(),
        }
    }

    fn start_async(&self) {
        let result = self.run_once();
        *self.pending.lock().expect("pending lock poisoned") = Some(result);
    }

    fn wait(&self) -> Result<(), BackendError> {
        let result = self
            .pending
            .lock()
            .expect("pending lock poisoned")
            .take()
            .unwrap_or(Ok(()));
        if let Some(cb) = self.callback.lock().expect("callback lock poisoned").take() {
            cb(result.as_ref().map(|_| ()).map_err(|e| e.to_string()));
        }
        result
    }

    fn infer(&self) -> Result<(), BackendError> {
        let result = self.run_once();
        if let Some(cb) = self.callback.lock().expect("callback lock poisoned").take() {
            cb(result.as_ref().map(|_| ()).map_err(|e| e.to_string()));
        }
        result
    }

    fn cancel(&self) {
        self.cancel_calls.fetch_add(1, Ordering::AcqRel);
    }

    fn set_callback(&self, callback: CompletionCallback) {
        *self.callback.lock().expect("callback lock poisoned") = Some(callback);
    }

    fn query_state(&self) -> Vec<VariableState> {
        Vec::new()
    }

    fn get_profiling_info(&self) -> Vec<ProfilingRecord> {
        vec![ProfilingRecord {
            node_name: "body".into(),
            real_time: *self.last_duration.lock().expect("duration lock poisoned"),
        }]
    }

    fn device(&self) -> &str {
        &self.device
    }
}
