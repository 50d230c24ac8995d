// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Example: run a partitioned model with repeated function calls and
//! device failover against the in-process loopback backend.
//!
//! The model is a producer feeding three calls of one function body, each
//! with its own closure. The body's preferred device fails, so the first
//! call triggers a failover to the fallback device; pipelining keeps a
//! reserve subrequest loaded with the next call's closures throughout.
//!
//! ```bash
//! cargo run -p runtime --example pipelined_funcalls
//! ```

use accel_backend::loopback::{LoopbackBackend, LoopbackModel, PassthroughBank};
use accel_backend::{Backend, DeviceCursor, PortInfo};
use partition_ir::{CompiledIo, DescriptorSet, SubgraphDescriptor};
use runtime::{ExecutorConfig, InferRequest};
use std::sync::Arc;
use tensor_core::{DType, Shape, Tensor};

const WIDTH: usize = 8;
const CALLS: usize = 3;

fn port(name: &str) -> PortInfo {
    PortInfo::new(name, DType::F32, Shape::vector(WIDTH))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialise tracing.
    tracing_subscriber::fmt().with_env_filter("info").init();

    // Shared device list for the function body: the NPU will fail, the
    // CPU catches the work.
    let producer_devices = Arc::new(DeviceCursor::new(vec!["cpu".into()]));
    let body_devices = Arc::new(DeviceCursor::new(vec!["npu".into(), "cpu".into()]));

    // Subgraph 0: producer. Subgraphs 1..=3: calls of the body at index 1.
    let body_io = CompiledIo {
        inputs: vec![port("act"), port("w")],
        outputs: vec![port("out")],
    };
    let mut subgraphs = vec![SubgraphDescriptor::normal(
        CompiledIo {
            inputs: vec![port("in")],
            outputs: vec![port("mid")],
        },
        Arc::clone(&producer_devices),
    )];
    for call in 0..CALLS {
        let mut desc = SubgraphDescriptor::normal(body_io.clone(), Arc::clone(&body_devices));
        if call > 0 {
            desc.compiled = None;
        }
        desc.replaced_by = Some(1);
        desc.param_base = 1;
        desc.closure = vec![Tensor::from_f32(
            Shape::vector(WIDTH),
            &vec![(call + 1) as f32 * 100.0; WIDTH],
        )?];
        desc.update_required = vec![true];
        subgraphs.push(desc);
    }

    let mut set = DescriptorSet::new(
        "pipelined-funcalls".into(),
        subgraphs,
        vec![port("g_in")],
        (0..CALLS).map(|c| port(&format!("g_out{c}"))).collect(),
    );
    set.inputs_to_submodels_inputs = vec![Some((0, 0))];
    set.outputs_to_submodels_outputs = (0..CALLS).map(|c| (c + 1, 0)).collect();
    for call in 0..CALLS {
        set.submodels_input_to_prev_output
            .insert((call + 1, 0), (0, 0));
    }
    let model = Arc::new(set.validate()?);
    println!("{}", model.summary());

    // The loopback backend: identity producer, adder body that fails on
    // the NPU.
    let mut body_model = LoopbackModel::new(
        vec![port("act"), port("w")],
        vec![port("out")],
        body_devices,
    );
    body_model.failing_devices.insert("npu".into());
    body_model.body = Arc::new(|inputs, outputs| {
        let a = inputs[0].as_f32_vec();
        let w = inputs[1].as_f32_vec();
        let sum: Vec<f32> = a.iter().zip(&w).map(|(x, y)| x + y).collect();
        outputs[0].write_f32(&sum);
    });
    let mut models = vec![
        Some(LoopbackModel::new(
            vec![port("in")],
            vec![port("mid")],
            producer_devices,
        )),
        Some(body_model),
    ];
    models.extend((1..CALLS).map(|_| None));
    let backend = Arc::new(LoopbackBackend::new(models));

    // Build and run the request with pipelining on.
    let config = ExecutorConfig {
        funcall_pipelining: true,
        ..Default::default()
    };
    let mut request = InferRequest::new(
        Arc::clone(&model),
        Arc::clone(&backend) as Arc<dyn Backend>,
        Arc::new(PassthroughBank),
        config,
    )?;

    let input: Vec<f32> = (0..WIDTH).map(|v| v as f32).collect();
    request.get_input_tensor(0).write_f32(&input);
    request.infer()?;

    println!("\ninput:  {input:?}");
    for call in 0..CALLS {
        println!(
            "call {}: {:?}",
            call,
            request.get_output_tensor(call).as_f32_vec(),
        );
    }

    println!("\nprofiling:");
    for rec in request.get_profiling_info() {
        println!("  {} ({:?})", rec.node_name, rec.real_time);
    }

    Ok(())
}
