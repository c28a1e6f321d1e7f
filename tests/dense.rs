use std::sync::Arc;

use rand::Rng;

use dualdense::activations::Activation;
use dualdense::dense::{Dense, DenseConfig};
use dualdense::gpu::reference::ReferenceRuntime;
use dualdense::gpu::GpuRuntime;
use dualdense::tensor;
use dualdense::tensors::Tensor;

fn scenario_kernel() -> Tensor {
    tensor!([[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]])
}

fn gpu_layer(config: DenseConfig, runtime: &Arc<ReferenceRuntime>) -> Dense {
    Dense::gpu("fc1", config, Arc::clone(runtime) as Arc<dyn GpuRuntime>).unwrap()
}

fn assert_close(a: &[f32], b: &[f32], tol: f32) {
    assert_eq!(a.len(), b.len());
    for (&x, &y) in a.iter().zip(b) {
        let scale = x.abs().max(1.0);
        assert!(
            (x - y).abs() <= tol * scale,
            "{x} and {y} differ beyond tolerance"
        );
    }
}

#[test]
fn gpu_identity_affine() {
    let runtime = Arc::new(ReferenceRuntime::new());
    let mut layer = gpu_layer(DenseConfig::new(2), &runtime);
    layer.set_parameter("kernel", scenario_kernel()).unwrap();
    layer
        .set_parameter("bias", Tensor::new(vec![2], vec![0.0, 0.0]))
        .unwrap();

    let mut input = Tensor::new(vec![3], vec![1.0, 2.0, 3.0]);
    let out = layer.compute(&mut input, 0).unwrap();
    assert_eq!(out.data(), &[4.0, 5.0]);
    assert_eq!(runtime.readback_count(), 1);
}

#[test]
fn gpu_relu_clamps_negative_preactivation() {
    let runtime = Arc::new(ReferenceRuntime::new());
    let config = DenseConfig::new(2).with_activation(Activation::Relu);
    let mut layer = gpu_layer(config, &runtime);
    layer.set_parameter("kernel", scenario_kernel()).unwrap();
    layer
        .set_parameter("bias", Tensor::new(vec![2], vec![0.0, 0.0]))
        .unwrap();

    // pre-activation is [-4, -5]
    let mut input = Tensor::new(vec![3], vec![-1.0, -2.0, -3.0]);
    let out = layer.compute(&mut input, 0).unwrap();
    assert_eq!(out.data(), &[0.0, 0.0]);
}

#[test]
fn gpu_identity_output_does_not_drift() {
    // With the identity activation the output aliases the pre-activation
    // buffer; negative values must survive untouched.
    let runtime = Arc::new(ReferenceRuntime::new());
    let mut layer = gpu_layer(DenseConfig::new(2).without_bias(), &runtime);
    layer.set_parameter("kernel", scenario_kernel()).unwrap();

    let mut input = Tensor::new(vec![3], vec![-1.0, -2.0, -3.0]);
    let out = layer.compute(&mut input, 0).unwrap();
    assert_eq!(out.data(), &[-4.0, -5.0]);
}

#[test]
fn gpu_without_bias_matches_unbiased_dot_products() {
    let runtime = Arc::new(ReferenceRuntime::new());
    let mut layer = gpu_layer(DenseConfig::new(2).without_bias(), &runtime);
    layer.set_parameter("kernel", scenario_kernel()).unwrap();

    // warm the working buffers with one call, then verify the second
    let mut warm = Tensor::new(vec![3], vec![5.0, 5.0, 5.0]);
    layer.compute(&mut warm, 0).unwrap();

    let mut input = Tensor::new(vec![3], vec![1.0, 1.0, 1.0]);
    let out = layer.compute(&mut input, 0).unwrap();
    assert_eq!(out.data(), &[2.0, 2.0]);
}

#[test]
fn readback_skipped_while_consumers_remain() {
    let runtime = Arc::new(ReferenceRuntime::new());
    let mut layer = gpu_layer(DenseConfig::new(2).without_bias(), &runtime);
    layer.set_parameter("kernel", scenario_kernel()).unwrap();

    let mut input = Tensor::new(vec![3], vec![1.0, 2.0, 3.0]);
    let out = layer.compute(&mut input, 1).unwrap();

    // device-resident: no host transfer happened, but the mirror chains on
    assert_eq!(runtime.readback_count(), 0);
    assert!(out.mirror().is_some());
}

#[test]
fn chained_layers_share_device_residency() {
    let runtime = Arc::new(ReferenceRuntime::new());

    let mut first = gpu_layer(DenseConfig::new(2).without_bias(), &runtime);
    first.set_parameter("kernel", scenario_kernel()).unwrap();

    let mut second = Dense::gpu(
        "fc2",
        DenseConfig::new(2)
            .without_bias()
            .with_activation(Activation::Relu),
        Arc::clone(&runtime) as Arc<dyn GpuRuntime>,
    )
    .unwrap();
    second
        .set_parameter("kernel", tensor!([[1.0, -1.0], [1.0, 1.0]]))
        .unwrap();

    let mut input = Tensor::new(vec![3], vec![1.0, 2.0, 3.0]);
    // first output stays device-resident, its mirror feeds the second layer
    let mut hidden = first.compute(&mut input, 1).unwrap().clone();
    let out = second.compute(&mut hidden, 0).unwrap();

    // hidden = [4, 5]; out = relu([4 + 5, -4 + 5]) = [9, 1]
    assert_eq!(out.data(), &[9.0, 1.0]);
    // exactly one transfer, at the edge of the graph
    assert_eq!(runtime.readback_count(), 1);
}

#[test]
fn input_mirror_is_created_once() {
    let runtime = Arc::new(ReferenceRuntime::new());
    let mut layer = gpu_layer(DenseConfig::new(2).without_bias(), &runtime);
    layer.set_parameter("kernel", scenario_kernel()).unwrap();

    let mut input = Tensor::new(vec![3], vec![1.0, 2.0, 3.0]);
    assert!(input.mirror().is_none());
    layer.compute(&mut input, 0).unwrap();
    let mirror = input.mirror().expect("mirror created on first call");
    layer.compute(&mut input, 0).unwrap();
    assert_eq!(input.mirror(), Some(mirror));
}

#[test]
fn mirrored_input_ignores_later_host_edits() {
    // the device copy is made once; host edits after that are not
    // re-uploaded, so the result still reflects the mirrored values
    let runtime = Arc::new(ReferenceRuntime::new());
    let mut layer = gpu_layer(DenseConfig::new(2).without_bias(), &runtime);
    layer.set_parameter("kernel", scenario_kernel()).unwrap();

    let mut input = Tensor::new(vec![3], vec![1.0, 2.0, 3.0]);
    layer.compute(&mut input, 0).unwrap();

    input.data_mut()[0] = 100.0;
    let out = layer.compute(&mut input, 0).unwrap();
    assert_eq!(out.data(), &[4.0, 5.0]);
}

#[test]
fn cpu_and_gpu_paths_agree() {
    let mut rng = rand::rng();
    let (in_dim, units) = (5, 4);

    for activation in [
        Activation::Identity,
        Activation::Relu,
        Activation::Sigmoid,
        Activation::Tanh,
        Activation::Softplus,
    ] {
        let kernel = Tensor::new(
            vec![in_dim, units],
            (0..in_dim * units)
                .map(|_| rng.random_range(-1.0f32..1.0))
                .collect(),
        );
        let bias = Tensor::new(
            vec![units],
            (0..units).map(|_| rng.random_range(-1.0f32..1.0)).collect(),
        );
        let input_data: Vec<f32> = (0..in_dim).map(|_| rng.random_range(-2.0f32..2.0)).collect();

        let config = DenseConfig::new(units).with_activation(activation);

        let mut cpu = Dense::cpu("fc1", config.clone()).unwrap();
        cpu.set_parameter("kernel", kernel.clone()).unwrap();
        cpu.set_parameter("bias", bias.clone()).unwrap();
        let mut cpu_input = Tensor::new(vec![in_dim], input_data.clone());
        let cpu_out = cpu.compute(&mut cpu_input, 0).unwrap().clone();

        let runtime = Arc::new(ReferenceRuntime::new());
        let mut gpu = gpu_layer(config, &runtime);
        gpu.set_parameter("kernel", kernel).unwrap();
        gpu.set_parameter("bias", bias).unwrap();
        let mut gpu_input = Tensor::new(vec![in_dim], input_data);
        let gpu_out = gpu.compute(&mut gpu_input, 0).unwrap();

        assert_close(cpu_out.data(), gpu_out.data(), 1e-5);
    }
}

#[test]
fn gpu_shape_mismatch_names_the_layer() {
    let runtime = Arc::new(ReferenceRuntime::new());
    let mut layer = gpu_layer(
        DenseConfig::new(2).without_bias().with_input_dim(3),
        &runtime,
    );
    layer.set_parameter("kernel", scenario_kernel()).unwrap();

    let mut wrong = Tensor::new(vec![4], vec![1.0; 4]);
    let err = layer.compute(&mut wrong, 0).unwrap_err();
    assert!(err.to_string().contains("fc1"));
    assert!(err.to_string().contains("[4]"));
}
