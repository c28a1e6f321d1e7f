//! Dense layer: one affine+activation transform behind a dual-backend
//! `compute` contract.
//!
//! A [`Dense`] layer computes `activation(Wᵗx + b)` for a single input
//! vector per call. The backend is fixed at construction: [`Dense::cpu`]
//! builds a layer that runs the affine kernel on host memory (rayon over
//! the output width), [`Dense::gpu`] builds one that dispatches compiled
//! compute programs on an injected [`GpuRuntime`]. Both paths share the
//! same parameter store, shape rules, and observable results; which one a
//! layer uses is not re-evaluated per call.
//!
//! Lifecycle discipline on the GPU path:
//!
//! - programs are compiled once, at construction, keyed by activation kind;
//! - the pre-activation and output buffers are allocated once, at
//!   construction;
//! - parameter mirrors are created once, when the parameter is attached;
//! - the only per-call allocation is mirroring an input tensor that has
//!   never been on the device.

use std::sync::Arc;

use log::debug;
use rayon::prelude::*;

use crate::activations::Activation;
use crate::error::LayerError;
use crate::gpu::{BufferId, GpuRuntime, ProgramId, ProgramKind, Uniform};
use crate::tensors::Tensor;

/// Hyperparameters of a dense layer, resolved at construction and
/// immutable afterwards.
#[derive(Debug, Clone)]
pub struct DenseConfig {
    /// Output width. Must be at least 1.
    pub units: usize,
    /// Nonlinearity applied after the affine transform.
    pub activation: Activation,
    /// Whether the affine transform adds a bias vector.
    pub use_bias: bool,
    /// Input width. May be left `None` and inferred from the kernel
    /// parameter or the first input.
    pub input_dim: Option<usize>,
    /// Activation requested by configuration name. Resolved when the
    /// layer is constructed, overriding `activation`; an unknown name is
    /// a construction error attributed to the layer.
    pub activation_name: Option<String>,
}

impl DenseConfig {
    /// Configuration with the given output width, identity activation,
    /// bias enabled, and input width inferred.
    pub fn new(units: usize) -> Self {
        Self {
            units,
            activation: Activation::Identity,
            use_bias: true,
            input_dim: None,
            activation_name: None,
        }
    }

    /// Sets the activation kind.
    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    /// Requests the activation by its configuration name (see
    /// [`Activation::name`]). Parsing is deferred to layer construction so
    /// an unknown name fails as a configuration error naming the layer.
    pub fn with_activation_name(mut self, name: impl Into<String>) -> Self {
        self.activation_name = Some(name.into());
        self
    }

    /// Disables the bias term.
    pub fn without_bias(mut self) -> Self {
        self.use_bias = false;
        self
    }

    /// Fixes the input width up front.
    pub fn with_input_dim(mut self, input_dim: usize) -> Self {
        self.input_dim = Some(input_dim);
        self
    }
}

/// A named tensor owned by the layer, with its device mirror (GPU mode
/// only). The mirror is created when the parameter is attached and never
/// recreated.
struct Param {
    host: Tensor,
    mirror: Option<BufferId>,
}

/// Which buffer holds the layer's result after a GPU compute.
///
/// With the identity activation the activation dispatch is skipped and the
/// output is a read-only alias of the pre-activation buffer; the tag makes
/// that aliasing explicit instead of reassigning buffer handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputSlot {
    Owned,
    PreactAlias,
}

struct GpuState {
    runtime: Arc<dyn GpuRuntime>,
    affine: ProgramId,
    activation: Option<ProgramId>,
    preact: Tensor,
    output: Tensor,
    preact_buf: BufferId,
    output_buf: BufferId,
    /// One-element placeholder bound in the bias slot when bias is off;
    /// the program never reads it (`add_bias = 0`).
    zero_bias: BufferId,
    slot: OutputSlot,
}

enum Engine {
    Cpu { output: Tensor },
    Gpu(GpuState),
}

/// One affine+activation transform with a backend fixed at construction.
pub struct Dense {
    name: String,
    units: usize,
    activation: Activation,
    use_bias: bool,
    input_dim: Option<usize>,
    kernel: Option<Param>,
    bias: Option<Param>,
    started: bool,
    engine: Engine,
}

impl std::fmt::Debug for Dense {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dense")
            .field("name", &self.name)
            .field("units", &self.units)
            .field("activation", &self.activation)
            .field("use_bias", &self.use_bias)
            .field("input_dim", &self.input_dim)
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

impl Dense {
    /// Creates a CPU-backed layer.
    ///
    /// # Errors
    ///
    /// Returns [`LayerError::Config`] for invalid hyperparameters.
    pub fn cpu(name: impl Into<String>, config: DenseConfig) -> Result<Self, LayerError> {
        let name = name.into();
        let activation = resolve_config(&name, &config)?;
        let output = Tensor::zeros(vec![config.units]);
        Ok(Self::assemble(name, config, activation, Engine::Cpu { output }))
    }

    /// Creates a GPU-backed layer against an explicit runtime.
    ///
    /// Compiles the affine program and, unless the activation is the
    /// identity, the activation program; allocates the pre-activation and
    /// output buffers. All of this happens exactly once, here.
    ///
    /// # Errors
    ///
    /// Returns [`LayerError::Config`] for invalid hyperparameters and
    /// [`LayerError::Resource`] if program compilation or buffer
    /// allocation fails; a layer that failed construction cannot be used.
    pub fn gpu(
        name: impl Into<String>,
        config: DenseConfig,
        runtime: Arc<dyn GpuRuntime>,
    ) -> Result<Self, LayerError> {
        let name = name.into();
        let activation_kind = resolve_config(&name, &config)?;

        let resource = |e| LayerError::resource(&name, e);
        let affine = runtime.compile(ProgramKind::Affine).map_err(&resource)?;
        let activation = match activation_kind {
            Activation::Identity => None,
            act => Some(
                runtime
                    .compile(ProgramKind::Activation(act))
                    .map_err(&resource)?,
            ),
        };
        let preact_buf = runtime.alloc(config.units).map_err(&resource)?;
        let output_buf = runtime.alloc(config.units).map_err(&resource)?;
        let zero_bias = runtime.upload(&[0.0]).map_err(&resource)?;

        let mut preact = Tensor::zeros(vec![config.units]);
        preact.set_mirror(preact_buf);
        let mut output = Tensor::zeros(vec![config.units]);
        output.set_mirror(output_buf);

        debug!(
            "layer `{name}`: compiled {} device program(s), units {}",
            1 + usize::from(activation.is_some()),
            config.units
        );

        Ok(Self::assemble(
            name,
            config,
            activation_kind,
            Engine::Gpu(GpuState {
                runtime,
                affine,
                activation,
                preact,
                output,
                preact_buf,
                output_buf,
                zero_bias,
                slot: OutputSlot::Owned,
            }),
        ))
    }

    fn assemble(
        name: String,
        config: DenseConfig,
        activation: Activation,
        engine: Engine,
    ) -> Self {
        Self {
            name,
            units: config.units,
            activation,
            use_bias: config.use_bias,
            input_dim: config.input_dim,
            kernel: None,
            bias: None,
            started: false,
            engine,
        }
    }

    /// The layer's name, carried in every error it raises.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolved output shape, for graph-shape inference.
    pub fn output_shape(&self) -> Vec<usize> {
        vec![self.units]
    }

    /// The activation kind this layer applies.
    pub fn activation(&self) -> Activation {
        self.activation
    }

    /// Attaches a named parameter: `"kernel"` with shape
    /// `[input_dim, units]`, or `"bias"` with shape `[units]`.
    ///
    /// Each parameter may be set exactly once, and only before the first
    /// compute; on the GPU path the device mirror is created here and is
    /// never recreated, so re-setting is rejected rather than silently
    /// leaving a stale mirror. A kernel with an unfixed input width
    /// resolves `input_dim` from its leading dimension.
    ///
    /// # Errors
    ///
    /// [`LayerError::Config`] for unknown names, re-sets, frozen layers,
    /// or a bias on a bias-less layer; [`LayerError::ShapeMismatch`] if
    /// the value's shape does not match the configuration;
    /// [`LayerError::Resource`] if mirror creation fails.
    pub fn set_parameter(&mut self, name: &str, value: Tensor) -> Result<(), LayerError> {
        if self.started {
            return Err(LayerError::config(
                &self.name,
                "parameters are frozen once compute has run",
            ));
        }
        match name {
            "kernel" => {
                if self.kernel.is_some() {
                    return Err(LayerError::config(
                        &self.name,
                        "parameter `kernel` is already set",
                    ));
                }
                let shape = value.shape().to_vec();
                if shape.len() != 2 || shape[1] != self.units {
                    let hinted = self
                        .input_dim
                        .or_else(|| shape.first().copied())
                        .unwrap_or(1);
                    let expected = vec![hinted, self.units];
                    return Err(LayerError::shape(&self.name, expected, &shape));
                }
                let in_dim = match self.input_dim {
                    Some(d) if shape[0] != d => {
                        return Err(LayerError::shape(&self.name, vec![d, self.units], &shape));
                    }
                    Some(d) => d,
                    None => shape[0],
                };
                if in_dim == 0 {
                    return Err(LayerError::config(
                        &self.name,
                        "kernel input dimension must be at least 1",
                    ));
                }
                self.input_dim = Some(in_dim);
                let mirror = self.mirror_for(&value)?;
                self.kernel = Some(Param {
                    host: value,
                    mirror,
                });
                Ok(())
            }
            "bias" => {
                if !self.use_bias {
                    return Err(LayerError::config(
                        &self.name,
                        "bias is disabled for this layer",
                    ));
                }
                if self.bias.is_some() {
                    return Err(LayerError::config(
                        &self.name,
                        "parameter `bias` is already set",
                    ));
                }
                if value.shape() != [self.units] {
                    return Err(LayerError::shape(
                        &self.name,
                        vec![self.units],
                        value.shape(),
                    ));
                }
                let mirror = self.mirror_for(&value)?;
                self.bias = Some(Param {
                    host: value,
                    mirror,
                });
                Ok(())
            }
            other => Err(LayerError::config(
                &self.name,
                format!("unknown parameter `{other}`"),
            )),
        }
    }

    /// Read access to an attached parameter.
    pub fn parameter(&self, name: &str) -> Option<&Tensor> {
        match name {
            "kernel" => self.kernel.as_ref().map(|p| &p.host),
            "bias" => self.bias.as_ref().map(|p| &p.host),
            _ => None,
        }
    }

    /// Runs the layer on one input vector and returns its output buffer.
    ///
    /// `downstream` is the number of consumers that will read this output
    /// as their own input. On the GPU path it decides the readback policy:
    /// with zero consumers the result is materialized into host memory
    /// before returning; otherwise it stays device-resident (the returned
    /// tensor's host data is then stale, but its mirror handle chains into
    /// the next layer without a round trip). The CPU path ignores it.
    ///
    /// The input is borrowed mutably only so a missing device mirror can
    /// be recorded on it; host data is never modified. The mirror is
    /// created the first time an input reaches the device and reused on
    /// every later call, so host edits made to an already-mirrored input
    /// are not re-uploaded; build a fresh tensor instead of mutating one
    /// in place. Every element of
    /// the output is overwritten on every call, either by bias-seeded
    /// accumulation or by a full program dispatch, so results never depend
    /// on previous calls.
    ///
    /// # Errors
    ///
    /// [`LayerError::ShapeMismatch`] if the input's trailing dimension
    /// does not equal the resolved input width (or the input is not a
    /// single vector); [`LayerError::Config`] if a required parameter is
    /// missing; [`LayerError::Resource`] if device work fails.
    pub fn compute(
        &mut self,
        input: &mut Tensor,
        downstream: usize,
    ) -> Result<&Tensor, LayerError> {
        let in_dim = match self.input_dim {
            Some(d) => d,
            None => {
                let d = input.trailing_dim().unwrap_or(0);
                if d == 0 {
                    return Err(LayerError::shape(&self.name, vec![1], input.shape()));
                }
                self.input_dim = Some(d);
                d
            }
        };
        if input.trailing_dim() != Some(in_dim) || input.data().len() != in_dim {
            return Err(LayerError::shape(&self.name, vec![in_dim], input.shape()));
        }
        let Some(kernel) = self.kernel.as_ref() else {
            return Err(LayerError::config(
                &self.name,
                "parameter `kernel` must be set before compute",
            ));
        };
        let bias = self.bias.as_ref();
        if self.use_bias && bias.is_none() {
            return Err(LayerError::config(
                &self.name,
                "bias is enabled but parameter `bias` is not set",
            ));
        }
        self.started = true;

        let activation = self.activation;
        let units = self.units;
        match &mut self.engine {
            Engine::Cpu { output } => {
                cpu_affine(output, &kernel.host, bias.map(|p| &p.host), input, units);
                activation.apply(output.data_mut());
                Ok(output)
            }
            Engine::Gpu(state) => {
                gpu_forward(&self.name, state, kernel, bias, input, in_dim, units, downstream)?;
                match state.slot {
                    OutputSlot::PreactAlias => Ok(&state.preact),
                    OutputSlot::Owned => Ok(&state.output),
                }
            }
        }
    }

    fn mirror_for(&self, value: &Tensor) -> Result<Option<BufferId>, LayerError> {
        match &self.engine {
            Engine::Cpu { .. } => Ok(None),
            Engine::Gpu(state) => state
                .runtime
                .upload(value.data())
                .map(Some)
                .map_err(|e| LayerError::resource(&self.name, e)),
        }
    }
}

/// Validates hyperparameters and resolves the effective activation kind,
/// parsing `activation_name` when one was requested.
fn resolve_config(name: &str, config: &DenseConfig) -> Result<Activation, LayerError> {
    if config.units < 1 {
        return Err(LayerError::config(name, "units must be at least 1"));
    }
    if config.input_dim == Some(0) {
        return Err(LayerError::config(name, "input_dim must be at least 1"));
    }
    match &config.activation_name {
        Some(raw) => raw
            .parse()
            .map_err(|()| LayerError::config(name, format!("unknown activation `{raw}`"))),
        None => Ok(config.activation),
    }
}

/// `output = bias_or_zero + Wᵗ·x` on host memory.
///
/// The kernel is stored `[input_dim, units]` and multiplied as its
/// transpose; the accumulator is seeded from the bias, or explicitly
/// zeroed when bias is off (buffer contents from earlier calls must never
/// leak through).
fn cpu_affine(
    output: &mut Tensor,
    kernel: &Tensor,
    bias: Option<&Tensor>,
    input: &Tensor,
    units: usize,
) {
    match bias {
        Some(b) => output.data_mut().copy_from_slice(b.data()),
        None => output.data_mut().fill(0.0),
    }
    let x = input.data();
    let w = kernel.data();
    output
        .data_mut()
        .par_iter_mut()
        .enumerate()
        .for_each(|(j, y)| {
            let mut acc = *y;
            for (i, &xi) in x.iter().enumerate() {
                acc += w[i * units + j] * xi;
            }
            *y = acc;
        });
}

#[allow(clippy::too_many_arguments)]
fn gpu_forward(
    name: &str,
    state: &mut GpuState,
    kernel: &Param,
    bias: Option<&Param>,
    input: &mut Tensor,
    in_dim: usize,
    units: usize,
    downstream: usize,
) -> Result<(), LayerError> {
    // The one allowed per-call allocation: inputs vary call to call, so an
    // input that has never been on the device is mirrored here.
    let x_buf = match input.mirror() {
        Some(id) => id,
        None => {
            let id = state
                .runtime
                .upload(input.data())
                .map_err(|e| LayerError::resource(name, e))?;
            input.set_mirror(id);
            id
        }
    };
    let Some(w_buf) = kernel.mirror else {
        return Err(LayerError::config(name, "kernel has no device mirror"));
    };
    let (b_buf, add_bias) = match bias {
        Some(p) => match p.mirror {
            Some(id) => (id, 1),
            None => return Err(LayerError::config(name, "bias has no device mirror")),
        },
        None => (state.zero_bias, 0),
    };

    let uniforms = [
        Uniform::new("m", 1),
        Uniform::new("k", in_dim as u32),
        Uniform::new("n", units as u32),
        Uniform::new("add_bias", add_bias),
    ];
    state
        .runtime
        .run(state.affine, &[x_buf, w_buf, b_buf], state.preact_buf, &uniforms)
        .map_err(|e| LayerError::resource(name, e))?;

    match state.activation {
        // identity: skip the activation dispatch and alias the output to
        // the pre-activation buffer
        None => state.slot = OutputSlot::PreactAlias,
        Some(prog) => {
            state
                .runtime
                .run(prog, &[state.preact_buf], state.output_buf, &[])
                .map_err(|e| LayerError::resource(name, e))?;
            state.slot = OutputSlot::Owned;
        }
    }

    if downstream == 0 {
        let (buf, host) = match state.slot {
            OutputSlot::PreactAlias => (state.preact_buf, &mut state.preact),
            OutputSlot::Owned => (state.output_buf, &mut state.output),
        };
        state
            .runtime
            .read_back(buf, host.data_mut())
            .map_err(|e| LayerError::resource(name, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor;

    fn scenario_kernel() -> Tensor {
        tensor!([[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]])
    }

    #[test]
    fn cpu_identity_affine() {
        let mut layer = Dense::cpu("fc1", DenseConfig::new(2)).unwrap();
        layer.set_parameter("kernel", scenario_kernel()).unwrap();
        layer
            .set_parameter("bias", Tensor::new(vec![2], vec![0.0, 0.0]))
            .unwrap();

        let mut input = Tensor::new(vec![3], vec![1.0, 2.0, 3.0]);
        let out = layer.compute(&mut input, 0).unwrap();
        assert_eq!(out.data(), &[4.0, 5.0]);
    }

    #[test]
    fn cpu_relu_clamps_negative_preactivation() {
        let config = DenseConfig::new(2).with_activation(Activation::Relu);
        let mut layer = Dense::cpu("fc1", config).unwrap();
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
    fn cpu_without_bias_zeroes_the_accumulator() {
        let mut layer = Dense::cpu("fc1", DenseConfig::new(2).without_bias()).unwrap();
        layer.set_parameter("kernel", scenario_kernel()).unwrap();

        // first call leaves nonzero values in the output buffer
        let mut warm = Tensor::new(vec![3], vec![5.0, 5.0, 5.0]);
        layer.compute(&mut warm, 0).unwrap();

        // second call must not see them
        let mut input = Tensor::new(vec![3], vec![1.0, 1.0, 1.0]);
        let out = layer.compute(&mut input, 0).unwrap();
        assert_eq!(out.data(), &[2.0, 2.0]);
    }

    #[test]
    fn input_width_is_inferred_then_enforced() {
        let mut layer = Dense::cpu("fc1", DenseConfig::new(2)).unwrap();
        layer.set_parameter("kernel", scenario_kernel()).unwrap();
        layer
            .set_parameter("bias", Tensor::new(vec![2], vec![0.0, 0.0]))
            .unwrap();

        let mut input = Tensor::new(vec![3], vec![1.0, 2.0, 3.0]);
        layer.compute(&mut input, 0).unwrap();

        let mut wrong = Tensor::new(vec![4], vec![1.0; 4]);
        let err = layer.compute(&mut wrong, 0).unwrap_err();
        assert!(matches!(
            err,
            LayerError::ShapeMismatch { expected, actual, .. }
                if expected == vec![3] && actual == vec![4]
        ));
    }

    #[test]
    fn kernel_shape_must_match_units() {
        let mut layer = Dense::cpu("fc1", DenseConfig::new(2)).unwrap();
        let err = layer
            .set_parameter("kernel", Tensor::new(vec![3, 4], vec![0.0; 12]))
            .unwrap_err();
        assert!(matches!(err, LayerError::ShapeMismatch { .. }));
    }

    #[test]
    fn missing_parameters_are_configuration_errors() {
        let mut layer = Dense::cpu("fc1", DenseConfig::new(2)).unwrap();
        let mut input = Tensor::new(vec![3], vec![1.0, 2.0, 3.0]);
        assert!(matches!(
            layer.compute(&mut input, 0),
            Err(LayerError::Config { .. })
        ));

        layer.set_parameter("kernel", scenario_kernel()).unwrap();
        // bias enabled but never attached
        assert!(matches!(
            layer.compute(&mut input, 0),
            Err(LayerError::Config { .. })
        ));
    }

    #[test]
    fn parameters_set_at_most_once() {
        let mut layer = Dense::cpu("fc1", DenseConfig::new(2)).unwrap();
        layer.set_parameter("kernel", scenario_kernel()).unwrap();
        assert!(matches!(
            layer.set_parameter("kernel", scenario_kernel()),
            Err(LayerError::Config { .. })
        ));
    }

    #[test]
    fn parameters_freeze_after_first_compute() {
        let mut layer = Dense::cpu("fc1", DenseConfig::new(2).without_bias()).unwrap();
        layer.set_parameter("kernel", scenario_kernel()).unwrap();
        let mut input = Tensor::new(vec![3], vec![1.0, 2.0, 3.0]);
        layer.compute(&mut input, 0).unwrap();

        let err = layer
            .set_parameter("bias", Tensor::new(vec![2], vec![0.0, 0.0]))
            .unwrap_err();
        assert!(matches!(err, LayerError::Config { .. }));
    }

    #[test]
    fn activation_names_resolve_at_construction() {
        let config = DenseConfig::new(2).with_activation_name("relu");
        let layer = Dense::cpu("fc1", config).unwrap();
        assert_eq!(layer.activation(), Activation::Relu);
    }

    #[test]
    fn unknown_activation_name_is_a_configuration_error() {
        let config = DenseConfig::new(2).with_activation_name("swish");
        let err = Dense::cpu("fc1", config).unwrap_err();
        assert!(matches!(err, LayerError::Config { .. }));
        assert!(err.to_string().contains("fc1"));
        assert!(err.to_string().contains("swish"));
    }

    #[test]
    fn zero_units_is_rejected() {
        assert!(matches!(
            Dense::cpu("fc1", DenseConfig::new(0)),
            Err(LayerError::Config { .. })
        ));
    }

    #[test]
    fn unknown_parameter_name_is_rejected() {
        let mut layer = Dense::cpu("fc1", DenseConfig::new(2)).unwrap();
        let err = layer
            .set_parameter("gamma", Tensor::zeros(vec![2]))
            .unwrap_err();
        assert!(matches!(err, LayerError::Config { .. }));
    }

    #[test]
    fn identical_configurations_agree() {
        let build = || {
            let mut layer = Dense::cpu(
                "fc1",
                DenseConfig::new(2).with_activation(Activation::Sigmoid),
            )
            .unwrap();
            layer.set_parameter("kernel", scenario_kernel()).unwrap();
            layer
                .set_parameter("bias", Tensor::new(vec![2], vec![0.25, -0.25]))
                .unwrap();
            layer
        };
        let (mut a, mut b) = (build(), build());
        let mut input_a = Tensor::new(vec![3], vec![0.5, -1.5, 2.0]);
        let mut input_b = input_a.clone();
        assert_eq!(
            a.compute(&mut input_a, 0).unwrap(),
            b.compute(&mut input_b, 0).unwrap()
        );
    }

    #[test]
    fn output_shape_reports_units() {
        let layer = Dense::cpu("fc1", DenseConfig::new(7)).unwrap();
        assert_eq!(layer.output_shape(), vec![7]);
    }
}
