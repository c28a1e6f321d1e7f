//! Device runtime contract for the GPU execution path.
//!
//! A [`GpuRuntime`] owns device-resident buffers and compiled compute
//! programs behind opaque handles. Layers never talk to a device API
//! directly: they compile programs at construction, create buffer mirrors
//! when parameters are attached, and dispatch [`GpuRuntime::run`] per call.
//! The runtime is passed into each layer explicitly, so the whole GPU path
//! is exercisable without real hardware by substituting
//! [`ReferenceRuntime`](reference::ReferenceRuntime), which implements the
//! same contract on host memory.
//!
//! Two invariants the contract leans on:
//!
//! - handles are plain indices with no ownership; buffers and programs live
//!   as long as the runtime that created them;
//! - [`GpuRuntime::readback_count`] counts every device-to-host transfer,
//!   making the conditional-readback policy of the layer observable.

use crate::activations::Activation;

pub mod reference;

#[cfg(feature = "wgpu")]
pub mod wgpu;

/// Opaque handle to a device-resident `f32` buffer owned by a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferId(pub(crate) usize);

/// Opaque handle to a compiled compute program owned by a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramId(pub(crate) usize);

/// The fixed computations a runtime knows how to compile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramKind {
    /// `y = x · W (+ bias)`: the input vector is a single-row matrix
    /// `[m, k]`, the weights are `[k, n]`, the bias (added only when the
    /// `add_bias` uniform is nonzero) is `[n]`.
    Affine,
    /// One element-wise program per non-identity activation kind.
    Activation(Activation),
}

/// A named scalar bound alongside a program invocation.
#[derive(Debug, Clone, Copy)]
pub struct Uniform {
    /// Name the program declares for this scalar.
    pub name: &'static str,
    /// Scalar value.
    pub value: u32,
}

impl Uniform {
    /// Binds `value` under `name`.
    pub fn new(name: &'static str, value: u32) -> Self {
        Self { name, value }
    }
}

/// Failures raised by a runtime while building or running device work.
#[derive(Debug)]
pub enum GpuError {
    /// Device or adapter acquisition failed.
    Init(String),
    /// The requested program has no device form (identity activation).
    UnsupportedProgram(ProgramKind),
    /// A buffer handle did not resolve in this runtime's registry.
    UnknownBuffer(BufferId),
    /// A program handle did not resolve in this runtime's registry.
    UnknownProgram(ProgramId),
    /// A program was invoked without a scalar it declares.
    MissingUniform(&'static str),
    /// A host transfer failed or moved a mismatched number of elements.
    Transfer(String),
}

impl core::fmt::Display for GpuError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Init(e) => write!(f, "device initialization failed: {e}"),
            Self::UnsupportedProgram(kind) => {
                write!(f, "no device program exists for {kind:?}")
            }
            Self::UnknownBuffer(BufferId(id)) => write!(f, "unknown buffer handle {id}"),
            Self::UnknownProgram(ProgramId(id)) => write!(f, "unknown program handle {id}"),
            Self::MissingUniform(name) => write!(f, "missing uniform `{name}`"),
            Self::Transfer(e) => write!(f, "host transfer failed: {e}"),
        }
    }
}

impl core::error::Error for GpuError {}

/// Contract between layers and a compute device.
///
/// All methods take `&self`: runtimes are internally synchronized and are
/// shared across layers as `Arc<dyn GpuRuntime>`. The contract is
/// synchronous from the caller's viewpoint; `run` may queue work on the
/// device, but `read_back` returns only once results are host-visible.
pub trait GpuRuntime: Send + Sync {
    /// Compiles one program. Expensive; layers call this once at
    /// construction and reuse the handle for every subsequent dispatch.
    fn compile(&self, kind: ProgramKind) -> Result<ProgramId, GpuError>;

    /// Allocates an uninitialized device buffer of `len` elements.
    fn alloc(&self, len: usize) -> Result<BufferId, GpuError>;

    /// Creates a device buffer holding a copy of `data`.
    fn upload(&self, data: &[f32]) -> Result<BufferId, GpuError>;

    /// Dispatches `program` over `inputs`, writing `output` in full.
    fn run(
        &self,
        program: ProgramId,
        inputs: &[BufferId],
        output: BufferId,
        uniforms: &[Uniform],
    ) -> Result<(), GpuError>;

    /// Copies a device buffer back into host memory. `out` must have
    /// exactly the buffer's length.
    fn read_back(&self, buffer: BufferId, out: &mut [f32]) -> Result<(), GpuError>;

    /// Number of device-to-host transfers performed so far.
    fn readback_count(&self) -> usize;
}
