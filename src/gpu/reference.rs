//! Host-side implementation of the [`GpuRuntime`] contract.
//!
//! `ReferenceRuntime` keeps its "device" buffers in host vectors and runs
//! each program with the same layout, accumulation order, and uniform
//! protocol as the compute shaders. It serves two purposes: a fallback when
//! the crate is built without the `wgpu` feature, and the runtime the test
//! suite injects to exercise the GPU execution path (including its
//! transfer counting) without hardware.

use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{BufferId, GpuError, GpuRuntime, ProgramId, ProgramKind, Uniform};
use crate::activations::Activation;

/// Host-memory runtime implementing the device contract.
#[derive(Debug, Default)]
pub struct ReferenceRuntime {
    buffers: Mutex<Vec<Vec<f32>>>,
    programs: Mutex<Vec<ProgramKind>>,
    readbacks: AtomicUsize,
}

impl ReferenceRuntime {
    /// Creates an empty runtime.
    pub fn new() -> Self {
        Self::default()
    }
}

fn uniform(uniforms: &[Uniform], name: &'static str) -> Result<u32, GpuError> {
    uniforms
        .iter()
        .find(|u| u.name == name)
        .map(|u| u.value)
        .ok_or(GpuError::MissingUniform(name))
}

impl GpuRuntime for ReferenceRuntime {
    fn compile(&self, kind: ProgramKind) -> Result<ProgramId, GpuError> {
        if kind == ProgramKind::Activation(Activation::Identity) {
            return Err(GpuError::UnsupportedProgram(kind));
        }
        let mut programs = self.programs.lock().expect("program registry poisoned");
        programs.push(kind);
        Ok(ProgramId(programs.len() - 1))
    }

    fn alloc(&self, len: usize) -> Result<BufferId, GpuError> {
        let mut buffers = self.buffers.lock().expect("buffer registry poisoned");
        buffers.push(vec![0.0; len]);
        Ok(BufferId(buffers.len() - 1))
    }

    fn upload(&self, data: &[f32]) -> Result<BufferId, GpuError> {
        let mut buffers = self.buffers.lock().expect("buffer registry poisoned");
        buffers.push(data.to_vec());
        Ok(BufferId(buffers.len() - 1))
    }

    fn run(
        &self,
        program: ProgramId,
        inputs: &[BufferId],
        output: BufferId,
        uniforms: &[Uniform],
    ) -> Result<(), GpuError> {
        let kind = {
            let programs = self.programs.lock().expect("program registry poisoned");
            *programs
                .get(program.0)
                .ok_or(GpuError::UnknownProgram(program))?
        };

        // Inputs are cloned out of the registry; the reference path trades
        // copies for borrow simplicity.
        let fetched: Vec<Vec<f32>> = {
            let buffers = self.buffers.lock().expect("buffer registry poisoned");
            inputs
                .iter()
                .map(|&id| {
                    buffers
                        .get(id.0)
                        .cloned()
                        .ok_or(GpuError::UnknownBuffer(id))
                })
                .collect::<Result<_, _>>()?
        };

        let result = match kind {
            ProgramKind::Affine => {
                let m = uniform(uniforms, "m")? as usize;
                let k = uniform(uniforms, "k")? as usize;
                let n = uniform(uniforms, "n")? as usize;
                let add_bias = uniform(uniforms, "add_bias")? != 0;

                let [x, w, bias] = fetched.as_slice() else {
                    return Err(GpuError::Transfer(format!(
                        "affine expects 3 inputs, got {}",
                        fetched.len()
                    )));
                };

                // Same accumulation order as the affine shader: one serial
                // reduction over k per (row, col) cell.
                let mut y = vec![0.0f32; m * n];
                for row in 0..m {
                    for col in 0..n {
                        let mut acc = 0.0f32;
                        for i in 0..k {
                            acc += x[row * k + i] * w[i * n + col];
                        }
                        if add_bias {
                            acc += bias[col];
                        }
                        y[row * n + col] = acc;
                    }
                }
                y
            }
            ProgramKind::Activation(act) => {
                let [x] = fetched.as_slice() else {
                    return Err(GpuError::Transfer(format!(
                        "activation expects 1 input, got {}",
                        fetched.len()
                    )));
                };
                let mut y = x.clone();
                act.apply(&mut y);
                y
            }
        };

        let mut buffers = self.buffers.lock().expect("buffer registry poisoned");
        let out = buffers
            .get_mut(output.0)
            .ok_or(GpuError::UnknownBuffer(output))?;
        if out.len() != result.len() {
            return Err(GpuError::Transfer(format!(
                "program wrote {} elements into a buffer of {}",
                result.len(),
                out.len()
            )));
        }
        *out = result;
        Ok(())
    }

    fn read_back(&self, buffer: BufferId, out: &mut [f32]) -> Result<(), GpuError> {
        let buffers = self.buffers.lock().expect("buffer registry poisoned");
        let src = buffers
            .get(buffer.0)
            .ok_or(GpuError::UnknownBuffer(buffer))?;
        if src.len() != out.len() {
            return Err(GpuError::Transfer(format!(
                "buffer holds {} elements, host target holds {}",
                src.len(),
                out.len()
            )));
        }
        out.copy_from_slice(src);
        self.readbacks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn readback_count(&self) -> usize {
        self.readbacks.load(Ordering::Relaxed)
    }
}
