//! dualdense: a dual-backend dense inference layer.
//!
//! One affine+activation transform, `activation(Wᵗx + b)`, with two
//! interchangeable execution paths behind a single `compute` contract: a
//! CPU numeric kernel, and compiled compute programs on a GPU runtime.
//! The two paths use entirely different primitives but must stay
//! observably equivalent within floating-point tolerance.
//!
//! # Features
//!
//! - Construction-time backend selection; no per-call re-dispatch.
//! - Explicit, injectable GPU runtime: the real `wgpu` implementation is
//!   behind the `wgpu` cargo feature, and a host-memory reference runtime
//!   implements the same contract for tests and GPU-less builds.
//! - Strict resource discipline on the GPU path: programs compiled once at
//!   construction, parameter mirrors created once at attach, working
//!   buffers allocated once, results read back only when nothing
//!   downstream consumes them.
//!
//! # Goals
//!
//! - Keep the CPU and GPU paths bit-for-bit honest about the same affine
//!   map, so either can stand in for the other in an inference graph.
//! - Make every failure structural and attributable: errors carry the
//!   layer's name and the expected-versus-actual shapes.
//!
//! # Modules
//!
//! - [`dense`]: the layer itself, with configuration, parameter store,
//!   and both execution paths.
//! - [`tensors`]: host tensor container with an optional device mirror.
//! - [`activations`]: activation kinds, CPU forms, program selection.
//! - [`gpu`]: the device runtime contract and its implementations.
//! - [`error`]: the error taxonomy.
//!
//! # Example
//!
//! ```rust
//! use dualdense::dense::{Dense, DenseConfig};
//! use dualdense::tensors::Tensor;
//!
//! let mut layer = Dense::cpu("fc1", DenseConfig::new(2)).unwrap();
//! layer
//!     .set_parameter(
//!         "kernel",
//!         Tensor::new(vec![3, 2], vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0]),
//!     )
//!     .unwrap();
//! layer
//!     .set_parameter("bias", Tensor::new(vec![2], vec![0.0, 0.0]))
//!     .unwrap();
//!
//! let mut input = Tensor::new(vec![3], vec![1.0, 2.0, 3.0]);
//! let out = layer.compute(&mut input, 0).unwrap();
//! assert_eq!(out.data(), &[4.0, 5.0]);
//! ```

pub mod activations;
pub mod dense;
pub mod error;
pub mod gpu;
pub mod tensors;
