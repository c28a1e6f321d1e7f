//! Host tensor container with an optional device-resident mirror.
//!
//! A [`Tensor`] is a shape plus flat row-major `f32` data, the same layout
//! the compute programs consume. On top of the host buffer it can carry a
//! [`BufferId`] pointing at a device-resident copy owned by a
//! [`GpuRuntime`](crate::gpu::GpuRuntime). The mirror is a plain handle:
//! creating, filling, and reading it back is always the runtime's job; the
//! tensor only remembers which buffer holds its device copy so repeated
//! layer calls never re-upload the same data.
//!
//! ## Design notes
//!
//! - Row-major only, `f32` only. The GPU programs are written against this
//!   exact layout.
//! - Cloning copies shape, data, and the mirror handle. Handles carry no
//!   ownership; the runtime that created a buffer keeps it alive. A cloned
//!   tensor therefore still chains into downstream device work.
//! - Equality compares shape and host data only. Two tensors holding the
//!   same values are equal no matter where their mirrors live.

use crate::gpu::BufferId;

/// An N-dimensional tensor: shape, flat row-major data, optional device mirror.
#[derive(Debug, Clone)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
    mirror: Option<BufferId>,
}

impl Tensor {
    /// Creates a new tensor with the given shape and flat data.
    ///
    /// # Panics
    /// Panics if the number of elements in `data` does not match the shape product.
    pub fn new(shape: impl Into<Vec<usize>>, data: Vec<f32>) -> Self {
        let shape = shape.into();
        assert_eq!(
            shape.iter().product::<usize>(),
            data.len(),
            "shape {:?} is incompatible with {} data elements",
            shape,
            data.len()
        );
        Self {
            shape,
            data,
            mirror: None,
        }
    }

    /// Creates a zero-filled tensor of the given shape.
    pub fn zeros(shape: impl Into<Vec<usize>>) -> Self {
        let shape = shape.into();
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![0.0; len],
            mirror: None,
        }
    }

    /// The tensor's shape, outermost dimension first.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// The trailing dimension, if the tensor has one.
    pub fn trailing_dim(&self) -> Option<usize> {
        self.shape.last().copied()
    }

    /// Read access to the flat host buffer.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Write access to the flat host buffer.
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// The device-resident mirror, if one has been created.
    pub fn mirror(&self) -> Option<BufferId> {
        self.mirror
    }

    /// Records the device buffer holding this tensor's mirror.
    pub fn set_mirror(&mut self, buffer: BufferId) {
        self.mirror = Some(buffer);
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        self.shape == other.shape && self.data == other.data
    }
}

/// Defines a tensor from nested literal arrays.
///
/// Sublists must be uniform in shape; ragged literals panic.
///
/// # Example
/// ```
/// use dualdense::tensor;
/// let t = tensor!([[1.0, 2.0], [3.0, 4.0]]);
/// assert_eq!(t.shape(), &[2, 2]);
/// ```
#[macro_export]
macro_rules! tensor {
    ($lit:literal) => {
        $crate::tensors::Tensor::new(Vec::<usize>::new(), vec![$lit])
    };

    // nested: every element is itself a bracketed row
    ([ $( [ $($row:tt)* ] ),+ $(,)? ]) => {{
        let children = vec![ $( $crate::tensor!([ $($row)* ]) ),+ ];
        let first_shape = children[0].shape().to_vec();
        assert!(children.iter().all(|c| c.shape() == first_shape),
            "ragged tensor literal (rows have mismatched shapes)");
        let mut shape = vec![children.len()];
        shape.extend_from_slice(&first_shape);
        let mut data = Vec::with_capacity(children.len() * children[0].data().len());
        for c in &children { data.extend_from_slice(c.data()); }
        $crate::tensors::Tensor::new(shape, data)
    }};

    // innermost row: scalars, matched as expressions so signed literals
    // like `-1.0` work
    ([ $( $x:expr ),+ $(,)? ]) => {{
        let data = vec![ $( $x ),+ ];
        let shape = vec![data.len()];
        $crate::tensors::Tensor::new(shape, data)
    }};
}
