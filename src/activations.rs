//! Element-wise activation functions.
//!
//! Each kind has two forms that must agree within floating-point tolerance:
//! the in-place CPU form implemented here, and a compute program the GPU
//! runtime builds from [`ProgramKind::Activation`](crate::gpu::ProgramKind).
//! [`Activation::Identity`] has no program form at all; the GPU execution
//! path skips the activation dispatch entirely for it.

use core::str::FromStr;

/// Enumeration of supported activation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Activation {
    /// Pass-through; the affine result is the layer output.
    #[default]
    Identity,
    /// `max(0, x)`
    Relu,
    /// `1 / (1 + e^-x)`
    Sigmoid,
    /// Hyperbolic tangent.
    Tanh,
    /// `ln(1 + e^x)`
    Softplus,
}

impl Activation {
    /// The kind's canonical configuration name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Identity => "linear",
            Self::Relu => "relu",
            Self::Sigmoid => "sigmoid",
            Self::Tanh => "tanh",
            Self::Softplus => "softplus",
        }
    }

    /// Applies the activation element-wise, in place.
    pub fn apply(self, data: &mut [f32]) {
        match self {
            Self::Identity => {}
            Self::Relu => {
                for x in data {
                    *x = x.max(0.0);
                }
            }
            Self::Sigmoid => {
                for x in data {
                    *x = 1.0 / (1.0 + (-*x).exp());
                }
            }
            Self::Tanh => {
                for x in data {
                    *x = x.tanh();
                }
            }
            Self::Softplus => {
                for x in data {
                    *x = x.exp().ln_1p();
                }
            }
        }
    }
}

impl FromStr for Activation {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linear" | "identity" => Ok(Self::Identity),
            "relu" => Ok(Self::Relu),
            "sigmoid" => Ok(Self::Sigmoid),
            "tanh" => Ok(Self::Tanh),
            "softplus" => Ok(Self::Softplus),
            _ => Err(()),
        }
    }
}
