//! This module provides the activation functions used by the convolutional and
//! transformer parts of the networks, namely Leaky Relu, GELU and Tanh.
//!
//! All activation functions are exposed as a free function as well as through the
//! [`Activation`] enum, which is what layers store to pick their nonlinearity.
use ndarray::*;

use crate::ImagePrecision;

/// Slope of the leaky relu for negative inputs (PyTorch default).
pub const LEAKY_RELU_SLOPE: ImagePrecision = 0.01;

/// Leaky relu implementation
pub fn leaky_relu<D: Dimension>(data: &Array<ImagePrecision, D>) -> Array<ImagePrecision, D> {
    data.mapv(leaky_relu_scalar)
}

/// Exact (erf based) GELU, `0.5 * x * (1 + erf(x / sqrt(2)))`.
///
/// The tanh approximation is not used, since the trained transformer blocks
/// rely on the exact form.
pub fn gelu<D: Dimension>(data: &Array<ImagePrecision, D>) -> Array<ImagePrecision, D> {
    data.mapv(gelu_scalar)
}

pub fn tanh<D: Dimension>(data: &Array<ImagePrecision, D>) -> Array<ImagePrecision, D> {
    data.mapv(|x| x.tanh())
}

#[inline]
fn leaky_relu_scalar(x: ImagePrecision) -> ImagePrecision {
    if x > 0. {
        x
    } else {
        LEAKY_RELU_SLOPE * x
    }
}

#[inline]
fn gelu_scalar(x: ImagePrecision) -> ImagePrecision {
    let x = x as f64;
    (0.5 * x * (1.0 + mathru::special::error::erf(x / std::f64::consts::SQRT_2))) as ImagePrecision
}

/// Nonlinearity choice of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    LeakyRelu,
    Gelu,
    Tanh,
}

impl Activation {
    #[inline]
    pub fn apply_scalar(&self, x: ImagePrecision) -> ImagePrecision {
        match self {
            Activation::LeakyRelu => leaky_relu_scalar(x),
            Activation::Gelu => gelu_scalar(x),
            Activation::Tanh => x.tanh(),
        }
    }

    pub fn activate<D: Dimension>(&self, x: &Array<ImagePrecision, D>) -> Array<ImagePrecision, D> {
        x.mapv(|a| self.apply_scalar(a))
    }

    pub fn activate_inplace<D: Dimension>(&self, x: &mut Array<ImagePrecision, D>) {
        x.mapv_inplace(|a| self.apply_scalar(a));
    }
}
