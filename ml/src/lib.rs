//! Layers and models for a multi-branch convolution/attention variational autoencoder.
//! Feature maps are `(channels, height, width)`, token sequences `(tokens, embed_dim)`.
pub mod activation_functions;
pub mod attention;
pub mod blocks;
mod branches;
pub mod config;
pub mod convolutions;
pub mod coupling;
pub mod fully_connected;
pub mod initializers;
pub mod models;
pub mod normalization;
pub mod patches;
pub mod pooling;
pub mod transposed_convolutions;
pub mod weight_loader;

use ndarray::{Array2, Array3, Array4};

pub type WeightPrecision = f32;
pub type ImagePrecision = f32;

/// A single feature map, `(channels, height, width)`.
pub type InternalDataRepresentation = Array3<ImagePrecision>;
/// A token sequence, `(tokens, embed_dim)`. Token 0 is the class token.
pub type TokenSequence = Array2<ImagePrecision>;
pub type ConvKernel = Array4<WeightPrecision>;

pub use config::ModelConfig;
pub use models::{CnnAttnVae, ModelError, Posterior};
