use ndarray::*;

use crate::{
    initializers::Init,
    weight_loader::{WeightLoader, WeightResult},
    ImagePrecision, InternalDataRepresentation, TokenSequence, WeightPrecision,
};

/// Epsilon used by the normalisation layers inside the convolution and transformer blocks.
pub const BLOCK_EPS: WeightPrecision = 1e-6;
/// PyTorch's default epsilon.
pub const DEFAULT_EPS: WeightPrecision = 1e-5;

/// Batch normalisation in evaluation mode. The affine transform and the running
/// statistics are folded into one scale and one shift per channel:
/// `y = x * weight / sqrt(var + eps) + (bias - mean * weight / sqrt(var + eps))`.
#[derive(Debug, Clone)]
pub struct BatchNormLayer {
    scale: Array1<WeightPrecision>,
    shift: Array1<WeightPrecision>,
}

impl BatchNormLayer {
    pub fn new(
        weight: Array1<WeightPrecision>,
        bias: Array1<WeightPrecision>,
        running_mean: Array1<WeightPrecision>,
        running_var: Array1<WeightPrecision>,
        eps: WeightPrecision,
    ) -> BatchNormLayer {
        let scale = &weight / &running_var.mapv(|v| (v + eps).sqrt());
        let shift = &bias - &(&running_mean * &scale);
        BatchNormLayer { scale, shift }
    }

    /// Loads `{name}.weight`, `{name}.bias`, `{name}.running_mean` and `{name}.running_var`.
    pub fn from_loader(
        loader: &mut impl WeightLoader,
        name: &str,
        num_channels: usize,
        eps: WeightPrecision,
    ) -> WeightResult<BatchNormLayer> {
        let weight = loader.get_weight(
            &format!("{}.weight", name),
            num_channels,
            Init::Constant(1.0),
        )?;
        let bias = loader.get_weight(&format!("{}.bias", name), num_channels, Init::Constant(0.0))?;
        let running_mean = loader.get_weight(
            &format!("{}.running_mean", name),
            num_channels,
            Init::Constant(0.0),
        )?;
        let running_var = loader.get_weight(
            &format!("{}.running_var", name),
            num_channels,
            Init::Constant(1.0),
        )?;
        Ok(BatchNormLayer::new(
            weight,
            bias,
            running_mean,
            running_var,
            eps,
        ))
    }

    pub fn normalize(&self, x: &InternalDataRepresentation) -> InternalDataRepresentation {
        let mut out = x.clone();
        self.normalize_inplace(&mut out);
        out
    }

    pub fn normalize_inplace(&self, x: &mut InternalDataRepresentation) {
        debug_assert_eq!(x.len_of(Axis(0)), self.scale.len());
        for ((mut channel, scale), shift) in x
            .outer_iter_mut()
            .zip(self.scale.iter())
            .zip(self.shift.iter())
        {
            channel.mapv_inplace(|v| v * scale + shift);
        }
    }
}

/// Layer normalisation over the last axis (the embedding axis of a token sequence).
#[derive(Debug, Clone)]
pub struct LayerNormLayer {
    weight: Array1<WeightPrecision>,
    bias: Array1<WeightPrecision>,
    eps: WeightPrecision,
}

impl LayerNormLayer {
    pub fn new(
        weight: Array1<WeightPrecision>,
        bias: Array1<WeightPrecision>,
        eps: WeightPrecision,
    ) -> LayerNormLayer {
        LayerNormLayer { weight, bias, eps }
    }

    pub fn from_loader(
        loader: &mut impl WeightLoader,
        name: &str,
        dim: usize,
        eps: WeightPrecision,
    ) -> WeightResult<LayerNormLayer> {
        let weight = loader.get_weight(&format!("{}.weight", name), dim, Init::Constant(1.0))?;
        let bias = loader.get_weight(&format!("{}.bias", name), dim, Init::Constant(0.0))?;
        Ok(LayerNormLayer::new(weight, bias, eps))
    }

    /// Normalises every row of `x` with its own (biased) mean and variance.
    pub fn normalize<'a, V>(&self, x: V) -> TokenSequence
    where
        V: AsArray<'a, ImagePrecision, Ix2>,
    {
        let x: ArrayView2<ImagePrecision> = x.into();
        debug_assert_eq!(x.ncols(), self.weight.len());
        let mut out = x.to_owned();
        for mut row in out.outer_iter_mut() {
            let n = row.len() as ImagePrecision;
            let mean = row.sum() / n;
            let var = row.iter().map(|v| (v - mean).powi(2)).sum::<ImagePrecision>() / n;
            let inv_std = 1.0 / (var + self.eps).sqrt();
            Zip::from(&mut row)
                .and(&self.weight)
                .and(&self.bias)
                .for_each(|v, w, b| *v = (*v - mean) * inv_std * w + b);
        }
        out
    }
}
