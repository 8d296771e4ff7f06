use crate::{
    initializers::Init,
    weight_loader::{WeightLoader, WeightResult},
    ImagePrecision, WeightPrecision,
};
use ndarray::*;

/// Rust implementation of a feed forward (linear) layer.
/// The weight matrix shall have dimension (in that order)
/// output units x input units (to comply with the order in which pytorch weights are saved).
#[derive(Debug, Clone)]
pub struct FeedforwardLayer {
    weights: Array2<WeightPrecision>,
    bias: Option<Array1<WeightPrecision>>,
}

impl FeedforwardLayer {
    pub fn new(
        weights: Array2<WeightPrecision>,
        bias: Option<Array1<WeightPrecision>>,
    ) -> FeedforwardLayer {
        if let Some(b) = &bias {
            debug_assert_eq!(b.len(), weights.nrows(), "Bias does not match output units");
        }
        FeedforwardLayer { weights, bias }
    }

    /// Loads `{name}.weight` and, if requested, `{name}.bias`.
    /// Fresh parameters use a truncated normal (std 0.02) and a zero bias.
    pub fn from_loader(
        loader: &mut impl WeightLoader,
        name: &str,
        input_dimension: usize,
        output_dimension: usize,
        bias: bool,
    ) -> WeightResult<FeedforwardLayer> {
        let weights = loader.get_weight(
            &format!("{}.weight", name),
            (output_dimension, input_dimension),
            Init::TruncNormal { std: 0.02 },
        )?;
        let bias = if bias {
            Some(loader.get_weight(
                &format!("{}.bias", name),
                output_dimension,
                Init::Constant(0.0),
            )?)
        } else {
            None
        };
        Ok(FeedforwardLayer::new(weights, bias))
    }

    pub fn input_dimension(&self) -> usize {
        self.weights.ncols()
    }

    pub fn output_dimension(&self) -> usize {
        self.weights.nrows()
    }

    /// Applies the layer to every row of `data`, `(rows, in) -> (rows, out)`.
    pub fn forward_pass<'a, V>(&self, data: V) -> Array2<ImagePrecision>
    where
        V: AsArray<'a, ImagePrecision, Ix2>,
    {
        let data_arr: ArrayView2<ImagePrecision> = data.into();
        debug_assert_eq!(data_arr.ncols(), self.input_dimension());
        let mut out = data_arr.dot(&self.weights.t());
        if let Some(bias) = &self.bias {
            out += bias;
        }
        out
    }

    /// Applies the layer to a single vector.
    pub fn forward_vector<'a, V>(&self, data: V) -> Array1<ImagePrecision>
    where
        V: AsArray<'a, ImagePrecision, Ix1>,
    {
        let data_arr: ArrayView1<ImagePrecision> = data.into();
        debug_assert_eq!(data_arr.len(), self.input_dimension());
        let mut out = self.weights.dot(&data_arr);
        if let Some(bias) = &self.bias {
            out += bias;
        }
        out
    }
}
