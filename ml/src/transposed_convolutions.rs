//! Transposed convolutions (also wrongly called deconvolution layers)
//! are learnable upsampling maps.
//! More can be read here:
//! - https://datascience.stackexchange.com/questions/6107/what-are-deconvolutional-layers
//! - https://github.com/akutzer/numpy_cnn/blob/master/CNN/Layer/TransposedConv.py
//! - https://ieee.nitk.ac.in/blog/deconv/
use crate::{
    convolutions::ConvParameters,
    initializers::{bias_bound, Init},
    weight_loader::{WeightLoader, WeightResult},
    ConvKernel, InternalDataRepresentation, WeightPrecision,
};
use ndarray::*;

/// Analog to a Convolution Layer.
/// The weight matrix shall have dimension (in that order)
/// input channels x output channels / groups x kernel height x kernel width,
/// which is how pytorch stores `ConvTranspose2d` weights.
#[derive(Debug, Clone)]
pub struct TransposedConvolutionLayer {
    kernel: ConvKernel,
    bias: Option<Array1<WeightPrecision>>,
    kernel_height: usize,
    kernel_width: usize,
    stride: usize,
    padding: usize,
    output_padding: usize,
    groups: usize,
    img_channels: usize,
    num_filters: usize,
}

impl TransposedConvolutionLayer {
    pub fn new(
        weights: ConvKernel,
        bias: Option<Array1<WeightPrecision>>,
        stride: usize,
        padding: usize,
        output_padding: usize,
        groups: usize,
    ) -> TransposedConvolutionLayer {
        let img_channels = weights.len_of(Axis(0));
        let num_filters = weights.len_of(Axis(1)) * groups;
        let kernel_height = weights.len_of(Axis(2));
        let kernel_width = weights.len_of(Axis(3));

        debug_assert!(stride > 0, "Stride of 0 passed");
        debug_assert!(groups > 0 && img_channels % groups == 0, "Invalid groups");
        debug_assert!(
            output_padding < stride,
            "Output padding must be smaller than the stride"
        );

        TransposedConvolutionLayer {
            kernel: weights,
            bias,
            kernel_height,
            kernel_width,
            stride,
            padding,
            output_padding,
            groups,
            img_channels,
            num_filters,
        }
    }

    /// Loads `{name}.weight` (and `{name}.bias`). Transposed convolutions keep
    /// PyTorch's default initialisation for fresh parameters.
    pub fn from_loader(
        loader: &mut impl WeightLoader,
        name: &str,
        params: ConvParameters,
    ) -> WeightResult<TransposedConvolutionLayer> {
        let k = params.kernel_size;
        let filters_per_group = params.out_channels / params.groups;
        let kernel = loader.get_weight(
            &format!("{}.weight", name),
            (params.in_channels, filters_per_group, k, k),
            Init::KaimingUniform,
        )?;
        let bias = if params.bias {
            Some(loader.get_weight(
                &format!("{}.bias", name),
                params.out_channels,
                Init::Uniform {
                    bound: bias_bound(filters_per_group * k * k),
                },
            )?)
        } else {
            None
        };
        Ok(TransposedConvolutionLayer::new(
            kernel,
            bias,
            params.stride,
            params.padding,
            params.output_padding,
            params.groups,
        ))
    }

    /// H' = (H - 1) * stride - 2 * padding + kernel + output_padding
    pub fn output_size(&self, height: usize, width: usize) -> (usize, usize) {
        (
            (height - 1) * self.stride + self.kernel_height + self.output_padding
                - 2 * self.padding,
            (width - 1) * self.stride + self.kernel_width + self.output_padding - 2 * self.padding,
        )
    }

    /// Performs a transposed convolution on the input image. This upsamples the image.
    ///
    /// Every input pixel scatters a copy of the kernel, scaled by its value, into the
    /// output at `stride * position - padding`. Per group this is one matrix product
    /// (kernel columns times flattened input) followed by a col2im accumulation.
    pub fn transposed_convolve(
        &self,
        image: &InternalDataRepresentation,
    ) -> InternalDataRepresentation {
        let (channels, height, width) = image.dim();
        debug_assert_eq!(channels, self.img_channels, "Wrong number of input channels");

        let (new_height, new_width) = self.output_size(height, width);
        let channels_per_group = self.img_channels / self.groups;
        let filters_per_group = self.num_filters / self.groups;
        let kernel_area = self.kernel_height * self.kernel_width;
        let padding = self.padding as isize;

        let mut output = Array3::zeros((self.num_filters, new_height, new_width));
        for g in 0..self.groups {
            let channel_offset = g * channels_per_group;
            let flat_image = Array2::from_shape_fn(
                (channels_per_group, height * width),
                |(c, idx)| image[[channel_offset + c, idx / width, idx % width]],
            );
            let kernel_columns =
                Array2::from_shape_fn((filters_per_group * kernel_area, channels_per_group), |(r, c)| {
                    self.kernel[[
                        channel_offset + c,
                        r / kernel_area,
                        (r / self.kernel_width) % self.kernel_height,
                        r % self.kernel_width,
                    ]]
                });
            // (filters * kh * kw, H * W)
            let columns = kernel_columns.dot(&flat_image);

            let filter_offset = g * filters_per_group;
            for f in 0..filters_per_group {
                let mut out_channel = output.index_axis_mut(Axis(0), filter_offset + f);
                for ki in 0..self.kernel_height {
                    for kj in 0..self.kernel_width {
                        let row = columns.row((f * self.kernel_height + ki) * self.kernel_width + kj);
                        for iy in 0..height {
                            let oy = (iy * self.stride + ki) as isize - padding;
                            if oy < 0 || oy >= new_height as isize {
                                continue;
                            }
                            for ix in 0..width {
                                let ox = (ix * self.stride + kj) as isize - padding;
                                if ox < 0 || ox >= new_width as isize {
                                    continue;
                                }
                                out_channel[[oy as usize, ox as usize]] += row[iy * width + ix];
                            }
                        }
                    }
                }
            }
        }

        if let Some(bias) = &self.bias {
            for (mut channel, b) in output.outer_iter_mut().zip(bias.iter()) {
                channel += *b;
            }
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weight_loader::RandomWeightLoader;

    /// Scatter based reference implementation.
    fn transposed_naive(layer: &TransposedConvolutionLayer, image: &Array3<f32>) -> Array3<f32> {
        let (_, height, width) = image.dim();
        let (new_height, new_width) = layer.output_size(height, width);
        let cpg = layer.img_channels / layer.groups;
        let fpg = layer.num_filters / layer.groups;
        let mut out = Array3::zeros((layer.num_filters, new_height, new_width));
        for c in 0..layer.img_channels {
            let g = c / cpg;
            for f in 0..fpg {
                for iy in 0..height {
                    for ix in 0..width {
                        for ki in 0..layer.kernel_height {
                            for kj in 0..layer.kernel_width {
                                let oy = (iy * layer.stride + ki) as isize - layer.padding as isize;
                                let ox = (ix * layer.stride + kj) as isize - layer.padding as isize;
                                if oy < 0 || ox < 0 || oy >= new_height as isize || ox >= new_width as isize
                                {
                                    continue;
                                }
                                out[[g * fpg + f, oy as usize, ox as usize]] +=
                                    image[[c, iy, ix]] * layer.kernel[[c, f, ki, kj]];
                            }
                        }
                    }
                }
            }
        }
        if let Some(bias) = &layer.bias {
            for (f, b) in bias.iter().enumerate() {
                out.index_axis_mut(Axis(0), f).mapv_inplace(|v| v + b);
            }
        }
        out
    }

    fn assert_close(a: &Array3<f32>, b: &Array3<f32>) {
        assert_eq!(a.shape(), b.shape());
        assert!(a.iter().zip(b.iter()).all(|(x, y)| (x - y).abs() < 1e-4));
    }

    #[test]
    fn test_transposed_conv_stride_two() {
        let image: Array3<f32> = array![[[1., 2.], [3., 4.]]];
        let kernel = Array::from_shape_vec((1, 1, 2, 2), vec![1., 1., 1., 1.]).unwrap();
        let layer = TransposedConvolutionLayer::new(kernel, None, 2, 0, 0, 1);
        // every pixel becomes a 2x2 block
        assert_eq!(
            layer.transposed_convolve(&image),
            array![[
                [1., 1., 2., 2.],
                [1., 1., 2., 2.],
                [3., 3., 4., 4.],
                [3., 3., 4., 4.]
            ]]
        );
    }

    #[test]
    fn test_transposed_conv_overlapping_kernel() {
        let image: Array3<f32> = array![[[1., 2.]]];
        let kernel = Array::from_shape_vec((1, 1, 1, 3), vec![1., 10., 100.]).unwrap();
        let layer = TransposedConvolutionLayer::new(kernel, Some(array![1.]), 1, 0, 0, 1);
        assert_eq!(
            layer.transposed_convolve(&image),
            array![[[2., 13., 121., 201.]]]
        );
    }

    #[test]
    fn test_decoder_upsampling_geometry_matches_naive() {
        // 3x3, stride 2, padding 1, output padding 1 doubles the resolution
        let mut loader = RandomWeightLoader::new(5);
        let layer = TransposedConvolutionLayer::from_loader(
            &mut loader,
            "up",
            ConvParameters::new(4, 6, 3)
                .stride(2)
                .padding(1)
                .output_padding(1)
                .groups(2),
        )
        .unwrap();
        let image = Array3::from_shape_fn((4, 3, 5), |(c, i, j)| (c + 2 * i) as f32 - j as f32 * 0.5);
        let out = layer.transposed_convolve(&image);
        assert_eq!(out.dim(), (6, 6, 10));
        assert_close(&out, &transposed_naive(&layer, &image));
    }

    #[test]
    fn test_pointwise_residual_geometry() {
        // 1x1, stride 2, output padding 1 as used by decoder residual paths
        let mut loader = RandomWeightLoader::new(6);
        let layer = TransposedConvolutionLayer::from_loader(
            &mut loader,
            "res",
            ConvParameters::new(3, 2, 1).stride(2).output_padding(1).with_bias(true),
        )
        .unwrap();
        let image = Array3::from_shape_fn((3, 4, 4), |(c, i, j)| (c * 16 + i * 4 + j) as f32 / 10.0);
        let out = layer.transposed_convolve(&image);
        assert_eq!(out.dim(), (2, 8, 8));
        assert_close(&out, &transposed_naive(&layer, &image));
    }
}
