use crate::{
    initializers::{bias_bound, Init},
    weight_loader::{WeightLoader, WeightResult},
    ConvKernel, ImagePrecision, InternalDataRepresentation, WeightPrecision,
};
use ndarray::*;

/// Hyperparameters of a (transposed) convolution, in PyTorch terms.
/// Kernels are always square.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvParameters {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub padding: usize,
    /// Only used by transposed convolutions.
    pub output_padding: usize,
    pub groups: usize,
    pub bias: bool,
}

impl ConvParameters {
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: usize) -> ConvParameters {
        ConvParameters {
            in_channels,
            out_channels,
            kernel_size,
            stride: 1,
            padding: 0,
            output_padding: 0,
            groups: 1,
            bias: false,
        }
    }

    pub fn stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    pub fn padding(mut self, padding: usize) -> Self {
        self.padding = padding;
        self
    }

    pub fn output_padding(mut self, output_padding: usize) -> Self {
        self.output_padding = output_padding;
        self
    }

    pub fn groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }

    pub fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }
}

/// Rust implementation of a convolutional layer.
/// The weight matrix shall have dimension (in that order)
/// output channels x input channels / groups x kernel height x kernel width
/// (to comply with the order in which pytorch weights are saved).
#[derive(Debug, Clone)]
pub struct ConvolutionLayer {
    /// Weight matrix of the kernel
    pub(crate) kernel: ConvKernel,
    bias: Option<Array1<WeightPrecision>>,
    pub(crate) kernel_height: usize,
    pub(crate) kernel_width: usize,
    pub(crate) stride: usize,
    pub(crate) padding: usize,
    groups: usize,
    pub(crate) num_filters: usize,
    pub(crate) img_channels: usize,
}

impl ConvolutionLayer {
    pub fn new(
        weights: ConvKernel,
        bias: Option<Array1<WeightPrecision>>,
        stride: usize,
        padding: usize,
        groups: usize,
    ) -> ConvolutionLayer {
        let num_filters = weights.len_of(Axis(0));
        let img_channels = weights.len_of(Axis(1)) * groups;
        let kernel_height = weights.len_of(Axis(2));
        let kernel_width = weights.len_of(Axis(3));

        debug_assert!(stride > 0, "Stride of 0 passed");
        debug_assert!(groups > 0 && num_filters % groups == 0, "Invalid groups");

        ConvolutionLayer {
            kernel: weights,
            bias,
            kernel_height,
            kernel_width,
            stride,
            padding,
            groups,
            num_filters,
            img_channels,
        }
    }

    /// Loads `{name}.weight` (and `{name}.bias`). Fresh kernels are drawn with
    /// kaiming normal (fan out), fresh biases with PyTorch's default uniform.
    pub fn from_loader(
        loader: &mut impl WeightLoader,
        name: &str,
        params: ConvParameters,
    ) -> WeightResult<ConvolutionLayer> {
        let k = params.kernel_size;
        let channels_per_group = params.in_channels / params.groups;
        let kernel = loader.get_weight(
            &format!("{}.weight", name),
            (params.out_channels, channels_per_group, k, k),
            Init::KaimingNormalFanOut,
        )?;
        let bias = if params.bias {
            Some(loader.get_weight(
                &format!("{}.bias", name),
                params.out_channels,
                Init::Uniform {
                    bound: bias_bound(channels_per_group * k * k),
                },
            )?)
        } else {
            None
        };
        Ok(ConvolutionLayer::new(
            kernel,
            bias,
            params.stride,
            params.padding,
            params.groups,
        ))
    }

    pub fn output_size(&self, height: usize, width: usize) -> (usize, usize) {
        (
            (height + 2 * self.padding - self.kernel_height) / self.stride + 1,
            (width + 2 * self.padding - self.kernel_width) / self.stride + 1,
        )
    }

    /// Performs a convolution on the given image data using this layers parameters.
    /// Each group is lowered to a single matrix product between the flattened
    /// filters and the im2col matrix of the group's input channels.
    /// https://leonardoaraujosantos.gitbook.io/artificial-inteligence/machine_learning/deep_learning/convolution_layer/making_faster
    pub fn convolve(&self, image: &InternalDataRepresentation) -> InternalDataRepresentation {
        let (channels, height, width) = image.dim();
        debug_assert_eq!(channels, self.img_channels, "Wrong number of input channels");

        let (new_height, new_width) = self.output_size(height, width);
        let channels_per_group = self.img_channels / self.groups;
        let filters_per_group = self.num_filters / self.groups;
        let patch_len = channels_per_group * self.kernel_height * self.kernel_width;

        let mut output = Array3::zeros((self.num_filters, new_height, new_width));
        for g in 0..self.groups {
            let group_image =
                image.slice(s![g * channels_per_group..(g + 1) * channels_per_group, .., ..]);
            let columns = self.im2col(group_image, new_height, new_width);

            let filter_offset = g * filters_per_group;
            let filter_rows = Array2::from_shape_fn((filters_per_group, patch_len), |(f, idx)| {
                let kernel_area = self.kernel_height * self.kernel_width;
                self.kernel[[
                    filter_offset + f,
                    idx / kernel_area,
                    (idx / self.kernel_width) % self.kernel_height,
                    idx % self.kernel_width,
                ]]
            });
            let product = filter_rows.dot(&columns);

            for (f, row) in product.outer_iter().enumerate() {
                let mut out_channel = output.index_axis_mut(Axis(0), filter_offset + f);
                for (idx, value) in row.iter().enumerate() {
                    out_channel[[idx / new_width, idx % new_width]] = *value;
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

    /// Lowers the image into a matrix of shape (channels * kh * kw, new_h * new_w),
    /// where column j holds the (zero padded) receptive field of output pixel j.
    fn im2col(
        &self,
        image: ArrayView3<ImagePrecision>,
        new_height: usize,
        new_width: usize,
    ) -> Array2<ImagePrecision> {
        let (channels, height, width) = image.dim();
        let mut columns = Array2::zeros((
            channels * self.kernel_height * self.kernel_width,
            new_height * new_width,
        ));
        let padding = self.padding as isize;

        for c in 0..channels {
            for ki in 0..self.kernel_height {
                for kj in 0..self.kernel_width {
                    let row = (c * self.kernel_height + ki) * self.kernel_width + kj;
                    for oy in 0..new_height {
                        let iy = (oy * self.stride + ki) as isize - padding;
                        if iy < 0 || iy >= height as isize {
                            continue;
                        }
                        for ox in 0..new_width {
                            let ix = (ox * self.stride + kj) as isize - padding;
                            if ix < 0 || ix >= width as isize {
                                continue;
                            }
                            columns[[row, oy * new_width + ox]] =
                                image[[c, iy as usize, ix as usize]];
                        }
                    }
                }
            }
        }
        columns
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weight_loader::RandomWeightLoader;

    /// Direct evaluation of the convolution sum, used as a reference.
    fn conv_2d_naive(layer: &ConvolutionLayer, image: &Array3<f32>) -> Array3<f32> {
        let (_, height, width) = image.dim();
        let (new_height, new_width) = layer.output_size(height, width);
        let cpg = layer.img_channels / layer.groups;
        let fpg = layer.num_filters / layer.groups;
        let mut out = Array3::zeros((layer.num_filters, new_height, new_width));
        for f in 0..layer.num_filters {
            let g = f / fpg;
            for oy in 0..new_height {
                for ox in 0..new_width {
                    let mut acc = layer.bias.as_ref().map(|b| b[f]).unwrap_or(0.0);
                    for c in 0..cpg {
                        for ki in 0..layer.kernel_height {
                            for kj in 0..layer.kernel_width {
                                let iy = (oy * layer.stride + ki) as isize - layer.padding as isize;
                                let ix = (ox * layer.stride + kj) as isize - layer.padding as isize;
                                if iy < 0 || ix < 0 || iy >= height as isize || ix >= width as isize
                                {
                                    continue;
                                }
                                acc += layer.kernel[[f, c, ki, kj]]
                                    * image[[g * cpg + c, iy as usize, ix as usize]];
                            }
                        }
                    }
                    out[[f, oy, ox]] = acc;
                }
            }
        }
        out
    }

    fn assert_close(a: &Array3<f32>, b: &Array3<f32>) {
        assert_eq!(a.shape(), b.shape());
        assert!(a.iter().zip(b.iter()).all(|(x, y)| (x - y).abs() < 1e-4));
    }

    fn test_image(channels: usize, height: usize, width: usize) -> Array3<f32> {
        Array3::from_shape_fn((channels, height, width), |(c, i, j)| {
            ((c * 31 + i * 7 + j * 3) % 11) as f32 / 5.0 - 1.0
        })
    }

    #[test]
    fn test_2d_conv() {
        let test_img = array![
            [
                [1.0, 2.0, 3.0, 4.0],
                [4.0, 5.0, 6.0, 7.0],
                [7.0, 8.0, 9.0, 9.0],
                [7.0, 8.0, 9.0, 9.0]
            ],
            [
                [1.0, 2.0, 3.0, 4.0],
                [4.0, 5.0, 6.0, 7.0],
                [7.0, 8.0, 9.0, 9.0],
                [7.0, 8.0, 9.0, 9.0]
            ],
            [
                [1.0, 2.0, 3.0, 4.0],
                [4.0, 5.0, 6.0, 7.0],
                [7.0, 8.0, 9.0, 9.0],
                [7.0, 8.0, 9.0, 9.0]
            ]
        ];
        let kernel = Array::from_shape_vec(
            (1, 3, 2, 2),
            vec![1., 2., 1., 2., 1., 2., 1., 2., 1., 2., 1., 2.],
        )
        .unwrap();
        let conv_layer = ConvolutionLayer::new(kernel, None, 1, 0, 1);
        let output = arr3(&[[
            [57.0, 75.0, 93.0],
            [111.0, 129.0, 141.0],
            [138.0, 156.0, 162.0],
        ]]);

        assert_eq!(conv_layer.convolve(&test_img), output);
    }

    #[test]
    fn test_2d_conv_with_stride() {
        let test_img: Array3<f32> = array![[[0., 1., 0.], [0., 0., 0.], [-1., 0., 0.]]];
        let kernel = Array::from_shape_vec((1, 1, 1, 1), vec![1.]).unwrap();
        let conv_layer = ConvolutionLayer::new(kernel, None, 2, 0, 1);

        assert_eq!(
            conv_layer.convolve(&test_img),
            array![[[0., 0.], [-1., 0.]]]
        );
    }

    #[test]
    fn test_2d_conv_with_padding_and_bias() {
        let test_img: Array3<f32> = array![[[1., 2.], [3., 4.]]];
        let kernel = Array::from_shape_vec((1, 1, 3, 3), vec![1.; 9]).unwrap();
        let conv_layer = ConvolutionLayer::new(kernel, Some(array![0.5]), 1, 1, 1);

        // every output pixel sees the whole image
        assert_eq!(
            conv_layer.convolve(&test_img),
            array![[[10.5, 10.5], [10.5, 10.5]]]
        );
    }

    #[test]
    fn test_conv_matches_naive_stem_geometry() {
        // 7x7, stride 2, padding 3 as used by the encoder stem
        let mut loader = RandomWeightLoader::new(1);
        let layer = ConvolutionLayer::from_loader(
            &mut loader,
            "stem",
            ConvParameters::new(3, 4, 7).stride(2).padding(3),
        )
        .unwrap();
        let image = test_image(3, 10, 10);
        let out = layer.convolve(&image);
        assert_eq!(out.dim(), (4, 5, 5));
        assert_close(&out, &conv_2d_naive(&layer, &image));
    }

    #[test]
    fn test_grouped_conv_matches_naive() {
        let mut loader = RandomWeightLoader::new(2);
        let layer = ConvolutionLayer::from_loader(
            &mut loader,
            "grouped",
            ConvParameters::new(4, 6, 3)
                .stride(2)
                .padding(1)
                .groups(2)
                .with_bias(true),
        )
        .unwrap();
        let image = test_image(4, 7, 6);
        let out = layer.convolve(&image);
        assert_eq!(out.dim(), (6, 4, 3));
        assert_close(&out, &conv_2d_naive(&layer, &image));
    }
}
