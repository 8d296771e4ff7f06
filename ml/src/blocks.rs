//! Residual bottleneck blocks of the convolutional paths.
use ndarray::*;

use crate::{
    activation_functions::Activation,
    branches::{channel_chunk, concat_channels},
    convolutions::{ConvParameters, ConvolutionLayer},
    normalization::{BatchNormLayer, BLOCK_EPS},
    transposed_convolutions::TransposedConvolutionLayer,
    weight_loader::{WeightLoader, WeightResult},
    ImagePrecision, InternalDataRepresentation,
};

/// Width reduction inside a bottleneck.
pub const EXPANSION: usize = 4;

/// Bottleneck width for a block with `outplanes` output channels.
pub fn med_planes(outplanes: usize) -> usize {
    if outplanes > EXPANSION {
        outplanes / EXPANSION
    } else {
        outplanes
    }
}

/// Whether a block shrinks (encoder) or grows (decoder) the feature map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Down,
    Up,
}

/// A convolution that is either a plain or a transposed one, depending on the direction.
#[derive(Debug, Clone)]
enum DirectedConv {
    Down(ConvolutionLayer),
    Up(TransposedConvolutionLayer),
}

impl DirectedConv {
    /// Transposed convolutions get `output_padding = stride - 1`, so that
    /// they exactly invert the size change of the plain convolution.
    fn from_loader(
        loader: &mut impl WeightLoader,
        name: &str,
        params: ConvParameters,
        direction: Direction,
    ) -> WeightResult<DirectedConv> {
        match direction {
            Direction::Down => Ok(DirectedConv::Down(ConvolutionLayer::from_loader(
                loader, name, params,
            )?)),
            Direction::Up => Ok(DirectedConv::Up(TransposedConvolutionLayer::from_loader(
                loader,
                name,
                params.output_padding(params.stride - 1),
            )?)),
        }
    }

    fn forward_pass(&self, x: &InternalDataRepresentation) -> InternalDataRepresentation {
        match self {
            DirectedConv::Down(conv) => conv.convolve(x),
            DirectedConv::Up(conv) => conv.transposed_convolve(x),
        }
    }
}

/// Construction parameters of a [`BottleneckBlock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockParameters {
    pub inplanes: usize,
    pub outplanes: usize,
    pub stride: usize,
    /// Whether the residual path is a strided 1x1 convolution (plus batch norm)
    /// instead of the identity.
    pub res_conv: bool,
    pub groups: usize,
    pub activation: Activation,
    pub direction: Direction,
}

impl BlockParameters {
    pub fn new(inplanes: usize, outplanes: usize, direction: Direction) -> BlockParameters {
        BlockParameters {
            inplanes,
            outplanes,
            stride: 1,
            res_conv: false,
            groups: 1,
            activation: Activation::LeakyRelu,
            direction,
        }
    }

    pub fn stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    pub fn res_conv(mut self, res_conv: bool) -> Self {
        self.res_conv = res_conv;
        self
    }

    pub fn groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }

    pub fn activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }
}

/// Single path residual bottleneck.
#[derive(Debug, Clone)]
pub struct BottleneckBlock {
    conv1: DirectedConv,
    bn1: BatchNormLayer,
    conv2: DirectedConv,
    bn2: BatchNormLayer,
    conv3: DirectedConv,
    bn3: BatchNormLayer,
    residual: Option<(DirectedConv, BatchNormLayer)>,
    activation: Activation,
}

impl BottleneckBlock {
    pub fn from_loader(
        loader: &mut impl WeightLoader,
        name: &str,
        block_params: BlockParameters,
    ) -> WeightResult<BottleneckBlock> {
        let med = med_planes(block_params.outplanes);
        let direction = block_params.direction;

        let conv1 = DirectedConv::from_loader(
            loader,
            &format!("{}.conv1", name),
            ConvParameters::new(block_params.inplanes, med, 1),
            direction,
        )?;
        let bn1 = BatchNormLayer::from_loader(loader, &format!("{}.bn1", name), med, BLOCK_EPS)?;
        let conv2 = DirectedConv::from_loader(
            loader,
            &format!("{}.conv2", name),
            ConvParameters::new(med, med, 3)
                .stride(block_params.stride)
                .padding(1)
                .groups(block_params.groups),
            direction,
        )?;
        let bn2 = BatchNormLayer::from_loader(loader, &format!("{}.bn2", name), med, BLOCK_EPS)?;
        let conv3 = DirectedConv::from_loader(
            loader,
            &format!("{}.conv3", name),
            ConvParameters::new(med, block_params.outplanes, 1),
            direction,
        )?;
        let bn3 = BatchNormLayer::from_loader(
            loader,
            &format!("{}.bn3", name),
            block_params.outplanes,
            BLOCK_EPS,
        )?;

        let residual = if block_params.res_conv {
            let conv = DirectedConv::from_loader(
                loader,
                &format!("{}.residual_conv", name),
                ConvParameters::new(block_params.inplanes, block_params.outplanes, 1)
                    .stride(block_params.stride),
                direction,
            )?;
            let bn = BatchNormLayer::from_loader(
                loader,
                &format!("{}.residual_bn", name),
                block_params.outplanes,
                BLOCK_EPS,
            )?;
            Some((conv, bn))
        } else {
            None
        };

        Ok(BottleneckBlock {
            conv1,
            bn1,
            conv2,
            bn2,
            conv3,
            bn3,
            residual,
            activation: block_params.activation,
        })
    }

    /// Returns the block output and the activated output of the 3x3 stage.
    /// `x_t`, if given, is added to the input of the 3x3 convolution; it must
    /// have the bottleneck width and the input's spatial size.
    pub fn forward_pass(
        &self,
        x: &InternalDataRepresentation,
        x_t: Option<ArrayView3<ImagePrecision>>,
    ) -> (InternalDataRepresentation, InternalDataRepresentation) {
        let mut h = self.conv1.forward_pass(x);
        self.bn1.normalize_inplace(&mut h);
        self.activation.activate_inplace(&mut h);
        if let Some(x_t) = x_t {
            h += &x_t;
        }

        let mut x2 = self.conv2.forward_pass(&h);
        self.bn2.normalize_inplace(&mut x2);
        self.activation.activate_inplace(&mut x2);

        let mut out = self.conv3.forward_pass(&x2);
        self.bn3.normalize_inplace(&mut out);

        match &self.residual {
            Some((conv, bn)) => {
                let mut residual = conv.forward_pass(x);
                bn.normalize_inplace(&mut residual);
                out += &residual;
            }
            None => out += x,
        }
        self.activation.activate_inplace(&mut out);
        (out, x2)
    }
}

/// One bottleneck per branch, each on its own channel slice.
#[derive(Debug, Clone)]
pub struct BranchedBlock {
    branches: Vec<BottleneckBlock>,
}

impl BranchedBlock {
    /// `block_params` describes a single branch; branch `i` is stored as `{name}.conv_{i}`.
    pub fn from_loader(
        loader: &mut impl WeightLoader,
        name: &str,
        block_params: BlockParameters,
        num_branch: usize,
    ) -> WeightResult<BranchedBlock> {
        let branches = (0..num_branch)
            .map(|i| {
                BottleneckBlock::from_loader(loader, &format!("{}.conv_{}", name, i), block_params)
            })
            .collect::<WeightResult<Vec<_>>>()?;
        Ok(BranchedBlock { branches })
    }

    pub fn num_branch(&self) -> usize {
        self.branches.len()
    }

    /// Splits `x` (and `x_t`) into equal channel slices, runs every branch and
    /// concatenates both outputs along the channels again.
    pub fn forward_pass(
        &self,
        x: &InternalDataRepresentation,
        x_t: Option<&InternalDataRepresentation>,
    ) -> (InternalDataRepresentation, InternalDataRepresentation) {
        let num_branch = self.num_branch();
        let mut outputs = Vec::with_capacity(num_branch);
        let mut medians = Vec::with_capacity(num_branch);
        for (i, branch) in self.branches.iter().enumerate() {
            let x_i = channel_chunk(x, i, num_branch).to_owned();
            let x_t_i = x_t.map(|t| channel_chunk(t, i, num_branch));
            let (out, x2) = branch.forward_pass(&x_i, x_t_i);
            outputs.push(out);
            medians.push(x2);
        }
        (concat_channels(&outputs), concat_channels(&medians))
    }
}

/// Bottleneck without a size change, used to deepen a stage.
/// Always runs in the encoder direction and keeps an identity residual.
#[derive(Debug, Clone)]
pub struct MedBlock {
    block: BottleneckBlock,
}

impl MedBlock {
    pub fn from_loader(
        loader: &mut impl WeightLoader,
        name: &str,
        planes: usize,
        groups: usize,
    ) -> WeightResult<MedBlock> {
        let block_params = BlockParameters::new(planes, planes, Direction::Down).groups(groups);
        Ok(MedBlock {
            block: BottleneckBlock::from_loader(loader, name, block_params)?,
        })
    }

    pub fn forward_pass(&self, x: &InternalDataRepresentation) -> InternalDataRepresentation {
        self.block.forward_pass(x, None).0
    }
}

/// [`MedBlock`] per branch.
#[derive(Debug, Clone)]
pub struct BranchedMedBlock {
    branches: Vec<MedBlock>,
}

impl BranchedMedBlock {
    pub fn from_loader(
        loader: &mut impl WeightLoader,
        name: &str,
        planes: usize,
        groups: usize,
        num_branch: usize,
    ) -> WeightResult<BranchedMedBlock> {
        let branches = (0..num_branch)
            .map(|i| MedBlock::from_loader(loader, &format!("{}.conv_{}", name, i), planes, groups))
            .collect::<WeightResult<Vec<_>>>()?;
        Ok(BranchedMedBlock { branches })
    }

    pub fn forward_pass(&self, x: &InternalDataRepresentation) -> InternalDataRepresentation {
        let num_branch = self.branches.len();
        let outputs: Vec<_> = self
            .branches
            .iter()
            .enumerate()
            .map(|(i, branch)| branch.forward_pass(&channel_chunk(x, i, num_branch).to_owned()))
            .collect();
        concat_channels(&outputs)
    }
}
