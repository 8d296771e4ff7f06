//! Coupling between the convolutional path and the token path, and the stages
//! built on top of it.
use log::debug;
use ndarray::*;

use crate::{
    activation_functions::Activation,
    attention::{AttentionParameters, TransformerBlock},
    blocks::{
        med_planes, BlockParameters, BottleneckBlock, BranchedBlock, BranchedMedBlock, Direction,
        MedBlock,
    },
    branches::{
        channel_chunk, concat_channels, concat_tokens, map_to_tokens, token_chunk, tokens_to_map,
    },
    config::StageLayout,
    convolutions::{ConvParameters, ConvolutionLayer},
    normalization::{BatchNormLayer, LayerNormLayer, BLOCK_EPS},
    pooling::{avg_pool2d, upsample_nearest},
    weight_loader::{WeightLoader, WeightResult},
    InternalDataRepresentation, TokenSequence,
};

/// Feature maps to tokens. Each branch projects its channel slice to the
/// embedding width, pools it down to the token grid and normalises.
#[derive(Debug, Clone)]
pub struct FcuDown {
    projections: Vec<ConvolutionLayer>,
    norms: Vec<LayerNormLayer>,
    dw_stride: usize,
}

impl FcuDown {
    /// `inplanes` is the channel count of one branch.
    pub fn from_loader(
        loader: &mut impl WeightLoader,
        name: &str,
        inplanes: usize,
        embed_dim: usize,
        dw_stride: usize,
        num_branch: usize,
    ) -> WeightResult<FcuDown> {
        let mut projections = Vec::with_capacity(num_branch);
        let mut norms = Vec::with_capacity(num_branch);
        for i in 0..num_branch {
            projections.push(ConvolutionLayer::from_loader(
                loader,
                &format!("{}.conv_project_{}", name, i),
                ConvParameters::new(inplanes, embed_dim, 1).with_bias(true),
            )?);
            norms.push(LayerNormLayer::from_loader(
                loader,
                &format!("{}.ln_{}", name, i),
                embed_dim,
                BLOCK_EPS,
            )?);
        }
        Ok(FcuDown {
            projections,
            norms,
            dw_stride,
        })
    }

    /// Returns `[x_t[0]; gelu(tokens of branch 0); ...]`, the class token is
    /// taken over unchanged.
    pub fn forward_pass(
        &self,
        x: &InternalDataRepresentation,
        x_t: &TokenSequence,
    ) -> TokenSequence {
        let num_branch = self.projections.len();
        let mut branch_tokens = Vec::with_capacity(num_branch);
        for (i, (projection, norm)) in self.projections.iter().zip(self.norms.iter()).enumerate() {
            let projected = projection.convolve(&channel_chunk(x, i, num_branch).to_owned());
            let pooled = avg_pool2d(&projected, self.dw_stride);
            branch_tokens.push(norm.normalize(&map_to_tokens(&pooled)));
        }
        let views: Vec<_> = branch_tokens.iter().map(|t| t.view()).collect();
        let mut tokens = concat_tokens(&views);
        Activation::Gelu.activate_inplace(&mut tokens);
        concat_tokens(&[x_t.slice(s![0..1, ..]), tokens.view()])
    }
}

/// Tokens to feature maps, the inverse direction of [`FcuDown`].
#[derive(Debug, Clone)]
pub struct FcuUp {
    projections: Vec<ConvolutionLayer>,
    norms: Vec<BatchNormLayer>,
    up_stride: usize,
}

impl FcuUp {
    /// `outplanes` is the channel count of one branch.
    pub fn from_loader(
        loader: &mut impl WeightLoader,
        name: &str,
        embed_dim: usize,
        outplanes: usize,
        up_stride: usize,
        num_branch: usize,
    ) -> WeightResult<FcuUp> {
        let mut projections = Vec::with_capacity(num_branch);
        let mut norms = Vec::with_capacity(num_branch);
        for i in 0..num_branch {
            projections.push(ConvolutionLayer::from_loader(
                loader,
                &format!("{}.conv_project_{}", name, i),
                ConvParameters::new(embed_dim, outplanes, 1).with_bias(true),
            )?);
            norms.push(BatchNormLayer::from_loader(
                loader,
                &format!("{}.bn_{}", name, i),
                outplanes,
                BLOCK_EPS,
            )?);
        }
        Ok(FcuUp {
            projections,
            norms,
            up_stride,
        })
    }

    /// Every branch must own `height * width` tokens. The result has size
    /// `(height * up_stride, width * up_stride)`.
    pub fn forward_pass(
        &self,
        x_t: &TokenSequence,
        height: usize,
        width: usize,
    ) -> InternalDataRepresentation {
        let num_branch = self.projections.len();
        let maps: Vec<_> = self
            .projections
            .iter()
            .zip(self.norms.iter())
            .enumerate()
            .map(|(i, (projection, norm))| {
                let map = tokens_to_map(token_chunk(x_t, i, num_branch), height, width);
                let mut map = projection.convolve(&map);
                norm.normalize_inplace(&mut map);
                Activation::LeakyRelu.activate_inplace(&mut map);
                upsample_nearest(&map, height * self.up_stride, width * self.up_stride)
            })
            .collect();
        concat_channels(&maps)
    }
}

/// Encoder stage. The convolutional path and the token path exchange
/// information twice: once into the tokens after the first block and once back
/// into the maps before the fusion block.
#[derive(Debug, Clone)]
pub struct ConvTransBlock {
    cnn_block: BranchedBlock,
    med_blocks: Vec<BranchedMedBlock>,
    squeeze_block: FcuDown,
    trans_block: TransformerBlock,
    expand_block: FcuUp,
    fusion_block: BranchedBlock,
    dw_stride: usize,
}

impl ConvTransBlock {
    pub fn from_loader(
        loader: &mut impl WeightLoader,
        name: &str,
        layout: &StageLayout,
        params: AttentionParameters,
        mlp_hidden_dim: usize,
        num_med_block: usize,
    ) -> WeightResult<ConvTransBlock> {
        let num_branch = params.num_branch;
        let outplanes = layout.outplanes;
        let cnn_params = BlockParameters::new(layout.inplanes, outplanes, Direction::Down)
            .stride(layout.stride)
            .res_conv(layout.res_conv);
        let cnn_block = BranchedBlock::from_loader(
            loader,
            &format!("{}.cnn_block", name),
            cnn_params,
            num_branch,
        )?;

        let fusion_params = if layout.last_fusion {
            BlockParameters::new(outplanes, outplanes, Direction::Down)
                .stride(2)
                .res_conv(true)
        } else {
            BlockParameters::new(outplanes, outplanes, Direction::Down)
        };
        let fusion_block = BranchedBlock::from_loader(
            loader,
            &format!("{}.fusion_block", name),
            fusion_params,
            num_branch,
        )?;

        let med_blocks = (0..num_med_block)
            .map(|k| {
                BranchedMedBlock::from_loader(
                    loader,
                    &format!("{}.med_block.{}", name, k),
                    outplanes,
                    1,
                    num_branch,
                )
            })
            .collect::<WeightResult<Vec<_>>>()?;

        let squeeze_block = FcuDown::from_loader(
            loader,
            &format!("{}.squeeze_block", name),
            med_planes(outplanes),
            params.dim,
            layout.dw_stride,
            num_branch,
        )?;
        let expand_block = FcuUp::from_loader(
            loader,
            &format!("{}.expand_block", name),
            params.dim,
            med_planes(outplanes),
            layout.dw_stride,
            num_branch,
        )?;
        let trans_block = TransformerBlock::from_loader(
            loader,
            &format!("{}.trans_block", name),
            params,
            mlp_hidden_dim,
        )?;

        Ok(ConvTransBlock {
            cnn_block,
            med_blocks,
            squeeze_block,
            trans_block,
            expand_block,
            fusion_block,
            dw_stride: layout.dw_stride,
        })
    }

    pub fn forward_pass(
        &self,
        x: &InternalDataRepresentation,
        x_t: &TokenSequence,
    ) -> (InternalDataRepresentation, TokenSequence) {
        let (mut x, x2) = self.cnn_block.forward_pass(x, None);
        let (_, height, width) = x2.dim();

        let squeezed = self.squeeze_block.forward_pass(&x2, x_t);
        let x_t = self.trans_block.forward_pass(&(squeezed + x_t));

        for med in self.med_blocks.iter() {
            x = med.forward_pass(&x);
        }

        let expanded = self.expand_block.forward_pass(
            &x_t,
            height / self.dw_stride,
            width / self.dw_stride,
        );
        let (x, _) = self.fusion_block.forward_pass(&x, Some(&expanded));
        debug!("conv/trans stage: maps {:?}, tokens {:?}", x.dim(), x_t.dim());
        (x, x_t)
    }
}

/// Decoder stage: a transposed bottleneck, optional med blocks and a fusion block.
#[derive(Debug, Clone)]
pub struct ConvStage {
    cnn_block: BottleneckBlock,
    med_blocks: Vec<MedBlock>,
    fusion_block: BottleneckBlock,
}

impl ConvStage {
    pub fn from_loader(
        loader: &mut impl WeightLoader,
        name: &str,
        layout: &StageLayout,
        num_med_block: usize,
    ) -> WeightResult<ConvStage> {
        let outplanes = layout.outplanes;
        let cnn_block = BottleneckBlock::from_loader(
            loader,
            &format!("{}.cnn_block", name),
            BlockParameters::new(layout.inplanes, outplanes, Direction::Up)
                .stride(layout.stride)
                .res_conv(layout.res_conv),
        )?;
        let med_blocks = (0..num_med_block)
            .map(|k| {
                MedBlock::from_loader(loader, &format!("{}.med_block.{}", name, k), outplanes, 1)
            })
            .collect::<WeightResult<Vec<_>>>()?;
        let fusion_params = if layout.last_fusion {
            BlockParameters::new(outplanes, outplanes, Direction::Up)
                .stride(2)
                .res_conv(true)
        } else {
            BlockParameters::new(outplanes, outplanes, Direction::Up)
        };
        let fusion_block =
            BottleneckBlock::from_loader(loader, &format!("{}.fusion_block", name), fusion_params)?;
        Ok(ConvStage {
            cnn_block,
            med_blocks,
            fusion_block,
        })
    }

    pub fn forward_pass(&self, x: &InternalDataRepresentation) -> InternalDataRepresentation {
        let (mut x, _) = self.cnn_block.forward_pass(x, None);
        for med in self.med_blocks.iter() {
            x = med.forward_pass(&x);
        }
        self.fusion_block.forward_pass(&x, None).0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weight_loader::RandomWeightLoader;

    fn params(dim: usize, num_branch: usize) -> AttentionParameters {
        AttentionParameters {
            dim,
            num_heads: 2,
            qkv_bias: false,
            scale: ((dim / 2) as f32).powf(-0.5),
            num_branch,
        }
    }

    fn feature_map(channels: usize, size: usize) -> InternalDataRepresentation {
        Array3::from_shape_fn((channels, size, size), |(c, i, j)| {
            ((c * 7 + i * 3 + j) % 11) as f32 / 5.0 - 1.0
        })
    }

    fn assert_close<D: Dimension>(a: &Array<f32, D>, b: &Array<f32, D>) {
        assert_eq!(a.shape(), b.shape());
        assert!(a.iter().zip(b.iter()).all(|(x, y)| (x - y).abs() < 1e-5));
    }

    fn token_sequence(rows: usize, dim: usize) -> TokenSequence {
        Array2::from_shape_fn((rows, dim), |(t, e)| ((t * 5 + e * 3) % 7) as f32 / 3.0 - 1.0)
    }

    #[test]
    fn test_fcu_down_keeps_class_token() {
        let mut loader = RandomWeightLoader::new(0);
        let down = FcuDown::from_loader(&mut loader, "squeeze", 2, 8, 2, 2).unwrap();
        let x_t = token_sequence(9, 8);
        let tokens = down.forward_pass(&feature_map(4, 4), &x_t);
        // 2 branches with a 2x2 grid each, plus the class token
        assert_eq!(tokens.dim(), (9, 8));
        assert_eq!(tokens.row(0), x_t.row(0));
    }

    #[test]
    fn test_fcu_down_applies_gelu() {
        let mut loader = RandomWeightLoader::new(1);
        let down = FcuDown::from_loader(&mut loader, "squeeze", 3, 6, 1, 1).unwrap();
        let tokens = down.forward_pass(&feature_map(3, 2), &token_sequence(5, 6));
        // gelu is bounded from below by about -0.17
        assert!(tokens.slice(s![1.., ..]).iter().all(|v| *v > -0.17));
    }

    #[test]
    fn test_fcu_up_shapes_and_branch_order() {
        let mut loader = RandomWeightLoader::new(2);
        let up = FcuUp::from_loader(&mut loader, "expand", 8, 3, 2, 2).unwrap();
        let x_t = token_sequence(9, 8);
        let maps = up.forward_pass(&x_t, 2, 2);
        assert_eq!(maps.dim(), (6, 4, 4));
        // leaky relu output, nearest upsampling repeats every value in 2x2 blocks
        assert_eq!(maps[[0, 0, 0]], maps[[0, 1, 1]]);
        assert_eq!(maps[[5, 2, 3]], maps[[5, 3, 2]]);

        // perturbing a token of branch 1 leaves branch 0's channels untouched
        let mut perturbed = x_t.clone();
        perturbed[[6, 0]] += 1.0;
        let maps_perturbed = up.forward_pass(&perturbed, 2, 2);
        assert_eq!(maps.slice(s![0..3, .., ..]), maps_perturbed.slice(s![0..3, .., ..]));
        assert_ne!(maps.slice(s![3..6, .., ..]), maps_perturbed.slice(s![3..6, .., ..]));
    }

    #[test]
    fn test_conv_trans_block_shapes() {
        let mut loader = RandomWeightLoader::new(3);
        let layout = StageLayout {
            index: 2,
            inplanes: 8,
            outplanes: 8,
            stride: 2,
            res_conv: true,
            dw_stride: 2,
            last_fusion: false,
        };
        let block =
            ConvTransBlock::from_loader(&mut loader, "conv_trans_2", &layout, params(8, 2), 16, 1)
                .unwrap();
        // 2 branches at 8x8 come out at 4x4, which is a 2x2 token grid per branch
        let (x, x_t) = block.forward_pass(&feature_map(16, 8), &token_sequence(9, 8));
        assert_eq!(x.dim(), (16, 4, 4));
        assert_eq!(x_t.dim(), (9, 8));
    }

    #[test]
    fn test_conv_trans_block_data_flow() {
        let mut loader = RandomWeightLoader::new(7);
        let layout = StageLayout {
            index: 3,
            inplanes: 8,
            outplanes: 8,
            stride: 1,
            res_conv: false,
            dw_stride: 2,
            last_fusion: false,
        };
        let block =
            ConvTransBlock::from_loader(&mut loader, "conv_trans_3", &layout, params(8, 2), 16, 1)
                .unwrap();
        let x = feature_map(16, 4);
        let x_t = token_sequence(9, 8);

        // squeeze the middle features into tokens and add them to the incoming tokens
        let (x_cnn, x2) = block.cnn_block.forward_pass(&x, None);
        let squeezed = block.squeeze_block.forward_pass(&x2, &x_t);
        let tokens = block.trans_block.forward_pass(&(&squeezed + &x_t));
        let mut x_med = x_cnn;
        for med in block.med_blocks.iter() {
            x_med = med.forward_pass(&x_med);
        }
        // expand the new tokens back to the 4x4 maps and fuse
        let expanded = block.expand_block.forward_pass(&tokens, 2, 2);
        let (fused, _) = block.fusion_block.forward_pass(&x_med, Some(&expanded));

        let (x_out, x_t_out) = block.forward_pass(&x, &x_t);
        assert_close(&x_t_out, &tokens);
        assert_close(&x_out, &fused);

        // the incoming tokens take part through the residual sum
        let without_residual = block.trans_block.forward_pass(&squeezed);
        assert!(x_t_out
            .iter()
            .zip(without_residual.iter())
            .any(|(a, b)| (a - b).abs() > 1e-3));
    }

    #[test]
    fn test_conv_trans_block_last_fusion_downsamples() {
        let mut loader = RandomWeightLoader::new(4);
        let layout = StageLayout {
            index: 6,
            inplanes: 8,
            outplanes: 8,
            stride: 1,
            res_conv: false,
            dw_stride: 1,
            last_fusion: true,
        };
        let block =
            ConvTransBlock::from_loader(&mut loader, "conv_trans_6", &layout, params(8, 2), 16, 0)
                .unwrap();
        let (x, x_t) = block.forward_pass(&feature_map(16, 2), &token_sequence(9, 8));
        assert_eq!(x.dim(), (16, 1, 1));
        assert_eq!(x_t.dim(), (9, 8));
    }

    #[test]
    fn test_conv_stage_upsamples() {
        let mut loader = RandomWeightLoader::new(5);
        let first = StageLayout {
            index: 0,
            inplanes: 16,
            outplanes: 8,
            stride: 2,
            res_conv: true,
            dw_stride: 1,
            last_fusion: false,
        };
        let stage = ConvStage::from_loader(&mut loader, "conv_trans_0", &first, 1).unwrap();
        assert_eq!(stage.forward_pass(&feature_map(16, 3)).dim(), (8, 6, 6));

        let last = StageLayout {
            index: 5,
            inplanes: 8,
            outplanes: 4,
            stride: 1,
            res_conv: true,
            dw_stride: 1,
            last_fusion: true,
        };
        let stage = ConvStage::from_loader(&mut loader, "conv_trans_5", &last, 0).unwrap();
        assert_eq!(stage.forward_pass(&feature_map(8, 6)).dim(), (4, 12, 12));
    }
}
