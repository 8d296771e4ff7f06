//! The multi-branch encoder, the convolutional decoders and the variational
//! autoencoder tying them together.
use log::{debug, info};
use ndarray::*;
use rand::Rng;
use rand_distr::StandardNormal;
use thiserror::Error;

use crate::{
    activation_functions::Activation,
    attention::{AttentionParameters, TransformerBlock},
    blocks::{BlockParameters, BottleneckBlock, BranchedBlock, Direction},
    branches::{channel_chunk, concat_channels, concat_tokens, map_to_tokens},
    config::{ConfigError, ModelConfig},
    convolutions::{ConvParameters, ConvolutionLayer},
    coupling::{ConvStage, ConvTransBlock},
    fully_connected::FeedforwardLayer,
    initializers::Init,
    normalization::{BatchNormLayer, LayerNormLayer, DEFAULT_EPS},
    pooling::{adaptive_avg_pool2d, upsample_nearest},
    weight_loader::{WeightError, WeightLoader},
    ImagePrecision, InternalDataRepresentation, TokenSequence,
};

/// Width of the per-branch stem.
pub const STEM_CHANNELS: usize = 64;
/// Side of the pooled map feeding the convolutional latent heads.
pub const LAST_POOL: usize = 4;

pub type ModelResult<T> = Result<T, ModelError>;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Input has shape {actual:?}, the model expects {expected:?}")]
    InputShape {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("Latent has length {actual}, the model expects {expected}")]
    LatentShape { expected: usize, actual: usize },
    #[error("Shape {shape:?} cannot be split into patches of size {patch_size}")]
    PatchShape { shape: Vec<usize>, patch_size: usize },
    #[error("Could not load model weights: {0}")]
    Weights(#[from] WeightError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// General model trait for en- and decoding
pub trait CodingModel {
    type Input;
    type Output;

    fn forward_pass(&self, input: &Self::Input) -> Self::Output;
}

/// Diagonal Gaussian over the latent space, as predicted by the encoder.
#[derive(Debug, Clone, PartialEq)]
pub struct Posterior {
    pub mean: Array1<ImagePrecision>,
    /// `None` if the model was built without a variance head.
    pub log_var: Option<Array1<ImagePrecision>>,
}

impl Posterior {
    /// Reparameterised sample `exp(log_var / 2) * eps + mean`, `eps ~ N(0, I)`.
    /// Without a log-variance, this is the mean.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Array1<ImagePrecision> {
        match &self.log_var {
            Some(log_var) => Zip::from(&self.mean)
                .and(log_var)
                .map_collect(|mean, log_var| {
                    let eps: ImagePrecision = rng.sample(StandardNormal);
                    (0.5 * log_var).exp() * eps + mean
                }),
            None => self.mean.clone(),
        }
    }
}

/// Multi-branch convolution and attention encoder.
///
/// Every branch has its own stem and its own slice of channels and tokens
/// through all stages. Branches only meet in the class token, in the latent
/// heads and in the per-token mixing of the transformer blocks.
pub struct MultiBranchEncoder {
    num_branch: usize,
    cls_token: TokenSequence,
    pos_embed: TokenSequence,
    stem: Vec<(ConvolutionLayer, BatchNormLayer)>,
    conv_1: BranchedBlock,
    trans_patch_convs: Vec<ConvolutionLayer>,
    trans_1: TransformerBlock,
    stages: Vec<ConvTransBlock>,
    trans_norm: LayerNormLayer,
    trans_cls_head: FeedforwardLayer,
    conv_heads: Vec<FeedforwardLayer>,
    conv_head: FeedforwardLayer,
    mean_head: FeedforwardLayer,
    var_head: Option<FeedforwardLayer>,
}

impl MultiBranchEncoder {
    pub fn from_loader(
        loader: &mut impl WeightLoader,
        name: &str,
        config: &ModelConfig,
    ) -> ModelResult<MultiBranchEncoder> {
        let num_branch = config.num_branch;
        let embed_dim = config.embed_dim;
        let latent = config.decode_embed;
        let token_init = Init::TruncNormal { std: 0.02 };

        let cls_token =
            loader.get_weight(&format!("{}.cls_token", name), (1, embed_dim), token_init)?;
        let pos_embed = loader.get_weight(
            &format!("{}.pos_embed", name),
            (config.num_tokens(), embed_dim),
            token_init,
        )?;

        let mut stem = Vec::with_capacity(num_branch);
        let mut trans_patch_convs = Vec::with_capacity(num_branch);
        let trans_dw_stride = config.patch_size / 2;
        for i in 0..num_branch {
            let conv = ConvolutionLayer::from_loader(
                loader,
                &format!("{}.conv1_{}", name, i),
                ConvParameters::new(config.in_chans, STEM_CHANNELS, 7)
                    .stride(2)
                    .padding(3),
            )?;
            let bn = BatchNormLayer::from_loader(
                loader,
                &format!("{}.bn1_{}", name, i),
                STEM_CHANNELS,
                DEFAULT_EPS,
            )?;
            stem.push((conv, bn));
        }

        let conv_1 = BranchedBlock::from_loader(
            loader,
            &format!("{}.conv_1", name),
            BlockParameters::new(STEM_CHANNELS, config.stage_channels(), Direction::Down)
                .res_conv(true),
            num_branch,
        )?;
        for i in 0..num_branch {
            trans_patch_convs.push(ConvolutionLayer::from_loader(
                loader,
                &format!("{}.trans_patch_conv_{}", name, i),
                ConvParameters::new(STEM_CHANNELS, embed_dim, trans_dw_stride)
                    .stride(trans_dw_stride)
                    .with_bias(true),
            )?);
        }

        let attention = AttentionParameters {
            dim: embed_dim,
            num_heads: config.num_heads,
            qkv_bias: config.qkv_bias,
            scale: config.attention_scale(),
            num_branch,
        };
        let mlp_hidden_dim = config.mlp_hidden_dim();
        let trans_1 = TransformerBlock::from_loader(
            loader,
            &format!("{}.trans_1", name),
            attention,
            mlp_hidden_dim,
        )?;

        let stages = config
            .encoder_stages()
            .iter()
            .map(|layout| {
                ConvTransBlock::from_loader(
                    loader,
                    &format!("{}.conv_trans_{}", name, layout.index),
                    layout,
                    attention,
                    mlp_hidden_dim,
                    config.num_med_block,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let trans_norm = LayerNormLayer::from_loader(
            loader,
            &format!("{}.trans_norm", name),
            embed_dim,
            DEFAULT_EPS,
        )?;
        let trans_cls_head = FeedforwardLayer::from_loader(
            loader,
            &format!("{}.trans_cls_head", name),
            embed_dim,
            latent,
            true,
        )?;
        // the last stage has 4 times the base width
        let pooled_len = 4 * config.stage_channels() * LAST_POOL * LAST_POOL;
        let conv_heads = (0..num_branch)
            .map(|i| {
                FeedforwardLayer::from_loader(
                    loader,
                    &format!("{}.conv_head{}", name, i),
                    pooled_len,
                    latent,
                    true,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        let conv_head = FeedforwardLayer::from_loader(
            loader,
            &format!("{}.conv_head", name),
            num_branch * latent,
            latent,
            true,
        )?;
        let mean_head = FeedforwardLayer::from_loader(
            loader,
            &format!("{}.mean_head", name),
            2 * latent,
            latent,
            true,
        )?;
        let var_head = if config.use_vae {
            Some(FeedforwardLayer::from_loader(
                loader,
                &format!("{}.var_head", name),
                2 * latent,
                latent,
                true,
            )?)
        } else {
            None
        };

        Ok(MultiBranchEncoder {
            num_branch,
            cls_token,
            pos_embed,
            stem,
            conv_1,
            trans_patch_convs,
            trans_1,
            stages,
            trans_norm,
            trans_cls_head,
            conv_heads,
            conv_head,
            mean_head,
            var_head,
        })
    }

    /// Stem, stage 1 and the initial token sequence `[cls; patches] + pos_embed`.
    fn embed(
        &self,
        input: &InternalDataRepresentation,
    ) -> (InternalDataRepresentation, TokenSequence) {
        let nb = self.num_branch;
        let stem_maps: Vec<_> = self
            .stem
            .iter()
            .enumerate()
            .map(|(i, (conv, bn))| {
                let mut x = conv.convolve(&channel_chunk(input, i, nb).to_owned());
                bn.normalize_inplace(&mut x);
                Activation::LeakyRelu.activate_inplace(&mut x);
                x
            })
            .collect();
        let x_base = concat_channels(&stem_maps);
        let (x, _) = self.conv_1.forward_pass(&x_base, None);

        let patch_tokens: Vec<_> = self
            .trans_patch_convs
            .iter()
            .enumerate()
            .map(|(i, conv)| {
                let branch = channel_chunk(&x_base, i, nb).to_owned();
                map_to_tokens(&conv.convolve(&branch))
            })
            .collect();
        let mut parts = vec![self.cls_token.view()];
        parts.extend(patch_tokens.iter().map(|t| t.view()));
        let x_t = concat_tokens(&parts) + &self.pos_embed;
        debug!("stem: maps {:?}, tokens {:?}", x.dim(), x_t.dim());
        (x, self.trans_1.forward_pass(&x_t))
    }

    /// Latent heads on the final feature map and the final class token.
    fn heads(&self, x: &InternalDataRepresentation, x_t: &TokenSequence) -> Posterior {
        let nb = self.num_branch;
        let pooled = adaptive_avg_pool2d(x, LAST_POOL);
        let branch_latents: Vec<_> = self
            .conv_heads
            .iter()
            .enumerate()
            .map(|(i, head)| {
                let flat: Array1<ImagePrecision> =
                    channel_chunk(&pooled, i, nb).iter().cloned().collect();
                head.forward_vector(&flat)
            })
            .collect();
        let conv_latent = self.conv_head.forward_vector(&flatten_all(&branch_latents));

        let cls = self.trans_norm.normalize(x_t.slice(s![0..1, ..]));
        let trans_latent = self.trans_cls_head.forward_vector(cls.row(0));

        let joint = flatten_all(&[conv_latent, trans_latent]);
        Posterior {
            mean: self.mean_head.forward_vector(&joint),
            log_var: self.var_head.as_ref().map(|head| head.forward_vector(&joint)),
        }
    }
}

fn flatten_all(parts: &[Array1<ImagePrecision>]) -> Array1<ImagePrecision> {
    parts.iter().flat_map(|p| p.iter().cloned()).collect()
}

impl CodingModel for MultiBranchEncoder {
    type Input = InternalDataRepresentation;
    type Output = Posterior;

    /// `input` is `(num_branch * in_chans, im_size, im_size)`.
    fn forward_pass(&self, input: &InternalDataRepresentation) -> Posterior {
        let (mut x, mut x_t) = self.embed(input);
        for stage in self.stages.iter() {
            let (next_x, next_x_t) = stage.forward_pass(&x, &x_t);
            x = next_x;
            x_t = next_x_t;
        }
        self.heads(&x, &x_t)
    }
}

/// Convolutional decoder, from a latent vector to one branch image.
pub struct ConvDecoder {
    seed_channels: usize,
    seed_size: usize,
    first_up: usize,
    first_fc: FeedforwardLayer,
    first_cnn: ConvolutionLayer,
    stages: Vec<ConvStage>,
    conv_last: BottleneckBlock,
}

impl ConvDecoder {
    pub fn from_loader(
        loader: &mut impl WeightLoader,
        name: &str,
        config: &ModelConfig,
    ) -> ModelResult<ConvDecoder> {
        let seed_channels = config.base_channel;
        let seed_size = config.decoder_seed_size();
        let first_fc = FeedforwardLayer::from_loader(
            loader,
            &format!("{}.first_fc", name),
            config.decode_embed,
            seed_channels * seed_size * seed_size,
            true,
        )?;
        let first_cnn = ConvolutionLayer::from_loader(
            loader,
            &format!("{}.first_cnn", name),
            ConvParameters::new(seed_channels, 4 * config.stage_channels(), 1).with_bias(true),
        )?;
        let stages = config
            .decoder_stages()
            .iter()
            .map(|layout| {
                ConvStage::from_loader(
                    loader,
                    &format!("{}.conv_trans_{}", name, layout.index),
                    layout,
                    config.num_med_block,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        let conv_last = BottleneckBlock::from_loader(
            loader,
            &format!("{}.conv_last", name),
            BlockParameters::new(config.decoder_out_planes(), config.in_chans, Direction::Down)
                .res_conv(true)
                .activation(Activation::Tanh),
        )?;
        Ok(ConvDecoder {
            seed_channels,
            seed_size,
            first_up: config.first_up,
            first_fc,
            first_cnn,
            stages,
            conv_last,
        })
    }
}

impl CodingModel for ConvDecoder {
    type Input = Array1<ImagePrecision>;
    type Output = InternalDataRepresentation;

    /// Output values lie in `[-1, 1]`.
    fn forward_pass(&self, latent: &Array1<ImagePrecision>) -> InternalDataRepresentation {
        let seed = self.first_fc.forward_vector(latent);
        let size = self.seed_size;
        let seed = Array3::from_shape_fn((self.seed_channels, size, size), |(c, i, j)| {
            seed[c * size * size + i * size + j]
        });
        let x = self.first_cnn.convolve(&seed);
        let mut x = upsample_nearest(&x, size * self.first_up, size * self.first_up);
        for stage in self.stages.iter() {
            x = stage.forward_pass(&x);
        }
        debug!("decoder: last stage {:?}", x.dim());
        self.conv_last.forward_pass(&x, None).0
    }
}

/// Multi-branch encoder with one decoder per branch, used as a variational autoencoder.
///
/// Inputs and outputs are `(num_branch * in_chans, im_size, im_size)`; the
/// output of decoder `i` occupies the channels of input branch `i`.
pub struct CnnAttnVae {
    config: ModelConfig,
    encoder: MultiBranchEncoder,
    decoders: Vec<ConvDecoder>,
}

impl CnnAttnVae {
    /// Builds the model with parameters named like the PyTorch module
    /// (`encoder.*`, `decoder_{i}.*`).
    pub fn new(config: ModelConfig, loader: &mut impl WeightLoader) -> ModelResult<CnnAttnVae> {
        config.validate()?;
        info!(
            "Building model: {} branches, depth {}, embed_dim {}, latent {}, image {}x{}",
            config.num_branch,
            config.depth,
            config.embed_dim,
            config.decode_embed,
            config.im_size,
            config.im_size
        );
        let encoder = MultiBranchEncoder::from_loader(loader, "encoder", &config)?;
        let decoders = (0..config.num_branch)
            .map(|i| ConvDecoder::from_loader(loader, &format!("decoder_{}", i), &config))
            .collect::<ModelResult<Vec<_>>>()?;
        info!("Model ready");
        Ok(CnnAttnVae {
            config,
            encoder,
            decoders,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// `(channels, height, width)` of a single input sample, which is also the output shape.
    pub fn image_shape(&self) -> (usize, usize, usize) {
        let config = &self.config;
        (config.num_branch * config.in_chans, config.im_size, config.im_size)
    }

    pub fn latent_dim(&self) -> usize {
        self.config.decode_embed
    }

    fn check_input(&self, shape: &[usize]) -> ModelResult<()> {
        let (c, h, w) = self.image_shape();
        if shape != [c, h, w] {
            return Err(ModelError::InputShape {
                expected: vec![c, h, w],
                actual: shape.to_vec(),
            });
        }
        Ok(())
    }

    pub fn encode(&self, input: &InternalDataRepresentation) -> ModelResult<Posterior> {
        self.check_input(input.shape())?;
        Ok(self.encoder.forward_pass(input))
    }

    /// Runs every decoder on `latent` and stacks their images along the channels.
    pub fn decode(
        &self,
        latent: &Array1<ImagePrecision>,
    ) -> ModelResult<InternalDataRepresentation> {
        if latent.len() != self.latent_dim() {
            return Err(ModelError::LatentShape {
                expected: self.latent_dim(),
                actual: latent.len(),
            });
        }
        let images: Vec<_> = self
            .decoders
            .iter()
            .map(|decoder| decoder.forward_pass(latent))
            .collect();
        Ok(concat_channels(&images))
    }

    /// Encodes, samples a latent from the posterior and decodes it.
    /// Returns the prediction, the mean and the log-variance.
    pub fn forward<R: Rng + ?Sized>(
        &self,
        input: &InternalDataRepresentation,
        rng: &mut R,
    ) -> ModelResult<(
        InternalDataRepresentation,
        Array1<ImagePrecision>,
        Option<Array1<ImagePrecision>>,
    )> {
        let posterior = self.encode(input)?;
        let latent = posterior.sample(rng);
        let prediction = self.decode(&latent)?;
        Ok((prediction, posterior.mean, posterior.log_var))
    }

    /// Decodes the posterior mean, without any sampling.
    pub fn reconstruct(
        &self,
        input: &InternalDataRepresentation,
    ) -> ModelResult<InternalDataRepresentation> {
        let posterior = self.encode(input)?;
        self.decode(&posterior.mean)
    }

    /// Decodes a latent drawn from the standard normal prior.
    pub fn generate<R: Rng + ?Sized>(&self, rng: &mut R) -> InternalDataRepresentation {
        let latent: Array1<ImagePrecision> = (0..self.latent_dim())
            .map(|_| rng.sample::<ImagePrecision, _>(StandardNormal))
            .collect();
        let images: Vec<_> = self
            .decoders
            .iter()
            .map(|decoder| decoder.forward_pass(&latent))
            .collect();
        concat_channels(&images)
    }

    /// [`forward`](CnnAttnVae::forward) for every sample of a `(batch, C, H, W)`
    /// array. Noise is drawn sample after sample from `rng`.
    pub fn forward_batch<R: Rng + ?Sized>(
        &self,
        input: &Array4<ImagePrecision>,
        rng: &mut R,
    ) -> ModelResult<(
        Array4<ImagePrecision>,
        Array2<ImagePrecision>,
        Option<Array2<ImagePrecision>>,
    )> {
        self.check_input(&input.shape()[1..])?;
        let batch = input.len_of(Axis(0));
        let latent = self.latent_dim();
        let mut predictions = Array4::zeros(input.raw_dim());
        let mut means = Array2::zeros((batch, latent));
        let mut log_vars = if self.config.use_vae {
            Some(Array2::zeros((batch, latent)))
        } else {
            None
        };

        for (b, sample) in input.outer_iter().enumerate() {
            let (prediction, mean, log_var) = self.forward(&sample.to_owned(), rng)?;
            predictions.index_axis_mut(Axis(0), b).assign(&prediction);
            means.row_mut(b).assign(&mean);
            if let (Some(all), Some(log_var)) = (log_vars.as_mut(), log_var) {
                all.row_mut(b).assign(&log_var);
            }
            debug!("batch sample {} of {} done", b + 1, batch);
        }
        Ok((predictions, means, log_vars))
    }
}
