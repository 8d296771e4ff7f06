//! Command line interface to the multi-branch VAE: reconstructs, encodes,
//! decodes and generates images with a model exported from PyTorch.

use branchvae::{branch_patches, load_input, save_branches};
use env_logger::Builder;
use log::{info, warn};
use ml::{
    weight_loader::{NpzWeightLoader, RandomWeightLoader},
    CnnAttnVae, ModelConfig, Posterior,
};
use ndarray::Array1;
use ndarray_npy::{read_npy, write_npy};
use quicli::prelude::*;
use rand::{rngs::StdRng, SeedableRng};
use std::path::{Path, PathBuf};
use structopt::StructOpt;

/// Options describing which model to run
#[derive(Debug, StructOpt)]
struct ModelOpts {
    /// Model configuration as JSON. Missing fields take the default values.
    #[structopt(short = "c", long = "config", parse(from_os_str))]
    config: Option<PathBuf>,
    /// Weights as .npz archive of the PyTorch state dict.
    /// Without weights, the model is randomly initialised.
    #[structopt(short = "w", long = "weights", parse(from_os_str))]
    weights: Option<PathBuf>,
    /// Seed for random initialisation and sampling
    #[structopt(long = "seed", default_value = "0")]
    seed: u64,
}

impl ModelOpts {
    fn load_config(&self) -> Result<ModelConfig, Error> {
        let config = match &self.config {
            Some(path) => ModelConfig::from_json_file(path)?,
            None => ModelConfig::default(),
        };
        Ok(config)
    }

    fn load_model(&self) -> Result<CnnAttnVae, Error> {
        let config = self.load_config()?;
        let model = match &self.weights {
            Some(path) => {
                let mut loader = NpzWeightLoader::from_path(path)?;
                info!("Loading {} parameters from {:?}", loader.len(), path);
                CnnAttnVae::new(config, &mut loader)?
            }
            None => {
                warn!("No weights given, initialising randomly with seed {}", self.seed);
                CnnAttnVae::new(config, &mut RandomWeightLoader::new(self.seed))?
            }
        };
        Ok(model)
    }

    /// Sampling uses a different stream than the initialisation.
    fn rng(&self) -> StdRng {
        StdRng::seed_from_u64(self.seed.wrapping_add(1))
    }
}

/// Reconstructs images with the autoencoder
#[derive(Debug, StructOpt)]
struct ReconstructOpts {
    /// One image per branch, a single image shared by all branches, or one .npy
    /// array holding the full model input
    #[structopt(parse(from_os_str))]
    inputs: Vec<PathBuf>,
    /// Output directory, defaults to the directory of the first input
    #[structopt(short = "o", long = "output", parse(from_os_str))]
    output: Option<PathBuf>,
    /// Decode a sample of the posterior instead of its mean
    #[structopt(long = "sample")]
    sample: bool,
    #[structopt(flatten)]
    model: ModelOpts,
    #[structopt(flatten)]
    verbosity: Verbosity,
}

/// Writes the latent posterior of images
#[derive(Debug, StructOpt)]
struct EncodeOpts {
    /// One image per branch, a single image shared by all branches, or one .npy
    /// array holding the full model input
    #[structopt(parse(from_os_str))]
    inputs: Vec<PathBuf>,
    /// Path of the mean, as .npy. The log-variance is written next to it
    /// as "<output>-log-var.npy".
    #[structopt(short = "o", long = "output", parse(from_os_str))]
    output: PathBuf,
    #[structopt(flatten)]
    model: ModelOpts,
    #[structopt(flatten)]
    verbosity: Verbosity,
}

/// Decodes a latent vector
#[derive(Debug, StructOpt)]
struct DecodeOpts {
    /// Latent vector as .npy
    #[structopt(parse(from_os_str))]
    latent: PathBuf,
    /// Output directory, defaults to the directory of the latent
    #[structopt(short = "o", long = "output", parse(from_os_str))]
    output: Option<PathBuf>,
    #[structopt(flatten)]
    model: ModelOpts,
    #[structopt(flatten)]
    verbosity: Verbosity,
}

/// Generates images from the prior
#[derive(Debug, StructOpt)]
struct GenerateOpts {
    /// Output directory
    #[structopt(short = "o", long = "output", parse(from_os_str), default_value = ".")]
    output: PathBuf,
    /// Number of samples
    #[structopt(short = "n", long = "count", default_value = "1")]
    count: usize,
    #[structopt(flatten)]
    model: ModelOpts,
    #[structopt(flatten)]
    verbosity: Verbosity,
}

/// Exports the transformer patches of images
#[derive(Debug, StructOpt)]
struct PatchesOpts {
    /// One image per branch, a single image shared by all branches, or one .npy
    /// array holding the full model input
    #[structopt(parse(from_os_str))]
    inputs: Vec<PathBuf>,
    /// Path of the patches, as .npy of shape (branches, patches, values)
    #[structopt(short = "o", long = "output", parse(from_os_str))]
    output: PathBuf,
    #[structopt(flatten)]
    model: ModelOpts,
    #[structopt(flatten)]
    verbosity: Verbosity,
}

/// Prints the model layout
#[derive(Debug, StructOpt)]
struct InfoOpts {
    #[structopt(flatten)]
    model: ModelOpts,
    #[structopt(flatten)]
    verbosity: Verbosity,
}

/// Multi-branch convolution/attention variational autoencoder.
#[derive(Debug, StructOpt)]
#[structopt(name = "branchvae")]
enum BranchVae {
    #[structopt(
        name = "reconstruct",
        about = "Encodes and decodes images, writing one image per decoder."
    )]
    Reconstruct(ReconstructOpts),
    #[structopt(
        name = "encode",
        about = "Writes the latent mean and log-variance of images as .npy."
    )]
    Encode(EncodeOpts),
    #[structopt(name = "decode", about = "Decodes a latent vector stored as .npy.")]
    Decode(DecodeOpts),
    #[structopt(
        name = "generate",
        about = "Decodes latent vectors drawn from the standard normal prior."
    )]
    Generate(GenerateOpts),
    #[structopt(
        name = "patches",
        about = "Writes the input split into transformer patches as .npy."
    )]
    Patches(PatchesOpts),
    #[structopt(name = "info", about = "Prints the derived model layout.")]
    Info(InfoOpts),
}

/// Trait for the subcommands of the cli
trait BranchVaeOpts {
    /// Performs the subcommand
    fn run(&self) -> Result<(), Error>;
    /// Returns the verbosity command
    fn get_verbosity(&self) -> &Verbosity;
    /// Sets up logging
    fn setup_env_logger(&self) -> CliResult {
        let mut builder = Builder::from_default_env();

        builder
            .filter(None, self.get_verbosity().log_level().to_level_filter())
            .init();

        Ok(())
    }
}

/// Output directory: the given one, or the directory of `input`.
fn output_dir(output: &Option<PathBuf>, input: &Path) -> PathBuf {
    match output {
        Some(dir) => dir.clone(),
        None => input
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(".")),
    }
}

/// File stem of `path` as string, used as prefix for output files.
fn stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string())
}

impl BranchVaeOpts for ReconstructOpts {
    fn run(&self) -> Result<(), Error> {
        let model = self.model.load_model()?;
        let input = load_input(&self.inputs, model.config())?;
        // load_input rejects an empty input list
        let first = &self.inputs[0];

        let reconstructed = if self.sample {
            let (prediction, _, _) = model.forward(&input, &mut self.model.rng())?;
            prediction
        } else {
            model.reconstruct(&input)?
        };

        let prefix = stem(first) + "-reconstructed";
        save_branches(
            &reconstructed,
            model.config().num_branch,
            &output_dir(&self.output, first),
            &prefix,
        )?;
        Ok(())
    }

    fn get_verbosity(&self) -> &Verbosity {
        &self.verbosity
    }
}

impl BranchVaeOpts for EncodeOpts {
    fn run(&self) -> Result<(), Error> {
        let model = self.model.load_model()?;
        let input = load_input(&self.inputs, model.config())?;
        let Posterior { mean, log_var } = model.encode(&input)?;

        write_npy(&self.output, &mean)?;
        info!("Wrote mean to {:?}", self.output);
        if let Some(log_var) = log_var {
            let path = self
                .output
                .with_file_name(stem(&self.output) + "-log-var.npy");
            write_npy(&path, &log_var)?;
            info!("Wrote log-variance to {:?}", path);
        }
        Ok(())
    }

    fn get_verbosity(&self) -> &Verbosity {
        &self.verbosity
    }
}

impl BranchVaeOpts for DecodeOpts {
    fn run(&self) -> Result<(), Error> {
        let model = self.model.load_model()?;
        let latent: Array1<f32> = read_npy(&self.latent)?;
        let decoded = model.decode(&latent)?;
        save_branches(
            &decoded,
            model.config().num_branch,
            &output_dir(&self.output, &self.latent),
            &(stem(&self.latent) + "-decoded"),
        )?;
        Ok(())
    }

    fn get_verbosity(&self) -> &Verbosity {
        &self.verbosity
    }
}

impl BranchVaeOpts for GenerateOpts {
    fn run(&self) -> Result<(), Error> {
        let model = self.model.load_model()?;
        let mut rng = self.model.rng();
        for i in 0..self.count {
            let generated = model.generate(&mut rng);
            save_branches(
                &generated,
                model.config().num_branch,
                &self.output,
                &format!("sample{}", i),
            )?;
        }
        Ok(())
    }

    fn get_verbosity(&self) -> &Verbosity {
        &self.verbosity
    }
}

impl BranchVaeOpts for PatchesOpts {
    fn run(&self) -> Result<(), Error> {
        let config = self.model.load_config()?;
        config.validate()?;
        let input = load_input(&self.inputs, &config)?;
        let patches = branch_patches(&input, &config)?;
        write_npy(&self.output, &patches)?;
        info!("Wrote {:?} patches to {:?}", patches.dim(), self.output);
        Ok(())
    }

    fn get_verbosity(&self) -> &Verbosity {
        &self.verbosity
    }
}

impl BranchVaeOpts for InfoOpts {
    fn run(&self) -> Result<(), Error> {
        let config = self.model.load_config()?;
        config.validate()?;
        println!("{:#?}", config);
        println!(
            "input/output: {} x {} x {}",
            config.num_branch * config.in_chans,
            config.im_size,
            config.im_size
        );
        println!(
            "tokens: {} ({} per branch + class token), head dim {}, mlp hidden {}",
            config.num_tokens(),
            config.tokens_per_branch(),
            config.head_dim(),
            config.mlp_hidden_dim()
        );
        println!("encoder stages (per branch widths):");
        for stage in config.encoder_stages() {
            println!(
                "  conv_trans_{}: {} -> {}, stride {}, token stride {}{}",
                stage.index,
                stage.inplanes,
                stage.outplanes,
                stage.stride,
                stage.dw_stride,
                if stage.last_fusion { ", fusing down" } else { "" }
            );
        }
        println!(
            "decoder seed: {} x {} x {}, upsampled by {}",
            config.base_channel,
            config.decoder_seed_size(),
            config.decoder_seed_size(),
            config.first_up
        );
        println!("decoder stages:");
        for stage in config.decoder_stages() {
            println!(
                "  conv_trans_{}: {} -> {}, stride {}{}",
                stage.index,
                stage.inplanes,
                stage.outplanes,
                stage.stride,
                if stage.last_fusion { ", fusing up" } else { "" }
            );
        }
        Ok(())
    }

    fn get_verbosity(&self) -> &Verbosity {
        &self.verbosity
    }
}

impl BranchVaeOpts for BranchVae {
    fn run(&self) -> Result<(), Error> {
        match self {
            BranchVae::Reconstruct(c) => c.run(),
            BranchVae::Encode(c) => c.run(),
            BranchVae::Decode(c) => c.run(),
            BranchVae::Generate(c) => c.run(),
            BranchVae::Patches(c) => c.run(),
            BranchVae::Info(c) => c.run(),
        }
    }

    fn get_verbosity(&self) -> &Verbosity {
        match self {
            BranchVae::Reconstruct(c) => c.get_verbosity(),
            BranchVae::Encode(c) => c.get_verbosity(),
            BranchVae::Decode(c) => c.get_verbosity(),
            BranchVae::Generate(c) => c.get_verbosity(),
            BranchVae::Patches(c) => c.get_verbosity(),
            BranchVae::Info(c) => c.get_verbosity(),
        }
    }
}

fn main() -> CliResult {
    let args = BranchVae::from_args();
    args.setup_env_logger()?;
    args.run()?;
    Ok(())
}
