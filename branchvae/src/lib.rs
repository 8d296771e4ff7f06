//! Image and array I/O for the command line interface.
//!
//! Model inputs stack one image per branch along the channel axis, with pixel
//! values mapped from `[0, 255]` to `[-1, 1]`. Model outputs are split back into
//! one image per decoder.
use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
};

use image::{
    imageops::FilterType, io::Reader as ImageReader, DynamicImage, GenericImageView, GrayImage, Luma, Rgb, RgbImage,
};
use log::{info, warn};
use ml::{
    patches::{patchify, unpatchify},
    ModelConfig, ModelError,
};
use ndarray::{concatenate, s, stack, Array3, ArrayView3, Axis, ShapeError};
use ndarray_npy::{read_npy, ReadNpyError};
use nshare::ToNdarray3;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InputError {
    #[error("{0:?} has an unrecognized type. Only .jpg, .png and .npy are supported")]
    UnsupportedFormat(PathBuf),
    #[error("Could not read image")]
    ImageError(#[from] image::ImageError),
    #[error("Could not read array")]
    NpyError(#[from] ReadNpyError),
    #[error("Cannot convert {0} channels to an image, only 1 (gray) and 3 (rgb) are supported")]
    ChannelCount(usize),
    #[error("Expected 1 or {expected} input images (one per branch), got {actual}")]
    BranchCount { expected: usize, actual: usize },
    #[error("Branch images do not fit together")]
    ShapeError(#[from] ShapeError),
    #[error("Cannot split input into patches")]
    PatchError(#[from] ModelError),
}

pub type InputResult<T> = Result<T, InputError>;

/// Maps a pixel value to the model's input range `[-1, 1]`.
pub fn from_pixel(x: u8) -> f32 {
    x as f32 / 127.5 - 1.0
}

/// Turns output from neural net into a pixel value, performs postprocessing
pub fn to_pixel(x: &f32) -> u8 {
    ((x.clamp(-1.0, 1.0) + 1.0) * 127.5).round() as u8
}

/// Returns the image as `(channels, height, width)` array in `[-1, 1]`,
/// ready to be put into an encoder. `channels` is 1 for grayscale, 3 for rgb.
pub fn image_to_ndarray(img: &DynamicImage, channels: usize) -> InputResult<Array3<f32>> {
    match channels {
        3 => Ok(img.to_rgb8().into_ndarray3().mapv(from_pixel)),
        1 => {
            let gray = img.to_luma8();
            let (width, height) = gray.dimensions();
            Ok(Array3::from_shape_fn(
                (1, height as usize, width as usize),
                |(_, i, j)| from_pixel(gray.get_pixel(j as u32, i as u32)[0]),
            ))
        }
        c => Err(InputError::ChannelCount(c)),
    }
}

/// Turns a `(channels, height, width)` array of pixel values into an image.
pub fn array_to_image(arr: ArrayView3<u8>) -> InputResult<DynamicImage> {
    let (channels, height, width) = arr.dim();
    let (w, h) = (width as u32, height as u32);
    match channels {
        3 => Ok(DynamicImage::ImageRgb8(RgbImage::from_fn(w, h, |x, y| {
            let (x, y) = (x as usize, y as usize);
            Rgb([arr[[0, y, x]], arr[[1, y, x]], arr[[2, y, x]]])
        }))),
        1 => Ok(DynamicImage::ImageLuma8(GrayImage::from_fn(w, h, |x, y| {
            Luma([arr[[0, y as usize, x as usize]]])
        }))),
        c => Err(InputError::ChannelCount(c)),
    }
}

/// Reads one branch image and scales it to the model's input size.
fn read_branch_image(path: &Path, config: &ModelConfig) -> InputResult<Array3<f32>> {
    let mut img = ImageReader::open(path)
        .map_err(image::ImageError::IoError)?
        .decode()?;
    let size = config.im_size as u32;
    if img.width() != size || img.height() != size {
        warn!(
            "Resizing {:?} from {}x{} to {}x{}",
            path,
            img.width(),
            img.height(),
            size,
            size
        );
        img = img.resize_exact(size, size, FilterType::Triangle);
    }
    image_to_ndarray(&img, config.in_chans)
}

/// Builds a model input from the given files.
///
/// A single `.npy` file is taken as the complete input. Otherwise there must be
/// one image per branch, or a single image that is shared by all branches.
pub fn load_input(paths: &[PathBuf], config: &ModelConfig) -> InputResult<Array3<f32>> {
    let is_npy = |p: &PathBuf| p.extension().and_then(OsStr::to_str) == Some("npy");
    if let [path] = paths {
        if is_npy(path) {
            return Ok(read_npy(path)?);
        }
    }
    if paths.len() != 1 && paths.len() != config.num_branch {
        return Err(InputError::BranchCount {
            expected: config.num_branch,
            actual: paths.len(),
        });
    }

    let mut branches = Vec::with_capacity(paths.len());
    for path in paths {
        match path.extension().and_then(OsStr::to_str) {
            Some("png") | Some("jpg") | Some("jpeg") => {
                branches.push(read_branch_image(path, config)?)
            }
            _ => return Err(InputError::UnsupportedFormat(path.clone())),
        }
    }
    if branches.len() == 1 && config.num_branch > 1 {
        info!("Using {:?} for all {} branches", paths[0], config.num_branch);
        branches = vec![branches[0].clone(); config.num_branch];
    }
    stack_branches(&branches)
}

/// Concatenates per-branch images along the channel axis.
pub fn stack_branches(branches: &[Array3<f32>]) -> InputResult<Array3<f32>> {
    let views: Vec<_> = branches.iter().map(|b| b.view()).collect();
    Ok(concatenate(Axis(0), &views)?)
}

/// Splits a model output into the images of its `num_branch` decoders.
pub fn split_branches(arr: &Array3<f32>, num_branch: usize) -> Vec<ArrayView3<f32>> {
    let per_branch = arr.len_of(Axis(0)) / num_branch;
    (0..num_branch)
        .map(|i| arr.slice(s![i * per_branch..(i + 1) * per_branch, .., ..]))
        .collect()
}

/// Splits every branch of a model input into transformer patches,
/// giving `(num_branch, tokens_per_branch, patch_size^2 * in_chans)`.
pub fn branch_patches(arr: &Array3<f32>, config: &ModelConfig) -> InputResult<Array3<f32>> {
    let patches = split_branches(arr, config.num_branch)
        .into_iter()
        .map(|branch| patchify(&branch.to_owned(), config.patch_size))
        .collect::<Result<Vec<_>, _>>()?;
    let views: Vec<_> = patches.iter().map(|p| p.view()).collect();
    Ok(stack(Axis(0), &views)?)
}

/// Inverse of [`branch_patches`].
pub fn patches_to_branches(
    patches: &Array3<f32>,
    config: &ModelConfig,
) -> InputResult<Array3<f32>> {
    let branches = patches
        .outer_iter()
        .map(|p| unpatchify(&p.to_owned(), config.patch_size, config.in_chans))
        .collect::<Result<Vec<_>, _>>()?;
    stack_branches(&branches)
}

/// Writes one png per decoder, named `<prefix>-branch<i>.png`, and returns their paths.
pub fn save_branches(
    arr: &Array3<f32>,
    num_branch: usize,
    dir: &Path,
    prefix: &str,
) -> InputResult<Vec<PathBuf>> {
    let mut written = Vec::with_capacity(num_branch);
    for (i, branch) in split_branches(arr, num_branch).into_iter().enumerate() {
        let pixels = branch.map(to_pixel);
        let path = dir.join(format!("{}-branch{}.png", prefix, i));
        array_to_image(pixels.view())?.save(&path)?;
        info!("Wrote {:?}", path);
        written.push(path);
    }
    Ok(written)
}
