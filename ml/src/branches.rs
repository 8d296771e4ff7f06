use ndarray::*;

use crate::{ImagePrecision, InternalDataRepresentation, TokenSequence};

/// Channel slice `i` out of `num_branch` equal slices.
pub(crate) fn channel_chunk(
    x: &InternalDataRepresentation,
    i: usize,
    num_branch: usize,
) -> ArrayView3<'_, ImagePrecision> {
    let per_branch = x.len_of(Axis(0)) / num_branch;
    x.slice(s![i * per_branch..(i + 1) * per_branch, .., ..])
}

/// Token slice `i` of the non-class tokens.
pub(crate) fn token_chunk(
    x: &TokenSequence,
    i: usize,
    num_branch: usize,
) -> ArrayView2<'_, ImagePrecision> {
    let per_branch = (x.nrows() - 1) / num_branch;
    x.slice(s![1 + i * per_branch..1 + (i + 1) * per_branch, ..])
}

pub(crate) fn concat_channels(parts: &[InternalDataRepresentation]) -> InternalDataRepresentation {
    let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
    concatenate(Axis(0), &views).unwrap_or_else(|_| {
        panic!(
            "branch outputs disagree in spatial size: {:?}",
            parts.iter().map(|p| p.dim()).collect::<Vec<_>>()
        )
    })
}

pub(crate) fn concat_tokens(parts: &[ArrayView2<ImagePrecision>]) -> TokenSequence {
    concatenate(Axis(0), parts).unwrap_or_else(|_| {
        panic!(
            "token blocks disagree in width: {:?}",
            parts.iter().map(|p| p.dim()).collect::<Vec<_>>()
        )
    })
}

/// `(tokens, channels)` view of a feature map, token `t` being pixel `t` in row major order.
pub(crate) fn map_to_tokens(x: &InternalDataRepresentation) -> TokenSequence {
    let (channels, height, width) = x.dim();
    Array2::from_shape_fn((height * width, channels), |(t, c)| {
        x[[c, t / width, t % width]]
    })
}

/// Inverse of [`map_to_tokens`].
pub(crate) fn tokens_to_map(
    x: ArrayView2<ImagePrecision>,
    height: usize,
    width: usize,
) -> InternalDataRepresentation {
    debug_assert_eq!(x.nrows(), height * width);
    Array3::from_shape_fn((x.ncols(), height, width), |(c, i, j)| x[[i * width + j, c]])
}
