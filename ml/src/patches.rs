//! Conversion between images and sequences of flattened square patches.
//! Patch `(h, w)` becomes row `h * grid + w`, ordered by patch row, patch column, channel.
use ndarray::*;

use crate::{models::ModelError, InternalDataRepresentation, TokenSequence};

/// `(C, H, W)` image to `(L, p * p * C)` patches with `L = (H / p) * (W / p)`.
/// The image must be square with a side divisible by `p`.
pub fn patchify(
    image: &InternalDataRepresentation,
    patch_size: usize,
) -> Result<TokenSequence, ModelError> {
    let (channels, height, width) = image.dim();
    if patch_size == 0 || height != width || height % patch_size != 0 {
        return Err(ModelError::PatchShape {
            shape: image.shape().to_vec(),
            patch_size,
        });
    }
    let p = patch_size;
    let grid = height / p;
    Ok(Array2::from_shape_fn(
        (grid * grid, p * p * channels),
        |(l, idx)| {
            let (h, w) = (l / grid, l % grid);
            let (pi, rest) = (idx / (p * channels), idx % (p * channels));
            let (qi, c) = (rest / channels, rest % channels);
            image[[c, h * p + pi, w * p + qi]]
        },
    ))
}

/// Inverse of [`patchify`]. `patches` must hold a square number of rows, each
/// `p * p * channels` wide.
pub fn unpatchify(
    patches: &TokenSequence,
    patch_size: usize,
    channels: usize,
) -> Result<InternalDataRepresentation, ModelError> {
    let (length, width) = patches.dim();
    let grid = (length as f64).sqrt().round() as usize;
    let p = patch_size;
    if p == 0 || channels == 0 || grid * grid != length || width != p * p * channels {
        return Err(ModelError::PatchShape {
            shape: patches.shape().to_vec(),
            patch_size,
        });
    }
    Ok(Array3::from_shape_fn(
        (channels, grid * p, grid * p),
        |(c, y, x)| {
            let l = (y / p) * grid + x / p;
            patches[[l, ((y % p) * p + x % p) * channels + c]]
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_layout() {
        // 2 channels, 4x4 image, value = channel * 100 + row * 10 + column
        let image = Array3::from_shape_fn((2, 4, 4), |(c, i, j)| (c * 100 + i * 10 + j) as f32);
        let patches = patchify(&image, 2).unwrap();
        assert_eq!(patches.dim(), (4, 8));
        // patch (0, 1): rows 0..2, columns 2..4, channels innermost
        assert_eq!(
            patches.row(1),
            array![2., 102., 3., 103., 12., 112., 13., 113.]
        );
        // patch (1, 0)
        assert_eq!(patches[[2, 0]], 20.);
        assert_eq!(unpatchify(&patches, 2, 2).unwrap(), image);
    }

    #[test]
    fn test_single_patch() {
        let image = Array3::from_shape_fn((3, 16, 16), |(c, i, j)| (c + i * j) as f32);
        let patches = patchify(&image, 16).unwrap();
        assert_eq!(patches.dim(), (1, 768));
        assert_eq!(unpatchify(&patches, 16, 3).unwrap(), image);
    }

    #[test]
    fn test_rejected_shapes() {
        assert!(matches!(
            patchify(&Array3::zeros((3, 4, 6)), 2),
            Err(ModelError::PatchShape { .. })
        ));
        assert!(matches!(
            patchify(&Array3::zeros((3, 6, 6)), 4),
            Err(ModelError::PatchShape { .. })
        ));
        assert!(matches!(
            unpatchify(&Array2::zeros((3, 12)), 2, 3),
            Err(ModelError::PatchShape { .. })
        ));
        assert!(matches!(
            unpatchify(&Array2::zeros((4, 10)), 2, 3),
            Err(ModelError::PatchShape { .. })
        ));
    }
}
