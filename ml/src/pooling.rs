use ndarray::*;

use crate::{ImagePrecision, InternalDataRepresentation};

/// Average pooling with kernel size and stride `window`, no padding.
pub fn avg_pool2d(x: &InternalDataRepresentation, window: usize) -> InternalDataRepresentation {
    debug_assert!(window > 0);
    if window == 1 {
        return x.clone();
    }
    let (channels, height, width) = x.dim();
    let new_height = (height - window) / window + 1;
    let new_width = (width - window) / window + 1;
    let area = (window * window) as ImagePrecision;
    Array3::from_shape_fn((channels, new_height, new_width), |(c, i, j)| {
        x.slice(s![
            c,
            i * window..(i + 1) * window,
            j * window..(j + 1) * window
        ])
        .sum()
            / area
    })
}

/// Adaptive average pooling to an `(output_size, output_size)` map.
/// Bin `i` covers `floor(i * H / out)..ceil((i + 1) * H / out)`, so bins may
/// overlap or repeat pixels when the input is smaller than the output.
pub fn adaptive_avg_pool2d(
    x: &InternalDataRepresentation,
    output_size: usize,
) -> InternalDataRepresentation {
    let (channels, height, width) = x.dim();
    let bin = |i: usize, len: usize| {
        let start = i * len / output_size;
        let end = ((i + 1) * len + output_size - 1) / output_size;
        start..end
    };
    Array3::from_shape_fn((channels, output_size, output_size), |(c, i, j)| {
        let rows = bin(i, height);
        let cols = bin(j, width);
        let count = (rows.len() * cols.len()) as ImagePrecision;
        x.slice(s![c, rows, cols]).sum() / count
    })
}

/// Nearest neighbour interpolation to `(new_height, new_width)`.
/// Output pixel `i` reads input pixel `floor(i * in / out)`.
pub fn upsample_nearest(
    x: &InternalDataRepresentation,
    new_height: usize,
    new_width: usize,
) -> InternalDataRepresentation {
    let (channels, height, width) = x.dim();
    if (height, width) == (new_height, new_width) {
        return x.clone();
    }
    Array3::from_shape_fn((channels, new_height, new_width), |(c, i, j)| {
        x[[c, i * height / new_height, j * width / new_width]]
    })
}
