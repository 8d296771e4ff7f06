//! Parameter initialisation for models built without a weight file.
use rand::Rng;
use rand_distr::{Distribution, Normal, Uniform};

use crate::WeightPrecision;

/// How a parameter should be filled when it is not read from a file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Init {
    Constant(WeightPrecision),
    /// Normal(0, std) resampled until it lies in [-2, 2].
    TruncNormal { std: WeightPrecision },
    /// Normal(0, sqrt(2 / fan_out)), the relu gain with fan_out mode.
    KaimingNormalFanOut,
    /// Uniform(-1/sqrt(fan_in), 1/sqrt(fan_in)), PyTorch's default for layer weights.
    KaimingUniform,
    /// Uniform(-bound, bound).
    Uniform { bound: WeightPrecision },
}

/// Fan in and fan out of a parameter with the given shape, computed the way
/// PyTorch does: dimension 1 and dimension 0 times the receptive field.
pub fn fans(shape: &[usize]) -> (usize, usize) {
    match shape.len() {
        0 => (1, 1),
        1 => (shape[0], shape[0]),
        _ => {
            let receptive_field: usize = shape[2..].iter().product();
            (shape[1] * receptive_field, shape[0] * receptive_field)
        }
    }
}

/// Bias bound used by PyTorch for layers whose weight has the given fan in.
pub fn bias_bound(fan_in: usize) -> WeightPrecision {
    if fan_in == 0 {
        0.0
    } else {
        1.0 / (fan_in as WeightPrecision).sqrt()
    }
}

impl Init {
    /// Draws `shape.iter().product()` values in standard (row major) order.
    pub fn sample<R: Rng + ?Sized>(&self, shape: &[usize], rng: &mut R) -> Vec<WeightPrecision> {
        let len: usize = shape.iter().product();
        let (fan_in, fan_out) = fans(shape);
        match *self {
            Init::Constant(value) => vec![value; len],
            Init::TruncNormal { std } => trunc_normal(len, std, rng),
            Init::KaimingNormalFanOut => {
                let std = (2.0 / fan_out.max(1) as WeightPrecision).sqrt();
                normal(len, std, rng)
            }
            Init::KaimingUniform => uniform(len, bias_bound(fan_in), rng),
            Init::Uniform { bound } => uniform(len, bound, rng),
        }
    }
}

fn normal<R: Rng + ?Sized>(len: usize, std: WeightPrecision, rng: &mut R) -> Vec<WeightPrecision> {
    match Normal::new(0.0, std) {
        Ok(dist) => (0..len).map(|_| dist.sample(rng)).collect(),
        // std of 0 (or NaN from an empty fan) degenerates to a constant
        Err(_) => vec![0.0; len],
    }
}

fn trunc_normal<R: Rng + ?Sized>(
    len: usize,
    std: WeightPrecision,
    rng: &mut R,
) -> Vec<WeightPrecision> {
    let dist = match Normal::new(0.0, std) {
        Ok(dist) => dist,
        Err(_) => return vec![0.0; len],
    };
    (0..len)
        .map(|_| loop {
            let value: WeightPrecision = dist.sample(rng);
            if (-2.0..=2.0).contains(&value) {
                break value;
            }
        })
        .collect()
}

fn uniform<R: Rng + ?Sized>(len: usize, bound: WeightPrecision, rng: &mut R) -> Vec<WeightPrecision> {
    if bound <= 0.0 {
        return vec![0.0; len];
    }
    let dist = Uniform::new_inclusive(-bound, bound);
    (0..len).map(|_| dist.sample(rng)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_fans_of_conv_kernel() {
        assert_eq!(fans(&[8, 4, 3, 3]), (36, 72));
        assert_eq!(fans(&[10, 5]), (5, 10));
        assert_eq!(fans(&[7]), (7, 7));
    }

    #[test]
    fn test_constant_init() {
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(Init::Constant(1.0).sample(&[2, 2], &mut rng), vec![1.0; 4]);
    }

    #[test]
    fn test_uniform_inits_respect_bounds() {
        let mut rng = StdRng::seed_from_u64(3);
        let values = Init::KaimingUniform.sample(&[4, 16, 1, 1], &mut rng);
        assert_eq!(values.len(), 64);
        assert!(values.iter().all(|v| v.abs() <= 0.25));

        let values = Init::Uniform { bound: 0.1 }.sample(&[100], &mut rng);
        assert!(values.iter().all(|v| v.abs() <= 0.1));
    }

    #[test]
    fn test_trunc_normal_stays_in_range() {
        let mut rng = StdRng::seed_from_u64(7);
        let values = Init::TruncNormal { std: 5.0 }.sample(&[1000], &mut rng);
        assert!(values.iter().all(|v| (-2.0..=2.0).contains(v)));
        assert!(values.iter().any(|v| *v != 0.0));
    }

    #[test]
    fn test_kaiming_normal_scale() {
        let mut rng = StdRng::seed_from_u64(11);
        // fan_out = 2 * 1 * 1, std = 1
        let values = Init::KaimingNormalFanOut.sample(&[2, 5000, 1, 1], &mut rng);
        let mean = values.iter().sum::<f32>() / values.len() as f32;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / values.len() as f32;
        assert!(mean.abs() < 0.05);
        assert!((var - 1.0).abs() < 0.1);
    }
}
