use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::{Distribution, Normal, Uniform};

use crate::{bail_value, shape::numel, Error, NDArray, Result};

/// How a variable obtains its initial value.
///
/// Random initializers are always seeded and always materialize the full
/// logical tensor before a shard is cut out of it, so every layout of the same
/// variable sees identical values.
#[derive(Clone, Debug)]
pub enum Initializer {
    Zeros,
    Ones,
    Constant(f32),
    Uniform { low: f32, high: f32, seed: u64 },
    Normal { mean: f32, std: f32, seed: u64 },
    /// Explicit values for the whole logical tensor.
    Provided(NDArray),
}

impl Initializer {
    pub fn materialize(&self, shape: &[usize]) -> Result<Vec<f32>> {
        let n = numel(shape);
        let data = match self {
            Self::Zeros => vec![0.; n],
            Self::Ones => vec![1.; n],
            Self::Constant(v) => vec![*v; n],
            Self::Uniform { low, high, seed } => {
                if low >= high {
                    bail_value!("uniform initializer needs low < high, got [{low}, {high})");
                }
                let mut rng = StdRng::seed_from_u64(*seed);
                let dist = Uniform::new(*low, *high);
                (0..n).map(|_| dist.sample(&mut rng)).collect()
            }
            Self::Normal { mean, std, seed } => {
                let mut rng = StdRng::seed_from_u64(*seed);
                let dist = Normal::new(*mean, *std).map_err(Error::wrap)?;
                (0..n).map(|_| rng.sample(dist)).collect()
            }
            Self::Provided(arr) => {
                if arr.shape() != shape {
                    bail_value!(
                        "provided initial value has shape {:?}, variable expects {shape:?}",
                        arr.shape()
                    );
                }
                arr.to_vec()
            }
        };
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_initializers_are_reproducible() {
        let init = Initializer::Normal {
            mean: 0.,
            std: 1.,
            seed: 42,
        };
        let a = init.materialize(&[4, 4]).unwrap();
        let b = init.materialize(&[4, 4]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);

        let u = Initializer::Uniform {
            low: -1.,
            high: 1.,
            seed: 7,
        }
        .materialize(&[100])
        .unwrap();
        assert!(u.iter().all(|x| (-1. ..1.).contains(x)));
    }

    #[test]
    fn bad_arguments_are_value_errors() {
        let err = Initializer::Uniform {
            low: 1.,
            high: 1.,
            seed: 0,
        }
        .materialize(&[2])
        .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Value);

        let provided = Initializer::Provided(NDArray::from_vec(vec![1., 2.], &[2]).unwrap());
        assert!(provided.materialize(&[3]).is_err());
    }
}
