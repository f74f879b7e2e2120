use rand::Rng;
use rand_distr::Exp1;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// How random weight vectors on the simplex are drawn.
///
/// `UniformNormalized` draws `n` uniform(0,1) values and divides by their sum.
/// It covers the whole simplex but concentrates mass near the centre, which is
/// fine for exploratory clouds. `Dirichlet` is the exact uniform-simplex draw
/// (Dirichlet(1,…,1), built from unit exponentials).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub enum SamplingScheme {
    #[default]
    UniformNormalized,
    Dirichlet,
}

impl SamplingScheme {
    pub fn sample_weights<R: Rng + ?Sized>(&self, number_of_assets: usize, rng: &mut R) -> Vec<f64> {
        let raw: Vec<f64> = match self {
            SamplingScheme::UniformNormalized => (0..number_of_assets).map(|_| rng.gen::<f64>()).collect(),
            SamplingScheme::Dirichlet => (0..number_of_assets).map(|_| rng.sample::<f64, _>(Exp1)).collect(),
        };
        normalize_or_uniform(raw)
    }
}

/// Divides by the sum; a zero (or non-finite) sum yields equal weights.
pub fn normalize_or_uniform(mut weights: Vec<f64>) -> Vec<f64> {
    let n = weights.len();
    if n == 0 {
        return weights;
    }
    let total: f64 = weights.iter().sum();
    if total > 0. && total.is_finite() {
        weights.iter_mut().for_each(|w| *w /= total);
    } else {
        weights.iter_mut().for_each(|w| *w = 1. / n as f64);
    }
    weights
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    #[test]
    fn test_samples_lie_on_the_simplex() {
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        for scheme in [SamplingScheme::UniformNormalized, SamplingScheme::Dirichlet] {
            for _ in 0..200 {
                let weights = scheme.sample_weights(5, &mut rng);
                assert_eq!(weights.len(), 5);
                assert!(weights.iter().all(|w| (0. ..=1.).contains(w)));
                assert!((weights.iter().sum::<f64>() - 1.).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_same_seed_same_samples() {
        let mut a = ChaCha20Rng::seed_from_u64(42);
        let mut b = ChaCha20Rng::seed_from_u64(42);
        assert_eq!(
            SamplingScheme::Dirichlet.sample_weights(4, &mut a),
            SamplingScheme::Dirichlet.sample_weights(4, &mut b)
        );
    }

    #[test]
    fn test_zero_sum_falls_back_to_equal_weights() {
        assert_eq!(normalize_or_uniform(vec![0., 0., 0., 0.]), vec![0.25; 4]);
        assert!(normalize_or_uniform(vec![]).is_empty());
    }

    #[test]
    fn test_scheme_serializes_camel_case() {
        let json = serde_json::to_string(&SamplingScheme::UniformNormalized).unwrap();
        assert_eq!(json, "\"uniformNormalized\"");
    }
}
