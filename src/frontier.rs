//! Monte-Carlo reference frontier.
//!
//! Random simplex portfolios are drawn sequentially from one seeded stream,
//! evaluated in parallel, and summarised twice: once with volatility as the
//! risk axis and once with historical CVaR. The two measures rank portfolios
//! differently, so neither frontier is derived from the other.

use rand::{rngs::OsRng, RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;
use utoipa::ToSchema;

use crate::consts::{
    DEFAULT_BOOTSTRAP_SIMULATIONS, DEFAULT_CVAR_ALPHA, DEFAULT_FRONTIER_CLOUD_CAP,
    DEFAULT_FRONTIER_SAMPLES,
};
use crate::sampling::SamplingScheme;
use crate::statistics::{
    evaluate_weights, sharpe, CvarEstimator, CvarModel, PortfolioMetrics, ReturnMatrix, RiskModel,
    StatisticsError,
};

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct FrontierConfig {
    pub samples: usize,
    /// Maximum number of cloud points kept in each frontier.
    pub cloud_cap: usize,
    pub risk_free_rate: f64,
    pub cvar_alpha: f64,
    pub cvar_estimator: CvarEstimator,
    pub bootstrap_simulations: usize,
    pub seed: Option<u64>,
    pub sampling_scheme: SamplingScheme,
}

impl Default for FrontierConfig {
    fn default() -> Self {
        FrontierConfig {
            samples: DEFAULT_FRONTIER_SAMPLES,
            cloud_cap: DEFAULT_FRONTIER_CLOUD_CAP,
            risk_free_rate: 0.,
            cvar_alpha: DEFAULT_CVAR_ALPHA,
            cvar_estimator: CvarEstimator::Historical,
            bootstrap_simulations: DEFAULT_BOOTSTRAP_SIMULATIONS,
            seed: None,
            sampling_scheme: SamplingScheme::UniformNormalized,
        }
    }
}

/// Risk axis of a frontier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub enum FrontierRiskMeasure {
    Volatility,
    Cvar,
}

impl FrontierRiskMeasure {
    pub fn risk_of(&self, metrics: &PortfolioMetrics) -> f64 {
        match self {
            FrontierRiskMeasure::Volatility => metrics.volatility,
            FrontierRiskMeasure::Cvar => metrics.cvar,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct FrontierPoint {
    pub risk: f64,
    #[serde(rename = "return")]
    pub ret: f64,
    pub sharpe: f64,
    pub weights: Vec<f64>,
}

impl FrontierPoint {
    /// Sharpe is recomputed against the chosen risk axis.
    pub fn from_metrics(
        weights: Vec<f64>,
        metrics: &PortfolioMetrics,
        measure: FrontierRiskMeasure,
        risk_free_rate: f64,
    ) -> Self {
        let risk = measure.risk_of(metrics);
        FrontierPoint {
            risk,
            ret: metrics.expected_return,
            sharpe: sharpe(metrics.expected_return, risk, risk_free_rate),
            weights,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Frontier {
    pub risk_measure: FrontierRiskMeasure,
    /// First `cloud_cap` samples, in draw order.
    pub points: Vec<FrontierPoint>,
    pub max_sharpe: Option<FrontierPoint>,
    pub min_risk: Option<FrontierPoint>,
}

impl Frontier {
    /// Distinguished points are searched over every sample, not only the capped
    /// cloud. Ties keep the earliest draw.
    fn from_samples(
        samples: &[(Vec<f64>, PortfolioMetrics)],
        measure: FrontierRiskMeasure,
        config: &FrontierConfig,
    ) -> Self {
        let points: Vec<FrontierPoint> = samples
            .iter()
            .map(|(w, m)| FrontierPoint::from_metrics(w.clone(), m, measure, config.risk_free_rate))
            .collect();

        let mut max_sharpe: Option<&FrontierPoint> = None;
        let mut min_risk: Option<&FrontierPoint> = None;
        for point in points.iter() {
            if max_sharpe.map_or(true, |best| point.sharpe > best.sharpe) {
                max_sharpe = Some(point);
            }
            if min_risk.map_or(true, |best| point.risk < best.risk) {
                min_risk = Some(point);
            }
        }
        let max_sharpe = max_sharpe.cloned();
        let min_risk = min_risk.cloned();

        let mut points = points;
        points.truncate(config.cloud_cap);

        Frontier {
            risk_measure: measure,
            points,
            max_sharpe,
            min_risk,
        }
    }

    /// Union of the simulated cloud with the optimized/original markers and the
    /// frontier's own distinguished points, ready for plotting.
    pub fn chart_dataset(
        &self,
        optimized: &PortfolioMetrics,
        original: &PortfolioMetrics,
        risk_free_rate: f64,
    ) -> Vec<ChartPoint> {
        let marker = |metrics: &PortfolioMetrics, kind: ChartPointKind| {
            let risk = self.risk_measure.risk_of(metrics);
            ChartPoint {
                kind,
                risk,
                ret: metrics.expected_return,
                sharpe: sharpe(metrics.expected_return, risk, risk_free_rate),
            }
        };
        let from_point = |point: &FrontierPoint, kind: ChartPointKind| ChartPoint {
            kind,
            risk: point.risk,
            ret: point.ret,
            sharpe: point.sharpe,
        };

        let mut dataset: Vec<ChartPoint> = self
            .points
            .iter()
            .map(|p| from_point(p, ChartPointKind::Simulated))
            .collect();
        dataset.push(marker(optimized, ChartPointKind::Optimized));
        dataset.push(marker(original, ChartPointKind::Original));
        if let Some(p) = &self.max_sharpe {
            dataset.push(from_point(p, ChartPointKind::MaxSharpe));
        }
        if let Some(p) = &self.min_risk {
            dataset.push(from_point(p, ChartPointKind::MinRisk));
        }
        dataset
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub enum ChartPointKind {
    Simulated,
    Optimized,
    Original,
    MaxSharpe,
    MinRisk,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ChartPoint {
    pub kind: ChartPointKind,
    pub risk: f64,
    #[serde(rename = "return")]
    pub ret: f64,
    pub sharpe: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SimulatedFrontiers {
    pub volatility: Frontier,
    pub cvar: Frontier,
    pub samples_drawn: usize,
    /// Seed of the sampling stream, recorded so the cloud can be reproduced.
    pub seed: u64,
}

pub fn simulate_frontiers(
    risk_model: &RiskModel,
    returns: &ReturnMatrix,
    config: &FrontierConfig,
) -> Result<SimulatedFrontiers, StatisticsError> {
    let n = risk_model.number_of_assets();
    if n != returns.number_of_assets() {
        return Err(StatisticsError::Computation(format!(
            "Risk model has {n} assets but the return matrix has {}.",
            returns.number_of_assets()
        )));
    }

    let seed = config.seed.unwrap_or_else(|| OsRng.next_u64());
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    let cvar_model = CvarModel::new(
        config.cvar_estimator,
        config.cvar_alpha,
        returns.number_of_periods(),
        config.bootstrap_simulations,
        seed,
    );

    // Draws stay sequential so the cloud depends only on the seed.
    let weights: Vec<Vec<f64>> = (0..config.samples)
        .map(|_| config.sampling_scheme.sample_weights(n, &mut rng))
        .collect();

    let samples: Vec<(Vec<f64>, PortfolioMetrics)> = weights
        .into_par_iter()
        .map(|w| {
            let metrics = evaluate_weights(
                &w,
                risk_model,
                returns,
                &cvar_model,
                config.risk_free_rate,
            );
            (w, metrics)
        })
        .collect();

    debug!(samples = samples.len(), seed, "simulated reference frontiers");

    Ok(SimulatedFrontiers {
        volatility: Frontier::from_samples(&samples, FrontierRiskMeasure::Volatility, config),
        cvar: Frontier::from_samples(&samples, FrontierRiskMeasure::Cvar, config),
        samples_drawn: samples.len(),
        seed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn fixture() -> (RiskModel, ReturnMatrix) {
        let rows: Vec<Vec<f64>> = (0..60)
            .map(|t| {
                let t = t as f64;
                vec![
                    0.001 + 0.02 * (t * 0.7).sin(),
                    0.0005 + 0.01 * (t * 1.3).cos(),
                    0.0008 + 0.015 * (t * 0.4).sin(),
                ]
            })
            .collect();
        let returns = ReturnMatrix::from_rows(&rows).unwrap();
        let model = RiskModel::from_returns(&returns, 252.).unwrap();
        (model, returns)
    }

    fn config(samples: usize, cloud_cap: usize) -> FrontierConfig {
        FrontierConfig {
            samples,
            cloud_cap,
            seed: Some(11),
            ..FrontierConfig::default()
        }
    }

    #[test]
    fn test_cloud_is_capped_but_extremes_use_every_sample() {
        let (model, returns) = fixture();
        let frontiers = simulate_frontiers(&model, &returns, &config(500, 50)).unwrap();

        assert_eq!(frontiers.samples_drawn, 500);
        assert_eq!(frontiers.volatility.points.len(), 50);
        assert_eq!(frontiers.cvar.points.len(), 50);

        let min_risk = frontiers.volatility.min_risk.as_ref().unwrap();
        assert!(frontiers.volatility.points.iter().all(|p| p.risk >= min_risk.risk));
        let max_sharpe = frontiers.cvar.max_sharpe.as_ref().unwrap();
        assert!(frontiers.cvar.points.iter().all(|p| p.sharpe <= max_sharpe.sharpe));
    }

    #[test]
    fn test_points_are_feasible_and_consistent() {
        let (model, returns) = fixture();
        let frontiers = simulate_frontiers(&model, &returns, &config(100, 100)).unwrap();
        for (vol, cvar) in frontiers.volatility.points.iter().zip(frontiers.cvar.points.iter()) {
            assert!((vol.weights.iter().sum::<f64>() - 1.).abs() < 1e-9);
            assert_eq!(vol.weights, cvar.weights);
            assert_relative_eq!(vol.ret, cvar.ret);
            assert_relative_eq!(vol.risk, model.portfolio_volatility(&vol.weights), epsilon = 1e-12);
        }
    }

    #[test]
    fn test_same_seed_reproduces_the_cloud() {
        let (model, returns) = fixture();
        let a = simulate_frontiers(&model, &returns, &config(200, 200)).unwrap();
        let b = simulate_frontiers(&model, &returns, &config(200, 200)).unwrap();
        assert_eq!(a.seed, 11);
        assert_eq!(a.volatility.points, b.volatility.points);
        assert_eq!(a.cvar.max_sharpe, b.cvar.max_sharpe);
    }

    #[test]
    fn test_zero_samples_yield_empty_frontiers() {
        let (model, returns) = fixture();
        let frontiers = simulate_frontiers(&model, &returns, &config(0, 10)).unwrap();
        assert!(frontiers.volatility.points.is_empty());
        assert!(frontiers.volatility.max_sharpe.is_none());
        assert!(frontiers.cvar.min_risk.is_none());
    }

    #[test]
    fn test_chart_dataset_carries_all_markers() {
        let (model, returns) = fixture();
        let frontiers = simulate_frontiers(&model, &returns, &config(30, 10)).unwrap();
        let cvar_model = CvarModel::historical(0.95);
        let optimized = evaluate_weights(&[0.5, 0.3, 0.2], &model, &returns, &cvar_model, 0.);
        let original = evaluate_weights(&[1. / 3.; 3], &model, &returns, &cvar_model, 0.);

        let chart = frontiers.cvar.chart_dataset(&optimized, &original, 0.);
        assert_eq!(chart.len(), 10 + 4);
        let optimized_point = chart
            .iter()
            .find(|p| p.kind == ChartPointKind::Optimized)
            .unwrap();
        assert_eq!(optimized_point.risk, optimized.cvar);
    }

    #[test]
    fn test_mismatched_inputs_are_rejected() {
        let (model, _) = fixture();
        let other = ReturnMatrix::from_rows(&[vec![0.1, 0.2], vec![0.0, 0.1], vec![0.1, 0.0]]).unwrap();
        assert!(matches!(
            simulate_frontiers(&model, &other, &config(10, 10)),
            Err(StatisticsError::Computation(_))
        ));
    }
}
