use std::sync::Arc;

use nalgebra::{DMatrix, DVector};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use thiserror::Error;
use utoipa::ToSchema;

use crate::consts::{FLOAT_COMPARISON_EPSILON, QUANTILE_INDEX_TOLERANCE, TRADING_DAYS_PER_YEAR};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StatisticsError {
    #[error("Insufficient data: {0}")]
    InsufficientData(String),
    #[error("Numerical failure: {0}")]
    Computation(String),
}

/// Daily log-returns, one row per day pair and one column per asset.
/// Always one row shorter than the price matrix it was derived from.
#[derive(Debug, Clone)]
pub struct ReturnMatrix {
    returns: DMatrix<f64>,
}

impl ReturnMatrix {
    pub fn from_prices(prices: &DMatrix<f64>) -> Self {
        log_returns(prices)
    }

    /// Builds a return matrix from already computed daily returns (row = day).
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self, StatisticsError> {
        let number_of_assets = rows.first().map(Vec::len).unwrap_or(0);
        if rows.iter().any(|row| row.len() != number_of_assets) {
            return Err(StatisticsError::InsufficientData(
                "Return rows must all have the same number of assets.".into(),
            ));
        }
        Ok(ReturnMatrix {
            returns: DMatrix::from_fn(rows.len(), number_of_assets, |i, j| rows[i][j]),
        })
    }

    pub fn number_of_periods(&self) -> usize {
        self.returns.nrows()
    }

    pub fn number_of_assets(&self) -> usize {
        self.returns.ncols()
    }

    pub fn as_matrix(&self) -> &DMatrix<f64> {
        &self.returns
    }

    pub fn asset_returns(&self, asset: usize) -> Vec<f64> {
        self.returns.column(asset).iter().copied().collect()
    }

    /// `Σ wᵢ·rᵢ,ₜ` for every day `t`.
    pub fn portfolio_daily_returns(&self, weights: &[f64]) -> Vec<f64> {
        debug_assert_eq!(weights.len(), self.number_of_assets());
        let weights = DVector::from_column_slice(weights);
        (&self.returns * weights).iter().copied().collect()
    }
}

/// `ln(p_t / p_{t-1})` per asset and day pair.
///
/// A pair with a missing, zero, negative or non-finite price contributes a
/// return of exactly `0.0` instead of failing. Sparse histories from the price
/// provider are common and a flat day is the least surprising reading of a gap.
pub fn log_returns(prices: &DMatrix<f64>) -> ReturnMatrix {
    let rows = prices.nrows().saturating_sub(1);
    let returns = DMatrix::from_fn(rows, prices.ncols(), |t, asset| {
        let previous = prices[(t, asset)];
        let current = prices[(t + 1, asset)];
        let usable = |p: f64| p.is_finite() && p > 0.;
        if usable(previous) && usable(current) {
            (current / previous).ln()
        } else {
            0.
        }
    });
    ReturnMatrix { returns }
}

/// Arithmetic mean of each asset's daily returns, scaled by `trading_days`.
pub fn annualized_mean(returns: &ReturnMatrix, trading_days: f64) -> DVector<f64> {
    let matrix = returns.as_matrix();
    DVector::from_iterator(
        matrix.ncols(),
        matrix.column_iter().map(|column| {
            if column.is_empty() {
                0.
            } else {
                column.iter().mean() * trading_days
            }
        }),
    )
}

/// Bessel-corrected sample covariance scaled by `trading_days`.
/// The result is explicitly symmetrized.
pub fn covariance(returns: &ReturnMatrix, trading_days: f64) -> Result<DMatrix<f64>, StatisticsError> {
    let matrix = returns.as_matrix();
    let periods = matrix.nrows();
    if periods < 2 {
        return Err(StatisticsError::InsufficientData(format!(
            "Covariance needs at least 2 return observations, got {periods}."
        )));
    }

    let means = annualized_mean(returns, 1.);
    let mut centered = matrix.clone();
    for j in 0..centered.ncols() {
        for i in 0..periods {
            centered[(i, j)] -= means[j];
        }
    }

    let raw = (centered.transpose() * &centered) * (trading_days / (periods as f64 - 1.));
    let symmetric = (&raw + raw.transpose()) * 0.5;

    if symmetric.iter().any(|v| !v.is_finite()) {
        return Err(StatisticsError::Computation(
            "Covariance matrix contains non-finite entries.".into(),
        ));
    }
    Ok(symmetric)
}

pub fn portfolio_return(weights: &[f64], mean_returns: &DVector<f64>) -> f64 {
    weights
        .iter()
        .zip(mean_returns.iter())
        .map(|(w, mu)| w * mu)
        .sum()
}

/// `sqrt(max(0, wᵀΣw))`; the clamp absorbs tiny negative variances produced
/// by rounding on near-singular matrices.
pub fn portfolio_risk(weights: &[f64], covariance: &DMatrix<f64>) -> f64 {
    debug_assert_eq!(weights.len(), covariance.nrows());
    let w = DVector::from_column_slice(weights);
    let variance = w.dot(&(covariance * &w));
    variance.max(0.).sqrt()
}

/// Empirical VaR threshold: the `floor((1 - alpha)·N)`-th order statistic of
/// the finite daily returns, ascending. `None` for an empty sample.
pub fn var_threshold(daily_returns: &[f64], alpha: f64) -> Option<f64> {
    let mut sorted: Vec<f64> = daily_returns
        .iter()
        .copied()
        .filter(|r| r.is_finite())
        .collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(|a, b| a.total_cmp(b));
    let index = tail_index(alpha, sorted.len());
    Some(sorted[index])
}

/// `floor((1 - alpha)·n)` clamped to the last index, tolerant of the
/// representation error in `1 - alpha`.
pub(crate) fn tail_index(alpha: f64, n: usize) -> usize {
    let raw = ((1. - alpha) * n as f64 + QUANTILE_INDEX_TOLERANCE).floor();
    (raw.max(0.) as usize).min(n.saturating_sub(1))
}

/// Mean of the daily returns at or below the VaR threshold, as a positive
/// loss. Returns `0.0` for an empty tail.
pub fn historical_cvar_daily(daily_returns: &[f64], alpha: f64) -> f64 {
    let Some(threshold) = var_threshold(daily_returns, alpha) else {
        return 0.;
    };
    let tail: Vec<f64> = daily_returns
        .iter()
        .copied()
        .filter(|r| r.is_finite() && *r <= threshold)
        .collect();
    if tail.is_empty() {
        return 0.;
    }
    (tail.iter().sum::<f64>() / tail.len() as f64).abs()
}

/// Daily historical CVaR annualized by `sqrt(252)`.
pub fn historical_cvar(daily_returns: &[f64], alpha: f64) -> f64 {
    historical_cvar_daily(daily_returns, alpha) * TRADING_DAYS_PER_YEAR.sqrt()
}

/// How the annual CVaR figure is estimated from a portfolio's daily returns.
#[derive(Copy, Clone, Serialize, Deserialize, Debug, Default, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub enum CvarEstimator {
    /// Daily historical CVaR scaled by `sqrt(252)`.
    #[default]
    Historical,
    /// CVaR of simulated one-year compounded returns, each year built from
    /// trading days resampled with replacement.
    Bootstrap,
}

/// Day indices of every simulated year, drawn once per run so that every
/// portfolio is scored against the same scenarios.
#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapPlan {
    periods: usize,
    horizon: usize,
    draws: Vec<usize>,
}

impl BootstrapPlan {
    pub fn new(periods: usize, simulations: usize, horizon: usize, seed: u64) -> Self {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        // Separate from the stream that drives sampling and evolution.
        rng.set_stream(1);
        let draws = if periods == 0 || horizon == 0 {
            Vec::new()
        } else {
            (0..simulations * horizon)
                .map(|_| rng.gen_range(0..periods))
                .collect()
        };
        BootstrapPlan {
            periods,
            horizon,
            draws,
        }
    }

    pub fn simulations(&self) -> usize {
        if self.horizon == 0 {
            0
        } else {
            self.draws.len() / self.horizon
        }
    }

    /// Compounded return `exp(Σ r) - 1` of every simulated year.
    pub fn annual_returns(&self, daily_log_returns: &[f64]) -> Vec<f64> {
        debug_assert_eq!(daily_log_returns.len(), self.periods);
        if self.draws.is_empty() {
            return vec![];
        }
        self.draws
            .chunks(self.horizon)
            .map(|year| {
                year.iter()
                    .map(|&day| daily_log_returns.get(day).copied().unwrap_or(0.))
                    .sum::<f64>()
                    .exp_m1()
            })
            .collect()
    }

    /// Mean loss of the worst `floor((1 - alpha)·S)`-ranked simulated years.
    /// Negative when even the tail years gain.
    pub fn annual_cvar(&self, daily_log_returns: &[f64], alpha: f64) -> f64 {
        let annual = self.annual_returns(daily_log_returns);
        let Some(threshold) = var_threshold(&annual, alpha) else {
            return 0.;
        };
        let tail: Vec<f64> = annual.into_iter().filter(|r| *r <= threshold).collect();
        if tail.is_empty() {
            return 0.;
        }
        -(tail.iter().sum::<f64>() / tail.len() as f64)
    }
}

/// CVaR estimator bound to its confidence level and, for the bootstrap, to
/// the scenarios of the current run.
#[derive(Debug, Clone, PartialEq)]
pub enum CvarModel {
    Historical { alpha: f64 },
    Bootstrap { alpha: f64, plan: Arc<BootstrapPlan> },
}

impl CvarModel {
    pub fn historical(alpha: f64) -> Self {
        CvarModel::Historical { alpha }
    }

    pub fn new(
        estimator: CvarEstimator,
        alpha: f64,
        periods: usize,
        simulations: usize,
        seed: u64,
    ) -> Self {
        match estimator {
            CvarEstimator::Historical => CvarModel::Historical { alpha },
            CvarEstimator::Bootstrap => CvarModel::Bootstrap {
                alpha,
                plan: Arc::new(BootstrapPlan::new(
                    periods,
                    simulations,
                    TRADING_DAYS_PER_YEAR as usize,
                    seed,
                )),
            },
        }
    }

    pub fn alpha(&self) -> f64 {
        match self {
            CvarModel::Historical { alpha } | CvarModel::Bootstrap { alpha, .. } => *alpha,
        }
    }

    pub fn annual_cvar(&self, daily_log_returns: &[f64]) -> f64 {
        match self {
            CvarModel::Historical { alpha } => historical_cvar(daily_log_returns, *alpha),
            CvarModel::Bootstrap { alpha, plan } => plan.annual_cvar(daily_log_returns, *alpha),
        }
    }
}

/// Excess return per unit of risk; `0.0` whenever risk is zero or the ratio
/// would not be finite.
pub fn sharpe(portfolio_return: f64, risk: f64, risk_free_rate: f64) -> f64 {
    if !risk.is_finite() || risk.abs() < FLOAT_COMPARISON_EPSILON {
        return 0.;
    }
    let ratio = (portfolio_return - risk_free_rate) / risk;
    if ratio.is_finite() {
        ratio
    } else {
        0.
    }
}

/// Annualized mean-return vector and covariance matrix for one optimization run.
#[derive(Debug, Clone)]
pub struct RiskModel {
    mean_returns: DVector<f64>,
    covariance: DMatrix<f64>,
}

impl RiskModel {
    pub fn new(mean_returns: DVector<f64>, covariance: DMatrix<f64>) -> Result<Self, StatisticsError> {
        let n = mean_returns.len();
        if covariance.nrows() != n || covariance.ncols() != n {
            return Err(StatisticsError::Computation(format!(
                "Covariance is {}x{} but there are {n} mean returns.",
                covariance.nrows(),
                covariance.ncols()
            )));
        }
        if mean_returns.iter().chain(covariance.iter()).any(|v| !v.is_finite()) {
            return Err(StatisticsError::Computation(
                "Risk model contains non-finite values.".into(),
            ));
        }
        let scale = covariance.amax().max(1.);
        if (&covariance - covariance.transpose()).amax() > 1e-9 * scale {
            return Err(StatisticsError::Computation(
                "Covariance matrix is not symmetric.".into(),
            ));
        }
        Ok(RiskModel {
            mean_returns,
            covariance,
        })
    }

    /// Fails before any work when fewer than 2 assets are given, or when
    /// there are fewer than `assets + 1` return observations.
    pub fn from_returns(returns: &ReturnMatrix, trading_days: f64) -> Result<Self, StatisticsError> {
        let assets = returns.number_of_assets();
        let periods = returns.number_of_periods();
        if assets < 2 {
            return Err(StatisticsError::InsufficientData(format!(
                "At least 2 assets are required, got {assets}."
            )));
        }
        if periods < assets + 1 {
            return Err(StatisticsError::InsufficientData(format!(
                "{periods} return observations cannot support a covariance over {assets} assets (need at least {}).",
                assets + 1
            )));
        }
        RiskModel::new(
            annualized_mean(returns, trading_days),
            covariance(returns, trading_days)?,
        )
    }

    pub fn number_of_assets(&self) -> usize {
        self.mean_returns.len()
    }

    pub fn mean_returns(&self) -> &DVector<f64> {
        &self.mean_returns
    }

    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }

    pub fn portfolio_return(&self, weights: &[f64]) -> f64 {
        portfolio_return(weights, &self.mean_returns)
    }

    pub fn portfolio_volatility(&self, weights: &[f64]) -> f64 {
        portfolio_risk(weights, &self.covariance)
    }
}

/// Everything the optimizer and simulator know about one weight vector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioMetrics {
    pub expected_return: f64,
    pub volatility: f64,
    pub cvar: f64,
    pub sharpe: f64,
}

pub fn evaluate_weights(
    weights: &[f64],
    risk_model: &RiskModel,
    returns: &ReturnMatrix,
    cvar_model: &CvarModel,
    risk_free_rate: f64,
) -> PortfolioMetrics {
    let expected_return = risk_model.portfolio_return(weights);
    let volatility = risk_model.portfolio_volatility(weights);
    let cvar = cvar_model.annual_cvar(&returns.portfolio_daily_returns(weights));
    PortfolioMetrics {
        expected_return,
        volatility,
        cvar,
        sharpe: sharpe(expected_return, volatility, risk_free_rate),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn two_asset_model() -> RiskModel {
        RiskModel::new(
            DVector::from_vec(vec![0.10, 0.05]),
            DMatrix::from_row_slice(2, 2, &[0.04, 0., 0., 0.01]),
        )
        .unwrap()
    }

    #[test]
    fn test_log_returns_skip_missing_prices() {
        let prices = DMatrix::from_row_slice(4, 2, &[100., 50., 110., 0., 121., 55., 0., 60.]);
        let returns = log_returns(&prices);

        assert_eq!(returns.number_of_periods(), 3);
        assert_relative_eq!(returns.as_matrix()[(0, 0)], (1.1f64).ln(), epsilon = 1e-12);
        // 50 -> 0 and 0 -> 55 are no-return days
        assert_eq!(returns.as_matrix()[(0, 1)], 0.);
        assert_eq!(returns.as_matrix()[(1, 1)], 0.);
        assert_eq!(returns.as_matrix()[(2, 0)], 0.);
        assert!(returns.as_matrix().iter().all(|r| r.is_finite()));
    }

    #[test]
    fn test_log_returns_of_single_row_is_empty() {
        let prices = DMatrix::from_row_slice(1, 2, &[1., 2.]);
        assert_eq!(log_returns(&prices).number_of_periods(), 0);
    }

    #[test]
    fn test_annualized_mean_and_covariance() {
        let returns =
            ReturnMatrix::from_rows(&[vec![0.01, 0.02], vec![0.03, 0.00], vec![0.02, 0.01]]).unwrap();
        let mean = annualized_mean(&returns, 252.);
        assert_relative_eq!(mean[0], 0.02 * 252., epsilon = 1e-12);
        assert_relative_eq!(mean[1], 0.01 * 252., epsilon = 1e-12);

        let cov = covariance(&returns, 252.).unwrap();
        // var(a) = ((-.01)^2 + .01^2 + 0) / 2 = 1e-4
        assert_relative_eq!(cov[(0, 0)], 1e-4 * 252., epsilon = 1e-12);
        // cov(a, b) = ((-.01)(.01) + (.01)(-.01) + 0) / 2 = -1e-4
        assert_relative_eq!(cov[(0, 1)], -1e-4 * 252., epsilon = 1e-12);
        assert_eq!(cov[(0, 1)], cov[(1, 0)]);
    }

    #[test]
    fn test_two_asset_reference_portfolio() {
        let model = two_asset_model();
        assert_relative_eq!(model.portfolio_volatility(&[1., 0.]), 0.2, epsilon = 1e-12);
        assert_relative_eq!(model.portfolio_return(&[1., 0.]), 0.10, epsilon = 1e-12);
        // same inputs, same answer
        assert_eq!(
            model.portfolio_volatility(&[1., 0.]),
            model.portfolio_volatility(&[1., 0.])
        );
    }

    #[test]
    fn test_portfolio_risk_clamps_negative_variance() {
        let cov = DMatrix::from_row_slice(2, 2, &[-1e-18, 0., 0., -1e-18]);
        assert_eq!(portfolio_risk(&[0.5, 0.5], &cov), 0.);
    }

    #[test]
    fn test_cvar_of_constant_series_is_its_magnitude() {
        let series = vec![-0.013; 40];
        assert_relative_eq!(historical_cvar_daily(&series, 0.95), 0.013, epsilon = 1e-15);
        assert_relative_eq!(
            historical_cvar(&series, 0.95),
            0.013 * 252f64.sqrt(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_cvar_averages_the_tail() {
        // 20 observations, alpha .9 -> threshold is sorted[2]
        let mut series: Vec<f64> = (0..20).map(|i| i as f64 * 0.001).collect();
        series[0] = -0.05;
        series[1] = -0.04;
        series[2] = -0.03;
        let expected = (0.05 + 0.04 + 0.03) / 3.;
        assert_relative_eq!(historical_cvar_daily(&series, 0.9), expected, epsilon = 1e-12);
    }

    #[test]
    fn test_tail_index_survives_inexact_alpha() {
        // 1 - 0.9 is 0.09999999999999998 in f64
        for n in [10, 20, 30, 100, 250] {
            assert_eq!(tail_index(0.9, n), n / 10, "n = {n}");
        }
        assert_eq!(tail_index(0.95, 20), 1);
        assert_eq!(tail_index(0.95, 19), 0);
        assert_eq!(tail_index(0.0, 5), 4);
        assert_eq!(var_threshold(&[0.3, -0.1, 0.2, 0.0, -0.2, 0.1, 0.4, -0.3, 0.5, 0.6], 0.9), Some(-0.2));
    }

    #[test]
    fn test_cvar_of_empty_series_is_zero() {
        assert_eq!(historical_cvar(&[], 0.95), 0.);
        assert_eq!(historical_cvar(&[f64::NAN], 0.95), 0.);
    }

    #[test]
    fn test_sharpe_with_zero_risk_is_zero() {
        assert_eq!(sharpe(0.12, 0., 0.), 0.);
        assert_eq!(sharpe(0.12, f64::NAN, 0.), 0.);
        assert_relative_eq!(sharpe(0.12, 0.2, 0.02), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_risk_model_rejects_too_few_assets_or_observations() {
        let one_asset = ReturnMatrix::from_rows(&[vec![0.01], vec![0.02], vec![0.0]]).unwrap();
        assert!(matches!(
            RiskModel::from_returns(&one_asset, 252.),
            Err(StatisticsError::InsufficientData(_))
        ));

        let short = ReturnMatrix::from_rows(&[vec![0.01, 0.02, 0.03], vec![0.0, 0.01, 0.02]]).unwrap();
        assert!(matches!(
            RiskModel::from_returns(&short, 252.),
            Err(StatisticsError::InsufficientData(_))
        ));
    }

    #[test]
    fn test_risk_model_rejects_asymmetric_covariance() {
        let result = RiskModel::new(
            DVector::from_vec(vec![0.1, 0.1]),
            DMatrix::from_row_slice(2, 2, &[0.04, 0.01, 0.02, 0.01]),
        );
        assert!(matches!(result, Err(StatisticsError::Computation(_))));
    }

    #[test]
    fn test_ragged_rows_are_rejected() {
        assert!(ReturnMatrix::from_rows(&[vec![0.1, 0.2], vec![0.1]]).is_err());
    }

    #[test]
    fn test_evaluate_weights_uses_daily_series_for_cvar() {
        let returns = ReturnMatrix::from_rows(&[
            vec![0.01, -0.02],
            vec![-0.03, 0.01],
            vec![0.02, 0.00],
            vec![0.00, 0.01],
        ])
        .unwrap();
        let model = RiskModel::from_returns(&returns, 252.).unwrap();
        let weights = [0.5, 0.5];
        let metrics = evaluate_weights(&weights, &model, &returns, &CvarModel::historical(0.95), 0.);

        let daily = returns.portfolio_daily_returns(&weights);
        assert_relative_eq!(metrics.cvar, historical_cvar(&daily, 0.95), epsilon = 1e-15);
        assert_relative_eq!(
            metrics.sharpe,
            metrics.expected_return / metrics.volatility,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_bootstrap_plan_is_seeded() {
        let a = BootstrapPlan::new(30, 50, 252, 7);
        let b = BootstrapPlan::new(30, 50, 252, 7);
        let c = BootstrapPlan::new(30, 50, 252, 8);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.simulations(), 50);
        assert!(a.draws.iter().all(|&day| day < 30));
    }

    #[test]
    fn test_bootstrap_cvar_of_constant_series_compounds_a_year() {
        let daily = vec![-0.001; 40];
        let plan = BootstrapPlan::new(daily.len(), 100, 252, 3);
        let expected = -(-0.252f64).exp_m1();
        for annual in plan.annual_returns(&daily) {
            assert_relative_eq!(annual, -expected, epsilon = 1e-12);
        }
        assert_relative_eq!(plan.annual_cvar(&daily, 0.95), expected, epsilon = 1e-12);

        // Gains everywhere: the tail is still a gain, reported as a negative loss.
        let gains = vec![0.001; 40];
        assert!(plan.annual_cvar(&gains, 0.95) < 0.);
    }

    #[test]
    fn test_bootstrap_cvar_tracks_the_worse_portfolio() {
        let calm: Vec<f64> = (0..120).map(|t| if t % 2 == 0 { 0.003 } else { -0.003 }).collect();
        let wild: Vec<f64> = calm.iter().map(|r| r * 5.).collect();
        let model = CvarModel::new(CvarEstimator::Bootstrap, 0.95, 120, 400, 11);
        assert_eq!(model.alpha(), 0.95);
        assert!(model.annual_cvar(&wild) > model.annual_cvar(&calm));
    }

    #[test]
    fn test_empty_bootstrap_plan_scores_zero() {
        let plan = BootstrapPlan::new(0, 100, 252, 1);
        assert_eq!(plan.simulations(), 0);
        assert_eq!(plan.annual_cvar(&[], 0.95), 0.);
    }

    #[test]
    fn test_historical_model_matches_historical_cvar() {
        let daily = [0.01, -0.02, 0.005, -0.04, 0.0, 0.03];
        assert_eq!(
            CvarModel::historical(0.9).annual_cvar(&daily),
            historical_cvar(&daily, 0.9)
        );
    }
}
