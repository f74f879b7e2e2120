//! Report-side analytics computed once a run has a chosen allocation:
//! per-asset risk contribution, sector allocation and cumulative
//! performance of the original and optimized weights.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use itertools::izip;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::consts::{FLOAT_COMPARISON_EPSILON, OTHER_SECTOR, TRADING_DAYS_PER_YEAR};
use crate::statistics::{historical_cvar, var_threshold, ReturnMatrix, RiskModel};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RiskContribution {
    pub ticker: String,
    /// Percent.
    pub weight: f64,
    /// Share of the portfolio's CVaR carried by this asset, in percent.
    /// Shares sum to 100 whenever the portfolio has a non-zero tail loss.
    pub contribution_pct: f64,
    /// Annualized CVaR attributed to this asset (`w_i · marginal_cvar`).
    pub component_cvar: f64,
    /// Annualized mean loss of the asset on the portfolio's tail days.
    pub marginal_cvar: f64,
    /// The asset's own annualized historical CVaR.
    pub standalone_cvar: f64,
    /// `w_i (Σw)_i / wᵀΣw` in percent.
    pub volatility_contribution_pct: f64,
}

/// Euler decomposition of historical CVaR over the portfolio's tail days,
/// alongside the variance decomposition of volatility.
pub fn risk_contribution(
    tickers: &[String],
    weights: &[f64],
    returns: &ReturnMatrix,
    risk_model: &RiskModel,
    cvar_alpha: f64,
) -> Vec<RiskContribution> {
    let annualization = TRADING_DAYS_PER_YEAR.sqrt();
    let portfolio_daily = returns.portfolio_daily_returns(weights);

    let tail_days: Vec<usize> = match var_threshold(&portfolio_daily, cvar_alpha) {
        Some(threshold) => portfolio_daily
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_finite() && **r <= threshold)
            .map(|(t, _)| t)
            .collect(),
        None => vec![],
    };
    let tail_mean = |series: &[f64]| {
        if tail_days.is_empty() {
            0.
        } else {
            tail_days.iter().map(|&t| series[t]).sum::<f64>() / tail_days.len() as f64
        }
    };
    let portfolio_loss = -tail_mean(&portfolio_daily) * annualization;

    let w = DVector::from_column_slice(weights);
    let sigma_w = risk_model.covariance() * &w;
    let variance = w.dot(&sigma_w);

    izip!(tickers.iter(), weights.iter(), 0..weights.len())
        .map(|(ticker, &weight, asset)| {
            let asset_daily = returns.asset_returns(asset);
            let marginal_cvar = -tail_mean(&asset_daily) * annualization;
            let component_cvar = weight * marginal_cvar;
            let contribution_pct = if portfolio_loss.abs() > FLOAT_COMPARISON_EPSILON {
                component_cvar / portfolio_loss * 100.
            } else {
                0.
            };
            let volatility_contribution_pct = if variance > FLOAT_COMPARISON_EPSILON {
                weight * sigma_w[asset] / variance * 100.
            } else {
                0.
            };
            RiskContribution {
                ticker: ticker.clone(),
                weight: weight * 100.,
                contribution_pct,
                component_cvar,
                marginal_cvar,
                standalone_cvar: historical_cvar(&asset_daily, cvar_alpha),
                volatility_contribution_pct,
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SectorWeight {
    pub sector: String,
    /// Percent.
    pub weight: f64,
}

/// Sums weights (fractions in, percent out) per sector. Assets without a
/// sector are grouped under "Other". Largest sector first, ties by name.
pub fn sector_allocation(sectors: &[Option<String>], weights: &[f64]) -> Vec<SectorWeight> {
    let mut totals: BTreeMap<String, f64> = BTreeMap::new();
    for (sector, weight) in sectors.iter().zip(weights.iter()) {
        let name = sector
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(OTHER_SECTOR);
        *totals.entry(name.to_string()).or_insert(0.) += weight * 100.;
    }

    let mut allocation: Vec<SectorWeight> = totals
        .into_iter()
        .map(|(sector, weight)| SectorWeight { sector, weight })
        .collect();
    allocation.sort_by(|a, b| b.weight.total_cmp(&a.weight).then_with(|| a.sector.cmp(&b.sector)));
    allocation
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PerformancePoint {
    pub date: NaiveDate,
    /// Cumulative return in percent.
    pub original: f64,
    pub optimized: f64,
}

/// Cumulative return (`exp(Σ r_p) - 1`, percent) of both allocations over the
/// price window. `dates` is the price index, so the series starts at 0 on the
/// first date and has one point per return row after it.
pub fn performance_series(
    dates: &[NaiveDate],
    returns: &ReturnMatrix,
    original_weights: &[f64],
    optimized_weights: &[f64],
) -> Vec<PerformancePoint> {
    let Some(&start) = dates.first() else {
        return vec![];
    };
    let cumulative = |weights: &[f64]| -> Vec<f64> {
        returns
            .portfolio_daily_returns(weights)
            .iter()
            .scan(0., |log_sum, r| {
                *log_sum += r;
                Some((log_sum.exp() - 1.) * 100.)
            })
            .collect()
    };
    let original = cumulative(original_weights);
    let optimized = cumulative(optimized_weights);

    std::iter::once(PerformancePoint {
        date: start,
        original: 0.,
        optimized: 0.,
    })
    .chain(
        izip!(dates.iter().skip(1), original, optimized).map(|(&date, original, optimized)| {
            PerformancePoint {
                date,
                original,
                optimized,
            }
        }),
    )
    .collect()
}
