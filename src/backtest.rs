//! Out-of-sample replay of the original and optimized allocations over the
//! most recent price days, which the optimizer never sees.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use utoipa::ToSchema;

use crate::analytics::{performance_series, PerformancePoint};
use crate::consts::TRADING_DAYS_PER_YEAR;
use crate::market_data::PriceMatrix;
use crate::statistics::{historical_cvar, sharpe, ReturnMatrix, StatisticsError};

/// Realized figures of one allocation over the projection window. Decimals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BacktestMetrics {
    /// Mean daily log return times 252.
    pub annualized_return: f64,
    /// `exp(Σ r) - 1` over the window.
    pub cumulative_return: f64,
    /// Historical CVaR of the window's daily returns, annualized.
    pub cvar: f64,
    /// Against the sample volatility of the window.
    pub sharpe: f64,
}

impl BacktestMetrics {
    fn from_daily(daily: &[f64], cvar_alpha: f64, risk_free_rate: f64) -> Self {
        let annualized_return = daily.iter().mean() * TRADING_DAYS_PER_YEAR;
        let volatility = daily.iter().std_dev() * TRADING_DAYS_PER_YEAR.sqrt();
        BacktestMetrics {
            annualized_return,
            cumulative_return: daily.iter().sum::<f64>().exp_m1(),
            cvar: historical_cvar(daily, cvar_alpha),
            sharpe: sharpe(annualized_return, volatility, risk_free_rate),
        }
    }
}

/// Optimized minus original, field by field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BacktestDelta {
    pub return_delta: f64,
    pub cumulative_return_delta: f64,
    pub risk_delta: f64,
    pub sharpe_delta: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BacktestReport {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// Number of daily returns replayed (price days minus one).
    pub period_days: usize,
    pub original: BacktestMetrics,
    pub optimized: BacktestMetrics,
    pub improvement: BacktestDelta,
    /// Cumulative return in percent, starting at 0 on `startDate`.
    pub series: Vec<PerformancePoint>,
}

/// Replays both allocations over `window`. Only rows of `window` are read,
/// so handing it the held-out tail keeps the figures out of sample.
pub fn run_backtest(
    window: &PriceMatrix,
    original_weights: &[f64],
    optimized_weights: &[f64],
    cvar_alpha: f64,
    risk_free_rate: f64,
) -> Result<BacktestReport, StatisticsError> {
    let (Some(&start_date), Some(&end_date)) = (window.dates.first(), window.dates.last()) else {
        return Err(StatisticsError::InsufficientData(
            "The projection window holds no price days.".into(),
        ));
    };
    let returns = ReturnMatrix::from_prices(&window.prices);
    if returns.number_of_periods() == 0 {
        return Err(StatisticsError::InsufficientData(
            "The projection window needs at least 2 price days.".into(),
        ));
    }

    let original = BacktestMetrics::from_daily(
        &returns.portfolio_daily_returns(original_weights),
        cvar_alpha,
        risk_free_rate,
    );
    let optimized = BacktestMetrics::from_daily(
        &returns.portfolio_daily_returns(optimized_weights),
        cvar_alpha,
        risk_free_rate,
    );

    Ok(BacktestReport {
        start_date,
        end_date,
        period_days: returns.number_of_periods(),
        improvement: BacktestDelta {
            return_delta: optimized.annualized_return - original.annualized_return,
            cumulative_return_delta: optimized.cumulative_return - original.cumulative_return,
            risk_delta: optimized.cvar - original.cvar,
            sharpe_delta: optimized.sharpe - original.sharpe,
        },
        original,
        optimized,
        series: performance_series(&window.dates, &returns, original_weights, optimized_weights),
    })
}
