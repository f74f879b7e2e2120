use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::portfolio::{PortfolioSnapshot, PortfolioStore, StoreError};
use crate::tickers::{tickers_match, MarketSuffixes};

/// Largest single weight accepted, in percent.
const MAX_WEIGHT_PERCENT: f64 = 100. + 1e-6;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApplicationError {
    #[error("No optimized ticker matched an asset of the portfolio ({skipped} skipped)")]
    NoAssetsUpdated { skipped: usize },
    #[error("Invalid weight {weight} for `{ticker}`")]
    InvalidWeight { ticker: String, weight: f64 },
    #[error("Portfolio {0} does not exist")]
    PortfolioNotFound(u64),
    #[error("Portfolio store failure: {0}")]
    Store(String),
}

/// One optimizer output entry. `weight` is in percent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TickerWeight {
    pub ticker: String,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlannedUpdate {
    pub asset_id: u64,
    /// Ticker as the portfolio stores it.
    pub ticker: String,
    pub previous_weight: f64,
    pub weight: f64,
}

/// Matched and normalized updates, before anything is written.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightPlan {
    pub updates: Vec<PlannedUpdate>,
    pub skipped_tickers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AssetUpdateFailure {
    pub ticker: String,
    pub asset_id: u64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationReport {
    pub portfolio_id: u64,
    pub updated_count: usize,
    pub skipped: usize,
    pub skipped_tickers: Vec<String>,
    pub updated: Vec<PlannedUpdate>,
    pub failures: Vec<AssetUpdateFailure>,
}

/// Validates optimizer output and maps it onto the portfolio's assets.
///
/// Every weight must be finite, non-negative and at most 100 or the whole
/// call is rejected. Optimizer tickers naming the same asset are merged.
/// Matched weights are rescaled to sum to 100; unmatched tickers are skipped.
pub fn plan_weight_updates(
    portfolio: &PortfolioSnapshot,
    optimized: &[TickerWeight],
    suffixes: &MarketSuffixes,
) -> Result<WeightPlan, ApplicationError> {
    if let Some(bad) = optimized
        .iter()
        .find(|tw| !tw.weight.is_finite() || tw.weight < 0. || tw.weight > MAX_WEIGHT_PERCENT)
    {
        return Err(ApplicationError::InvalidWeight {
            ticker: bad.ticker.clone(),
            weight: bad.weight,
        });
    }

    // (asset index, raw weight) in portfolio order
    let mut matched: Vec<(usize, f64)> = Vec::new();
    let mut skipped_tickers = Vec::new();
    for entry in optimized.iter() {
        match portfolio
            .assets
            .iter()
            .position(|asset| tickers_match(&asset.ticker, &entry.ticker, suffixes))
        {
            Some(idx) => match matched.iter_mut().find(|(i, _)| *i == idx) {
                Some((_, weight)) => *weight += entry.weight,
                None => matched.push((idx, entry.weight)),
            },
            None => skipped_tickers.push(entry.ticker.clone()),
        }
    }

    if matched.is_empty() {
        return Err(ApplicationError::NoAssetsUpdated {
            skipped: skipped_tickers.len(),
        });
    }
    matched.sort_by_key(|(idx, _)| *idx);

    let total: f64 = matched.iter().map(|(_, w)| w).sum();
    if total <= 0. {
        let (idx, weight) = matched[0];
        return Err(ApplicationError::InvalidWeight {
            ticker: portfolio.assets[idx].ticker.clone(),
            weight,
        });
    }

    let updates = matched
        .into_iter()
        .map(|(idx, weight)| {
            let asset = &portfolio.assets[idx];
            PlannedUpdate {
                asset_id: asset.asset_id,
                ticker: asset.ticker.clone(),
                previous_weight: asset.weight,
                weight: weight / total * 100.,
            }
        })
        .collect();

    Ok(WeightPlan {
        updates,
        skipped_tickers,
    })
}

/// Writes optimized weights back to the store, one asset at a time.
///
/// Decreases are written before increases so a re-allocation never has to
/// pass through a state above 100%. A failed write is recorded and the batch
/// continues; nothing is rolled back.
pub async fn apply_optimized_weights(
    store: &dyn PortfolioStore,
    portfolio_id: u64,
    optimized: &[TickerWeight],
    suffixes: &MarketSuffixes,
) -> Result<ApplicationReport, ApplicationError> {
    let portfolio = store
        .get_portfolio(portfolio_id)
        .await
        .map_err(|e| match e {
            StoreError::PortfolioNotFound(id) => ApplicationError::PortfolioNotFound(id),
            other => ApplicationError::Store(other.to_string()),
        })?;

    let plan = plan_weight_updates(&portfolio, optimized, suffixes)?;
    let mut ordered: Vec<&PlannedUpdate> = plan.updates.iter().collect();
    ordered.sort_by_key(|u| u.weight > u.previous_weight);

    let mut updated = Vec::new();
    let mut failures = Vec::new();
    for update in ordered {
        match store
            .update_asset_weight(portfolio_id, update.asset_id, update.weight)
            .await
        {
            Ok(()) => updated.push(update.clone()),
            Err(e) => {
                warn!(portfolio_id, ticker = %update.ticker, error = %e, "asset weight update failed");
                failures.push(AssetUpdateFailure {
                    ticker: update.ticker.clone(),
                    asset_id: update.asset_id,
                    reason: e.to_string(),
                });
            }
        }
    }

    info!(
        portfolio_id,
        updated = updated.len(),
        failed = failures.len(),
        skipped = plan.skipped_tickers.len(),
        "applied optimized weights"
    );

    Ok(ApplicationReport {
        portfolio_id,
        updated_count: updated.len(),
        skipped: plan.skipped_tickers.len(),
        skipped_tickers: plan.skipped_tickers,
        updated,
        failures,
    })
}

/// Lets callers holding a concrete store apply weights without boxing it.
#[async_trait]
pub trait ApplyOptimizedWeights {
    async fn apply_optimized_weights(
        &self,
        portfolio_id: u64,
        optimized: &[TickerWeight],
        suffixes: &MarketSuffixes,
    ) -> Result<ApplicationReport, ApplicationError>;
}

#[async_trait]
impl<S: PortfolioStore> ApplyOptimizedWeights for S {
    async fn apply_optimized_weights(
        &self,
        portfolio_id: u64,
        optimized: &[TickerWeight],
        suffixes: &MarketSuffixes,
    ) -> Result<ApplicationReport, ApplicationError> {
        apply_optimized_weights(self, portfolio_id, optimized, suffixes).await
    }
}
