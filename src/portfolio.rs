use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use utoipa::ToSchema;

use crate::sampling::normalize_or_uniform;

/// Percentage tolerance the store allows above a 100% total.
const TOTAL_WEIGHT_TOLERANCE: f64 = 1e-6;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Portfolio {0} does not exist")]
    PortfolioNotFound(u64),
    #[error("Asset {asset_id} is not part of portfolio {portfolio_id}")]
    AssetNotFound { portfolio_id: u64, asset_id: u64 },
    #[error("Update rejected: {0}")]
    Rejected(String),
    #[error("Store backend failure: {0}")]
    Backend(String),
}

/// One holding as the portfolio store reports it. `weight` is in percent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AssetRecord {
    pub asset_id: u64,
    pub ticker: String,
    pub weight: f64,
    #[serde(default)]
    pub sector: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioSnapshot {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    pub assets: Vec<AssetRecord>,
}

impl PortfolioSnapshot {
    pub fn tickers(&self) -> Vec<String> {
        self.assets.iter().map(|a| a.ticker.clone()).collect()
    }

    /// Current allocation as fractions summing to 1. Portfolios whose stored
    /// weights are all zero (or unusable) are read as equally weighted.
    pub fn current_weights(&self) -> Vec<f64> {
        normalize_or_uniform(
            self.assets
                .iter()
                .map(|a| if a.weight.is_finite() && a.weight > 0. { a.weight } else { 0. })
                .collect(),
        )
    }

    pub fn total_weight(&self) -> f64 {
        self.assets.iter().map(|a| a.weight).sum()
    }
}

/// Portfolio persistence collaborator.
#[async_trait]
pub trait PortfolioStore: Send + Sync {
    async fn get_portfolio(&self, portfolio_id: u64) -> Result<PortfolioSnapshot, StoreError>;

    /// Sets one asset's weight (percent). The store owns the weight-total rule
    /// and may reject the write.
    async fn update_asset_weight(
        &self,
        portfolio_id: u64,
        asset_id: u64,
        weight: f64,
    ) -> Result<(), StoreError>;
}

/// Store held in memory (datasets, tests). Enforces the same write-time rule
/// as the production store: the portfolio total may never exceed 100%.
#[derive(Debug, Default)]
pub struct InMemoryPortfolioStore {
    portfolios: RwLock<HashMap<u64, PortfolioSnapshot>>,
}

impl InMemoryPortfolioStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, portfolio: PortfolioSnapshot) {
        self.portfolios.write().insert(portfolio.id, portfolio);
    }

    pub fn len(&self) -> usize {
        self.portfolios.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl PortfolioStore for InMemoryPortfolioStore {
    async fn get_portfolio(&self, portfolio_id: u64) -> Result<PortfolioSnapshot, StoreError> {
        self.portfolios
            .read()
            .get(&portfolio_id)
            .cloned()
            .ok_or(StoreError::PortfolioNotFound(portfolio_id))
    }

    async fn update_asset_weight(
        &self,
        portfolio_id: u64,
        asset_id: u64,
        weight: f64,
    ) -> Result<(), StoreError> {
        if !weight.is_finite() || weight < 0. {
            return Err(StoreError::Rejected(format!("weight {weight} is not a valid percentage")));
        }

        let mut portfolios = self.portfolios.write();
        let portfolio = portfolios
            .get_mut(&portfolio_id)
            .ok_or(StoreError::PortfolioNotFound(portfolio_id))?;

        let others: f64 = portfolio
            .assets
            .iter()
            .filter(|a| a.asset_id != asset_id)
            .map(|a| a.weight)
            .sum();
        let asset = portfolio
            .assets
            .iter_mut()
            .find(|a| a.asset_id == asset_id)
            .ok_or(StoreError::AssetNotFound {
                portfolio_id,
                asset_id,
            })?;

        if others + weight > 100. + TOTAL_WEIGHT_TOLERANCE {
            return Err(StoreError::Rejected(format!(
                "total weight would be {:.2}% (over 100%)",
                others + weight
            )));
        }

        debug!(portfolio_id, asset_id, old = asset.weight, new = weight, "asset weight updated");
        asset.weight = weight;
        Ok(())
    }
}
