//! Deterministic portfolios and price histories shared by the async tests.

use std::sync::Arc;

use chrono::{Duration, NaiveDate};

use crate::config::Dataset;
use crate::market_data::{InMemoryPriceSource, PricePoint, PriceSeries};
use crate::portfolio::{AssetRecord, InMemoryPortfolioStore, PortfolioSnapshot};
use crate::tickers::MarketSuffixes;

pub(crate) const TRADING_DAYS: usize = 160;

/// Prices following `exp(Σ drift + amplitude·sin(frequency·t + phase))`.
pub(crate) fn synthetic_series(
    ticker: &str,
    drift: f64,
    amplitude: f64,
    frequency: f64,
    phase: f64,
) -> PriceSeries {
    let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap_or_default();
    let mut log_price = 100f64.ln();
    let points = (0..TRADING_DAYS)
        .map(|t| {
            if t > 0 {
                log_price += drift + amplitude * (frequency * t as f64 + phase).sin();
            }
            PricePoint {
                date: start + Duration::days(t as i64),
                price: log_price.exp(),
            }
        })
        .collect();
    PriceSeries {
        ticker: ticker.into(),
        points,
    }
}

fn asset(asset_id: u64, ticker: &str, weight: f64, sector: Option<&str>) -> AssetRecord {
    AssetRecord {
        asset_id,
        ticker: ticker.into(),
        weight,
        sector: sector.map(str::to_string),
    }
}

pub(crate) fn demo_portfolio() -> PortfolioSnapshot {
    PortfolioSnapshot {
        id: 1,
        name: "Brazil core".into(),
        assets: vec![
            asset(10, "PETR4", 40., Some("Energy")),
            asset(11, "VALE3.SA", 35., Some("Materials")),
            asset(12, "itub4", 25., None),
        ],
    }
}

pub(crate) fn demo_dataset() -> Dataset {
    Dataset {
        portfolios: vec![
            demo_portfolio(),
            PortfolioSnapshot {
                id: 2,
                name: "Single name".into(),
                assets: vec![asset(20, "PETR4.SA", 100., Some("Energy"))],
            },
        ],
        prices: vec![
            synthetic_series("PETR4.SA", 0.0009, 0.021, 0.71, 0.3),
            synthetic_series("VALE3.SA", 0.0004, 0.015, 1.37, 1.1),
            synthetic_series("ITUB4.SA", 0.0002, 0.008, 0.23, 2.0),
        ],
    }
}

pub(crate) fn demo_collaborators() -> (Arc<InMemoryPriceSource>, Arc<InMemoryPortfolioStore>) {
    let (prices, store) = demo_dataset().into_collaborators(MarketSuffixes::default());
    (Arc::new(prices), Arc::new(store))
}
