use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::NaiveDate;
use nalgebra::DMatrix;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::error::OptimizerError;
use crate::tickers::{tickers_match, MarketSuffixes};

#[derive(Error, Debug)]
pub enum MarketDataError {
    #[error("No price history available for `{0}`")]
    UnknownTicker(String),
    #[error("Price provider failure: {0}")]
    Provider(String),
}

impl From<MarketDataError> for OptimizerError {
    fn from(err: MarketDataError) -> Self {
        match err {
            MarketDataError::UnknownTicker(_) => OptimizerError::InsufficientData(err.to_string()),
            MarketDataError::Provider(msg) => OptimizerError::Collaborator(msg),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PricePoint {
    pub date: NaiveDate,
    pub price: f64,
}

/// Ordered (date, price) history of a single asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceSeries {
    pub ticker: String,
    pub points: Vec<PricePoint>,
}

/// Dense price matrix: one row per trading day, one column per asset.
///
/// Every column shares the `dates` index. Days on which an asset has no quote
/// hold `0.0`, which the statistics layer reads as a no-return day.
#[derive(Debug, Clone)]
pub struct PriceMatrix {
    pub tickers: Vec<String>,
    pub dates: Vec<NaiveDate>,
    pub prices: DMatrix<f64>,
}

impl PriceMatrix {
    /// Aligns independent series on the union of their dates.
    pub fn align(series: &[PriceSeries]) -> Self {
        let dates: Vec<NaiveDate> = series
            .iter()
            .flat_map(|s| s.points.iter().map(|p| p.date))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let row_of: HashMap<NaiveDate, usize> =
            dates.iter().enumerate().map(|(i, d)| (*d, i)).collect();

        let mut prices = DMatrix::<f64>::zeros(dates.len(), series.len());
        for (col, s) in series.iter().enumerate() {
            for point in s.points.iter() {
                if let Some(&row) = row_of.get(&point.date) {
                    prices[(row, col)] = point.price;
                }
            }
        }

        PriceMatrix {
            tickers: series.iter().map(|s| s.ticker.clone()).collect(),
            dates,
            prices,
        }
    }

    /// Keeps only the most recent `days` rows.
    pub fn tail(self, days: usize) -> Self {
        let total = self.dates.len();
        if days >= total {
            return self;
        }
        let start = total - days;
        PriceMatrix {
            tickers: self.tickers,
            dates: self.dates[start..].to_vec(),
            prices: self.prices.rows(start, days).into_owned(),
        }
    }

    /// Splits off the most recent `days` rows: `(history, recent)`.
    /// The two windows share no row.
    pub fn split_recent(self, days: usize) -> (Self, Self) {
        let total = self.dates.len();
        let cut = total.saturating_sub(days);
        let history = PriceMatrix {
            tickers: self.tickers.clone(),
            dates: self.dates[..cut].to_vec(),
            prices: self.prices.rows(0, cut).into_owned(),
        };
        let recent = PriceMatrix {
            tickers: self.tickers,
            dates: self.dates[cut..].to_vec(),
            prices: self.prices.rows(cut, total - cut).into_owned(),
        };
        (history, recent)
    }

    pub fn number_of_days(&self) -> usize {
        self.prices.nrows()
    }

    pub fn number_of_assets(&self) -> usize {
        self.prices.ncols()
    }
}

/// Market-data collaborator. Treated as a pure function of its arguments.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn historical_prices(
        &self,
        tickers: &[String],
        lookback_days: usize,
    ) -> Result<PriceMatrix, MarketDataError>;
}

/// Price source backed by series held in memory (datasets, tests).
///
/// Keys are ordered, so a ticker that only matches through suffix rules
/// resolves to the same stored series on every call.
#[derive(Debug, Default)]
pub struct InMemoryPriceSource {
    series: RwLock<BTreeMap<String, Vec<PricePoint>>>,
    suffixes: MarketSuffixes,
}

impl InMemoryPriceSource {
    pub fn new(suffixes: MarketSuffixes) -> Self {
        InMemoryPriceSource {
            series: RwLock::new(BTreeMap::new()),
            suffixes,
        }
    }

    pub fn insert(&self, ticker: &str, mut points: Vec<PricePoint>) {
        points.sort_by_key(|p| p.date);
        self.series.write().insert(ticker.trim().to_uppercase(), points);
    }

    /// Exact key first; otherwise the first stored ticker, in key order,
    /// that canonicalizes to the same asset.
    fn lookup(&self, ticker: &str) -> Option<Vec<PricePoint>> {
        let series = self.series.read();
        if let Some(points) = series.get(&ticker.trim().to_uppercase()) {
            return Some(points.clone());
        }
        let mut candidates = series
            .iter()
            .filter(|(known, _)| tickers_match(known, ticker, &self.suffixes));
        let (known, points) = candidates.next()?;
        let others = candidates.count();
        if others > 0 {
            debug!(ticker, resolved = %known, others, "ambiguous ticker resolved by key order");
        }
        Some(points.clone())
    }
}

#[async_trait]
impl PriceSource for InMemoryPriceSource {
    async fn historical_prices(
        &self,
        tickers: &[String],
        lookback_days: usize,
    ) -> Result<PriceMatrix, MarketDataError> {
        let mut series = Vec::with_capacity(tickers.len());
        for ticker in tickers {
            let points = self
                .lookup(ticker)
                .ok_or_else(|| MarketDataError::UnknownTicker(ticker.clone()))?;
            series.push(PriceSeries {
                ticker: ticker.clone(),
                points,
            });
        }
        let matrix = PriceMatrix::align(&series).tail(lookback_days);
        debug!(
            assets = matrix.number_of_assets(),
            days = matrix.number_of_days(),
            "aligned in-memory price matrix"
        );
        Ok(matrix)
    }
}
