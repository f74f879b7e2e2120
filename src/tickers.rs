//! Ticker matching between optimizer output and portfolio records.
//!
//! Portfolios store tickers the way users typed them (`petr4`, `PETR4.SA`),
//! while the market-data side works with exchange-qualified symbols. Two
//! tickers name the same asset when they are equal after trimming,
//! upper-casing, and stripping one known market suffix from each side.

use serde::{Deserialize, Serialize};

/// Known exchange suffixes, stored upper-case with their leading dot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketSuffixes(Vec<String>);

impl MarketSuffixes {
    pub fn new<I, S>(suffixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        MarketSuffixes(
            suffixes
                .into_iter()
                .map(|s| s.as_ref().trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .map(|s| if s.starts_with('.') { s } else { format!(".{s}") })
                .collect(),
        )
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl Default for MarketSuffixes {
    fn default() -> Self {
        MarketSuffixes::new([".SA", ".US"])
    }
}

/// Upper-cased, trimmed ticker with a known market suffix removed.
pub fn canonical_ticker(ticker: &str, suffixes: &MarketSuffixes) -> String {
    let upper = ticker.trim().to_uppercase();
    for suffix in suffixes.iter() {
        if let Some(stripped) = upper.strip_suffix(suffix) {
            if !stripped.is_empty() {
                return stripped.to_string();
            }
        }
    }
    upper
}

pub fn tickers_match(a: &str, b: &str, suffixes: &MarketSuffixes) -> bool {
    let a = canonical_ticker(a, suffixes);
    !a.is_empty() && a == canonical_ticker(b, suffixes)
}
