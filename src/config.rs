use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use crate::consts::{
    DEFAULT_BOOTSTRAP_SIMULATIONS, DEFAULT_CVAR_ALPHA, DEFAULT_FRONTIER_CLOUD_CAP,
    DEFAULT_FRONTIER_SAMPLES,
};
use crate::error::OptimizerError;
use crate::evolution::objective::RiskMeasure;
use crate::evolution::portfolio_evolution::{EvolutionError, StandardEvolutionConfig};
use crate::frontier::FrontierConfig;
use crate::market_data::{InMemoryPriceSource, PriceSeries};
use crate::portfolio::{InMemoryPortfolioStore, PortfolioSnapshot};
use crate::sampling::SamplingScheme;
use crate::statistics::CvarEstimator;
use crate::tickers::MarketSuffixes;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Environment variable `{key}` has invalid value `{value}`: {reason}")]
    InvalidEnv {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("Could not access dataset `{path}`: {source}")]
    DatasetIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Dataset is malformed: {0}")]
    DatasetFormat(#[from] serde_json::Error),
}

impl From<ConfigError> for OptimizerError {
    fn from(err: ConfigError) -> Self {
        OptimizerError::InvalidConfig(err.to_string())
    }
}

/// Process-level settings, read from the environment (a `.env` file is
/// loaded first by the binaries).
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub bind_address: String,
    /// How long a finished job stays pollable.
    pub job_ttl: Duration,
    /// Wall-clock budget applied when a request does not set its own.
    pub job_timeout: Option<Duration>,
    pub max_concurrent_jobs: usize,
    pub lookback_days: usize,
    pub market_suffixes: MarketSuffixes,
    pub dataset_path: Option<PathBuf>,
    pub frontier_samples: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            bind_address: "0.0.0.0:8080".into(),
            job_ttl: Duration::from_secs(600),
            job_timeout: None,
            max_concurrent_jobs: num_cpus::get(),
            lookback_days: 756,
            market_suffixes: MarketSuffixes::default(),
            dataset_path: None,
            frontier_samples: DEFAULT_FRONTIER_SAMPLES,
        }
    }
}

fn parse_var<T>(key: &'static str, raw: String) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|e| ConfigError::InvalidEnv {
        key,
        value: raw.clone(),
        reason: e.to_string(),
    })
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = ServiceConfig::default();

        if let Some(raw) = lookup("AEGIS_BIND_ADDRESS") {
            config.bind_address = raw.trim().to_string();
        }
        if let Some(raw) = lookup("AEGIS_JOB_TTL_SECS") {
            config.job_ttl = Duration::from_secs(parse_var("AEGIS_JOB_TTL_SECS", raw)?);
        }
        if let Some(raw) = lookup("AEGIS_JOB_TIMEOUT_SECS") {
            let secs: u64 = parse_var("AEGIS_JOB_TIMEOUT_SECS", raw)?;
            config.job_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(raw) = lookup("AEGIS_MAX_CONCURRENT_JOBS") {
            let jobs: usize = parse_var("AEGIS_MAX_CONCURRENT_JOBS", raw.clone())?;
            if jobs == 0 {
                return Err(ConfigError::InvalidEnv {
                    key: "AEGIS_MAX_CONCURRENT_JOBS",
                    value: raw,
                    reason: "at least one job must be allowed to run".into(),
                });
            }
            config.max_concurrent_jobs = jobs;
        }
        if let Some(raw) = lookup("AEGIS_LOOKBACK_DAYS") {
            config.lookback_days = parse_var("AEGIS_LOOKBACK_DAYS", raw)?;
        }
        if let Some(raw) = lookup("AEGIS_MARKET_SUFFIXES") {
            config.market_suffixes = MarketSuffixes::new(raw.split(','));
        }
        if let Some(raw) = lookup("AEGIS_DATASET") {
            let trimmed = raw.trim();
            config.dataset_path = (!trimmed.is_empty()).then(|| PathBuf::from(trimmed));
        }
        if let Some(raw) = lookup("AEGIS_FRONTIER_SAMPLES") {
            config.frontier_samples = parse_var("AEGIS_FRONTIER_SAMPLES", raw)?;
        }

        Ok(config)
    }
}

/// Body of a start-optimization call. Every field is optional on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct OptimizationRequest {
    pub population_size: usize,
    pub generations: usize,
    pub risk_weight: f64,
    pub cvar_alpha: f64,
    pub cvar_estimator: CvarEstimator,
    pub bootstrap_simulations: usize,
    pub risk_measure: RiskMeasure,
    /// CVaR share of the risk term when `riskMeasure` is `blend`.
    pub cvar_share: f64,
    pub risk_free_rate: f64,
    pub seed: Option<u64>,
    pub early_stop_patience: Option<usize>,
    pub timeout_secs: Option<u64>,
    /// Put the portfolio's current allocation into the first generation.
    pub seed_with_current_weights: bool,
    pub sampling_scheme: SamplingScheme,
    pub include_frontier: bool,
    pub frontier_samples: Option<usize>,
    /// Most recent price days held out of the optimization and replayed as a
    /// backtest. `0` optimizes on the whole window.
    pub projection_days: usize,
}

impl Default for OptimizationRequest {
    fn default() -> Self {
        OptimizationRequest {
            population_size: 100,
            generations: 50,
            risk_weight: 1.,
            cvar_alpha: DEFAULT_CVAR_ALPHA,
            cvar_estimator: CvarEstimator::Historical,
            bootstrap_simulations: DEFAULT_BOOTSTRAP_SIMULATIONS,
            risk_measure: RiskMeasure::Cvar,
            cvar_share: 0.5,
            risk_free_rate: 0.,
            seed: None,
            early_stop_patience: None,
            timeout_secs: None,
            seed_with_current_weights: true,
            sampling_scheme: SamplingScheme::UniformNormalized,
            include_frontier: true,
            frontier_samples: None,
            projection_days: 0,
        }
    }
}

impl OptimizationRequest {
    /// Validated GA configuration for this request.
    pub fn evolution_config(&self) -> Result<StandardEvolutionConfig, EvolutionError> {
        let config = StandardEvolutionConfig {
            generations: self.generations,
            population_size: self.population_size,
            risk_weight: self.risk_weight,
            risk_measure: self.risk_measure,
            cvar_share: self.cvar_share,
            cvar_alpha: self.cvar_alpha,
            cvar_estimator: self.cvar_estimator,
            bootstrap_simulations: self.bootstrap_simulations,
            risk_free_rate: self.risk_free_rate,
            global_seed: self.seed,
            early_stop_patience: self.early_stop_patience,
            sampling_scheme: self.sampling_scheme,
            ..StandardEvolutionConfig::default()
        };
        config.validate()?;
        if self.projection_days == 1 {
            return Err(EvolutionError::BadPopulationParameter(
                "A projection window needs at least 2 price days (or 0 to disable it).".into(),
            ));
        }
        Ok(config)
    }

    pub fn frontier_config(&self, default_samples: usize) -> FrontierConfig {
        FrontierConfig {
            samples: self.frontier_samples.unwrap_or(default_samples),
            cloud_cap: DEFAULT_FRONTIER_CLOUD_CAP,
            risk_free_rate: self.risk_free_rate,
            cvar_alpha: self.cvar_alpha,
            cvar_estimator: self.cvar_estimator,
            bootstrap_simulations: self.bootstrap_simulations,
            seed: self.seed,
            sampling_scheme: self.sampling_scheme,
        }
    }

    pub fn timeout(&self, service_default: Option<Duration>) -> Option<Duration> {
        match self.timeout_secs {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => service_default,
        }
    }
}

/// Offline inputs: portfolios plus their price histories, as one JSON file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dataset {
    #[serde(default)]
    pub portfolios: Vec<PortfolioSnapshot>,
    #[serde(default)]
    pub prices: Vec<PriceSeries>,
}

impl Dataset {
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::DatasetIo {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Pretty-printed JSON, readable back by `from_json_file`.
    pub fn write_json_file(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|source| ConfigError::DatasetIo {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Replaces the portfolio with the same id, or appends it.
    pub fn upsert_portfolio(&mut self, portfolio: PortfolioSnapshot) {
        match self.portfolios.iter_mut().find(|p| p.id == portfolio.id) {
            Some(existing) => *existing = portfolio,
            None => self.portfolios.push(portfolio),
        }
    }

    pub fn into_collaborators(
        self,
        suffixes: MarketSuffixes,
    ) -> (InMemoryPriceSource, InMemoryPortfolioStore) {
        let prices = InMemoryPriceSource::new(suffixes);
        for series in self.prices {
            prices.insert(&series.ticker, series.points);
        }
        let store = InMemoryPortfolioStore::new();
        for portfolio in self.portfolios {
            store.insert(portfolio);
        }
        (prices, store)
    }
}
