use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::application::ApplicationError;
use crate::evolution::portfolio_evolution::EvolutionError;
use crate::statistics::StatisticsError;

/// Stable, serializable tag for every failure the optimizer can surface.
/// A failed job keeps this next to its message so callers can branch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InsufficientData,
    InvalidPortfolio,
    InvalidWeight,
    NoAssetsUpdated,
    JobNotFound,
    JobNotFinished,
    JobCancelled,
    Computation,
    InvalidConfig,
    Collaborator,
}

#[derive(Error, Debug)]
pub enum OptimizerError {
    #[error("Insufficient data: {0}")]
    InsufficientData(String),
    #[error("Invalid portfolio: {0}")]
    InvalidPortfolio(String),
    #[error("Invalid weight {weight} for `{ticker}`")]
    InvalidWeight { ticker: String, weight: f64 },
    #[error("No assets were updated ({skipped} optimizer tickers had no match in the portfolio)")]
    NoAssetsUpdated { skipped: usize },
    #[error("Job `{0}` was not found")]
    JobNotFound(Uuid),
    #[error("Job was cancelled: {0}")]
    JobCancelled(String),
    #[error("Numerical failure: {0}")]
    Computation(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Collaborator failure: {0}")]
    Collaborator(String),
}

impl OptimizerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OptimizerError::InsufficientData(_) => ErrorKind::InsufficientData,
            OptimizerError::InvalidPortfolio(_) => ErrorKind::InvalidPortfolio,
            OptimizerError::InvalidWeight { .. } => ErrorKind::InvalidWeight,
            OptimizerError::NoAssetsUpdated { .. } => ErrorKind::NoAssetsUpdated,
            OptimizerError::JobNotFound(_) => ErrorKind::JobNotFound,
            OptimizerError::JobCancelled(_) => ErrorKind::JobCancelled,
            OptimizerError::Computation(_) => ErrorKind::Computation,
            OptimizerError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            OptimizerError::Collaborator(_) => ErrorKind::Collaborator,
        }
    }
}

impl From<StatisticsError> for OptimizerError {
    fn from(err: StatisticsError) -> Self {
        match err {
            StatisticsError::InsufficientData(msg) => OptimizerError::InsufficientData(msg),
            StatisticsError::Computation(msg) => OptimizerError::Computation(msg),
        }
    }
}

impl From<EvolutionError> for OptimizerError {
    fn from(err: EvolutionError) -> Self {
        match err {
            EvolutionError::BadPopulationParameter(msg) => OptimizerError::InvalidConfig(msg),
            EvolutionError::InsufficientData(msg) => OptimizerError::InsufficientData(msg),
            EvolutionError::Cancelled { generation } => OptimizerError::JobCancelled(format!(
                "evolution stopped at generation {generation}"
            )),
            EvolutionError::Computation(msg) => OptimizerError::Computation(msg),
        }
    }
}

impl From<ApplicationError> for OptimizerError {
    fn from(err: ApplicationError) -> Self {
        match err {
            ApplicationError::NoAssetsUpdated { skipped } => {
                OptimizerError::NoAssetsUpdated { skipped }
            }
            ApplicationError::InvalidWeight { ticker, weight } => {
                OptimizerError::InvalidWeight { ticker, weight }
            }
            ApplicationError::PortfolioNotFound(id) => {
                OptimizerError::InvalidPortfolio(format!("Portfolio {id} does not exist"))
            }
            ApplicationError::Store(msg) => OptimizerError::Collaborator(msg),
        }
    }
}
