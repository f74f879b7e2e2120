use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use utoipa::ToSchema;

use crate::consts::NUMBER_OF_OPTIMIZATION_OBJECTIVES;
use crate::statistics::PortfolioMetrics;

#[derive(Copy, Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum OptimizationDirection {
    Maximize,
    Minimize,
}

/// Which risk figure the optimizer minimizes.
///
/// `Blend` mixes both as `cvar_share·cvar + (1 - cvar_share)·volatility`, with
/// the share supplied by the run configuration.
#[derive(Copy, Clone, Serialize, Deserialize, Debug, Default, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub enum RiskMeasure {
    Volatility,
    #[default]
    Cvar,
    Blend,
}

pub trait OptimizationObjective: Debug + Send + Sync {
    fn compute(&self, metrics: &PortfolioMetrics) -> f64;

    fn direction(&self) -> OptimizationDirection;

    /// Objective value oriented so that higher is always better.
    fn score(&self, metrics: &PortfolioMetrics) -> f64 {
        let value = self.compute(metrics);
        match self.direction() {
            OptimizationDirection::Maximize => value,
            OptimizationDirection::Minimize => -value,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExpectedReturn;

impl OptimizationObjective for ExpectedReturn {
    fn compute(&self, metrics: &PortfolioMetrics) -> f64 {
        metrics.expected_return
    }

    fn direction(&self) -> OptimizationDirection {
        OptimizationDirection::Maximize
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CombinedRisk {
    pub measure: RiskMeasure,
    pub cvar_share: f64,
}

impl OptimizationObjective for CombinedRisk {
    fn compute(&self, metrics: &PortfolioMetrics) -> f64 {
        match self.measure {
            RiskMeasure::Volatility => metrics.volatility,
            RiskMeasure::Cvar => metrics.cvar,
            RiskMeasure::Blend => {
                self.cvar_share * metrics.cvar + (1. - self.cvar_share) * metrics.volatility
            }
        }
    }

    fn direction(&self) -> OptimizationDirection {
        OptimizationDirection::Minimize
    }
}

/// The two objectives plus the weighted-sum fitness used for elitism, early
/// stopping and convergence reporting:
/// `fitness = return - risk_weight · risk`.
///
/// With a non-negative `risk_weight` the fitness can only grow with more
/// return or less risk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitnessPolicy {
    pub risk: CombinedRisk,
    pub risk_weight: f64,
}

impl FitnessPolicy {
    pub fn new(measure: RiskMeasure, cvar_share: f64, risk_weight: f64) -> Self {
        FitnessPolicy {
            risk: CombinedRisk {
                measure,
                cvar_share,
            },
            risk_weight,
        }
    }

    pub fn risk(&self, metrics: &PortfolioMetrics) -> f64 {
        self.risk.compute(metrics)
    }

    pub fn fitness(&self, metrics: &PortfolioMetrics) -> f64 {
        ExpectedReturn.compute(metrics) - self.risk_weight * self.risk(metrics)
    }

    /// Higher-is-better scores in objective order (return, risk).
    pub fn scores(&self, metrics: &PortfolioMetrics) -> [f64; NUMBER_OF_OPTIMIZATION_OBJECTIVES] {
        [ExpectedReturn.score(metrics), self.risk.score(metrics)]
    }
}
