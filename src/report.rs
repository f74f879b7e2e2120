//! A single optimization run from collaborator answers to the final report.
//! Scheduling, progress bookkeeping and cancellation policy live in `jobs`;
//! the functions here only observe the hooks they are handed.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use utoipa::ToSchema;

use crate::analytics::{
    performance_series, risk_contribution, sector_allocation, PerformancePoint, RiskContribution,
    SectorWeight,
};
use crate::application::TickerWeight;
use crate::backtest::{run_backtest, BacktestReport};
use crate::config::OptimizationRequest;
use crate::consts::TRADING_DAYS_PER_YEAR;
use crate::error::OptimizerError;
use crate::evolution::objective::RiskMeasure;
use crate::evolution::portfolio_evolution::pareto_evolution::StandardParetoEvolution;
use crate::evolution::portfolio_evolution::{
    EvolutionError, EvolutionHooks, EvolutionInputs, EvolutionStrategy, FinalPopulationSummary,
    GenerationRecord, ParetoSolution,
};
use crate::frontier::{simulate_frontiers, ChartPoint, FrontierConfig, SimulatedFrontiers};
use crate::jobs::JobStage;
use crate::market_data::{PriceMatrix, PriceSource};
use crate::portfolio::{PortfolioSnapshot, PortfolioStore, StoreError};
use crate::statistics::{evaluate_weights, CvarEstimator, PortfolioMetrics, ReturnMatrix, RiskModel};

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FrontierReport {
    pub frontiers: SimulatedFrontiers,
    /// Volatility cloud plus the optimized, original, max-Sharpe and min-risk markers.
    pub volatility_chart: Vec<ChartPoint>,
    pub cvar_chart: Vec<ChartPoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationReport {
    pub portfolio_id: u64,
    /// Risk measure `originalRisk`/`optimizedRisk` are expressed in.
    pub risk_measure: RiskMeasure,
    pub cvar_estimator: CvarEstimator,
    /// Price days the optimizer was fitted on.
    pub training_days: usize,
    pub original_return: f64,
    pub original_risk: f64,
    pub optimized_return: f64,
    pub optimized_risk: f64,
    /// `optimizedReturn - originalReturn`.
    pub improvement: f64,
    /// Number of generations recorded in the convergence history.
    pub convergence_generation: usize,
    pub stopped_early: bool,
    pub seed: u64,
    pub original_metrics: PortfolioMetrics,
    pub optimized_metrics: PortfolioMetrics,
    /// Percent, keyed by the portfolio's own tickers.
    pub optimized_weights: Vec<TickerWeight>,
    pub convergence_history: Vec<GenerationRecord>,
    pub pareto_table: Vec<ParetoSolution>,
    pub final_summary: FinalPopulationSummary,
    pub frontier: Option<FrontierReport>,
    pub performance_series: Vec<PerformancePoint>,
    pub sector_allocation: Vec<SectorWeight>,
    pub risk_contribution: Vec<RiskContribution>,
    /// Present when the request held back a projection window.
    pub backtest: Option<BacktestReport>,
}

/// Reads the portfolio and checks it can be optimized at all.
pub async fn load_portfolio(
    store: &dyn PortfolioStore,
    portfolio_id: u64,
) -> Result<PortfolioSnapshot, OptimizerError> {
    let portfolio = store.get_portfolio(portfolio_id).await.map_err(|e| match e {
        StoreError::PortfolioNotFound(_) => OptimizerError::InvalidPortfolio(e.to_string()),
        other => OptimizerError::Collaborator(other.to_string()),
    })?;

    if portfolio.assets.len() < 2 {
        return Err(OptimizerError::InsufficientData(format!(
            "portfolio {portfolio_id} holds {} asset(s); at least 2 are required",
            portfolio.assets.len()
        )));
    }
    Ok(portfolio)
}

pub async fn fetch_prices(
    source: &dyn PriceSource,
    portfolio: &PortfolioSnapshot,
    lookback_days: usize,
) -> Result<PriceMatrix, OptimizerError> {
    let prices = source
        .historical_prices(&portfolio.tickers(), lookback_days)
        .await?;
    if prices.number_of_assets() != portfolio.assets.len() {
        return Err(OptimizerError::Collaborator(format!(
            "price source returned {} series for {} assets",
            prices.number_of_assets(),
            portfolio.assets.len()
        )));
    }
    if prices.number_of_days() < 2 {
        return Err(OptimizerError::InsufficientData(format!(
            "{} price observation(s) in the lookback window",
            prices.number_of_days()
        )));
    }
    Ok(prices)
}

/// Splits off the request's projection window. Everything fitted later only
/// sees the first matrix.
fn training_and_projection(
    prices: &PriceMatrix,
    projection_days: usize,
) -> Result<(PriceMatrix, Option<PriceMatrix>), OptimizerError> {
    if projection_days == 0 {
        return Ok((prices.clone(), None));
    }
    let available = prices.number_of_days();
    if projection_days + 2 > available {
        return Err(OptimizerError::InsufficientData(format!(
            "{available} price days cannot hold a {projection_days}-day projection window \
             and at least 2 training days"
        )));
    }
    let (training, projection) = prices.clone().split_recent(projection_days);
    Ok((training, Some(projection)))
}

fn cancelled_after(hooks: &EvolutionHooks<'_>, generations_run: usize) -> Result<(), OptimizerError> {
    if hooks.is_cancelled() {
        return Err(EvolutionError::Cancelled {
            generation: generations_run,
        }
        .into());
    }
    Ok(())
}

/// CPU-bound part of a run: statistics, evolution, frontier, analytics and
/// the optional out-of-sample backtest. `on_stage` is told when statistics
/// are ready and when the report is being assembled; per-generation progress
/// flows through `hooks`, whose cancel flag is also honoured between the
/// post-evolution steps.
pub fn run_optimization(
    portfolio: &PortfolioSnapshot,
    prices: &PriceMatrix,
    request: &OptimizationRequest,
    default_frontier_samples: usize,
    hooks: &EvolutionHooks<'_>,
    on_stage: &dyn Fn(JobStage),
) -> Result<OptimizationReport, OptimizerError> {
    let config = request.evolution_config()?;
    let (training, projection) = training_and_projection(prices, request.projection_days)?;
    let returns = ReturnMatrix::from_prices(&training.prices);
    let risk_model = RiskModel::from_returns(&returns, TRADING_DAYS_PER_YEAR)?;
    on_stage(JobStage::StatisticsComputed);

    let original_weights = portfolio.current_weights();
    let inputs = EvolutionInputs {
        risk_model: &risk_model,
        returns: &returns,
        initial_weights: request
            .seed_with_current_weights
            .then_some(original_weights.as_slice()),
    };
    let evolution = StandardParetoEvolution.evolve(&config, &inputs, hooks)?;
    cancelled_after(hooks, evolution.generations_run)?;
    on_stage(JobStage::ResultsAssembled);

    let optimized_weights = evolution.selected.weights.clone();
    let cvar_model = config.cvar_model(returns.number_of_periods(), evolution.seed);
    let evaluate = |weights: &[f64]| {
        evaluate_weights(weights, &risk_model, &returns, &cvar_model, config.risk_free_rate)
    };
    let original_metrics = evaluate(&original_weights);
    let optimized_metrics = evaluate(&optimized_weights);
    let policy = config.fitness_policy();

    let frontier = if request.include_frontier {
        // Unseeded requests still put the frontier on the run's stream, so the
        // bootstrap scenarios match the ones the optimizer was scored on.
        let frontier_config = FrontierConfig {
            seed: Some(evolution.seed),
            ..request.frontier_config(default_frontier_samples)
        };
        let frontiers = simulate_frontiers(&risk_model, &returns, &frontier_config)?;
        cancelled_after(hooks, evolution.generations_run)?;
        debug!(samples = frontiers.samples_drawn, seed = frontiers.seed, "frontier simulated");
        Some(FrontierReport {
            volatility_chart: frontiers.volatility.chart_dataset(
                &optimized_metrics,
                &original_metrics,
                config.risk_free_rate,
            ),
            cvar_chart: frontiers.cvar.chart_dataset(
                &optimized_metrics,
                &original_metrics,
                config.risk_free_rate,
            ),
            frontiers,
        })
    } else {
        None
    };

    let backtest = match &projection {
        Some(window) => Some(run_backtest(
            window,
            &original_weights,
            &optimized_weights,
            config.cvar_alpha,
            config.risk_free_rate,
        )?),
        None => None,
    };

    let tickers = portfolio.tickers();
    let sectors: Vec<Option<String>> = portfolio.assets.iter().map(|a| a.sector.clone()).collect();

    let report = OptimizationReport {
        portfolio_id: portfolio.id,
        risk_measure: config.risk_measure,
        cvar_estimator: config.cvar_estimator,
        training_days: training.number_of_days(),
        original_return: original_metrics.expected_return,
        original_risk: policy.risk(&original_metrics),
        optimized_return: optimized_metrics.expected_return,
        optimized_risk: policy.risk(&optimized_metrics),
        improvement: optimized_metrics.expected_return - original_metrics.expected_return,
        convergence_generation: evolution.convergence_history.len(),
        stopped_early: evolution.stopped_early,
        seed: evolution.seed,
        original_metrics,
        optimized_metrics,
        optimized_weights: tickers
            .iter()
            .zip(optimized_weights.iter())
            .map(|(ticker, w)| TickerWeight {
                ticker: ticker.clone(),
                weight: w * 100.,
            })
            .collect(),
        performance_series: performance_series(
            &training.dates,
            &returns,
            &original_weights,
            &optimized_weights,
        ),
        sector_allocation: sector_allocation(&sectors, &optimized_weights),
        risk_contribution: risk_contribution(
            &tickers,
            &optimized_weights,
            &returns,
            &risk_model,
            config.cvar_alpha,
        ),
        convergence_history: evolution.convergence_history,
        pareto_table: evolution.pareto_table,
        final_summary: evolution.final_summary,
        frontier,
        backtest,
    };

    info!(
        portfolio_id = portfolio.id,
        original_return = report.original_return,
        optimized_return = report.optimized_return,
        original_risk = report.original_risk,
        optimized_risk = report.optimized_risk,
        generations = report.convergence_generation,
        training_days = report.training_days,
        backtest = report.backtest.is_some(),
        "optimization report assembled"
    );
    Ok(report)
}
