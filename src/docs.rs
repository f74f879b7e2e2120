use utoipa::OpenApi;

use crate::analytics::{PerformancePoint, RiskContribution, SectorWeight};
use crate::application::{ApplicationReport, AssetUpdateFailure, PlannedUpdate, TickerWeight};
use crate::backtest::{BacktestDelta, BacktestMetrics, BacktestReport};
use crate::config::OptimizationRequest;
use crate::error::ErrorKind;
use crate::evolution::objective::RiskMeasure;
use crate::evolution::portfolio_evolution::{FinalPopulationSummary, GenerationRecord, ParetoSolution};
use crate::frontier::{ChartPoint, ChartPointKind, Frontier, FrontierPoint, FrontierRiskMeasure, SimulatedFrontiers};
use crate::handlers::{ApplyWeightsRequest, ErrorResponse, HealthResponse, JobAccepted};
use crate::jobs::{JobProgress, JobStage, JobStatus};
use crate::report::{FrontierReport, OptimizationReport};
use crate::sampling::SamplingScheme;
use crate::statistics::{CvarEstimator, PortfolioMetrics};

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::health,
        crate::handlers::start_optimization,
        crate::handlers::get_progress,
        crate::handlers::get_result,
        crate::handlers::cancel_optimization,
        crate::handlers::apply_weights
    ),
    components(
        schemas(
            OptimizationRequest,
            RiskMeasure,
            CvarEstimator,
            SamplingScheme,
            JobAccepted,
            JobProgress,
            JobStatus,
            JobStage,
            OptimizationReport,
            PortfolioMetrics,
            GenerationRecord,
            ParetoSolution,
            FinalPopulationSummary,
            FrontierReport,
            SimulatedFrontiers,
            Frontier,
            FrontierPoint,
            FrontierRiskMeasure,
            ChartPoint,
            ChartPointKind,
            PerformancePoint,
            SectorWeight,
            RiskContribution,
            BacktestReport,
            BacktestMetrics,
            BacktestDelta,
            TickerWeight,
            ApplyWeightsRequest,
            ApplicationReport,
            PlannedUpdate,
            AssetUpdateFailure,
            HealthResponse,
            ErrorResponse,
            ErrorKind
        )
    ),
    tags(
        (name = "Optimization", description = "Start, follow, cancel and read portfolio optimization jobs"),
        (name = "Portfolio", description = "Write optimized weights back to a portfolio"),
        (name = "Service", description = "Liveness")
    )
)]
pub struct ApiDoc;
