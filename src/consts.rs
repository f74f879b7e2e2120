// Annualization
pub const TRADING_DAYS_PER_YEAR: f64 = 252.;
pub const DEFAULT_CVAR_ALPHA: f64 = 0.95;
/// Simulated years behind a bootstrap CVaR estimate.
pub const DEFAULT_BOOTSTRAP_SIMULATIONS: usize = 500;

// Comparisons
pub const FLOAT_COMPARISON_EPSILON: f64 = 1e-12;
/// Slack added to `(1 - alpha)·N` before flooring so that `1 - 0.9` landing
/// just under `0.1` does not drop an order statistic.
pub const QUANTILE_INDEX_TOLERANCE: f64 = 1e-9;
/// Tolerance on `|sum(weights) - 1|` for a weight vector to count as feasible.
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-4;

// Evolution
/// Return and risk.
pub const NUMBER_OF_OPTIMIZATION_OBJECTIVES: usize = 2;
pub const DEFAULT_MUTATION_SIGMA: f64 = 0.05;
pub const DEFAULT_PARETO_TABLE_SIZE: usize = 20;

// Frontier simulation
pub const DEFAULT_FRONTIER_SAMPLES: usize = 5000;
pub const DEFAULT_FRONTIER_CLOUD_CAP: usize = 1000;

// Job progress milestones (percent)
pub const PROGRESS_PORTFOLIO_LOADED: u8 = 5;
pub const PROGRESS_PRICES_FETCHED: u8 = 15;
pub const PROGRESS_STATISTICS_COMPUTED: u8 = 40;
pub const PROGRESS_GENERATIONS_START: u8 = 50;
pub const PROGRESS_GENERATIONS_END: u8 = 90;
pub const PROGRESS_RESULTS_ASSEMBLED: u8 = 95;
pub const PROGRESS_DONE: u8 = 100;

// Reporting
pub const OTHER_SECTOR: &str = "Other";
