use std::cmp::Ordering;
use std::sync::atomic::AtomicBool;

use rand::prelude::*;
use rand_distr::Normal;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use crate::consts::{
    DEFAULT_BOOTSTRAP_SIMULATIONS, DEFAULT_CVAR_ALPHA, DEFAULT_MUTATION_SIGMA,
    DEFAULT_PARETO_TABLE_SIZE, WEIGHT_SUM_TOLERANCE,
};
use crate::evolution::individual::Individual;
use crate::evolution::objective::{FitnessPolicy, RiskMeasure};
use crate::sampling::{normalize_or_uniform, SamplingScheme};
use crate::statistics::{evaluate_weights, CvarEstimator, CvarModel, ReturnMatrix, RiskModel};

pub mod pareto_evolution;

// Strategy Definition
pub trait EvolutionStrategy {
    type Config;
    fn evolve(
        &self,
        config: &Self::Config,
        inputs: &EvolutionInputs<'_>,
        hooks: &EvolutionHooks<'_>,
    ) -> Result<EvolutionResult, EvolutionError>;
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvolutionError {
    #[error("Invalid population parameters were passed: {0}")]
    BadPopulationParameter(String),
    #[error("Insufficient data: {0}")]
    InsufficientData(String),
    #[error("Evolution was cancelled after generation {generation}")]
    Cancelled { generation: usize },
    #[error("Numerical failure during evolution: {0}")]
    Computation(String),
}

/// Every knob of a generational run. Nothing the loop depends on is a hidden
/// constant.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StandardEvolutionConfig {
    pub generations: usize,
    pub population_size: usize,
    /// Share of the next generation copied from the best fronts. The champion
    /// is carried over even when this rounds to zero.
    pub elitism_rate: f64,
    pub crossover_rate: f64,
    /// Per-gene probability of a Gaussian perturbation.
    pub mutation_rate: f64,
    pub mutation_sigma: f64,
    pub tournament_size: usize,
    pub risk_weight: f64,
    pub risk_measure: RiskMeasure,
    /// Only read by `RiskMeasure::Blend`.
    pub cvar_share: f64,
    pub cvar_alpha: f64,
    #[serde(default)]
    pub cvar_estimator: CvarEstimator,
    /// Simulated years per bootstrap estimate; ignored by the historical estimator.
    pub bootstrap_simulations: usize,
    pub risk_free_rate: f64,
    #[serde(default)]
    pub global_seed: Option<u64>,
    /// Stop once best fitness has not improved by more than
    /// `early_stop_tolerance` for this many consecutive generations.
    #[serde(default)]
    pub early_stop_patience: Option<usize>,
    pub early_stop_tolerance: f64,
    pub pareto_table_size: usize,
    pub sampling_scheme: SamplingScheme,
}

impl Default for StandardEvolutionConfig {
    fn default() -> Self {
        StandardEvolutionConfig {
            generations: 50,
            population_size: 100,
            elitism_rate: 0.1,
            crossover_rate: 0.9,
            mutation_rate: 0.2,
            mutation_sigma: DEFAULT_MUTATION_SIGMA,
            tournament_size: 3,
            risk_weight: 1.,
            risk_measure: RiskMeasure::Cvar,
            cvar_share: 0.5,
            cvar_alpha: DEFAULT_CVAR_ALPHA,
            cvar_estimator: CvarEstimator::Historical,
            bootstrap_simulations: DEFAULT_BOOTSTRAP_SIMULATIONS,
            risk_free_rate: 0.,
            global_seed: None,
            early_stop_patience: None,
            early_stop_tolerance: 1e-9,
            pareto_table_size: DEFAULT_PARETO_TABLE_SIZE,
            sampling_scheme: SamplingScheme::UniformNormalized,
        }
    }
}

impl StandardEvolutionConfig {
    pub fn validate(&self) -> Result<(), EvolutionError> {
        let bad = |msg: &str| Err(EvolutionError::BadPopulationParameter(msg.into()));
        let is_probability = |p: f64| (0. ..=1.).contains(&p);

        if self.population_size < 2 {
            return bad("Population size must be at least 2.");
        }
        if self.generations == 0 {
            return bad("Generation budget cannot be zero.");
        }
        if !(0. ..1.).contains(&self.elitism_rate) {
            return bad("Elitism rate must be in [0, 1).");
        }
        if !is_probability(self.crossover_rate) || !is_probability(self.mutation_rate) {
            return bad("Crossover and mutation rates must be in [0, 1].");
        }
        if !self.mutation_sigma.is_finite() || self.mutation_sigma < 0. {
            return bad("Mutation sigma must be a finite, non-negative number.");
        }
        if self.tournament_size == 0 {
            return bad("Tournament size cannot be zero.");
        }
        if !self.risk_weight.is_finite() || self.risk_weight < 0. {
            return bad("Risk weight must be a finite, non-negative number.");
        }
        if !is_probability(self.cvar_share) {
            return bad("CVaR share must be in [0, 1].");
        }
        if !(self.cvar_alpha > 0. && self.cvar_alpha < 1.) {
            return bad("CVaR alpha must be in (0, 1).");
        }
        if self.cvar_estimator == CvarEstimator::Bootstrap && self.bootstrap_simulations == 0 {
            return bad("Bootstrap CVaR needs at least one simulation.");
        }
        if !self.risk_free_rate.is_finite() {
            return bad("Risk-free rate must be finite.");
        }
        if self.early_stop_patience == Some(0) {
            return bad("Early-stop patience must be at least 1 generation.");
        }
        if !self.early_stop_tolerance.is_finite() || self.early_stop_tolerance < 0. {
            return bad("Early-stop tolerance must be a finite, non-negative number.");
        }
        if self.pareto_table_size == 0 {
            return bad("Pareto table size cannot be zero.");
        }
        Ok(())
    }

    pub fn fitness_policy(&self) -> FitnessPolicy {
        FitnessPolicy::new(self.risk_measure, self.cvar_share, self.risk_weight)
    }

    /// CVaR estimator for a run over `periods` return rows, seeded by the run seed.
    pub fn cvar_model(&self, periods: usize, seed: u64) -> CvarModel {
        CvarModel::new(
            self.cvar_estimator,
            self.cvar_alpha,
            periods,
            self.bootstrap_simulations,
            seed,
        )
    }

    /// Number of individuals copied into the next generation, champion included.
    pub fn elite_count(&self) -> usize {
        (((self.population_size as f64) * self.elitism_rate) as usize).max(1)
    }
}

/// Read-only data one run evaluates against.
#[derive(Debug, Clone, Copy)]
pub struct EvolutionInputs<'a> {
    pub risk_model: &'a RiskModel,
    pub returns: &'a ReturnMatrix,
    /// Seeded into the initial population when present.
    pub initial_weights: Option<&'a [f64]>,
}

/// Callbacks observed at generation boundaries.
#[derive(Default, Clone, Copy)]
pub struct EvolutionHooks<'a> {
    pub cancel_flag: Option<&'a AtomicBool>,
    pub on_generation: Option<&'a (dyn Fn(&GenerationRecord, usize) + Send + Sync)>,
}

impl EvolutionHooks<'_> {
    pub fn is_cancelled(&self) -> bool {
        self.cancel_flag
            .map(|flag| flag.load(std::sync::atomic::Ordering::SeqCst))
            .unwrap_or(false)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRecord {
    /// 1-based.
    pub generation: usize,
    pub best_return: f64,
    pub best_risk: f64,
    pub best_volatility: f64,
    pub best_cvar: f64,
    pub best_fitness: f64,
    pub average_fitness: f64,
    pub front_size: usize,
}

impl GenerationRecord {
    /// "Best" fields all describe the fittest individual, so they belong to one
    /// portfolio rather than being per-column maxima.
    fn from_population(generation: usize, population: &[&Individual], front_size: usize) -> Option<Self> {
        let champion = best_individual(population.iter().copied())?;
        let average_fitness =
            population.iter().map(|i| i.fitness).sum::<f64>() / population.len() as f64;
        Some(GenerationRecord {
            generation,
            best_return: champion.metrics.expected_return,
            best_risk: champion.risk,
            best_volatility: champion.metrics.volatility,
            best_cvar: champion.metrics.cvar,
            best_fitness: champion.fitness,
            average_fitness,
            front_size,
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ParetoSolution {
    pub weights: Vec<f64>,
    #[serde(rename = "return")]
    pub ret: f64,
    /// Risk under the run's risk measure.
    pub risk: f64,
    pub volatility: f64,
    pub cvar: f64,
    pub sharpe: f64,
    pub fitness: f64,
    pub rank: usize,
}

impl From<&Individual> for ParetoSolution {
    fn from(individual: &Individual) -> Self {
        ParetoSolution {
            weights: individual.weights.clone(),
            ret: individual.metrics.expected_return,
            risk: individual.risk,
            volatility: individual.metrics.volatility,
            cvar: individual.metrics.cvar,
            sharpe: individual.metrics.sharpe,
            fitness: individual.fitness,
            rank: individual.rank.unwrap_or(1),
        }
    }
}

/// Contains summary statistics for the final population after evolution.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FinalPopulationSummary {
    /// Best (highest) expected return found in the final population.
    pub best_return: f64,
    pub population_average_return: f64,
    /// Best (lowest) volatility found in the final population.
    pub best_volatility: f64,
    pub population_average_volatility: f64,
    /// Best (lowest) annualized CVaR found in the final population.
    pub best_cvar: f64,
    pub population_average_cvar: f64,
    /// Best (highest) Sharpe ratio found in the final population.
    pub best_sharpe: f64,
    pub population_average_sharpe: f64,
}

impl FinalPopulationSummary {
    fn from_population(population: &[Individual]) -> Self {
        let size = population.len().max(1) as f64;
        let fold = |f: fn(&Individual) -> f64, init: f64, pick: fn(f64, f64) -> f64| {
            population.iter().map(f).fold(init, pick)
        };
        let average = |f: fn(&Individual) -> f64| population.iter().map(f).sum::<f64>() / size;

        FinalPopulationSummary {
            best_return: fold(|i| i.metrics.expected_return, f64::NEG_INFINITY, f64::max),
            population_average_return: average(|i| i.metrics.expected_return),
            best_volatility: fold(|i| i.metrics.volatility, f64::INFINITY, f64::min),
            population_average_volatility: average(|i| i.metrics.volatility),
            best_cvar: fold(|i| i.metrics.cvar, f64::INFINITY, f64::min),
            population_average_cvar: average(|i| i.metrics.cvar),
            best_sharpe: fold(|i| i.metrics.sharpe, f64::NEG_INFINITY, f64::max),
            population_average_sharpe: average(|i| i.metrics.sharpe),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EvolutionResult {
    /// Front entry nearest the ideal point.
    pub selected: ParetoSolution,
    /// Final non-dominated front ordered by distance to the ideal point.
    pub pareto_table: Vec<ParetoSolution>,
    pub convergence_history: Vec<GenerationRecord>,
    pub generations_run: usize,
    pub stopped_early: bool,
    /// Seed of the run's random stream.
    pub seed: u64,
    pub final_summary: FinalPopulationSummary,
}

/// Fails before any generation runs when the inputs cannot support a search.
pub fn validate_inputs(inputs: &EvolutionInputs<'_>) -> Result<(), EvolutionError> {
    let assets = inputs.risk_model.number_of_assets();
    if assets < 2 {
        return Err(EvolutionError::InsufficientData(format!(
            "At least 2 assets are required, got {assets}."
        )));
    }
    if inputs.returns.number_of_assets() != assets {
        return Err(EvolutionError::Computation(format!(
            "Risk model has {assets} assets but the return matrix has {}.",
            inputs.returns.number_of_assets()
        )));
    }
    let periods = inputs.returns.number_of_periods();
    if periods < assets + 1 {
        return Err(EvolutionError::InsufficientData(format!(
            "{periods} return observations cannot support {assets} assets (need at least {}).",
            assets + 1
        )));
    }
    if let Some(weights) = inputs.initial_weights {
        if weights.len() != assets {
            return Err(EvolutionError::BadPopulationParameter(format!(
                "Initial weights have {} entries for {assets} assets.",
                weights.len()
            )));
        }
    }
    Ok(())
}

pub fn initialize_population<R: Rng + ?Sized>(
    population_size: usize,
    assets_under_management: usize,
    sampling_scheme: SamplingScheme,
    seed_weights: Option<&[f64]>,
    rng: &mut R,
) -> Result<Vec<Vec<f64>>, EvolutionError> {
    if population_size == 0 && assets_under_management == 0 {
        return Err(EvolutionError::BadPopulationParameter("Both population size and assets under management are zero, but none are supposed to be.".into()));
    } else if population_size == 0 {
        return Err(EvolutionError::BadPopulationParameter(
            "Population size cannot be zero".into(),
        ));
    } else if assets_under_management == 0 {
        return Err(EvolutionError::BadPopulationParameter(
            "Assets under management cannot be zero".into(),
        ));
    }

    let mut population = Vec::with_capacity(population_size);
    if let Some(weights) = seed_weights {
        let mut seeded = weights.to_vec();
        repair_weights(&mut seeded);
        population.push(seeded);
    }
    while population.len() < population_size {
        population.push(sampling_scheme.sample_weights(assets_under_management, rng));
    }
    Ok(population)
}

/// Clips every weight into `[0, 1]` (non-finite entries become 0) and
/// renormalizes to sum 1. An all-zero vector becomes equal weights.
pub fn repair_weights(weights: &mut Vec<f64>) {
    for weight in weights.iter_mut() {
        *weight = if weight.is_finite() { weight.clamp(0., 1.) } else { 0. };
    }
    *weights = normalize_or_uniform(std::mem::take(weights));
}

pub fn is_feasible(weights: &[f64]) -> bool {
    weights.iter().all(|w| (0. ..=1.).contains(w))
        && (weights.iter().sum::<f64>() - 1.).abs() < WEIGHT_SUM_TOLERANCE
}

/// Evaluates every weight vector in parallel. Output order (and therefore
/// every `id`) follows input order.
pub fn evaluate_population(
    population: Vec<Vec<f64>>,
    inputs: &EvolutionInputs<'_>,
    cvar_model: &CvarModel,
    risk_free_rate: f64,
    policy: &FitnessPolicy,
) -> Vec<Individual> {
    population
        .into_par_iter()
        .enumerate()
        .map(|(id, weights)| {
            let metrics = evaluate_weights(
                &weights,
                inputs.risk_model,
                inputs.returns,
                cvar_model,
                risk_free_rate,
            );
            Individual::new(id, weights, metrics, policy)
        })
        .collect()
}

pub fn best_individual<'a, I>(population: I) -> Option<&'a Individual>
where
    I: IntoIterator<Item = &'a Individual>,
{
    population.into_iter().min_by(|a, b| a.fitness_order(b))
}

pub(crate) fn generate_offsprings<R: Rng + ?Sized>(
    breeding_pool: &[&Individual],
    offspring_count: usize,
    config: &StandardEvolutionConfig,
    rng: &mut R,
) -> Result<Vec<Vec<f64>>, EvolutionError> {
    let perturbation = Normal::new(0., config.mutation_sigma)
        .map_err(|e| EvolutionError::BadPopulationParameter(e.to_string()))?;
    let mut offsprings = Vec::with_capacity(offspring_count);

    while offsprings.len() < offspring_count {
        let (parent_1, parent_2) = select_parents(breeding_pool, config.tournament_size, rng)?;

        let mut child_weights = crossover(&parent_1.weights, &parent_2.weights, config.crossover_rate, rng);

        // Toss a coin per gene and stochastically mutate based on rate
        mutate(&mut child_weights, config.mutation_rate, &perturbation, rng);
        repair_weights(&mut child_weights);

        offsprings.push(child_weights);
    }
    Ok(offsprings)
}

fn select_parents<'a, R: Rng + ?Sized>(
    breeding_pool: &[&'a Individual],
    k: usize,
    rng: &mut R,
) -> Result<(&'a Individual, &'a Individual), EvolutionError> {
    let parent_1 = tournament_selection(breeding_pool, k, rng);
    let parent_2 = tournament_selection(breeding_pool, k, rng);
    match (parent_1, parent_2) {
        (Some(p1), Some(p2)) => Ok((p1, p2)),
        _ => Err(EvolutionError::Computation(format!(
            "Tournament selection found no contestants (k={k}, pool={}).",
            breeding_pool.len()
        ))),
    }
}

/// Picks `k` distinct contestants and returns the one winning
/// `Individual::selection_order`. `None` only for an empty pool or `k == 0`.
pub fn tournament_selection<'a, R: Rng + ?Sized>(
    breeding_pool: &[&'a Individual],
    k: usize,
    rng: &mut R,
) -> Option<&'a Individual> {
    breeding_pool
        .choose_multiple(rng, k)
        .copied()
        .min_by(|a, b| a.selection_order(b))
}

/// Blend crossover: each gene is `alpha·w1 + (1-alpha)·w2` with a fresh
/// `alpha` per gene. Without a crossover the child is a copy of the first parent.
pub fn crossover<R: Rng + ?Sized>(parent_1: &[f64], parent_2: &[f64], crossover_rate: f64, rng: &mut R) -> Vec<f64> {
    if !rng.gen_bool(crossover_rate) {
        return parent_1.to_vec();
    }
    parent_1
        .iter()
        .zip(parent_2.iter())
        .map(|(&weight_1, &weight_2)| {
            let alpha: f64 = rng.gen_range(0.0..1.0);
            alpha * weight_1 + (1.0 - alpha) * weight_2
        })
        .collect()
}

/// Adds `N(0, sigma)` noise to each gene with probability `mutation_rate`.
/// The result is not feasible until passed through `repair_weights`.
pub fn mutate<R: Rng + ?Sized>(weights: &mut [f64], mutation_rate: f64, perturbation: &Normal<f64>, rng: &mut R) {
    for weight in weights.iter_mut() {
        if rng.gen_bool(mutation_rate) {
            *weight += perturbation.sample(rng);
        }
    }
}

/// Orders a front so the entry nearest the ideal point comes first, ties by
/// fitness then id.
pub(crate) fn compare_by_distance(a: &(f64, &Individual), b: &(f64, &Individual)) -> Ordering {
    a.0.total_cmp(&b.0).then_with(|| a.1.fitness_order(b.1))
}
