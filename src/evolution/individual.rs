use std::cmp::Ordering;

use crate::consts::NUMBER_OF_OPTIMIZATION_OBJECTIVES;
use crate::evolution::objective::FitnessPolicy;
use crate::statistics::PortfolioMetrics;

/// One evaluated weight vector inside a generation.
///
/// `id` is the individual's index in its generation and is the final
/// tie-breaker everywhere an ordering is needed, which keeps seeded runs
/// reproducible.
#[derive(Debug, Clone)]
pub struct Individual {
    pub id: usize,
    pub rank: Option<usize>,
    pub crowding_distance: Option<f64>,
    pub weights: Vec<f64>,
    pub metrics: PortfolioMetrics,
    pub risk: f64,
    pub fitness: f64,
    pub scores: [f64; NUMBER_OF_OPTIMIZATION_OBJECTIVES],
}

impl Individual {
    pub fn new(id: usize, weights: Vec<f64>, metrics: PortfolioMetrics, policy: &FitnessPolicy) -> Self {
        // Non-finite figures sink to the bottom of every ordering.
        let finite_or_worst = |v: f64| if v.is_finite() { v } else { f64::NEG_INFINITY };
        let scores = policy.scores(&metrics).map(finite_or_worst);
        Individual {
            id,
            rank: None,
            crowding_distance: None,
            weights,
            metrics,
            risk: policy.risk(&metrics),
            fitness: finite_or_worst(policy.fitness(&metrics)),
            scores,
        }
    }

    pub fn is_dominated_by(&self, other: &Individual) -> bool {
        let other_is_at_least_as_good_in_all = self
            .scores
            .iter()
            .zip(other.scores.iter())
            .all(|(mine, theirs)| theirs >= mine);

        let other_is_strictly_better_in_one = self
            .scores
            .iter()
            .zip(other.scores.iter())
            .any(|(mine, theirs)| theirs > mine);

        other_is_at_least_as_good_in_all && other_is_strictly_better_in_one
    }

    /// Tournament order: lower rank, then larger crowding distance, then
    /// higher fitness, then lower id. `Less` means "wins".
    pub fn selection_order(&self, other: &Individual) -> Ordering {
        let rank = |i: &Individual| i.rank.unwrap_or(usize::MAX);
        let crowding = |i: &Individual| i.crowding_distance.unwrap_or(f64::NEG_INFINITY);
        rank(self)
            .cmp(&rank(other))
            .then_with(|| crowding(other).total_cmp(&crowding(self)))
            .then_with(|| self.fitness_order(other))
    }

    /// Higher fitness first, ties by lower id.
    pub fn fitness_order(&self, other: &Individual) -> Ordering {
        other
            .fitness
            .total_cmp(&self.fitness)
            .then_with(|| self.id.cmp(&other.id))
    }
}
