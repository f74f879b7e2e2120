use std::collections::HashSet;

use rayon::prelude::*;
use tracing::warn;

use crate::consts::NUMBER_OF_OPTIMIZATION_OBJECTIVES;
use crate::evolution::individual::Individual;
use crate::evolution::portfolio_evolution::compare_by_distance;

mod standard_pareto;

pub use standard_pareto::StandardParetoEvolution;

/// Finds the indices of non-dominated individuals within a slice.
///
/// An individual is non-dominated if no other individual in the slice
/// dominates it (see `Individual::is_dominated_by`).
///
/// # Returns
/// Indices relative to the input slice, in ascending order.
///
/// # Complexity
/// O(N^2) comparisons, parallelized over the outer loop.
pub fn find_non_dominated_indices(individuals: &[Individual]) -> Vec<usize> {
    if individuals.is_empty() {
        return vec![];
    }

    individuals
        .par_iter()
        .enumerate()
        .filter(|(i, individual_a)| {
            let is_dominated = individuals
                .iter()
                .enumerate()
                .any(|(j, individual_b)| *i != j && individual_a.is_dominated_by(individual_b));
            !is_dominated
        })
        .map(|(i, _)| i)
        .collect()
}

/// Crowding distance over both objective scores. Boundary individuals of each
/// objective get an infinite distance; the front is left ordered by id.
pub fn calculate_and_update_crowding_distance(front: &mut [Individual]) {
    if front.is_empty() {
        return;
    }

    front
        .iter_mut()
        .for_each(|individual| individual.crowding_distance = Some(0.0));

    let last_index = front.len() - 1;
    for objective_idx in 0..NUMBER_OF_OPTIMIZATION_OBJECTIVES {
        front.sort_by(|a, b| {
            a.scores[objective_idx]
                .total_cmp(&b.scores[objective_idx])
                .then_with(|| a.id.cmp(&b.id))
        });

        front[0].crowding_distance = Some(f64::INFINITY);
        front[last_index].crowding_distance = Some(f64::INFINITY);

        let range = front[last_index].scores[objective_idx] - front[0].scores[objective_idx];
        if range > 0.0 && range.is_finite() {
            for i in 1..last_index {
                let previous = front[i - 1].scores[objective_idx];
                let next = front[i + 1].scores[objective_idx];
                let current_distance = front[i].crowding_distance.unwrap_or(0.0);
                front[i].crowding_distance = Some(current_distance + (next - previous) / range);
            }
        }
    }

    front.sort_by_key(|individual| individual.id);
}

/// Partitions a population into ranked fronts (rank 1 = non-dominated),
/// assigning `rank` and `crowding_distance` on every individual.
pub fn build_pareto_fronts(individuals: Vec<Individual>) -> Vec<Vec<Individual>> {
    let mut fronts: Vec<Vec<Individual>> = Vec::new();
    let mut remaining = individuals;

    let mut current_front_rank = 1;
    while !remaining.is_empty() {
        let non_dominated: HashSet<usize> =
            find_non_dominated_indices(&remaining).into_iter().collect();

        if non_dominated.is_empty() {
            // Unreachable for a strict partial order; keep the rest as one final front.
            warn!(
                remaining = remaining.len(),
                "found no non-dominated individuals, closing the sort"
            );
            remaining
                .iter_mut()
                .for_each(|individual| individual.rank = Some(current_front_rank));
            calculate_and_update_crowding_distance(&mut remaining);
            fronts.push(remaining);
            break;
        }

        let (front, rest): (Vec<(usize, Individual)>, Vec<(usize, Individual)>) = remaining
            .into_iter()
            .enumerate()
            .partition(|(idx, _)| non_dominated.contains(idx));

        let mut front: Vec<Individual> = front
            .into_iter()
            .map(|(_, mut individual)| {
                individual.rank = Some(current_front_rank);
                individual
            })
            .collect();
        calculate_and_update_crowding_distance(&mut front);

        fronts.push(front);
        remaining = rest.into_iter().map(|(_, individual)| individual).collect();
        current_front_rank += 1;
    }

    fronts
}

/// Normalized Euclidean distance of every front member to the ideal point
/// (best observed value of each objective across the front), nearest first.
///
/// Objectives whose range over the front is zero contribute nothing.
pub fn rank_by_ideal_point(front: &[Individual]) -> Vec<(f64, &Individual)> {
    let mut ideal = [f64::NEG_INFINITY; NUMBER_OF_OPTIMIZATION_OBJECTIVES];
    let mut nadir = [f64::INFINITY; NUMBER_OF_OPTIMIZATION_OBJECTIVES];
    for individual in front.iter() {
        for k in 0..NUMBER_OF_OPTIMIZATION_OBJECTIVES {
            ideal[k] = ideal[k].max(individual.scores[k]);
            nadir[k] = nadir[k].min(individual.scores[k]);
        }
    }

    let mut ranked: Vec<(f64, &Individual)> = front
        .iter()
        .map(|individual| {
            let squared: f64 = (0..NUMBER_OF_OPTIMIZATION_OBJECTIVES)
                .map(|k| {
                    let range = ideal[k] - nadir[k];
                    if range > 0. && range.is_finite() {
                        ((ideal[k] - individual.scores[k]) / range).powi(2)
                    } else {
                        0.
                    }
                })
                .sum();
            (squared.sqrt(), individual)
        })
        .collect();
    ranked.sort_by(compare_by_distance);
    ranked
}
