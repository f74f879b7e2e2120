use rand::{rngs::OsRng, RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use tracing::{debug, info, warn};

use crate::evolution::individual::Individual;
use crate::evolution::portfolio_evolution::{
    best_individual, evaluate_population, generate_offsprings, initialize_population,
    pareto_evolution::{build_pareto_fronts, rank_by_ideal_point},
    validate_inputs, EvolutionError, EvolutionHooks, EvolutionInputs, EvolutionResult,
    EvolutionStrategy, FinalPopulationSummary, GenerationRecord, ParetoSolution,
    StandardEvolutionConfig,
};

/// Generational NSGA-style search with champion elitism.
///
/// Each generation: evaluate, sort into fronts, record history, then build the
/// next population from the champion, the best fronts (cut by crowding
/// distance) and tournament-bred offspring. All randomness comes from one
/// ChaCha20 stream, so a fixed seed reproduces the run exactly.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardParetoEvolution;

impl EvolutionStrategy for StandardParetoEvolution {
    type Config = StandardEvolutionConfig;

    fn evolve(
        &self,
        config: &StandardEvolutionConfig,
        inputs: &EvolutionInputs<'_>,
        hooks: &EvolutionHooks<'_>,
    ) -> Result<EvolutionResult, EvolutionError> {
        // Initialization Phase
        config.validate()?;
        validate_inputs(inputs)?;

        let population_size = config.population_size;
        let generations = config.generations;
        let policy = config.fitness_policy();
        let elite_population_size = config.elite_count();
        if elite_population_size >= population_size {
            return Err(EvolutionError::BadPopulationParameter(
                "Elite population size cannot be >= total population size.".into(),
            ));
        }
        let offspring_count = population_size - elite_population_size;

        let seed = config.global_seed.unwrap_or_else(|| OsRng.next_u64());
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        let cvar_model = config.cvar_model(inputs.returns.number_of_periods(), seed);

        let initial = initialize_population(
            population_size,
            inputs.risk_model.number_of_assets(),
            config.sampling_scheme,
            inputs.initial_weights,
            &mut rng,
        )?;
        let mut population: Vec<Individual> = evaluate_population(
            initial,
            inputs,
            &cvar_model,
            config.risk_free_rate,
            &policy,
        );

        let mut convergence_history: Vec<GenerationRecord> = Vec::new();
        let mut best_fitness_so_far = f64::NEG_INFINITY;
        let mut stale_generations = 0;
        let mut stopped_early = false;

        info!(
            population_size,
            generations,
            assets = inputs.risk_model.number_of_assets(),
            seed,
            "starting evolution"
        );

        let final_fronts = loop {
            let generation = convergence_history.len() + 1;

            // Generation boundary: the only place cancellation is observed.
            if hooks.is_cancelled() {
                warn!(generation, "evolution cancelled");
                return Err(EvolutionError::Cancelled {
                    generation: generation - 1,
                });
            }

            let fronts = build_pareto_fronts(population);
            let evaluated: Vec<&Individual> = fronts.iter().flatten().collect();
            let record = GenerationRecord::from_population(
                generation,
                &evaluated,
                fronts.first().map(Vec::len).unwrap_or(0),
            )
            .ok_or_else(|| EvolutionError::Computation("Population became empty.".into()))?;

            debug!(
                generation,
                best_fitness = record.best_fitness,
                best_return = record.best_return,
                best_risk = record.best_risk,
                front_size = record.front_size,
                "generation evaluated"
            );
            if let Some(on_generation) = hooks.on_generation {
                on_generation(&record, generations);
            }

            if record.best_fitness > best_fitness_so_far + config.early_stop_tolerance {
                stale_generations = 0;
            } else {
                stale_generations += 1;
            }
            best_fitness_so_far = best_fitness_so_far.max(record.best_fitness);
            convergence_history.push(record);

            if generation >= generations {
                break fronts;
            }
            if let Some(patience) = config.early_stop_patience {
                if stale_generations >= patience {
                    info!(generation, patience, "fitness plateaued, stopping early");
                    stopped_early = true;
                    break fronts;
                }
            }

            let mut next_generation: Vec<Vec<f64>> = Vec::with_capacity(population_size);

            // Champion first, so best fitness never regresses.
            let champion = best_individual(evaluated.iter().copied())
                .ok_or_else(|| EvolutionError::Computation("Population became empty.".into()))?;
            next_generation.push(champion.weights.clone());

            // Adding Elites (Exploitation)
            for front in fronts.iter() {
                if next_generation.len() >= elite_population_size {
                    break;
                }
                let needed = elite_population_size - next_generation.len();
                let mut candidates: Vec<&Individual> =
                    front.iter().filter(|i| i.id != champion.id).collect();
                if candidates.len() > needed {
                    // Partial front: keep the least crowded.
                    candidates.sort_by(|a, b| a.selection_order(b));
                    candidates.truncate(needed);
                }
                next_generation.extend(candidates.into_iter().map(|i| i.weights.clone()));
            }

            // Offspring (Exploration)
            let offsprings = generate_offsprings(&evaluated, offspring_count, config, &mut rng)?;
            next_generation.extend(offsprings);

            population = evaluate_population(
                next_generation,
                inputs,
                &cvar_model,
                config.risk_free_rate,
                &policy,
            );
        };

        let population: Vec<Individual> = final_fronts.iter().flatten().cloned().collect();
        let final_summary = FinalPopulationSummary::from_population(&population);

        let first_front = final_fronts
            .first()
            .ok_or_else(|| EvolutionError::Computation("No Pareto front was produced.".into()))?;
        let pareto_table: Vec<ParetoSolution> = rank_by_ideal_point(first_front)
            .into_iter()
            .take(config.pareto_table_size)
            .map(|(_, individual)| ParetoSolution::from(individual))
            .collect();
        let selected = pareto_table
            .first()
            .cloned()
            .ok_or_else(|| EvolutionError::Computation("Pareto front is empty.".into()))?;

        info!(
            generations_run = convergence_history.len(),
            stopped_early,
            selected_return = selected.ret,
            selected_risk = selected.risk,
            "evolution finished"
        );

        Ok(EvolutionResult {
            selected,
            pareto_table,
            generations_run: convergence_history.len(),
            convergence_history,
            stopped_early,
            seed,
            final_summary,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evolution::objective::RiskMeasure;
    use crate::evolution::portfolio_evolution::is_feasible;
    use crate::statistics::{CvarEstimator, ReturnMatrix, RiskModel};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn market() -> (RiskModel, ReturnMatrix) {
        let rows: Vec<Vec<f64>> = (0..120)
            .map(|t| {
                let t = t as f64;
                vec![
                    0.0012 + 0.025 * (t * 0.9).sin(),
                    0.0004 + 0.006 * (t * 1.7).cos(),
                    0.0008 + 0.015 * (t * 0.3).sin() * (t * 0.11).cos(),
                    -0.0002 + 0.02 * (t * 2.3).sin(),
                ]
            })
            .collect();
        let returns = ReturnMatrix::from_rows(&rows).unwrap();
        let model = RiskModel::from_returns(&returns, 252.).unwrap();
        (model, returns)
    }

    fn config(seed: u64) -> StandardEvolutionConfig {
        StandardEvolutionConfig {
            generations: 15,
            population_size: 30,
            global_seed: Some(seed),
            ..Default::default()
        }
    }

    #[test]
    fn test_every_exported_weight_vector_is_feasible() {
        let (model, returns) = market();
        let inputs = EvolutionInputs {
            risk_model: &model,
            returns: &returns,
            initial_weights: Some(&[0.25, 0.25, 0.25, 0.25]),
        };
        let result = StandardParetoEvolution
            .evolve(&config(1), &inputs, &EvolutionHooks::default())
            .unwrap();

        assert!(is_feasible(&result.selected.weights));
        assert!(result.selected.weights.iter().all(|w| *w >= 0.));
        for solution in result.pareto_table.iter() {
            assert!((solution.weights.iter().sum::<f64>() - 1.).abs() < 1e-3);
            assert!(solution.weights.iter().all(|w| *w >= 0.));
            assert_eq!(solution.rank, 1);
        }
        assert!(result.pareto_table.len() <= 20);
        assert_eq!(result.pareto_table[0], result.selected);
    }

    #[test]
    fn test_best_fitness_never_decreases() {
        let (model, returns) = market();
        for measure in [RiskMeasure::Volatility, RiskMeasure::Cvar, RiskMeasure::Blend] {
            let inputs = EvolutionInputs {
                risk_model: &model,
                returns: &returns,
                initial_weights: None,
            };
            let cfg = StandardEvolutionConfig {
                risk_measure: measure,
                elitism_rate: 0.,
                ..config(9)
            };
            let result = StandardParetoEvolution
                .evolve(&cfg, &inputs, &EvolutionHooks::default())
                .unwrap();

            assert_eq!(result.convergence_history.len(), 15);
            for pair in result.convergence_history.windows(2) {
                assert!(pair[1].best_fitness >= pair[0].best_fitness);
                assert_eq!(pair[1].generation, pair[0].generation + 1);
            }
        }
    }

    #[test]
    fn test_same_seed_same_selected_solution() {
        let (model, returns) = market();
        let inputs = EvolutionInputs {
            risk_model: &model,
            returns: &returns,
            initial_weights: None,
        };
        let a = StandardParetoEvolution
            .evolve(&config(42), &inputs, &EvolutionHooks::default())
            .unwrap();
        let b = StandardParetoEvolution
            .evolve(&config(42), &inputs, &EvolutionHooks::default())
            .unwrap();

        assert_eq!(a.selected, b.selected);
        assert_eq!(a.convergence_history, b.convergence_history);
        assert_eq!(a.seed, 42);
    }

    #[test]
    fn test_seeded_current_weights_bound_the_first_generation() {
        let (model, returns) = market();
        let current = [0.125, 0.5, 0.25, 0.125];
        let inputs = EvolutionInputs {
            risk_model: &model,
            returns: &returns,
            initial_weights: Some(&current),
        };
        let cfg = config(5);
        let result = StandardParetoEvolution
            .evolve(&cfg, &inputs, &EvolutionHooks::default())
            .unwrap();

        let policy = cfg.fitness_policy();
        let current_metrics = crate::statistics::evaluate_weights(
            &current,
            &model,
            &returns,
            &cfg.cvar_model(returns.number_of_periods(), 5),
            0.,
        );
        let current_fitness = policy.fitness(&current_metrics);
        let last = result.convergence_history.last().unwrap();
        assert!(last.best_fitness >= current_fitness);
    }

    #[test]
    fn test_bootstrap_cvar_run_is_reproducible() {
        let (model, returns) = market();
        let inputs = EvolutionInputs {
            risk_model: &model,
            returns: &returns,
            initial_weights: None,
        };
        let cfg = StandardEvolutionConfig {
            cvar_estimator: CvarEstimator::Bootstrap,
            bootstrap_simulations: 64,
            generations: 6,
            ..config(21)
        };
        let a = StandardParetoEvolution
            .evolve(&cfg, &inputs, &EvolutionHooks::default())
            .unwrap();
        let b = StandardParetoEvolution
            .evolve(&cfg, &inputs, &EvolutionHooks::default())
            .unwrap();
        assert_eq!(a.selected, b.selected);

        // The reported CVaR is the bootstrap figure, not the sqrt(252) one.
        let cvar_model = cfg.cvar_model(returns.number_of_periods(), 21);
        let daily = returns.portfolio_daily_returns(&a.selected.weights);
        assert_eq!(a.selected.cvar, cvar_model.annual_cvar(&daily));
    }

    #[test]
    fn test_early_stop_with_patience() {
        let (model, returns) = market();
        let inputs = EvolutionInputs {
            risk_model: &model,
            returns: &returns,
            initial_weights: None,
        };
        let cfg = StandardEvolutionConfig {
            generations: 500,
            early_stop_patience: Some(3),
            early_stop_tolerance: 1.,
            ..config(2)
        };
        let result = StandardParetoEvolution
            .evolve(&cfg, &inputs, &EvolutionHooks::default())
            .unwrap();

        // The first generation always improves on -inf, every later one is
        // within the (huge) tolerance.
        assert!(result.stopped_early);
        assert_eq!(result.generations_run, 4);
    }

    #[test]
    fn test_cancellation_is_observed_at_generation_boundary() {
        let (model, returns) = market();
        let inputs = EvolutionInputs {
            risk_model: &model,
            returns: &returns,
            initial_weights: None,
        };
        let cancel = AtomicBool::new(false);
        let seen = AtomicUsize::new(0);
        let on_generation = |record: &GenerationRecord, _total: usize| {
            seen.store(record.generation, Ordering::SeqCst);
            if record.generation == 3 {
                cancel.store(true, Ordering::SeqCst);
            }
        };
        let hooks = EvolutionHooks {
            cancel_flag: Some(&cancel),
            on_generation: Some(&on_generation),
        };

        let result = StandardParetoEvolution.evolve(&config(8), &inputs, &hooks);
        assert_eq!(result, Err(EvolutionError::Cancelled { generation: 3 }));
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_insufficient_data_fails_before_any_generation() {
        let returns = ReturnMatrix::from_rows(&[vec![0.01, 0.02], vec![0.0, 0.01]]).unwrap();
        let model = RiskModel::new(
            nalgebra::DVector::from_vec(vec![0.1, 0.1]),
            nalgebra::DMatrix::from_row_slice(2, 2, &[0.04, 0., 0., 0.04]),
        )
        .unwrap();
        let inputs = EvolutionInputs {
            risk_model: &model,
            returns: &returns,
            initial_weights: None,
        };
        let seen = AtomicUsize::new(0);
        let on_generation = |_: &GenerationRecord, _: usize| {
            seen.fetch_add(1, Ordering::SeqCst);
        };
        let hooks = EvolutionHooks {
            cancel_flag: None,
            on_generation: Some(&on_generation),
        };

        let result = StandardParetoEvolution.evolve(&config(1), &inputs, &hooks);
        assert!(matches!(result, Err(EvolutionError::InsufficientData(_))));
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }
}
