use std::{fs::File, io::Write, path::PathBuf, sync::Arc, time::Duration, time::Instant};

use aegis_optimizer::application::apply_optimized_weights;
use aegis_optimizer::config::{Dataset, OptimizationRequest, ServiceConfig};
use aegis_optimizer::jobs::{JobStatus, OptimizationController};
use aegis_optimizer::portfolio::PortfolioStore;
use anyhow::{anyhow, bail, Context};
use clap::Parser;
use tokio::task;
use tracing_subscriber::EnvFilter;

/// Runs one optimization over a JSON dataset and writes the report to disk.
#[derive(Parser, Debug)]
#[command(name = "script", version)]
struct Args {
    /// Dataset with `portfolios` and `prices` (see `Dataset`).
    #[arg(long)]
    dataset: PathBuf,
    #[arg(long, default_value_t = 1)]
    portfolio: u64,
    /// JSON file holding an `OptimizationRequest`; flags below override it.
    #[arg(long)]
    request: Option<PathBuf>,
    #[arg(long)]
    generations: Option<usize>,
    #[arg(long)]
    population: Option<usize>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long, default_value = "optimization_report.json")]
    output: PathBuf,
    /// Apply the optimized weights to the portfolio and save the dataset.
    #[arg(long)]
    apply: bool,
    /// Where `--apply` saves the updated dataset; defaults to `--dataset`.
    #[arg(long, requires = "apply")]
    apply_output: Option<PathBuf>,
    /// Most recent price days held out and replayed as a backtest.
    #[arg(long)]
    projection_days: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();
    let args = Args::parse();

    let config = ServiceConfig::from_env()?;
    let mut dataset = Dataset::from_json_file(&args.dataset)?;
    let (prices, store) = dataset
        .clone()
        .into_collaborators(config.market_suffixes.clone());
    let controller = OptimizationController::new(Arc::new(prices), Arc::new(store), config.clone());

    let mut request = match &args.request {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading request file {}", path.display()))?;
            serde_json::from_str::<OptimizationRequest>(&raw)?
        }
        None => OptimizationRequest::default(),
    };
    if let Some(generations) = args.generations {
        request.generations = generations;
    }
    if let Some(population) = args.population {
        request.population_size = population;
    }
    if args.seed.is_some() {
        request.seed = args.seed;
    }
    if let Some(days) = args.projection_days {
        request.projection_days = days;
    }

    println!("Optimizing portfolio {}: ", args.portfolio);
    let start = Instant::now();
    let job_id = controller.start(args.portfolio, request)?;

    let mut last_progress = None;
    let progress = loop {
        let progress = controller.poll_progress(job_id)?;
        if last_progress != Some(progress.progress) {
            println!("[{:>3}%] {}", progress.progress, progress.message);
            last_progress = Some(progress.progress);
        }
        if progress.status.is_terminal() {
            break progress;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    };
    if progress.status != JobStatus::Completed {
        bail!("optimization {job_id} ended as {:?}: {}", progress.status, progress.message);
    }

    let report = controller.result(job_id)?;
    let json = serde_json::to_string_pretty(report.as_ref())?;
    let output = args.output.clone();
    task::spawn_blocking(move || {
        let mut f = File::create(&output)?;
        f.write_all(json.as_bytes())?;
        Ok::<_, std::io::Error>(())
    })
    .await??;

    println!(
        "→ return {:.4} → {:.4}, risk {:.4} → {:.4}, best_sharpe = {:.4}, pop_avg_sharpe = {:.4}",
        report.original_return,
        report.optimized_return,
        report.original_risk,
        report.optimized_risk,
        report.final_summary.best_sharpe,
        report.final_summary.population_average_sharpe
    );
    for weight in report.optimized_weights.iter() {
        println!("   {:<12} {:>7.2}%", weight.ticker, weight.weight);
    }
    if let Some(backtest) = &report.backtest {
        println!(
            "Backtest {} → {}: cumulative {:+.2}% vs {:+.2}%, sharpe {:.3} vs {:.3}",
            backtest.start_date,
            backtest.end_date,
            backtest.optimized.cumulative_return * 100.,
            backtest.original.cumulative_return * 100.,
            backtest.optimized.sharpe,
            backtest.original.sharpe
        );
    }
    println!("Report written to {}", args.output.display());

    if args.apply {
        let applied = apply_optimized_weights(
            controller.store().as_ref(),
            args.portfolio,
            &report.optimized_weights,
            &config.market_suffixes,
        )
        .await?;
        println!(
            "Applied weights: {} updated, {} skipped, {} failed",
            applied.updated_count,
            applied.skipped,
            applied.failures.len()
        );
        for failure in applied.failures.iter() {
            println!("   {} failed: {}", failure.ticker, failure.reason);
        }

        let updated = controller
            .store()
            .get_portfolio(args.portfolio)
            .await
            .map_err(|e| anyhow!("re-reading portfolio {}: {e}", args.portfolio))?;
        dataset.upsert_portfolio(updated);
        let target = args.apply_output.clone().unwrap_or_else(|| args.dataset.clone());
        let written = target.clone();
        task::spawn_blocking(move || dataset.write_json_file(&written)).await??;
        println!("Dataset saved to {}", target.display());
    }

    println!("Total time: {:.2?}", start.elapsed());
    Ok(())
}
