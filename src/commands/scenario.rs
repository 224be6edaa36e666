use std::path::Path;

use anyhow::{Context, Result};

use packplane::config::Config;
use packplane::scenario::{ScenarioKind, ScenarioRunner};

pub fn list() -> Result<()> {
    println!("{:<34} DESCRIPTION", "NAME");
    println!("{}", "-".repeat(100));
    for kind in ScenarioKind::all() {
        println!("{:<34} {}", kind.name(), kind.description());
    }
    println!("\nTotal: {} scenarios", ScenarioKind::all().len());
    Ok(())
}

pub async fn run_one(
    config_path: Option<&Path>,
    name: &str,
    time_compression: u64,
    seed: Option<u64>,
) -> Result<()> {
    let Some(kind) = ScenarioKind::by_name(name) else {
        let available: Vec<&str> = ScenarioKind::all().iter().map(|k| k.name()).collect();
        anyhow::bail!(
            "Unknown scenario '{}'. Available scenarios: {}",
            name,
            available.join(", ")
        );
    };

    let mut config = Config::load(config_path).context("Failed to load configuration")?;
    if let Some(seed) = seed {
        config.chaos_seed = seed;
    }
    let config = config.accelerated(time_compression);

    println!("Running scenario '{}' (time compression {time_compression}x)...\n", kind.name());
    println!("  {}", kind.description());
    println!();

    let runner = ScenarioRunner::new(config);
    let outcome = runner.run(kind).await?;

    for step in &outcome.steps {
        let marker = if step.passed { "  OK  " } else { " FAIL " };
        match &step.detail {
            Some(detail) => println!("[{marker}] {} ({detail})", step.description),
            None => println!("[{marker}] {}", step.description),
        }
    }
    println!();

    if outcome.passed {
        println!("Scenario '{}' PASSED ({} steps)", outcome.scenario, outcome.steps.len());
        Ok(())
    } else {
        let failed = outcome.steps.iter().filter(|s| !s.passed).count();
        anyhow::bail!(
            "Scenario '{}' FAILED ({failed}/{} steps failed)",
            outcome.scenario,
            outcome.steps.len()
        )
    }
}

pub async fn run(config_path: Option<&Path>, action: crate::cli::ScenarioAction) -> Result<()> {
    match action {
        crate::cli::ScenarioAction::List => list(),
        crate::cli::ScenarioAction::Run { name, time_compression, seed } => {
            run_one(config_path, &name, time_compression, seed).await
        }
    }
}
