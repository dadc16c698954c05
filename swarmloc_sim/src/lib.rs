// swarmloc_sim/src/lib.rs

// This prelude is for convenience for other files WITHIN the swarmloc_sim crate.
pub mod prelude;

// This module contains all the simulation-specific logic.
pub mod cli;
pub mod config;
pub mod error;
pub mod report;
pub mod scenario;
pub mod serde_helpers;

use crate::prelude::*;

/// Loads the scenario named by the CLI, runs it and writes the requested outputs.
pub fn run_from_cli(cli: &Cli) -> Result<RunReport, SimError> {
    let mut config = ScenarioConfig::load(&cli.scenario)?;
    if let Some(seed) = cli.seed {
        config = config.with_seed(seed);
    }

    let mut runner = ScenarioRunner::new(config)?;
    let report = runner.run()?;

    if let Some(path) = &cli.dot {
        runner.write_pose_graph_dot(path)?;
    }
    match &cli.report {
        Some(path) => report.write(path)?,
        None => println!("{}", report.to_toml()?),
    }
    Ok(report)
}
