// swarmloc_sim/examples/01_swarm_replay.rs

//! An end-to-end run of the swarm localizer on a synthetic swarm.
//!
//! This example demonstrates how to:
//! 1. Parse the command line and load a scenario TOML file.
//! 2. Install a `tracing` subscriber for the core and simulation logs.
//! 3. Replay the scenario through the localizer and print the run report.
//!
//! To run this example:
//! `cargo run --example 01_swarm_replay -- --scenario assets/scenarios/three_drones.toml`

use clap::Parser;
use tracing_subscriber::EnvFilter;

use swarmloc_sim::cli::Cli;
use swarmloc_sim::run_from_cli;

fn main() {
    // RUST_LOG wins over the default filter.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,swarmloc_core=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    match run_from_cli(&cli) {
        Ok(report) => {
            tracing::info!(ready = report.ready, cost = report.final_cost, "Scenario finished");
        }
        Err(e) => {
            tracing::error!("Scenario failed: {}", e);
            std::process::exit(1);
        }
    }
}
