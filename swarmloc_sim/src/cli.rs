// swarmloc_sim/src/cli.rs

use clap::Parser;
use std::path::PathBuf;

/// Swarmloc: replays a synthetic drone swarm through the swarm localizer.
///
/// This struct defines the command-line arguments that can be passed to any
/// binary application that uses the swarmloc simulation library.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// The path to the scenario TOML file to run.
    #[arg(short, long, default_value = "assets/scenarios/three_drones.toml")]
    pub scenario: PathBuf,

    /// Overrides the seed of both the scenario and the restart search.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Writes the final pose graph as Graphviz DOT.
    #[arg(long)]
    pub dot: Option<PathBuf>,

    /// Writes the run report as TOML instead of printing it.
    #[arg(long)]
    pub report: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults_and_overrides() {
        let cli = Cli::parse_from(["swarmloc"]);
        assert_eq!(cli.scenario, PathBuf::from("assets/scenarios/three_drones.toml"));
        assert!(cli.seed.is_none());

        let cli = Cli::parse_from(["swarmloc", "-s", "x.toml", "--seed", "4", "--dot", "g.dot"]);
        assert_eq!(cli.scenario, PathBuf::from("x.toml"));
        assert_eq!(cli.seed, Some(4));
        assert_eq!(cli.dot, Some(PathBuf::from("g.dot")));
        assert!(cli.report.is_none());
    }
}
