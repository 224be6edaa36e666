use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "packplane")]
#[command(about = "Workload orchestration control plane for pack deployments")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Path to a YAML config file; environment variables override it
    #[arg(long, global = true, env = "PACKPLANE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Display application version
    Version,

    /// Print the effective configuration as YAML
    Config,

    /// Run the control plane and the admin HTTP surface
    Serve {
        /// Admin listen address (overrides config)
        #[arg(long)]
        addr: Option<String>,
    },

    /// Declarative chaos scenarios
    Scenario {
        #[command(subcommand)]
        action: ScenarioAction,
    },
}

#[derive(Subcommand)]
pub enum ScenarioAction {
    /// List the available scenarios
    List,

    /// Run one scenario to completion with compressed timing
    Run {
        /// Scenario name from `scenario list`
        name: String,

        /// Divide every timing constant by this factor
        #[arg(long, default_value_t = 100)]
        time_compression: u64,

        /// Chaos PRNG seed
        #[arg(long)]
        seed: Option<u64>,
    },
}
