use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "maestro")]
#[command(version)]
#[command(about = "Declarative infrastructure reconciliation: plan, apply, converge", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Show the changes required to reach the desired state
    Plan(PlanArgs),

    /// Apply the changes required to reach the desired state
    Apply(ApplyArgs),

    /// Destroy all managed infrastructure
    Destroy(DestroyArgs),

    /// Update state to match the real infrastructure
    Refresh(CommonArgs),

    /// Check configuration for errors without touching providers
    Validate(CommonArgs),

    /// Read output values from the state
    Output(OutputArgs),

    /// Inspect and modify the state
    #[command(subcommand)]
    State(StateCommand),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args)]
pub struct CommonArgs {
    /// Path to the configuration document
    #[arg(long, default_value = "main.mstro.json")]
    pub config: PathBuf,

    /// Path to the state file
    #[arg(long = "state", default_value = "maestro.mstate")]
    pub state: PathBuf,

    /// Set an input variable, NAME=VALUE (repeatable)
    #[arg(long = "var", value_name = "NAME=VALUE")]
    pub vars: Vec<String>,

    /// Read input variables from a JSON file
    #[arg(long = "var-file", value_name = "PATH")]
    pub var_file: Option<PathBuf>,

    /// Limit the operation to a resource, instance, or module address
    /// and its dependencies (repeatable)
    #[arg(long = "target", value_name = "ADDR")]
    pub targets: Vec<String>,

    /// Maximum number of concurrent operations
    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u16).range(1..=256))]
    pub parallelism: u16,

    /// Hold the state lock for the duration of the operation
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, value_name = "true|false")]
    pub lock: bool,

    /// How long to wait for the state lock, e.g. 10s or 2m
    #[arg(long = "lock-timeout", default_value = "10s", value_name = "DURATION")]
    pub lock_timeout: String,
}

#[derive(Args)]
pub struct PlanArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Write the plan to a file for a later apply
    #[arg(long, value_name = "PATH")]
    pub out: Option<PathBuf>,

    /// Plan the destruction of all managed infrastructure
    #[arg(long)]
    pub destroy: bool,
}

#[derive(Args)]
pub struct ApplyArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Skip the interactive confirmation
    #[arg(long)]
    pub auto_approve: bool,

    /// A plan file produced by plan -out, applied without replanning
    pub plan_file: Option<PathBuf>,
}

#[derive(Args)]
pub struct DestroyArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Skip the interactive confirmation
    #[arg(long)]
    pub auto_approve: bool,
}

#[derive(Args)]
pub struct OutputArgs {
    /// Path to the state file
    #[arg(long = "state", default_value = "maestro.mstate")]
    pub state: PathBuf,

    /// Print as JSON
    #[arg(long)]
    pub json: bool,

    /// Print only this output
    pub name: Option<String>,
}

#[derive(Subcommand)]
pub enum StateCommand {
    /// List resource instances recorded in the state
    List {
        #[arg(long = "state", default_value = "maestro.mstate")]
        state: PathBuf,
    },

    /// Show the attributes of one instance
    Show {
        #[arg(long = "state", default_value = "maestro.mstate")]
        state: PathBuf,
        /// Instance address, e.g. test_instance.web[0]
        addr: String,
    },

    /// Remove instances from the state without destroying them
    Rm {
        #[arg(long = "state", default_value = "maestro.mstate")]
        state: PathBuf,
        /// Resource or instance address
        addr: String,
    },
}
