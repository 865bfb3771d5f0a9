use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};

use groundwork::executor::ExecuteOptions;

#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::Args, Debug)]
pub struct GlobalArgs {
    /// State file recording what has been created
    #[arg(long, global = true, env = "GROUNDWORK_STATE", default_value = "groundwork.state.json")]
    pub state: PathBuf,

    /// Provider that performs remote calls (simulated or rest)
    #[arg(long, global = true, env = "GROUNDWORK_PROVIDER", default_value = "simulated")]
    pub provider: String,

    #[arg(long, global = true, env = "GROUNDWORK_ENDPOINT")]
    pub endpoint: Option<String>,

    #[arg(long, global = true, env = "GROUNDWORK_TOKEN", hide_env_values = true)]
    pub token: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show what apply would change
    Plan(PlanArgs),
    /// Create, update and delete resources to match the declarations
    Apply(ApplyArgs),
    /// Delete every recorded resource
    Destroy(DestroyArgs),
    /// Re-read recorded resources from the provider
    Refresh,
    /// Print the dependency graph
    Graph(GraphArgs),
    /// Inspect or edit recorded state
    State {
        #[command(subcommand)]
        command: StateCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum StateCommand {
    List,
    Show { address: String },
    /// Forget a resource without deleting it remotely
    Rm { address: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Human,
    Json,
}

#[derive(clap::Args, Debug)]
pub struct DeclarationArgs {
    /// Declaration document
    #[arg(short, long, default_value = "groundwork.json")]
    pub file: PathBuf,

    /// Variable override, may be repeated
    #[arg(long = "var", value_name = "NAME=VALUE")]
    pub vars: Vec<String>,
}

#[derive(clap::Args, Debug)]
pub struct PlanArgs {
    #[command(flatten)]
    pub declarations: DeclarationArgs,

    #[arg(long, value_enum, default_value_t = Format::Human)]
    pub format: Format,
}

#[derive(clap::Args, Debug)]
pub struct EngineArgs {
    /// Maximum concurrent provider operations
    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..))]
    pub parallelism: u64,

    /// Abort a single provider operation after this many seconds
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Retries for transient provider errors
    #[arg(long, default_value_t = 2)]
    pub retries: u32,

    /// Initial retry backoff in milliseconds, doubled per retry
    #[arg(long, default_value_t = 500)]
    pub backoff_ms: u64,
}

impl EngineArgs {
    pub fn options(&self) -> ExecuteOptions {
        ExecuteOptions {
            parallelism: usize::try_from(self.parallelism).unwrap_or(usize::MAX),
            operation_timeout: self.timeout_secs.map(Duration::from_secs),
            max_retries: self.retries,
            retry_backoff: Duration::from_millis(self.backoff_ms),
            ..ExecuteOptions::default()
        }
    }
}

#[derive(clap::Args, Debug)]
pub struct ApplyArgs {
    #[command(flatten)]
    pub plan: PlanArgs,

    #[command(flatten)]
    pub engine: EngineArgs,
}

#[derive(clap::Args, Debug)]
pub struct DestroyArgs {
    #[arg(long, value_enum, default_value_t = Format::Human)]
    pub format: Format,

    #[command(flatten)]
    pub engine: EngineArgs,
}

#[derive(clap::Args, Debug)]
pub struct GraphArgs {
    #[command(flatten)]
    pub declarations: DeclarationArgs,

    #[arg(long, value_enum, default_value_t = Format::Human)]
    pub format: Format,
}
