mod args;

pub use args::{Cli, Command, Format, StateCommand};

use std::process::ExitCode;
use std::sync::Arc;

use color_eyre::eyre::{Result, WrapErr, eyre};
use tokio_util::sync::CancellationToken;

use args::{DeclarationArgs, GlobalArgs};
use groundwork::context::RunContext;
use groundwork::declaration;
use groundwork::executor::{ExecuteOptions, Executor, RunStatus};
use groundwork::output;
use groundwork::providers::{self, ProviderRegistry, ProviderSettings};
use groundwork::resource::{ResourceDecl, ResourceId};
use groundwork::state::{FileStateStore, StateStore};

const EXIT_PARTIAL: u8 = 2;

pub async fn run(cli: Cli, cancel: CancellationToken) -> Result<ExitCode> {
    let global = &cli.global;
    match &cli.command {
        Command::Plan(args) => {
            let context = prepare(global, &args.declarations, ExecuteOptions::default())?;
            print_plan(&context, args.format);
            Ok(ExitCode::SUCCESS)
        }
        Command::Apply(args) => {
            let context = prepare(global, &args.plan.declarations, args.engine.options())?;
            execute(global, context, args.plan.format, &cancel).await
        }
        Command::Destroy(args) => {
            let store = open_store(global)?;
            let context = RunContext::destroy(store, args.engine.options())?;
            execute(global, context, args.format, &cancel).await
        }
        Command::Refresh => refresh(global).await,
        Command::Graph(args) => {
            let graph = groundwork::graph::ResourceGraph::build(load(&args.declarations)?)?;
            match args.format {
                Format::Human => print!("{}", output::graph_tree(&graph)),
                Format::Json => {
                    let edges: Vec<_> = graph
                        .edges()
                        .into_iter()
                        .map(|(from, to)| serde_json::json!({ "from": from.to_string(), "to": to.to_string() }))
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&edges)?);
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::State { command } => state(global, command),
    }
}

fn load(args: &DeclarationArgs) -> Result<Vec<ResourceDecl>> {
    let overrides = args
        .vars
        .iter()
        .map(|raw| declaration::parse_override(raw))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(declaration::load(&args.file, &overrides)?)
}

fn open_store(global: &GlobalArgs) -> Result<Arc<dyn StateStore>> {
    let store = FileStateStore::open(&global.state)
        .wrap_err_with(|| format!("failed to open state at {}", global.state.display()))?;
    Ok(Arc::new(store))
}

fn prepare(global: &GlobalArgs, declarations: &DeclarationArgs, options: ExecuteOptions) -> Result<RunContext> {
    let decls = load(declarations)?;
    let store = open_store(global)?;
    Ok(RunContext::prepare(decls, store, options)?)
}

fn registry(global: &GlobalArgs) -> Result<ProviderRegistry> {
    let settings = ProviderSettings {
        endpoint: global.endpoint.clone(),
        token: global.token.clone(),
    };
    let provider = providers::get_provider(&global.provider, &settings)?;
    Ok(ProviderRegistry::new().with(provider))
}

fn print_plan(context: &RunContext, format: Format) {
    match format {
        Format::Human => print!("{}", output::plan_text(&context.plan)),
        Format::Json => println!("{:#}", output::plan_json(&context.plan)),
    }
}

async fn execute(
    global: &GlobalArgs,
    context: RunContext,
    format: Format,
    cancel: &CancellationToken,
) -> Result<ExitCode> {
    if format == Format::Human {
        print_plan(&context, format);
    }
    if !context.plan.has_changes() {
        match format {
            Format::Human => println!("No changes. Recorded state matches the declarations."),
            Format::Json => print_plan(&context, format),
        }
        return Ok(ExitCode::SUCCESS);
    }

    let executor = Executor::new(registry(global)?);
    let report = executor.apply(&context, cancel).await?;

    match format {
        Format::Human => print!("{}", output::report_table(&report)),
        Format::Json => println!(
            "{:#}",
            serde_json::json!({
                "plan": output::plan_json(&context.plan),
                "report": output::report_json(&report),
            })
        ),
    }

    Ok(match report.status {
        RunStatus::Success => ExitCode::SUCCESS,
        RunStatus::PartialFailure | RunStatus::Cancelled => ExitCode::from(EXIT_PARTIAL),
    })
}

async fn refresh(global: &GlobalArgs) -> Result<ExitCode> {
    let store = open_store(global)?;
    let registry = registry(global)?;
    let mut failures = 0;

    for record in store.list()? {
        let Some(provider) = registry.provider_for(&record.id.resource_type) else {
            tracing::warn!(resource = %record.id, "no provider for recorded resource, leaving it untouched");
            failures += 1;
            continue;
        };
        match provider.read(&record.id, &record.provider_id).await {
            Ok(Some(response)) => {
                let (provider_id, outputs) = response.into_outputs();
                if provider_id != record.provider_id || outputs != record.outputs {
                    tracing::info!(resource = %record.id, "refreshed");
                    store.put(groundwork::state::StateRecord {
                        provider_id,
                        outputs,
                        ..record
                    })?;
                }
            }
            Ok(None) => {
                tracing::warn!(resource = %record.id, provider_id = %record.provider_id, "gone remotely, forgetting it");
                store.delete(&record.id)?;
            }
            Err(e) => {
                tracing::error!(resource = %record.id, error = %e, "refresh failed");
                failures += 1;
            }
        }
    }

    println!("Refreshed {} with {} failure(s).", global.state.display(), failures);
    Ok(if failures == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_PARTIAL)
    })
}

fn state(global: &GlobalArgs, command: &StateCommand) -> Result<ExitCode> {
    let store = open_store(global)?;
    match command {
        StateCommand::List => print!("{}", output::state_table(&store.list()?)),
        StateCommand::Show { address } => {
            let id: ResourceId = address.parse()?;
            let record = store
                .get(&id)?
                .ok_or_else(|| eyre!("{} is not in state", id))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        StateCommand::Rm { address } => {
            let id: ResourceId = address.parse()?;
            if store.get(&id)?.is_none() {
                return Err(eyre!("{} is not in state", id));
            }
            store.delete(&id)?;
            tracing::warn!(resource = %id, "removed from state; the remote object was not deleted");
            println!("Removed {}.", id);
        }
    }
    Ok(ExitCode::SUCCESS)
}
