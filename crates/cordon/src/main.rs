use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser};
use serde_json::{Map, Value};

use cordon_runtime::{RuntimeConfig, SessionRuntime};
use cordon_store::{SessionId, SessionStore, StoreOptions};
use cordon_worker::{locate_workerd, ProcessWorkerFactory};

#[derive(Parser)]
#[command(name = "cordon")]
#[command(about = "Session-isolated execution runtime.", long_about = None)]
#[command(version)]
struct Cli {
    /// Session store root directory.
    #[arg(long, value_name = "PATH", default_value = ".sessions", global = true)]
    root: PathBuf,

    /// Worker guest binary (defaults to CORDON_WORKERD_BIN or a sibling of
    /// this executable).
    #[arg(long, value_name = "PATH", global = true)]
    workerd: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Manage sessions.
    Session(SessionArgs),
    /// Deploy a contract into a session.
    Deploy(DeployArgs),
    /// Invoke a contract function.
    Call(CallArgs),
    /// List deployed contracts.
    Contracts(SessionRef),
    /// Show export metadata for one contract.
    Exports(ContractRef),
    /// Show one contract's source and exports.
    Details(ContractRef),
    /// Inspect or mutate session state.
    State(StateArgs),
    /// Inspect or mutate the execution environment.
    Env(EnvArgs),
    /// Show persisted UI state.
    Ui(SessionRef),
}

#[derive(Args)]
struct SessionArgs {
    #[command(subcommand)]
    cmd: SessionCommand,
}

#[derive(clap::Subcommand)]
enum SessionCommand {
    /// Create a fresh session and print its metadata.
    New,
    /// List session identifiers.
    List,
    /// Delete a session and all of its storage.
    Rm(SessionRef),
}

#[derive(Args)]
struct SessionRef {
    #[arg(long, value_name = "ID")]
    session: String,
}

#[derive(Args)]
struct ContractRef {
    #[arg(long, value_name = "ID")]
    session: String,

    #[arg(long, value_name = "NAME")]
    contract: String,
}

#[derive(Args)]
struct DeployArgs {
    #[arg(long, value_name = "ID")]
    session: String,

    #[arg(long, value_name = "NAME")]
    name: String,

    /// File containing the contract source.
    #[arg(long, value_name = "PATH")]
    code_file: PathBuf,
}

#[derive(Args)]
struct CallArgs {
    #[arg(long, value_name = "ID")]
    session: String,

    #[arg(long, value_name = "NAME")]
    contract: String,

    #[arg(long, value_name = "NAME")]
    function: String,

    /// Keyword arguments as a JSON object.
    #[arg(long, value_name = "JSON", default_value = "{}")]
    kwargs: String,
}

#[derive(Args)]
struct StateArgs {
    #[command(subcommand)]
    cmd: StateCommand,
}

#[derive(clap::Subcommand)]
enum StateCommand {
    /// Print the state snapshot.
    Dump(StateDumpArgs),
    /// Apply a state snapshot from a JSON file.
    Apply(StateApplyArgs),
    /// Reset contract and runtime state to defaults.
    Reset(SessionRef),
}

#[derive(Args)]
struct StateDumpArgs {
    #[arg(long, value_name = "ID")]
    session: String,

    /// Include keys prefixed with `__`.
    #[arg(long)]
    show_internal: bool,
}

#[derive(Args)]
struct StateApplyArgs {
    #[arg(long, value_name = "ID")]
    session: String,

    #[arg(long, value_name = "PATH")]
    file: PathBuf,
}

#[derive(Args)]
struct EnvArgs {
    #[command(subcommand)]
    cmd: EnvCommand,
}

#[derive(clap::Subcommand)]
enum EnvCommand {
    /// Print the session's execution environment.
    Show(SessionRef),
    /// Set one environment variable.
    Set(EnvSetArgs),
    /// Reset one environment variable to its default.
    Unset(EnvUnsetArgs),
}

#[derive(Args)]
struct EnvSetArgs {
    #[arg(long, value_name = "ID")]
    session: String,

    #[arg(long, value_name = "KEY")]
    key: String,

    /// Value; parsed as JSON when possible, else taken as a string.
    #[arg(long, value_name = "VALUE")]
    value: String,
}

#[derive(Args)]
struct EnvUnsetArgs {
    #[arg(long, value_name = "ID")]
    session: String,

    #[arg(long, value_name = "KEY")]
    key: String,
}

fn main() -> std::process::ExitCode {
    match try_main() {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("cordon: {err:#}");
            std::process::ExitCode::from(2)
        }
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = RuntimeConfig::from_env()?;
    let store = SessionStore::open_with_options(&cli.root, StoreOptions::from_env()?)
        .with_context(|| format!("open session store at {}", cli.root.display()))?;

    let workerd = match &cli.workerd {
        Some(path) => path.clone(),
        None => locate_workerd()?,
    };
    let factory = ProcessWorkerFactory::new(workerd).with_options(config.worker_options());

    let runtime = SessionRuntime::new(Arc::new(store), Box::new(factory), config);
    let result = run_command(&runtime, &cli.command);
    runtime.shutdown();
    result
}

fn run_command(runtime: &SessionRuntime, command: &Command) -> Result<()> {
    match command {
        Command::Session(args) => match &args.cmd {
            SessionCommand::New => {
                let metadata = runtime.create_session()?;
                print_json(&serde_json::to_value(&metadata)?)
            }
            SessionCommand::List => {
                let sessions = runtime.list_sessions()?;
                for id in sessions {
                    println!("{id}");
                }
                Ok(())
            }
            SessionCommand::Rm(target) => {
                let id = session_id(&target.session)?;
                runtime.close_session(&id);
                runtime.store().delete(&id)?;
                Ok(())
            }
        },
        Command::Deploy(args) => {
            let id = session_id(&args.session)?;
            let code = std::fs::read_to_string(&args.code_file)
                .with_context(|| format!("read contract source {}", args.code_file.display()))?;
            runtime.deploy(&id, &args.name, &code)?;
            println!("deployed {}", args.name);
            Ok(())
        }
        Command::Call(args) => {
            let id = session_id(&args.session)?;
            let kwargs: Map<String, Value> = serde_json::from_str(&args.kwargs)
                .context("--kwargs must be a JSON object")?;
            let result = runtime.call(&id, &args.contract, &args.function, kwargs)?;
            print_json(&result)
        }
        Command::Contracts(target) => {
            let id = session_id(&target.session)?;
            for name in runtime.list_contracts(&id)? {
                println!("{name}");
            }
            Ok(())
        }
        Command::Exports(target) => {
            let id = session_id(&target.session)?;
            let exports = runtime.get_export_metadata(&id, &target.contract)?;
            print_json(&serde_json::to_value(&exports)?)
        }
        Command::Details(target) => {
            let id = session_id(&target.session)?;
            let details = runtime.get_contract_details(&id, &target.contract)?;
            print_json(&serde_json::to_value(&details)?)
        }
        Command::State(args) => match &args.cmd {
            StateCommand::Dump(dump) => {
                let id = session_id(&dump.session)?;
                println!("{}", runtime.dump_state(&id, dump.show_internal)?);
                Ok(())
            }
            StateCommand::Apply(apply) => {
                let id = session_id(&apply.session)?;
                let raw = std::fs::read(&apply.file)
                    .with_context(|| format!("read snapshot {}", apply.file.display()))?;
                let snapshot: Value = serde_json::from_slice(&raw)
                    .with_context(|| format!("parse snapshot {}", apply.file.display()))?;
                runtime.apply_state_snapshot(&id, &snapshot)?;
                Ok(())
            }
            StateCommand::Reset(target) => {
                let id = session_id(&target.session)?;
                let metadata = runtime.reset_state(&id)?;
                print_json(&serde_json::to_value(&metadata)?)
            }
        },
        Command::Env(args) => match &args.cmd {
            EnvCommand::Show(target) => {
                let id = session_id(&target.session)?;
                print_json(&Value::Object(runtime.get_environment(&id)?))
            }
            EnvCommand::Set(set) => {
                let id = session_id(&set.session)?;
                let value = serde_json::from_str(&set.value)
                    .unwrap_or_else(|_| Value::String(set.value.clone()));
                let coerced = runtime.set_environment_var(&id, &set.key, value)?;
                print_json(&coerced)
            }
            EnvCommand::Unset(unset) => {
                let id = session_id(&unset.session)?;
                runtime.remove_environment_var(&id, &unset.key)?;
                Ok(())
            }
        },
        Command::Ui(target) => {
            let id = session_id(&target.session)?;
            print_json(&Value::Object(runtime.get_ui_state(&id)?))
        }
    }
}

fn session_id(raw: &str) -> Result<SessionId> {
    SessionId::parse(raw).map_err(|err| anyhow::anyhow!("{err}"))
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
