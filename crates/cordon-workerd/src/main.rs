use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use cordon_worker::guest::serve;

mod service;

use service::StorageService;

#[derive(Parser)]
#[command(name = "cordon-workerd")]
#[command(about = "Isolated session service worker.", long_about = None)]
struct Cli {
    /// Session storage directory (contains contract_state/ and run_state/).
    #[arg(long, value_name = "PATH")]
    storage_home: PathBuf,
}

fn main() -> std::process::ExitCode {
    match try_main() {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("cordon-workerd: {err:#}");
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

    let mut service = StorageService::new(&cli.storage_home).with_context(|| {
        format!("initialize session service at {}", cli.storage_home.display())
    })?;

    tracing::debug!(storage_home = %cli.storage_home.display(), "session worker ready");

    let mut stdin = std::io::stdin().lock();
    let mut stdout = std::io::stdout().lock();
    serve(&mut service, &mut stdin, &mut stdout).context("serve session service")?;
    Ok(())
}
