mod cli;

use clap::Parser;
use cli::Cli;
use miette::IntoDiagnostic;
use rpmdb_doctor::Doctor;

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.logfile.clone())?;

    let config = cli.into_config()?;
    tracing::info!("Extreme RPM database checkup commencing");

    let mut doctor = Doctor::new(config)?;
    let healthy = doctor.run().await?;

    let actions = doctor.actions();
    if actions.is_empty() {
        tracing::info!("No repairs were needed");
    } else {
        tracing::info!("Repair actions taken: {}", actions.names().join(", "));
    }

    if !healthy {
        std::process::exit(1);
    }
    Ok(())
}

fn init_tracing(verbose: bool, logfile: Option<std::path::PathBuf>) -> miette::Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    if let Some(path) = logfile {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .into_diagnostic()?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
    Ok(())
}
