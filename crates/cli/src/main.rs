//! datafetch CLI - submit several retrieval requests concurrently.

use anyhow::{bail, Context, Result};
use clap::Parser;
use datafetch_client::{resolve, ExplicitCredentials, WebApiClient};
use datafetch_core::{RequestDescription, RequestStatus};
use datafetch_task::{wait, RequestTask, ReturnWhen, ServerConfig, Service};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "datafetch")]
#[command(about = "Submit multiple retrieval requests concurrently", long_about = None)]
struct Cli {
    /// Input files, each containing one request
    #[arg(required = true)]
    infiles: Vec<PathBuf>,

    /// How many requests run at the same time
    #[arg(long, default_value = "3")]
    workers: usize,

    /// Which service to use
    #[arg(long, default_value = "mars")]
    service: String,

    /// Disable writing of log files
    #[arg(long)]
    no_logs: bool,

    /// Pause between two submissions, in milliseconds
    #[arg(long, default_value = "1000")]
    delay_ms: u64,

    /// API endpoint (default: environment or ~/.ecmwfapirc)
    #[arg(long)]
    url: Option<String>,

    /// API key
    #[arg(long)]
    key: Option<String>,

    /// Account e-mail
    #[arg(long)]
    email: Option<String>,
}

fn print_status(task: &RequestTask) {
    println!(
        "Request for target '{}' changed status to {}",
        task.target().display(),
        task.status()
    );
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Read every request up front so a bad file fails before anything is sent
    let mut requests = Vec::with_capacity(cli.infiles.len());
    for infile in &cli.infiles {
        let text = std::fs::read_to_string(infile)
            .with_context(|| format!("file '{}' cannot be read", infile.display()))?;
        let request = RequestDescription::parse(&text)
            .with_context(|| format!("file '{}' does not contain a valid request", infile.display()))?;
        requests.push(request);
    }

    let credentials = resolve(&ExplicitCredentials {
        url: cli.url,
        key: cli.key,
        email: cli.email,
    })?;
    let client = WebApiClient::new()?;
    let config = ServerConfig {
        max_workers: cli.workers,
        write_logs: !cli.no_logs,
        ..ServerConfig::default()
    };
    let service = Service::new(cli.service.trim(), config, credentials, Arc::new(client))?;

    let delay = Duration::from_millis(cli.delay_ms);
    let mut tasks = Vec::with_capacity(requests.len());
    for (i, request) in requests.into_iter().enumerate() {
        if i > 0 {
            std::thread::sleep(delay);
        }
        let task = service.execute_with(request, None, print_status)?;
        debug!(task = %task.key(), "Submitted {}", task.target().display());
        tasks.push(task);
    }

    let result = wait(&tasks, None, ReturnWhen::AllCompleted);
    info!("{} of {} requests finished", result.done.len(), tasks.len());

    println!();
    let mut failed = 0;
    for task in &tasks {
        println!("{}", task);
        if task.status() == RequestStatus::Error {
            failed += 1;
            if let Ok(Some(err)) = task.exception(Some(Duration::ZERO)) {
                println!("  {}", err);
            }
        }
    }

    service.shutdown(true);
    if failed > 0 {
        bail!("{} of {} requests failed", failed, tasks.len());
    }
    Ok(())
}
