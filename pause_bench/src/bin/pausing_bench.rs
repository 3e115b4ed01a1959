//! Runs the pause/resume benchmark scenarios against the current Kubernetes
//! context and appends the results to per-scenario files.
use anyhow::{Context, bail};
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use pause_bench::cluster::KubeCluster;
use pause_bench::config::BenchmarkConfig;
use pause_bench::cql::ScyllaSessionFactory;
use pause_bench::scenario::{Orchestrator, Scenario};
use pause_bench::summary;
use pause_bench::timing::JsonLinesFile;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span};
use utils::logging::{self, LogFormat};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Benchmark configuration file
    #[arg(short, long)]
    config: Utf8PathBuf,

    /// Log format: plain, json or test
    #[arg(long, default_value = "plain", value_parser = LogFormat::from_config)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run benchmark scenarios, appending a result per successful run
    Run {
        /// Scenarios to run, in order. Can be repeated.
        #[arg(long = "scenario", value_enum, default_values_t = Scenario::ALL.to_vec())]
        scenarios: Vec<Scenario>,

        /// How many times to run every scenario
        #[arg(long, default_value_t = 1)]
        iterations: u32,

        /// Overrides dest_dir of the configuration file
        #[arg(long)]
        dest_dir: Option<Utf8PathBuf>,
    },
    /// Print statistics of the results collected so far
    Summarize {
        /// Overrides dest_dir of the configuration file
        #[arg(long)]
        dest_dir: Option<Utf8PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(cli.log_format, logging::Output::Stderr)?;
    logging::replace_panic_hook_with_tracing_panic_hook().forget();

    let mut config = BenchmarkConfig::load(&cli.config)?;

    match cli.command {
        Command::Run {
            scenarios,
            iterations,
            dest_dir,
        } => {
            if let Some(dest_dir) = dest_dir {
                config.dest_dir = dest_dir;
                config.validate().context("invalid --dest-dir")?;
            }
            run(config, &scenarios, iterations).await
        }
        Command::Summarize { dest_dir } => {
            let dest_dir = dest_dir.unwrap_or(config.dest_dir);
            let summaries = summary::load(&dest_dir, &Scenario::ALL)?;
            if summaries.is_empty() {
                bail!("no results found in {dest_dir}");
            }
            println!("{}", summary::render(&summaries));
            Ok(())
        }
    }
}

async fn run(config: BenchmarkConfig, scenarios: &[Scenario], iterations: u32) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received interrupt, cancelling the current run");
                cancel.cancel();
            }
        }
    });

    let dest_dir = config.dest_dir.clone();
    let cluster = KubeCluster::try_default().await?;
    let orchestrator = Orchestrator::new(cluster, ScyllaSessionFactory, config)?;

    let mut runs = 0;
    let mut failed = 0;
    for iteration in 1..=iterations {
        for &scenario in scenarios {
            if cancel.is_cancelled() {
                bail!("interrupted after {runs} runs, {failed} of which failed");
            }
            runs += 1;
            let mut sink = JsonLinesFile::open(&scenario.results_path(&dest_dir))?;
            let span = info_span!("run", %scenario, iteration);
            match orchestrator
                .run(scenario, &mut sink, &cancel.child_token())
                .instrument(span)
                .await
            {
                Ok(_) => info!(%scenario, iteration, "appended result to {}", sink.path()),
                Err(e) => {
                    failed += 1;
                    let phase = e.phase;
                    let e = anyhow::Error::from(e);
                    error!(%scenario, iteration, %phase, "{e:#}");
                }
            }
        }
    }

    if failed > 0 {
        bail!("{failed} of {runs} runs failed");
    }
    Ok(())
}
