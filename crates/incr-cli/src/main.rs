use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use incr_core::{JobSpec, RunMode};
use incr_storage::CollectionStore;
use incr_sync::{open_run, IncrementalConfig, IncrementalRun, SeenBeforeLoader};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "incr-cli")]
#[command(about = "Emit only items not seen in earlier runs of a job")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Filter a JSON-lines item stream and persist newly seen identifiers.
    Run(RunArgs),
    /// Count identifiers stored for a job.
    Seen(StoreArgs),
}

#[derive(Debug, Args)]
struct StoreArgs {
    #[arg(long)]
    job: String,
    /// Use a local collection directory instead of Scrapy Cloud.
    #[arg(long)]
    store_dir: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[command(flatten)]
    store: StoreArgs,
    /// JSON-lines input; stdin when omitted.
    #[arg(long)]
    input: Option<PathBuf>,
    #[arg(long)]
    full_crawl: bool,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    unique_field: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("incr_sync=info".parse()?)
                .add_directive("incr_storage=info".parse()?)
                .add_directive("incr_cli=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Seen(args) => seen(args).await,
    }
}

fn resolve_config(store: &StoreArgs) -> Result<IncrementalConfig> {
    let mut config = IncrementalConfig::from_env()?;
    if let Some(dir) = &store.store_dir {
        config.store_dir = Some(dir.clone());
    }
    Ok(config)
}

async fn run(args: RunArgs) -> Result<()> {
    let mut config = resolve_config(&args.store)?;
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(field) = args.unique_field {
        config.unique_field = field;
    }
    config.full_crawl |= args.full_crawl;

    let job = JobSpec::new(args.store.job.clone()).with_mode(RunMode::from_full_crawl(config.full_crawl));
    let mut run = open_run(&job, &config).await?;
    info!(run_id = %run.run_id(), job = %run.job_name(), "incremental run opened");

    let reader: Box<dyn AsyncBufRead + Unpin + Send> = match &args.input {
        Some(path) => Box::new(BufReader::new(
            tokio::fs::File::open(path)
                .await
                .with_context(|| format!("opening {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };

    if let Err(err) = filter_stream(&mut run, reader).await {
        run.abort().await;
        return Err(err);
    }

    let summary = run.close().await?;
    eprintln!(
        "run complete: run_id={} job={} mode={:?} prior_seen={} passed={} untracked={} dropped={} flushed={} batches={}",
        summary.run_id,
        summary.job,
        summary.mode,
        summary.prior_seen,
        summary.counters.passed,
        summary.counters.passed_untracked,
        summary.counters.dropped_previous_run + summary.counters.dropped_this_run,
        summary.flushed.entries,
        summary.flushed.batches
    );
    Ok(())
}

async fn filter_stream(
    run: &mut IncrementalRun,
    reader: Box<dyn AsyncBufRead + Unpin + Send>,
) -> Result<()> {
    let stdout = std::io::stdout();
    let mut out = std::io::BufWriter::new(stdout.lock());
    let mut lines = reader.lines();
    let mut line_no = 0usize;

    while let Some(line) = lines.next_line().await.context("reading input")? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let item: serde_json::Value = serde_json::from_str(&line)
            .with_context(|| format!("parsing input line {line_no}"))?;

        if !run.admit_record(&item)? {
            continue;
        }
        if let Some(item) = run.process_item(item)?.into_item() {
            serde_json::to_writer(&mut out, &item).context("writing item")?;
            out.write_all(b"\n").context("writing item")?;
        }
    }
    out.flush().context("flushing output")?;
    Ok(())
}

async fn seen(args: StoreArgs) -> Result<()> {
    let config = resolve_config(&args)?;
    config.validate()?;
    let store = config.open_store()?;
    let loaded = SeenBeforeLoader::new(store.as_ref()).load(&args.job).await?;
    store.close().await?;

    if loaded.first_run {
        println!("{}: 0 (collection not created yet)", args.job);
    } else {
        println!("{}: {}", args.job, loaded.seen.len());
    }
    Ok(())
}
