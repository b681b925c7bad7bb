//! corpus-pipeline command line
//!
//! Run with: cargo run -p corpus-pipeline --features cli -- --help

use anyhow::Context;
use clap::{Parser, Subcommand};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use corpus_pipeline::config::{ExportFormat, PipelineConfig};
use corpus_pipeline::export::{ExportEngine, ExportSummary, LocalDatasetHost};
use corpus_pipeline::pipeline::{DatasetPipeline, RunOptions, Stage, StageReport, StageTransformer};
use corpus_pipeline::processing::{CancellationFlag, ProgressTracker};
use corpus_pipeline::providers::open_store;
use corpus_pipeline::representation::HfTokenizer;
use corpus_pipeline::storage::ParquetEncoder;

#[derive(Parser)]
#[command(name = "corpus-pipeline")]
#[command(version, about = "Move datasets through the document, representation and parquet stages")]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct DatasetArgs {
    /// Dataset identifier
    dataset: String,

    /// Restrict to keys under this sub-collection prefix
    #[arg(short, long)]
    prefix: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show per-stage object counts and missing documents
    Status {
        #[command(flatten)]
        dataset: DatasetArgs,

        /// Also write the table as CSV
        #[arg(long, value_name = "FILE")]
        csv: Option<PathBuf>,
    },

    /// Advance documents to the next stage
    Process {
        #[command(flatten)]
        dataset: DatasetArgs,

        /// Target stage (representations or parquet); both when omitted
        #[arg(short, long)]
        target: Option<Stage>,

        /// Worker count
        #[arg(short, long)]
        workers: Option<usize>,

        /// Maximum raw document size in bytes
        #[arg(long)]
        max_size: Option<usize>,

        /// Rewrite targets that already exist
        #[arg(long)]
        clobber: bool,

        /// Write per-key status as CSV
        #[arg(long, value_name = "FILE")]
        status_csv: Option<PathBuf>,
    },

    /// Write the manifest for a stage
    Index {
        #[command(flatten)]
        dataset: DatasetArgs,

        #[arg(short, long, default_value = "representations")]
        stage: Stage,
    },

    /// Export filtered token sequences or their decoded text
    Export {
        #[command(flatten)]
        dataset: DatasetArgs,

        /// gzip JSON Lines output file
        #[arg(short, long, value_name = "FILE", conflicts_with = "destination")]
        output: Option<PathBuf>,

        /// Upload destination on the dataset host
        #[arg(long, requires = "host_root")]
        destination: Option<String>,

        /// Directory acting as the dataset host
        #[arg(long, value_name = "DIR")]
        host_root: Option<PathBuf>,

        #[arg(long)]
        min_tokens: Option<usize>,

        #[arg(long)]
        max_tokens: Option<usize>,

        /// Fraction of records to keep (0.0-1.0)
        #[arg(long)]
        sample_rate: Option<f64>,

        #[arg(long)]
        max_documents: Option<usize>,

        /// Disable content-hash dedup
        #[arg(long)]
        no_dedup: bool,

        /// Record payload: tokens or text
        #[arg(long)]
        format: Option<ExportFormat>,

        /// Drop records whose quality score is above this value
        #[arg(long)]
        score_threshold: Option<f64>,

        /// Write the quality score with each record
        #[arg(long)]
        include_score: bool,

        /// Write the full quality metrics with each record
        #[arg(long)]
        include_metrics: bool,

        /// Tokenizer whose ids are exported
        #[arg(long)]
        tokenizer: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "corpus_pipeline=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => {
            let mut config = PipelineConfig::default();
            config.apply_env_overrides();
            config
        }
    };

    let store = open_store(&config.store).await?;

    match cli.command {
        Commands::Status { dataset, csv } => {
            let pipeline = DatasetPipeline::new(store, dataset.dataset, dataset.prefix, &config)?;
            let status = pipeline.status().await?;

            println!(
                "\n{} {}",
                style("Dataset").bold(),
                style(&status.dataset_id).cyan()
            );
            println!("{:<16} {:>10} {:>10}", "Stage", "Count", "Missing");
            for stage in &status.stages {
                let missing = stage.missing.map(|m| m.to_string()).unwrap_or_else(|| "-".into());
                println!("{:<16} {:>10} {:>10}", stage.stage, stage.count, missing);
            }

            if let Some(path) = csv {
                std::fs::write(&path, status.to_csv()?)?;
                println!("\nWrote {}", path.display());
            }
        }

        Commands::Process {
            dataset,
            target,
            workers,
            max_size,
            clobber,
            status_csv,
        } => {
            let transitions: Vec<(Stage, Stage)> = match target {
                Some(target) => {
                    let source = target
                        .previous()
                        .with_context(|| format!("{} is not a processing target", target))?;
                    vec![(source, target)]
                }
                None => vec![
                    (Stage::Documents, Stage::Representations),
                    (Stage::Representations, Stage::Parquet),
                ],
            };

            let pipeline = DatasetPipeline::new(store, dataset.dataset, dataset.prefix, &config)?
                .with_transformer(Arc::new(StageTransformer::from_config(&config)?));
            let options = RunOptions {
                concurrency: workers,
                size_limit: max_size,
                clobber,
            };

            let cancel = CancellationFlag::new();
            let ctrl_c = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupt received, finishing in-flight documents");
                    ctrl_c.cancel();
                }
            });

            for (source, target) in transitions {
                let tracker = Arc::new(ProgressTracker::new(
                    format!("{}:{}->{}", pipeline.dataset_id(), source, target),
                    config.processing.progress_interval,
                ));
                let spinner = spinner(tracker.clone());

                let report = pipeline
                    .process_stage_with(source, target, &options, tracker.clone(), &cancel)
                    .await;
                spinner.finish_and_clear();
                let report = report?;
                print_report(&report);

                if let Some(path) = &status_csv {
                    let path = csv_path_for(path, target);
                    tracker.write_csv(&path)?;
                    println!("  Per-key status: {}", path.display());
                }
                if report.cancelled {
                    break;
                }
            }
        }

        Commands::Index { dataset, stage } => {
            let pipeline = DatasetPipeline::new(store, dataset.dataset, dataset.prefix, &config)?;
            let manifest = pipeline.build_index(stage).await?;
            println!(
                "{} {} objects in {} manifest",
                style("Indexed").green().bold(),
                manifest.metadata.count,
                stage
            );
            if let Some(totals) = &manifest.metadata.token_totals {
                for (tokenizer, total) in totals {
                    println!("  {}: {} tokens", tokenizer, total);
                }
            }
        }

        Commands::Export {
            dataset,
            output,
            destination,
            host_root,
            min_tokens,
            max_tokens,
            sample_rate,
            max_documents,
            no_dedup,
            format,
            score_threshold,
            include_score,
            include_metrics,
            tokenizer,
        } => {
            let mut export = config.export.clone();
            export.min_tokens = min_tokens.or(export.min_tokens);
            export.max_tokens = max_tokens.or(export.max_tokens);
            export.sample_rate = sample_rate.or(export.sample_rate);
            export.max_documents = max_documents.or(export.max_documents);
            if no_dedup {
                export.dedup = false;
            }
            export.format = format.unwrap_or(export.format);
            export.score_threshold = score_threshold.or(export.score_threshold);
            export.include_score |= include_score;
            export.include_metrics |= include_metrics;
            export.tokenizer = tokenizer.or(export.tokenizer);

            let decoder = if export.needs_text() {
                let spec = config
                    .representation
                    .tokenizers
                    .iter()
                    .find(|spec| export.tokenizer.as_deref().map_or(true, |name| name == spec.name))
                    .context("text output and quality scoring need a configured tokenizer")?;
                Some(Arc::new(HfTokenizer::from_spec(spec)?))
            } else {
                None
            };

            let mut engine = ExportEngine::new(
                store,
                dataset.dataset.clone(),
                dataset.prefix,
                export,
                Arc::new(ParquetEncoder),
            )?
            .with_list_page_size(config.store.list_page_size);
            if let Some(decoder) = decoder {
                engine = engine.with_decoder(decoder)?;
            }

            let summary = match (output, destination, host_root) {
                (_, Some(destination), Some(root)) => {
                    let host = Arc::new(LocalDatasetHost::new(root)?);
                    engine.export_to_host(host, &destination).await?
                }
                (Some(path), _, _) => engine.export_to_file(&path).await?,
                (None, _, _) => {
                    let path = PathBuf::from(format!("{}.jsonl.gz", dataset.dataset));
                    engine.export_to_file(&path).await?
                }
            };
            print_export(&summary);
        }
    }

    Ok(())
}

/// Spinner that polls the tracker until finished
fn spinner(tracker: Arc<ProgressTracker>) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    if let Ok(template) = ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] {msg}") {
        bar.set_style(template);
    }
    bar.enable_steady_tick(Duration::from_millis(120));

    let poll = bar.clone();
    tokio::spawn(async move {
        while !poll.is_finished() {
            let s = tracker.snapshot();
            poll.set_message(format!(
                "{}: {}/{} ({} written, {} skipped, {} failed)",
                tracker.label(),
                s.processed,
                s.total,
                s.written,
                s.skipped,
                s.failed
            ));
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    });
    bar
}

fn print_report(report: &StageReport) {
    let s = &report.snapshot;
    println!(
        "{} {} -> {} in {:.1}s",
        if report.cancelled {
            style("Cancelled").yellow().bold()
        } else {
            style("Done").green().bold()
        },
        report.source,
        report.target,
        report.elapsed_secs
    );
    println!("  Written: {}", style(s.written).green());
    println!("  Skipped: {}", s.skipped);
    println!("  Failed:  {}", style(s.failed).red());
    for key in report.failed_keys.iter().take(10) {
        println!("    {}", key);
    }
    if report.failed_keys.len() > 10 {
        println!("    ... and {} more", report.failed_keys.len() - 10);
    }
}

fn print_export(summary: &ExportSummary) {
    println!(
        "{} {}/{} records in {} batches",
        style("Exported").green().bold(),
        summary.exported,
        summary.read,
        summary.batches
    );
    println!("  Duplicates:         {}", summary.duplicates);
    println!("  Empty:              {}", summary.empty);
    println!("  Below min tokens:   {}", summary.below_min);
    println!("  Above max tokens:   {}", summary.above_max);
    println!("  Low quality:        {}", summary.low_quality);
    println!("  Outside percentile: {}", summary.outside_percentile);
    println!("  Sampled out:        {}", summary.sampled_out);
    if summary.unreadable > 0 {
        println!("  Unreadable objects: {}", style(summary.unreadable).red());
    }
}

/// `status.csv` becomes `status.representations.csv` when several stages run
fn csv_path_for(path: &std::path::Path, target: Stage) -> PathBuf {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("status");
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("csv");
    path.with_file_name(format!("{}.{}.{}", stem, target, ext))
}
