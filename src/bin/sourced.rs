use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sourced::acquire::AcquireReport;
use sourced::analyzers::{AnalyzerKind, LineCount, Utf8Check};
use sourced::app::{AnalyzeResult, App, CreateRequest, DownloadOptions, tally_analysis};
use sourced::config::Settings;
use sourced::domain::{DatasetName, IndexSource};
use sourced::error::SourcedError;
use sourced::index::PypiClient;
use sourced::output::{JsonOutput, OutputMode, TerminalSink};
use sourced::progress::{ProgressSink, TracingSink};
use sourced::scan::{DEFAULT_EXTENSION, ScanOptions};

#[derive(Parser)]
#[command(name = "sourced")]
#[command(about = "Collect source distributions from PyPI and analyze them in bulk")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    non_interactive: bool,

    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Manage datasets")]
    Datasets(DatasetsArgs),
    #[command(about = "Run a built-in analyzer over a downloaded dataset")]
    Analyze(AnalyzeArgs),
}

#[derive(Args)]
struct DatasetsArgs {
    #[command(subcommand)]
    command: DatasetsCommand,
}

#[derive(Subcommand)]
enum DatasetsCommand {
    #[command(about = "List registered datasets")]
    List,
    #[command(about = "Show dataset info")]
    Info(InfoArgs),
    #[command(about = "Create a dataset from a package index and download it")]
    Create(CreateArgs),
    #[command(about = "Resume downloading a dataset")]
    Download(DownloadArgs),
    #[command(about = "Unregister a dataset, keeping its files")]
    Remove(InfoArgs),
}

#[derive(Args)]
struct InfoArgs {
    name: String,
}

#[derive(Args)]
struct CreateArgs {
    name: String,

    #[arg(long, value_enum, default_value_t = IndexSource::PypiPopular)]
    source: IndexSource,

    #[arg(long, default_value_t = 20)]
    sample_size: usize,

    #[arg(long)]
    base_data_dir: Option<Utf8PathBuf>,

    #[arg(long)]
    fresh_index: bool,

    #[arg(long)]
    no_download: bool,
}

#[derive(Args)]
struct DownloadArgs {
    name: String,

    #[arg(long)]
    retry_skipped: bool,
}

#[derive(Args)]
struct AnalyzeArgs {
    dataset: String,

    #[arg(long, value_enum, default_value_t = AnalyzerKind::Utf8)]
    analyzer: AnalyzerKind,

    #[arg(long, default_value = DEFAULT_EXTENSION)]
    extension: String,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<SourcedError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &SourcedError) -> u8 {
    match error {
        SourcedError::DatasetNotFound(_)
        | SourcedError::DatasetCacheMissing(_)
        | SourcedError::InvalidOptions(_)
        | SourcedError::InvalidDatasetName(_) => 2,
        SourcedError::IndexHttp(_) | SourcedError::IndexStatus { .. } => 3,
        SourcedError::Interrupted => 130,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };
    let sink: Arc<dyn ProgressSink> = match output_mode {
        OutputMode::Interactive => Arc::new(TerminalSink::new()),
        OutputMode::NonInteractive => Arc::new(TracingSink),
    };

    let settings = Settings::resolve()?;
    settings.ensure_dirs()?;
    let index = Arc::new(PypiClient::new()?);
    let mut app = App::open(settings, index)?;

    match cli.command {
        Commands::Datasets(args) => match args.command {
            DatasetsCommand::List => run_list(&app, output_mode),
            DatasetsCommand::Info(args) => run_info(&app, args, output_mode),
            DatasetsCommand::Create(args) => run_create(&mut app, args, sink, output_mode),
            DatasetsCommand::Download(args) => {
                let options = DownloadOptions {
                    retry_skipped: args.retry_skipped,
                };
                run_download(&mut app, &args.name, options, sink, output_mode)
            }
            DatasetsCommand::Remove(args) => run_remove(&mut app, args, output_mode),
        },
        Commands::Analyze(args) => run_analyze(&app, args, sink, output_mode),
    }
}

fn run_list(app: &App<PypiClient>, output_mode: OutputMode) -> miette::Result<()> {
    let result = app.list();
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_list(&result).into_diagnostic(),
        OutputMode::Interactive => {
            if result.datasets.is_empty() {
                println!("no datasets yet (try `sourced datasets create <name>`)");
            }
            for entry in &result.datasets {
                let summary = entry.summary;
                println!(
                    "{}  {}  ({} downloaded, {} skipped, {} pending)",
                    entry.name,
                    entry.path,
                    summary.downloaded,
                    summary.skipped,
                    summary.awaiting_download
                );
            }
            Ok(())
        }
    }
}

fn run_info(app: &App<PypiClient>, args: InfoArgs, output_mode: OutputMode) -> miette::Result<()> {
    let result = app.info(&args.name)?;
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_info(&result).into_diagnostic(),
        OutputMode::Interactive => {
            let summary = result.summary;
            println!("{}", result.name);
            println!("  path:        {}", result.path);
            println!("  cache file:  {}", result.cache_file);
            println!("  sources:     {}", summary.total);
            println!("  downloaded:  {}", summary.downloaded);
            println!("  skipped:     {}", summary.skipped);
            println!("  pending:     {}", summary.awaiting_download);
            Ok(())
        }
    }
}

fn run_remove(
    app: &mut App<PypiClient>,
    args: InfoArgs,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let result = app.remove_dataset(&args.name)?;
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_remove(&result).into_diagnostic(),
        OutputMode::Interactive => {
            println!("removed '{}' (files kept in {})", result.name, result.path);
            Ok(())
        }
    }
}

fn run_create(
    app: &mut App<PypiClient>,
    args: CreateArgs,
    sink: Arc<dyn ProgressSink>,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let name: DatasetName = args.name.parse()?;
    let request = CreateRequest {
        name: name.clone(),
        source: args.source,
        sample_size: Some(args.sample_size),
        base_data_dir: args.base_data_dir,
        fresh_index: args.fresh_index,
    };
    let result = app.create_dataset(request, &sink)?;
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_create(&result).into_diagnostic()?,
        OutputMode::Interactive => println!(
            "dataset '{}' at {} ({} sources, from {})",
            result.name, result.path, result.summary.total, result.action
        ),
    }

    if args.no_download {
        return Ok(());
    }
    run_download(
        app,
        name.as_str(),
        DownloadOptions::default(),
        sink,
        output_mode,
    )
}

fn run_download(
    app: &mut App<PypiClient>,
    name: &str,
    options: DownloadOptions,
    sink: Arc<dyn ProgressSink>,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let cancel = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&cancel);
    if let Err(err) = ctrlc::set_handler(move || handler_flag.store(true, Ordering::Relaxed)) {
        warn!("could not install Ctrl+C handler: {err}");
    }

    let report = app.download(name, options, sink, &cancel)?;
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_download(&report).into_diagnostic()?,
        OutputMode::Interactive => print_download_summary(&report),
    }
    if report.interrupted {
        return Err(SourcedError::Interrupted.into());
    }
    Ok(())
}

fn print_download_summary(report: &AcquireReport) {
    eprintln!();
    println!(
        "downloaded {} of {} pending sources",
        report.downloaded, report.attempted
    );
    for skip in &report.skipped {
        println!("  {skip}");
    }
    for failed in &report.failed {
        println!("  failed {}: {}", failed.project, failed.message);
    }
    if !report.failed.is_empty() {
        println!("failed sources stay pending; rerun `sourced datasets download` to retry them");
    }
}

fn run_analyze(
    app: &App<PypiClient>,
    args: AnalyzeArgs,
    sink: Arc<dyn ProgressSink>,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let options = ScanOptions::default().with_extension(args.extension);
    let result = match args.analyzer {
        AnalyzerKind::Utf8 => {
            let analysis = app.analyze(&args.dataset, Utf8Check, &options, sink)?;
            info!("analyzing {} files", analysis.total_files());
            tally_analysis(&args.dataset, analysis, |status| *status, |_| {})?
        }
        AnalyzerKind::Lines => {
            let analysis = app.analyze(&args.dataset, LineCount, &options, sink)?;
            info!("analyzing {} files", analysis.total_files());
            tally_analysis(&args.dataset, analysis, line_bucket, |_| {})?
        }
    };

    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_analyze(&result).into_diagnostic(),
        OutputMode::Interactive => {
            print_analyze_summary(&result);
            Ok(())
        }
    }
}

fn line_bucket(lines: &Option<usize>) -> &'static str {
    match lines {
        None => "unreadable",
        Some(0..=99) => "<100 lines",
        Some(100..=999) => "100-999 lines",
        Some(_) => ">=1000 lines",
    }
}

fn print_analyze_summary(result: &AnalyzeResult) {
    eprintln!();
    println!(
        "{}: {} files in {:.2}s ({:.1} files/s)",
        result.dataset,
        result.files,
        result.elapsed_ms as f64 / 1000.0,
        result.files_per_second
    );
    for (label, count) in &result.outcomes {
        println!("  {label}: {count}");
    }
    if result.failed > 0 {
        println!("  crashed: {}", result.failed);
    }
}
