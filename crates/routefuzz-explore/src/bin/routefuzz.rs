//! routefuzz CLI: fuzz a running web application, inspect saved results.
//!
//! # Usage
//!
//! ```bash
//! # Fuzz the app on port 3000 backed by app_development
//! routefuzz run --results results --port 3000 --db app_development
//!
//! # Same, configured through the environment, replaying recorded traffic
//! RESULTS_PATH=results TARGET_APP_PORT=3000 TARGET_DBNAME=app_development \
//!     routefuzz run --seeds results/visited_routes.json
//!
//! # Requests that got a 500 on POST /posts
//! routefuzz stats results/fuzz_stats --verb POST --path /posts --code 500
//!
//! # Merge coverage from several runs
//! routefuzz union-cov run1/coverage.json run2/coverage.json
//! ```

use clap::{Parser, Subcommand};
use log::info;
use routefuzz_explore::catalog::{
    read_json, Catalog, CatalogError, DefaultHeaders, DEFAULT_ROUTE_EXCLUDES,
};
use routefuzz_explore::coverage::{calculate_coverage_percentage, union_coverage_files};
use routefuzz_explore::explorer::{error_chain, ExploreError, Explorer, ExplorerConfig};
use routefuzz_explore::report::format_report;
use routefuzz_explore::stats::{FuzzStats, StatsError};
use routefuzz_target::http::HttpSender;
use routefuzz_target::postgres::PgCli;
use routefuzz_target::report_dir::ReportDir;
use routefuzz_target::{ReportError, SendError};
use snafu::Snafu;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// CLI errors for the routefuzz binary.
#[derive(Debug, Snafu)]
enum CliError {
    #[snafu(display("Fuzzing run failed"), context(false))]
    Explore { source: ExploreError },
    #[snafu(display("Route catalog error"), context(false))]
    Catalog { source: CatalogError },
    #[snafu(display("Stats error"), context(false))]
    Stats { source: StatsError },
    #[snafu(display("Target report error"), context(false))]
    Report { source: ReportError },
    #[snafu(display("HTTP client error"), context(false))]
    Send { source: SendError },
    #[snafu(display("I/O error"), context(false))]
    Io { source: std::io::Error },
    #[snafu(display("JSON error"), context(false))]
    Json { source: serde_json::Error },
}

#[derive(Parser)]
#[command(name = "routefuzz")]
#[command(about = "Coverage-guided stateful fuzzer for database-backed web applications")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fuzz a running target application
    Run(RunArgs),

    /// Print saved results matching the given filters as JSON
    Stats {
        /// Path to a fuzz_stats file
        file: PathBuf,

        #[arg(long)]
        verb: Option<String>,

        #[arg(long)]
        path: Option<String>,

        #[arg(long)]
        code: Option<u16>,
    },

    /// Merge coverage files from independent runs
    UnionCov {
        /// Coverage files (JSON: file → per-line hit counts)
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Write the merged coverage here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    /// Results directory the target writes its reports into
    #[arg(long, env = "RESULTS_PATH")]
    results: PathBuf,

    /// Port the target application listens on
    #[arg(long, env = "TARGET_APP_PORT")]
    port: u16,

    /// Database the target application uses
    #[arg(long, env = "TARGET_DBNAME")]
    db: String,

    #[arg(long, env = "TARGET_HOSTNAME", default_value = "localhost")]
    hostname: String,

    #[arg(long, env = "TARGET_DB_HOST", default_value = "localhost")]
    db_host: String,

    #[arg(long, env = "TARGET_DB_USER")]
    db_user: Option<String>,

    /// Route listing (default: <results>/routes.json)
    #[arg(long)]
    routes: Option<PathBuf>,

    /// Recorded requests to replay first
    #[arg(long)]
    seeds: Option<PathBuf>,

    /// JSON map of lower-case verb → headers for unrecorded routes
    #[arg(long)]
    default_headers: Option<PathBuf>,

    /// JSON map of model name → table name
    #[arg(long)]
    tables: Option<PathBuf>,

    /// Only fuzz this route (VERB:/path)
    #[arg(long)]
    route: Option<String>,

    /// Snapshot directory to restore before the first request
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Restore only cookies and PRNG from --snapshot
    #[arg(long, env = "SKIP_DB_LOAD")]
    skip_db_load: bool,

    #[arg(long)]
    stop_after_replay: bool,

    #[arg(long)]
    stop_after_exhaustive: bool,

    /// Master seed
    #[arg(long, default_value = "0")]
    seed: u64,

    /// Stop after this many requests
    #[arg(long)]
    max_iterations: Option<u64>,

    /// Request timeout in seconds
    #[arg(long, default_value = "60")]
    timeout: u64,

    /// Extra paths never to request
    #[arg(long)]
    exclude: Vec<String>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run(args) => cmd_run(args),
        Commands::Stats {
            file,
            verb,
            path,
            code,
        } => cmd_stats(file, verb, path, code),
        Commands::UnionCov { files, output } => cmd_union_cov(files, output),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", error_chain(&e));
        std::process::exit(1);
    }
}

fn cmd_run(args: RunArgs) -> Result<(), CliError> {
    let mut excludes: Vec<String> = DEFAULT_ROUTE_EXCLUDES
        .iter()
        .map(|s| s.to_string())
        .collect();
    excludes.extend(args.exclude);

    let default_headers: DefaultHeaders = match &args.default_headers {
        Some(path) => read_json(path)?,
        None => DefaultHeaders::new(),
    };
    let tables: BTreeMap<String, String> = match &args.tables {
        Some(path) => read_json(path)?,
        None => BTreeMap::new(),
    };
    let routes = args
        .routes
        .clone()
        .unwrap_or_else(|| args.results.join("routes.json"));
    let catalog = Catalog::load(&routes, args.seeds.as_deref(), &default_headers, &excludes)?;

    let config = ExplorerConfig {
        hostname: args.hostname.clone(),
        port: args.port,
        db_name: args.db.clone(),
        results_dir: args.results.clone(),
        target_route: args.route,
        stop_after_replay: args.stop_after_replay,
        stop_after_exhaustive: args.stop_after_exhaustive,
        seed: args.seed,
        max_iterations: args.max_iterations,
        initial_snapshot: args.snapshot,
        skip_db_load: args.skip_db_load,
    };
    // Before ReportDir::open truncates the target's report files.
    config.validate(&catalog)?;

    let sender = HttpSender::new(Duration::from_secs(args.timeout))?;
    let target = ReportDir::open(
        &args.results,
        format!("http://{}:{}", args.hostname, args.port),
    )?;
    let storage = PgCli::new(args.db_host, args.db_user, args.db).with_tables(tables);

    let mut explorer = Explorer::new(
        config,
        catalog,
        Box::new(sender),
        Box::new(target),
        Box::new(storage),
    )?;
    ctrlc_simple(&explorer.running_flag());

    let report = explorer.run()?;
    println!("{}", format_report(&report));
    Ok(())
}

fn cmd_stats(
    file: PathBuf,
    verb: Option<String>,
    path: Option<String>,
    code: Option<u16>,
) -> Result<(), CliError> {
    let stats = FuzzStats::load(&file)?;
    let results = stats.get_results(verb.as_deref(), path.as_deref(), code);
    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}

fn cmd_union_cov(files: Vec<PathBuf>, output: Option<PathBuf>) -> Result<(), CliError> {
    let union = union_coverage_files(&files)?;
    info!("merged coverage from {} files", files.len());
    if let Some(path) = output {
        std::fs::write(&path, serde_json::to_vec(&union)?)?;
        println!("Saved merged coverage to {:?}", path);
    }
    println!("Coverage: {:.2}%", calculate_coverage_percentage(&union));
    Ok(())
}

/// Signal handler for SIGINT + SIGTERM (avoids pulling in ctrlc crate).
///
/// The first signal stops the loop once the in-flight request returns.
/// A second one exits right away.
fn ctrlc_simple(running: &Arc<AtomicBool>) {
    let r = running.clone();
    unsafe {
        static mut RUNNING: *const AtomicBool = std::ptr::null();
        // Leaked: the handler may fire at any point until exit.
        RUNNING = Arc::into_raw(r);

        extern "C" fn handler(_: libc::c_int) {
            unsafe {
                if !RUNNING.is_null() && !(*RUNNING).swap(false, Ordering::Relaxed) {
                    libc::_exit(130);
                }
            }
        }

        let h = handler as *const () as libc::sighandler_t;
        libc::signal(libc::SIGINT, h);
        libc::signal(libc::SIGTERM, h);
    }
}
