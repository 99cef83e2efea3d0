use std::process::ExitCode;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::Parser;
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use ows_fieldpack::cancel::CancelToken;
use ows_fieldpack::capabilities::HttpCatalogClient;
use ows_fieldpack::config::{
    DEFAULT_BACKOFF_SECS, DEFAULT_DISCOVERY_TIMEOUT_SECS, DEFAULT_GEOSERVER_BASE,
    DEFAULT_MAX_ATTEMPTS, DEFAULT_SLEEP_SECS, DEFAULT_TIMEOUT_SECS, PackConfig,
};
use ows_fieldpack::error::PackError;
use ows_fieldpack::output::{JsonOutput, OutputMode};
use ows_fieldpack::run::{PackRunner, RunReport};
use ows_fieldpack::transfer::HttpTransferClient;

#[derive(Parser)]
#[command(name = "ows-fieldpack")]
#[command(about = "Download matching WFS/WCS layers from a geospatial server for offline use")]
#[command(version, author)]
struct Cli {
    /// GeoServer base URL (the `/ows` endpoint lives under it)
    #[arg(long, default_value = DEFAULT_GEOSERVER_BASE)]
    geoserver_base: String,

    /// Root directory for packs
    #[arg(long, default_value = "packs")]
    out_dir: Utf8PathBuf,

    /// Pack folder name under the output root
    #[arg(long, default_value = "fieldpack")]
    pack_name: String,

    /// Regex matched case-insensitively against layer names (repeatable)
    #[arg(long = "pattern")]
    patterns: Vec<String>,

    /// Also download WCS coverages as GeoTIFF (can be large)
    #[arg(long)]
    include_rasters: bool,

    /// Verify TLS certificates (off by default; these servers commonly
    /// present chains that fail standard validation)
    #[arg(long)]
    verify_tls: bool,

    /// Only discover and write manifest/README, do not download
    #[arg(long)]
    discover_only: bool,

    /// Re-download items that already exist on disk
    #[arg(long)]
    force: bool,

    /// Retry attempts per item
    #[arg(long, default_value_t = DEFAULT_MAX_ATTEMPTS)]
    max_attempts: u32,

    /// Per-request timeout in seconds (rasters can be slow)
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS)]
    timeout: u64,

    /// Capability-request timeout in seconds
    #[arg(long, default_value_t = DEFAULT_DISCOVERY_TIMEOUT_SECS)]
    discovery_timeout: u64,

    /// Base retry backoff in seconds (doubles per attempt, capped at 60)
    #[arg(long, default_value_t = DEFAULT_BACKOFF_SECS)]
    backoff: f64,

    /// Sleep between downloads in seconds
    #[arg(long, default_value_t = DEFAULT_SLEEP_SECS)]
    sleep: f64,

    /// Concurrent download workers
    #[arg(long, default_value_t = 1)]
    concurrency: usize,

    /// Print the run report as JSON instead of a text summary
    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(pack) = report.downcast_ref::<PackError>() {
            return ExitCode::from(map_exit_code(pack));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &PackError) -> u8 {
    match error {
        PackError::InvalidBaseUrl(_) | PackError::InvalidPattern { .. } => 2,
        PackError::HttpClient(_)
        | PackError::DiscoveryHttp(_)
        | PackError::DiscoveryStatus { .. } => 3,
        PackError::Filesystem(_) | PackError::ManifestWrite(_) => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Text
    };

    let pack_dir = cli.out_dir.join(&cli.pack_name);
    let mut config = PackConfig::new(cli.geoserver_base, pack_dir, cli.patterns);
    config.include_rasters = cli.include_rasters;
    config.verify_tls = cli.verify_tls;
    config.discover_only = cli.discover_only;
    config.force = cli.force;
    config.max_attempts = cli.max_attempts;
    config.timeout = Duration::from_secs(cli.timeout);
    config.discovery_timeout = Duration::from_secs(cli.discovery_timeout);
    config.base_backoff = Duration::from_secs_f64(cli.backoff);
    config.sleep_between = Duration::from_secs_f64(cli.sleep);
    config.concurrency = cli.concurrency;
    let config = config.resolve().into_diagnostic()?;

    let catalog = HttpCatalogClient::new(
        &config.base_url,
        config.discovery_timeout,
        config.verify_tls,
    )
    .into_diagnostic()?;
    let transfer = HttpTransferClient::new(
        config.timeout,
        config.verify_tls,
        config.max_attempts,
        config.base_backoff,
    )
    .into_diagnostic()?;

    let pack_dir = config.pack_dir.clone();
    let runner = PackRunner::new(config, catalog, transfer);
    let report = runner.run(&CancelToken::new()).into_diagnostic()?;

    match output_mode {
        OutputMode::Json => JsonOutput::print_report(&report).into_diagnostic()?,
        OutputMode::Text => print_summary(&report, &pack_dir),
    }
    // Partial success is the steady state for this tool; only discovery or
    // manifest failure exits non-zero.
    Ok(())
}

fn print_summary(report: &RunReport, pack_dir: &Utf8PathBuf) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let red = "\x1b[31m";
    let reset = "\x1b[0m";

    let summary = &report.summary;
    println!("{cyan}Pack: {pack_dir}{reset}");
    println!(
        "{green}planned: {} | downloaded: {} | skipped: {} | failed: {}{reset}",
        summary.planned, summary.downloaded, summary.skipped, summary.failed
    );
    if summary.no_data > 0 {
        println!("{yellow}no data: {}{reset}", summary.no_data);
    }
    if summary.cancelled > 0 {
        println!("{yellow}cancelled: {}{reset}", summary.cancelled);
    }
    for row in &report.rows {
        if !row.error.is_empty() {
            println!("{red}FAILED {} {} :: {}{reset}", row.kind, row.name, row.error);
        }
    }
}
