//! Binary entry point for the Tally stats service and administrative CLI.
#![forbid(unsafe_code)]

use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use tally::service::StatsService;
use tally::{server, Config, StatsKind};

#[derive(Parser, Debug)]
#[command(
    name = "tally",
    version,
    about = "Application statistics aggregation service",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_name = "FILE",
        help = "Path to a TOML configuration file"
    )]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_name = "DIR",
        help = "Override the configured data directory"
    )]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP ingest server with the rollup scheduler
    Serve(ServeCmd),
    /// Run one update round on every counter of a stats kind
    UpdateCounters(StatsArgs),
    /// Rebuild the materialized view of a stats kind
    UpdateCache(StatsArgs),
    /// Remove periodic archive rows older than the given age
    StripDb(StripDbCmd),
    /// Wipe all counter state and archive collections
    Clear,
    /// Compare recent and reference windows and report anomalies
    FindAnomalies(FindAnomaliesCmd),
}

#[derive(Args, Debug)]
struct ServeCmd {
    #[arg(long, help = "Network interface to bind to")]
    host: Option<IpAddr>,

    #[arg(long, help = "Listening port")]
    port: Option<u16>,
}

#[derive(Args, Debug)]
struct StatsArgs {
    #[arg(long, value_enum, help = "Statistics family to operate on")]
    stats: StatsKindArg,
}

#[derive(Args, Debug)]
struct StripDbCmd {
    #[arg(long, help = "Remove rows older than this many days")]
    days: u32,

    #[arg(long, value_enum, help = "Restrict to one statistics family")]
    stats: Option<StatsKindArg>,
}

#[derive(Args, Debug)]
struct FindAnomaliesCmd {
    #[arg(long = "refhours", help = "Reference window length in hours")]
    ref_hours: u32,

    #[arg(long = "checkhours", help = "Check window length in hours")]
    check_hours: u32,

    #[arg(long, help = "Detection sensitivity, strictly between 0 and 1")]
    sensitivity: f64,

    #[arg(
        long,
        value_enum,
        default_value_t = OutputMode::Console,
        help = "Where to report detected anomalies"
    )]
    mode: OutputMode,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StatsKindArg {
    Apps,
    Tasks,
}

impl From<StatsKindArg> for StatsKind {
    fn from(arg: StatsKindArg) -> Self {
        match arg {
            StatsKindArg::Apps => StatsKind::Apps,
            StatsKindArg::Tasks => StatsKind::Tasks,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputMode {
    /// Print one line per anomaly; the archive is updated as well
    Console,
    /// Update the anomalies collection only
    Store,
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> tally::Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }

    match cli.command {
        Command::Serve(cmd) => {
            if let Some(host) = cmd.host {
                config.http.host = host;
            }
            if let Some(port) = cmd.port {
                config.http.port = port;
            }
            let (host, port) = (config.http.host, config.http.port);
            let service = Arc::new(StatsService::open(config)?);
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(server::serve(service, host, port))
        }
        Command::UpdateCounters(args) => with_service(config, |service| {
            service.update_counters(args.stats.into())
        }),
        Command::UpdateCache(args) => {
            with_service(config, |service| service.update_cache(args.stats.into()))
        }
        Command::StripDb(cmd) => with_service(config, |service| {
            let removed = service.strip_db(cmd.stats.map(Into::into), cmd.days)?;
            println!("removed {removed} archive rows older than {} days", cmd.days);
            Ok(())
        }),
        Command::Clear => with_service(config, |service| service.clear()),
        Command::FindAnomalies(cmd) => with_service(config, |service| {
            let anomalies =
                service.find_anomalies(cmd.ref_hours, cmd.check_hours, cmd.sensitivity)?;
            if cmd.mode == OutputMode::Console {
                for anomaly in &anomalies {
                    println!("{} {} {}", anomaly.app_id, anomaly.name, anomaly.field);
                }
            }
            println!("{} anomalies detected", anomalies.len());
            Ok(())
        }),
    }
}

/// Open the service, run one operation, and flush the store snapshot.
fn with_service<F>(config: Config, op: F) -> tally::Result<()>
where
    F: FnOnce(&StatsService) -> tally::Result<()>,
{
    let service = StatsService::open(config)?;
    op(&service)?;
    service.persist()
}
