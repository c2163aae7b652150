use anyhow::{Context, Result};
use clap::Parser;
use kvtiles::app::{exit_code, run_daemon, wait_for_signal, EXIT_FATAL};
use kvtiles::config::{ConfigOverrides, KvtilesConfig};
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;

#[derive(Parser, Debug)]
#[command(name = "kvtilesd")]
#[command(about = "Vector tiles server with gRPC health and Prometheus metrics")]
#[command(version)]
#[command(long_about = "Serves vector tiles and map pages from a read-only map database. \
Exposes a gRPC health service, Prometheus metrics and an HTTP API on separate ports, \
and drains them in order on SIGINT or SIGTERM.")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "KVTILES_CONFIG", default_value = "kvtiles.toml", help = "Path to TOML configuration file")]
    config: String,

    /// DEBUG|INFO|WARN|ERROR
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Override log format (json, pretty, compact)
    #[arg(long, value_name = "FORMAT", help = "Log output format: json, pretty, or compact")]
    log_format: Option<String>,

    /// Map database path
    #[arg(long, value_name = "PATH")]
    db_path: Option<String>,

    /// Directory holding static files and page templates
    #[arg(long, value_name = "DIR")]
    static_dir: Option<String>,

    #[arg(long, value_name = "PORT")]
    http_metrics_port: Option<u16>,

    #[arg(long, value_name = "PORT")]
    http_api_port: Option<u16>,

    #[arg(long, value_name = "PORT")]
    health_port: Option<u16>,

    /// Budget for draining every service on shutdown
    #[arg(long, value_name = "SECS")]
    shutdown_timeout_secs: Option<u64>,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit without starting the daemon")]
    validate_config: bool,

    /// Print default configuration and exit
    #[arg(long, help = "Print default configuration in TOML format and exit")]
    print_config: bool,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            log_level: self.log_level.clone(),
            log_format: self.log_format.clone(),
            db_path: self.db_path.clone(),
            static_dir: self.static_dir.clone(),
            http_metrics_port: self.http_metrics_port,
            http_api_port: self.http_api_port,
            health_port: self.health_port,
            shutdown_timeout_secs: self.shutdown_timeout_secs,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        print_default_config()?;
        return Ok(());
    }

    let config = match KvtilesConfig::load(&args.config, &args.overrides()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("✗ Failed to load configuration: {}", e);
            std::process::exit(EXIT_FATAL);
        }
    };

    let log_guard = init_logging(&config)?;

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        eprintln!("✗ Configuration validation failed: {}", e);
        std::process::exit(EXIT_FATAL);
    }

    if args.validate_config {
        info!("Configuration validation successful");
        println!("✓ Configuration is valid");
        return Ok(());
    }

    info!("Starting kvtilesd v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    let outcome = run_daemon(&config, wait_for_signal()).await;
    if let Err(e) = &outcome {
        error!("kvtilesd failed: {}", e);
    }

    let code = exit_code(&outcome);
    info!("kvtilesd exited with code: {}", code);

    // Flush buffered log lines before exiting
    drop(log_guard);
    std::process::exit(code);
}

fn init_logging(config: &KvtilesConfig) -> Result<WorkerGuard> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let level = config.log.level.to_ascii_lowercase();
    let verbose = level == "debug";

    // RUST_LOG wins over the configured level
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("kvtiles={0},kvtilesd={0}", level)));

    let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());

    let fmt_layer = match config.log.format.as_str() {
        "json" => fmt::layer()
            .json()
            .with_writer(writer)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        "compact" => fmt::layer()
            .compact()
            .with_writer(writer)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed(),
        "pretty" => fmt::layer()
            .pretty()
            .with_writer(writer)
            .with_target(true)
            .with_thread_ids(verbose)
            .with_file(verbose)
            .with_line_number(verbose)
            .boxed(),
        format => {
            eprintln!("Warning: Unknown log format '{}', using default", format);
            fmt::layer()
                .with_writer(writer)
                .with_target(true)
                .with_thread_ids(verbose)
                .with_file(verbose)
                .with_line_number(verbose)
                .boxed()
        }
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}

/// Print default configuration in TOML format
fn print_default_config() -> Result<()> {
    let defaults = toml::to_string_pretty(&KvtilesConfig::default())
        .context("Failed to serialize default configuration")?;

    println!("# kvtilesd configuration file");
    println!("# Every key can also be set through KVTILES__<SECTION>__<KEY> variables");
    println!();
    println!("{}", defaults);
    Ok(())
}
