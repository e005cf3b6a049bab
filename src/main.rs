mod commands;

use clap::Parser;
use color_eyre::Result;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rrsync::{Config, RestaurantClient};

#[derive(Parser, Debug)]
#[command(name = "rrsync")]
#[command(about = "Offline-first client for the restaurant reviews API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/rrsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Backend origin, overrides the config file
  #[arg(long, value_name = "URL")]
  api_url: Option<String>,

  #[command(subcommand)]
  command: commands::Command,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let config = match &args.api_url {
    Some(url) => config.with_api_url(url)?,
    None => config,
  };

  // Only the daemon keeps a log file
  let log_dir = match args.command {
    commands::Command::Watch => config.log_dir(),
    _ => None,
  };
  let _log_guard = init_tracing(log_dir.as_deref());

  let client = RestaurantClient::new(&config)?;
  commands::run(args.command, &client, &config).await
}

/// Log to stderr, plus a daily rolling file when `log_dir` is given.
/// Default level is info; RUST_LOG overrides it.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

  let (file_layer, guard) = match log_dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "rrsync.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      (
        Some(fmt::layer().with_writer(writer).with_ansi(false)),
        Some(guard),
      )
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(std::io::stderr))
    .with(file_layer)
    .init();

  guard
}
