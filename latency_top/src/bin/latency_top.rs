//! Report which tables generate the most latency events, and how slow they
//! are, over one sampling interval.

#![allow(clippy::print_stdout)]

use std::{io, path::PathBuf};

use clap::Parser;
use latency_top::{
    compute_delta,
    config::{self, Config},
    report::{self, Format},
    scrape::{self, Scraper},
};
use tokio::{runtime::Builder, signal, time};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("Failed to load configuration: {0}")]
    Config(#[from] config::Error),
    #[error("Scrape failed: {0}")]
    Scrape(#[from] scrape::Error),
    #[error("Failed to compute rates: {0}")]
    Delta(#[from] latency_top::delta::Error),
    #[error("Interrupted before the second sample")]
    Interrupted,
}

#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Args {
    /// path on disk to a YAML configuration file
    #[clap(long)]
    config_path: Option<PathBuf>,
    /// seconds to wait between the two samples, overrides the configuration
    #[clap(long)]
    interval_seconds: Option<u64>,
    /// host to scrape, defaults to the IPv4 address of the local hostname
    #[clap(long)]
    host: Option<String>,
    /// port to scrape
    #[clap(long)]
    port: Option<u16>,
    /// output format of the report
    #[clap(long, value_enum, default_value_t = Format::Table)]
    format: Format,
}

fn load_config(args: &Args) -> Result<Config, Error> {
    let mut config = match &args.config_path {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    if let Some(interval_seconds) = args.interval_seconds {
        config.interval_seconds = interval_seconds;
    }
    if let Some(host) = &args.host {
        config.endpoint.host = Some(host.clone());
    }
    if let Some(port) = args.port {
        config.endpoint.port = port;
    }
    config.validate()?;
    Ok(config)
}

async fn run(config: Config, format: Format) -> Result<(), Error> {
    let scraper = Scraper::new(&config).await?;
    let interval = config.interval();

    info!("Taking first sample, next one in {interval:?}");
    let before = scraper.snapshot().await?;

    tokio::select! {
        () = time::sleep(interval) => {}
        res = signal::ctrl_c() => {
            res?;
            warn!("Interrupt received, no report produced");
            return Err(Error::Interrupted);
        }
    }

    info!("Taking second sample");
    let after = scraper.snapshot().await?;
    let rates = compute_delta(&before, &after)?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    report::render(&mut out, format, config.interval_seconds, &rates)?;
    Ok(())
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .with_ansi(false)
        .finish()
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    let runtime = Builder::new_current_thread().enable_all().build()?;
    let res = runtime.block_on(run(config, args.format));
    if let Err(e) = &res {
        error!("{e}");
    }
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config() {
        let args = Args::parse_from([
            "latency-top",
            "--interval-seconds",
            "5",
            "--host",
            "10.1.2.3",
            "--port",
            "7000",
            "--format",
            "json",
        ]);
        let config = load_config(&args).expect("flags are valid");

        assert_eq!(config.interval_seconds, 5);
        assert_eq!(config.endpoint.host.as_deref(), Some("10.1.2.3"));
        assert_eq!(config.endpoint.port, 7000);
        assert_eq!(args.format, Format::Json);
    }

    #[test]
    fn zero_interval_rejected() {
        let args = Args::parse_from(["latency-top", "--interval-seconds", "0"]);
        assert!(matches!(
            load_config(&args),
            Err(Error::Config(config::Error::ZeroInterval))
        ));
    }

    #[test]
    fn defaults_without_flags() {
        let args = Args::parse_from(["latency-top"]);
        assert_eq!(args.format, Format::Table);
        assert_eq!(load_config(&args).expect("defaults are valid"), Config::default());
    }
}
