// venue-booker: command line front end for the booking engine

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use venue_booker::{
    config::parse_target_date,
    schedule::{next_occurrence, parse_start_time, wait_until},
    AuthGuard, AvailabilityMonitor, BookingConfig, Clock, ConfigStore, Credentials,
    HttpVenueApi, Orchestrator, RunState, SessionStore, SlotCatalog, StatusSnapshot,
    SystemClock, TimeWindow, VenueApi,
};

#[derive(Parser)]
#[command(name = "venue-booker")]
#[command(about = "Discover and book sports venue slots")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Booking config (JSON). Missing fields fall back to defaults.
    #[arg(long, short, env = "VENUE_BOOKER_CONFIG", default_value = "booking_config.json")]
    config: PathBuf,

    /// Cookie file, either "a=b; c=d" or one pair per line
    #[arg(long, env = "VENUE_BOOKER_COOKIES", default_value = "cookies.txt")]
    cookie_file: PathBuf,

    /// Override the target date (YYYY-MM-DD)
    #[arg(long)]
    date: Option<String>,

    /// Override the preferred windows, most preferred first (repeatable)
    #[arg(long = "window")]
    windows: Vec<String>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the booking loop until the cap, the daily limit, the retry budget or Ctrl-C
    Run {
        /// Wait until this time of day (HH:MM:SS) before starting
        #[arg(long)]
        at: Option<String>,

        /// Seconds between progress lines
        #[arg(long, default_value = "5")]
        status_interval: u64,
    },

    /// Query availability once and print it grouped by window
    Discover,

    /// Check whether the stored cookies are still logged in
    CheckLogin,

    /// Poll availability and report venues that appear or disappear
    Monitor {
        /// Seconds between checks (defaults to the config retry interval)
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Write a config file with defaults filled in
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = resolve_config(&cli)?;

    match &cli.command {
        Commands::InitConfig { force } => init_config(&cli.config, &config, *force),
        Commands::CheckLogin => check_login(&cli, &config).await,
        Commands::Discover => discover(&cli, &config).await,
        Commands::Monitor { interval } => monitor(&cli, &config, *interval).await,
        Commands::Run { at, status_interval } => {
            run(&cli, config, at.as_deref(), *status_interval).await
        }
    }
}

// init-config --force rewrites the file, so it never needs to parse the old one
fn resolve_config(cli: &Cli) -> Result<BookingConfig> {
    match cli.command {
        Commands::InitConfig { force: true } => apply_overrides(cli, BookingConfig::default()),
        _ => load_config(cli),
    }
}

fn load_config(cli: &Cli) -> Result<BookingConfig> {
    let config = if cli.config.exists() {
        BookingConfig::load(&cli.config)
            .with_context(|| format!("failed to load {}", cli.config.display()))?
    } else {
        warn!(path = %cli.config.display(), "config file not found, using defaults");
        BookingConfig::default()
    };
    apply_overrides(cli, config)
}

fn apply_overrides(cli: &Cli, mut config: BookingConfig) -> Result<BookingConfig> {
    if let Some(date) = &cli.date {
        config.target_date = parse_target_date(date)?;
    }
    if !cli.windows.is_empty() {
        config.preferred_windows = cli
            .windows
            .iter()
            .map(|w| w.parse::<TimeWindow>())
            .collect::<Result<_, _>>()?;
    }
    Ok(config)
}

fn load_session(cli: &Cli) -> Result<Credentials> {
    Credentials::from_file(&cli.cookie_file)
        .with_context(|| format!("failed to read cookies from {}", cli.cookie_file.display()))
}

fn http_api(config: &BookingConfig) -> Result<Arc<dyn VenueApi>> {
    Ok(Arc::new(HttpVenueApi::new(config)?))
}

fn init_config(path: &Path, config: &BookingConfig, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists, pass --force to overwrite", path.display());
    }
    config.save(path)?;
    println!("Wrote {}", path.display());
    Ok(())
}

async fn check_login(cli: &Cli, config: &BookingConfig) -> Result<()> {
    let creds = load_session(cli)?;
    let guard = AuthGuard::new(http_api(config)?);
    let status = guard.check(&creds).await;
    println!("{status}");
    if !status.is_valid() {
        bail!("login check failed");
    }
    Ok(())
}

async fn discover(cli: &Cli, config: &BookingConfig) -> Result<()> {
    let creds = load_session(cli)?;
    let catalog = SlotCatalog::new(http_api(config)?);
    let discovery = catalog
        .discover_detailed(config, &creds, SystemClock.now())
        .await;

    println!(
        "{} {} / {}",
        config.target_date_str(),
        config.campus_name(),
        config.sport_code
    );
    for window in &discovery.skipped {
        println!("  {window}: skipped (already started)");
    }
    for (window, err) in &discovery.failures {
        println!("  {window}: query failed ({err})");
    }
    for window in &discovery.queried {
        if discovery.failures.iter().any(|(w, _)| w == window) {
            continue;
        }
        let venues: Vec<_> = discovery
            .slots
            .iter()
            .filter(|s| &s.window == window)
            .map(|s| s.venue_name.as_str())
            .collect();
        if venues.is_empty() {
            println!("  {window}: none");
        } else {
            println!("  {window}: {}", venues.join(", "));
        }
    }
    println!("{} bookable venue(s)", discovery.slots.len());
    Ok(())
}

async fn monitor(cli: &Cli, config: &BookingConfig, interval: Option<u64>) -> Result<()> {
    let creds = load_session(cli)?;
    let catalog = SlotCatalog::new(http_api(config)?);
    let mut monitor = AvailabilityMonitor::new(config.preferred_windows.clone());
    let interval = Duration::from_secs(interval.unwrap_or(config.retry_interval_secs).max(1));

    loop {
        let slots = catalog.discover(config, &creds, SystemClock.now()).await;
        let pass = monitor.observe(&slots);

        println!("[check {}]", pass.check);
        for report in &pass.windows {
            for venue in &report.appeared {
                println!("  + {} {venue}", report.window);
            }
            for venue in &report.disappeared {
                println!("  - {} {venue}", report.window);
            }
            if !report.changed() {
                println!("  {}: {} available", report.window, report.available.len());
            }
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    println!("Monitor stopped after {} check(s)", monitor.checks());
    Ok(())
}

async fn run(cli: &Cli, config: BookingConfig, at: Option<&str>, status_interval: u64) -> Result<()> {
    config.validate()?;
    let creds = load_session(cli)?;
    let api = http_api(&config)?;

    if let Some(at) = at {
        let start = next_occurrence(SystemClock.now(), parse_start_time(at)?);
        println!("Waiting until {start}");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let ctrl_c = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                trigger.cancel();
            }
        });
        let reached = wait_until(&SystemClock, start, &cancel).await;
        ctrl_c.abort();
        if !reached {
            println!("Cancelled before start");
            return Ok(());
        }
    }

    let orchestrator = Orchestrator::new(
        api,
        Arc::new(ConfigStore::new(config)),
        Arc::new(SessionStore::new(creds)),
    );
    orchestrator.start_run().await?;

    let mut ticker = tokio::time::interval(Duration::from_secs(status_interval.max(1)));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, stopping");
                orchestrator.stop_run();
            }
            _ = orchestrator.wait() => break,
            _ = ticker.tick() => print_progress(&orchestrator.status()),
        }
    }

    if !orchestrator.shutdown(Duration::from_secs(5)).await {
        warn!("worker had to be aborted");
    }
    print_summary(&orchestrator.status());
    Ok(())
}

fn print_progress(status: &StatusSnapshot) {
    if status.state == RunState::Running || status.state == RunState::Stopping {
        println!(
            "[{}] cycle {} | {} booked | {}",
            status.elapsed,
            status.retry_count,
            status.booking_records.len(),
            status.last_status_line
        );
    }
}

fn print_summary(status: &StatusSnapshot) {
    println!("{}", status.last_status_line);
    if let Some(err) = &status.last_error {
        println!("Last error: {err}");
    }
    for record in &status.booking_records {
        println!(
            "  {} (order {}, {})",
            record.label,
            record.confirmation_id,
            record.booked_at.format("%H:%M:%S")
        );
    }
    println!("Elapsed {}", status.elapsed);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_file(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("venue-booker-{}-{name}", std::process::id()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_init_config_force_overwrites_corrupt_file() {
        let path = scratch_file("corrupt.json", "{ not json");
        let path_arg = path.to_str().unwrap();

        let plain = Cli::try_parse_from(["venue-booker", "--config", path_arg, "init-config"]).unwrap();
        assert!(resolve_config(&plain).is_err());

        let forced = Cli::try_parse_from([
            "venue-booker",
            "--config",
            path_arg,
            "--date",
            "2025-06-12",
            "init-config",
            "--force",
        ])
        .unwrap();
        let config = resolve_config(&forced).unwrap();
        assert_eq!(config.target_date_str(), "2025-06-12");
        init_config(&forced.config, &config, true).unwrap();

        let written = BookingConfig::load(&path).unwrap();
        assert_eq!(written.target_date_str(), "2025-06-12");
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_init_config_refuses_existing_file_without_force() {
        let path = scratch_file("existing.json", "{}");
        let err = init_config(&path, &BookingConfig::default(), false).unwrap_err();
        assert!(err.to_string().contains("--force"));
        std::fs::remove_file(&path).unwrap();
    }
}
