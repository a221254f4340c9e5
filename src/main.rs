use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};

use cookie_bot::auth::{KeyProvider, PlatformKeyProvider};
use cookie_bot::config::{default_user_data_dir, discover_profiles, AppConfig, ConfigError};
use cookie_bot::control::{ControlClient, ControlCommand, ControlResponse, ControlServer};
use cookie_bot::generator::CommandGenerator;
use cookie_bot::scheduler::{JobScheduler, SchedulerContext, WorkOutcome};
use tokio_util::sync::CancellationToken;

/// Keeps browser sessions fresh and generates aliases on a schedule
#[derive(Parser, Debug)]
#[command(name = "cookie-bot", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Config file path (defaults to the platform config dir)
    #[arg(long, global = true, env = "COOKIE_BOT_CONFIG")]
    config: Option<PathBuf>,

    /// Run the scheduler non-interactively (plain log output)
    #[arg(long, global = true)]
    daemon: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler until Ctrl-C or `stop` (default)
    Start,
    /// Ask the running scheduler to finish its work and exit
    Stop,
    /// Run one profile, or all, immediately
    RunNow {
        /// Profile id (all profiles when omitted)
        profile: Option<String>,
    },
    /// Print the schedule and session state as JSON
    Status,
    /// Discover browser profiles and add them to the config
    Configure {
        /// Browser user data directory to scan
        #[arg(long)]
        user_data_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    cookie_bot::init_tracing(!cli.daemon);

    match run(cli).await {
        Ok(()) => ExitCode::from(cookie_bot::exit_code::OK),
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::from(cookie_bot::exit_code_for(&e))
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = match cli.config {
        Some(path) => path,
        None => AppConfig::default_path()?,
    };

    match cli.command.unwrap_or(Command::Start) {
        Command::Configure { user_data_dir } => configure(&config_path, user_data_dir),
        Command::Start => {
            let scheduler = build(load(&config_path)?, true)?;
            serve(scheduler).await
        }
        Command::Stop => {
            let config = load(&config_path)?;
            match ControlClient::connect(&config.sessions_dir).await? {
                Some(client) => {
                    client.send(ControlCommand::Stop).await?;
                    println!("Stop requested");
                }
                None => println!("cookie-bot is not running"),
            }
            Ok(())
        }
        Command::RunNow { profile } => {
            let config = load(&config_path)?;
            let outcomes = match ControlClient::connect(&config.sessions_dir).await? {
                Some(client) => match client.send(ControlCommand::RunNow { profile }).await? {
                    ControlResponse::Outcomes { outcomes } => outcomes,
                    other => anyhow::bail!("unexpected daemon response: {:?}", other),
                },
                None => run_locally(build(config, true)?, profile.as_deref()).await?,
            };
            for (profile_id, outcome) in &outcomes {
                println!("{}: {}", profile_id, serde_json::to_string(outcome)?);
            }
            Ok(())
        }
        Command::Status => {
            let config = load(&config_path)?;
            let status = match ControlClient::connect(&config.sessions_dir).await? {
                Some(client) => match client.send(ControlCommand::Status).await? {
                    ControlResponse::Status { status } => status,
                    other => anyhow::bail!("unexpected daemon response: {:?}", other),
                },
                None => build(config, false)?.status(Utc::now()),
            };
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
    }
}

fn load(config_path: &std::path::Path) -> Result<AppConfig> {
    AppConfig::load(config_path).with_context(|| format!("loading {}", config_path.display()))
}

/// Opens the session store and (optionally) checks key access
fn build(config: AppConfig, preflight: bool) -> Result<JobScheduler> {
    let keys = Arc::new(PlatformKeyProvider::new(&config.profiles, &config.browser));
    if preflight {
        for profile in &config.profiles {
            keys.resolve_key(profile)
                .with_context(|| format!("resolving the cookie key for profile {}", profile.id))?;
        }
        tracing::info!(sources = keys.source_count(), "Cookie keys available");
    }

    let generator = Arc::new(CommandGenerator::from_settings(&config.generator));
    let ctx = SchedulerContext::new(&config, keys, generator)
        .with_context(|| format!("opening sessions dir {}", config.sessions_dir.display()))?;
    Ok(JobScheduler::new(Arc::new(ctx), Utc::now()))
}

/// Runs in this process when no daemon serves the sessions dir
async fn run_locally(
    scheduler: JobScheduler,
    profile: Option<&str>,
) -> Result<Vec<(String, WorkOutcome)>> {
    Ok(scheduler.run_now(profile, Utc::now())?.join().await)
}

async fn serve(scheduler: JobScheduler) -> Result<()> {
    let control = ControlServer::bind(scheduler.context().repository()).await?;
    scheduler.start().await?;

    let shutdown = CancellationToken::new();
    let control = tokio::spawn(control.serve(scheduler.clone(), shutdown.clone()));
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for Ctrl-C")?;
            tracing::info!("Ctrl-C received");
        }
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();

    tracing::info!("Shutdown requested, waiting for running work");
    scheduler.stop().await;
    if let Err(e) = control.await {
        tracing::error!("Control channel ended abnormally: {}", e);
    }

    for profile in scheduler.status(Utc::now()).profiles {
        tracing::info!(
            profile = %profile.profile_id,
            extractions = profile.extractions,
            generations = profile.generations,
            "Final profile stats"
        );
    }
    Ok(())
}

fn configure(config_path: &std::path::Path, user_data_dir: Option<PathBuf>) -> Result<()> {
    let mut config = AppConfig::load_or_default(config_path)?;
    let dir = match user_data_dir.or_else(default_user_data_dir) {
        Some(dir) => dir,
        None => return Err(ConfigError::NoDefaultLocation("browser user data").into()),
    };

    let discovered = discover_profiles(&dir)
        .with_context(|| format!("scanning {}", dir.display()))?;
    let found = discovered.len();
    let added = config.merge_profiles(discovered);
    if config.profiles.is_empty() {
        tracing::warn!(dir = %dir.display(), "No browser profiles with a cookie store found");
    }

    config.save(config_path)?;
    println!(
        "Found {} profile(s) in {}, added {}; {} configured in {}",
        found,
        dir.display(),
        added,
        config.profiles.len(),
        config_path.display()
    );
    Ok(())
}
