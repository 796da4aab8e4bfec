// file: src/main.rs
// description: commandline application entry point with command handling
// reference: application bootstrap and orchestration

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tube_relay::chat::console::CONSOLE_REQUESTER;
use tube_relay::chat::{Command, MessageClassifier};
use tube_relay::utils::logging::{format_error, format_info, format_success, format_warning};
use tube_relay::{
    AuthorizationCode, Config, ConsoleSink, CredentialStore, Dispatcher, DriveClient,
    GoogleOAuthClient, HealthCheck, HealthReport, HealthStatus, InboundEvent, JobState,
    MediaExtractor, NotificationSink, Orchestrator, PipelineServices, RelayError, TelegramBot,
    Validator, YtDlpExtractor,
};

const INBOUND_CAPACITY: usize = 64;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "tube_relay")]
#[command(author = "cipher")]
#[command(version = "0.1.0")]
#[command(about = "Relay YouTube videos from a chat bot into Google Drive", long_about = None)]
struct Cli {
    #[arg(
        short,
        long,
        value_name = "FILE",
        default_value = "config/default.toml"
    )]
    config: PathBuf,

    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    color: bool,

    #[arg(short, long, action = ArgAction::SetTrue)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Telegram bot (long polling) until Ctrl-C
    Run,

    /// Authorize Google Drive access from the terminal
    Auth {
        /// Start a new authorization even when a usable token exists
        #[arg(long)]
        force: bool,
    },

    /// Download one video and upload it with console progress
    Fetch {
        /// YouTube video link
        url: String,
    },

    /// Check the extractor, stored token and Telegram connectivity
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tube_relay::utils::logging::init_logger(cli.color, cli.verbose);

    info!("Tube Relay");
    info!("Loading configuration from: {}", cli.config.display());

    let config = if cli.config.exists() {
        Config::load(Some(cli.config.as_path())).context("Failed to load configuration")?
    } else {
        warn!(
            "Config file {} not found, using default configuration",
            cli.config.display()
        );
        Config::load(None).context("Failed to load configuration from environment")?
    };

    match cli.command {
        Commands::Run => cmd_run(config).await?,
        Commands::Auth { force } => cmd_auth(&config, force).await?,
        Commands::Fetch { url } => cmd_fetch(config, &url, cli.color).await?,
        Commands::Doctor => cmd_doctor(&config).await?,
    }

    Ok(())
}

async fn open_credentials(config: &Config) -> Result<Arc<CredentialStore>> {
    let provider =
        GoogleOAuthClient::new(&config.drive).context("Invalid Google OAuth configuration")?;
    let store = CredentialStore::open(
        config.drive.token_path.clone(),
        Arc::new(provider),
        config.pipeline.authorization_ttl(),
    )
    .await
    .context("Failed to open credential store")?;

    Ok(Arc::new(store))
}

fn build_services(
    config: &Config,
    credentials: Arc<CredentialStore>,
    sink: Arc<dyn NotificationSink>,
) -> Result<PipelineServices> {
    let extractor = YtDlpExtractor::new(config.extractor.binary.clone(), config.extractor.timeout());
    let storage = DriveClient::new().context("Failed to create Drive client")?;

    Ok(PipelineServices {
        credentials,
        extractor: Arc::new(extractor),
        storage: Arc::new(storage),
        sink,
    })
}

async fn cmd_run(config: Config) -> Result<()> {
    let bot = Arc::new(TelegramBot::new(&config.telegram).context("Failed to create Telegram bot")?);
    let identity = bot
        .get_me()
        .await
        .context("Telegram rejected the bot token")?;
    info!("Connected to Telegram as {}", identity);

    let credentials = open_credentials(&config).await?;
    let shutdown = CancellationToken::new();
    let services = build_services(&config, Arc::clone(&credentials), bot.clone())?;
    let orchestrator = Orchestrator::new(config, services, shutdown.clone());

    orchestrator
        .sweep_stale_artifacts()
        .await
        .context("Failed to sweep stale artifacts")?;

    let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
    let listener = Arc::clone(&bot).spawn_listener(tx, shutdown.clone());

    let dispatcher = Dispatcher::new(Arc::clone(&orchestrator), credentials, bot);
    let dispatch_shutdown = shutdown.clone();
    let dispatch = tokio::spawn(async move { dispatcher.run(rx, dispatch_shutdown).await });

    info!("Bot running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    warn!("Shutdown requested, abandoning in-flight transfers");
    shutdown.cancel();

    if !orchestrator.drain(SHUTDOWN_GRACE).await {
        error!(
            "{} job(s) did not finish within {:?}",
            orchestrator.active_jobs(),
            SHUTDOWN_GRACE
        );
    }

    if let Err(e) = listener.await {
        error!("Listener task failed: {}", e);
    }
    if let Err(e) = dispatch.await {
        error!("Dispatcher task failed: {}", e);
    }

    info!("Shutdown complete");
    Ok(())
}

async fn cmd_auth(config: &Config, force: bool) -> Result<()> {
    let credentials = open_credentials(config).await?;

    if !force {
        match credentials.ensure_valid().await {
            Ok(credential) => {
                println!(
                    "{}",
                    format_success(&format!(
                        "Already authorized (token valid until {}). Use --force to re-authorize.",
                        credential.expiry.format("%Y-%m-%d %H:%M UTC")
                    ))
                );
                return Ok(());
            }
            Err(e) if e.requires_authorization() => {}
            Err(e) => return Err(e).context("Failed to check stored token"),
        }
    }

    let url = credentials.begin_authorization(CONSOLE_REQUESTER);
    println!("{}", format_info("Open this URL in a browser and allow access:"));
    println!("\n{}\n", url);
    print!("Paste the code or the redirect address: ");
    std::io::stdout().flush().context("Failed to flush stdout")?;

    let line = tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line).map(|_| line)
    })
    .await
    .context("Input task failed")?
    .context("Failed to read from stdin")?;

    let code = match MessageClassifier::classify(&line) {
        Command::AuthorizationCode(code) => code,
        _ => AuthorizationCode::bare(line.trim()),
    };

    credentials
        .complete_authorization(CONSOLE_REQUESTER, &code)
        .await
        .context("Authorization failed")?;

    println!(
        "{}",
        format_success(&format!(
            "Token stored at {}",
            credentials.token_path().display()
        ))
    );
    Ok(())
}

async fn cmd_fetch(config: Config, url: &str, color: bool) -> Result<()> {
    let sink: Arc<ConsoleSink> = Arc::new(ConsoleSink::new(color));
    let credentials = open_credentials(&config).await?;
    let shutdown = CancellationToken::new();
    let services = build_services(&config, Arc::clone(&credentials), sink.clone())?;
    let orchestrator = Orchestrator::new(config, services, shutdown.clone());

    // terminal lines feed the same dispatcher the bot uses: codes, /cancel, /status
    let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
    spawn_stdin_reader(tx);
    let dispatcher = Dispatcher::new(Arc::clone(&orchestrator), credentials, sink);
    let dispatch_shutdown = shutdown.child_token();
    let dispatch_stop = dispatch_shutdown.clone();
    tokio::spawn(async move { dispatcher.run(rx, dispatch_shutdown).await });

    let ticket = orchestrator
        .submit(CONSOLE_REQUESTER, url)
        .await
        .context("Failed to start transfer")?;

    let start = Instant::now();
    let mut handle = ticket.handle;
    let job = tokio::select! {
        job = &mut handle => job.context("Transfer task failed")?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling transfer");
            shutdown.cancel();
            handle.await.context("Transfer task failed")?
        }
    };
    dispatch_stop.cancel();

    match job.state {
        JobState::Succeeded => {
            info!(
                "Transfer finished in {:.1}s: {}",
                start.elapsed().as_secs_f64(),
                job.remote_link().unwrap_or_default()
            );
            Ok(())
        }
        JobState::Cancelled => {
            println!("{}", format_warning("Transfer cancelled"));
            Ok(())
        }
        _ => {
            let reason = job
                .last_error
                .map(|e| e.message)
                .unwrap_or_else(|| "unknown error".to_string());
            println!("{}", format_error(&reason));
            Err(anyhow::anyhow!("Transfer failed: {}", reason))
        }
    }
}

/// Blocking stdin reads on a detached thread so the process can exit while
/// the terminal is idle.
fn spawn_stdin_reader(tx: mpsc::Sender<InboundEvent>) {
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if line.trim().is_empty() {
                continue;
            }
            if tx
                .blocking_send(InboundEvent::new(CONSOLE_REQUESTER, line))
                .is_err()
            {
                break;
            }
        }
    });
}

async fn cmd_doctor(config: &Config) -> Result<()> {
    info!("Running health checks");
    let mut checks = Vec::new();

    let extractor = YtDlpExtractor::new(config.extractor.binary.clone(), config.extractor.timeout());
    let started = Instant::now();
    checks.push(match extractor.version().await {
        Ok(version) => HealthCheck::healthy(
            "extractor",
            Some(format!("{} {}", config.extractor.binary, version)),
            started.elapsed(),
        ),
        Err(e) => HealthCheck::unhealthy("extractor", format!("{:#}", e), started.elapsed()),
    });

    let started = Instant::now();
    let download_dir = &config.extractor.download_dir;
    checks.push(
        match std::fs::create_dir_all(download_dir)
            .map_err(RelayError::from)
            .and_then(|_| Validator::validate_directory(download_dir))
        {
            Ok(()) => HealthCheck::healthy(
                "download_dir",
                Some(download_dir.display().to_string()),
                started.elapsed(),
            ),
            Err(e) => HealthCheck::unhealthy("download_dir", e.to_string(), started.elapsed()),
        },
    );

    let started = Instant::now();
    checks.push(match open_credentials(config).await {
        Ok(store) => match store.get().await {
            Ok(credential) if !credential.is_expired(chrono::Duration::zero()) => {
                HealthCheck::healthy(
                    "credentials",
                    Some(format!("valid until {}", credential.expiry)),
                    started.elapsed(),
                )
            }
            Ok(credential) if credential.is_refreshable() => HealthCheck::degraded(
                "credentials",
                "access token expired, will be refreshed on next use".to_string(),
                started.elapsed(),
            ),
            Ok(_) => HealthCheck::degraded(
                "credentials",
                "token expired and not refreshable; run `tube_relay auth`".to_string(),
                started.elapsed(),
            ),
            Err(_) => HealthCheck::degraded(
                "credentials",
                "not authorized; run `tube_relay auth`".to_string(),
                started.elapsed(),
            ),
        },
        Err(e) => HealthCheck::unhealthy("credentials", format!("{:#}", e), started.elapsed()),
    });

    let started = Instant::now();
    checks.push(match TelegramBot::new(&config.telegram) {
        Ok(bot) => match bot.get_me().await {
            Ok(identity) => HealthCheck::healthy("telegram", Some(identity), started.elapsed()),
            Err(e) => HealthCheck::unhealthy("telegram", e.to_string(), started.elapsed()),
        },
        Err(e) => HealthCheck::degraded("telegram", e.to_string(), started.elapsed()),
    });

    let report = HealthReport::new(checks, env!("CARGO_PKG_VERSION").to_string());
    println!("{}", report.format());

    if report.overall_status == HealthStatus::Unhealthy {
        return Err(anyhow::anyhow!("Health check failed"));
    }
    Ok(())
}
