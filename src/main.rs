use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use portal_watch::bot::{run_polling, TelegramApi};
use portal_watch::config::{Config, ConfigOverrides};
use portal_watch::notify::TelegramNotifier;
use portal_watch::portal::{HttpPortalClient, PortalClient};
use portal_watch::server::{router, run_server};
use portal_watch::subscription::{Credential, SubscriberId, SubscriptionStore};
use portal_watch::watch::WatchScheduler;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "portal-watch",
    about = "Watches a student portal dashboard and pushes changes to Telegram"
)]
struct Cli {
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the bot and the watch engine.
    Serve {
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        interval_secs: Option<u64>,
    },
    /// Log in once and print the dashboard snapshot.
    Check {
        #[arg(short, long)]
        username: String,
        #[arg(long, env = "PORTAL_PASSWORD", hide_env_values = true)]
        password: String,
    },
    Config {
        #[arg(long)]
        init: bool,
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let mut config = Config::load(Some(&config_path))?;
    let mut overrides = ConfigOverrides::from_env();

    match cli.command {
        Commands::Config { init, show } => handle_config_command(init, show, &config, &config_path),
        Commands::Check { username, password } => {
            config.apply_overrides(overrides);
            run_check(&config, &username, &password).await
        }
        Commands::Serve {
            port,
            interval_secs,
        } => {
            overrides.port = port.or(overrides.port);
            overrides.interval_secs = interval_secs;
            config.apply_overrides(overrides);
            serve(config).await
        }
    }
}

fn handle_config_command(init: bool, show: bool, config: &Config, config_path: &Path) -> Result<()> {
    if init {
        Config::write_template(config_path)?;
        println!("Wrote config template to {}", config_path.display());
    }
    if show || !init {
        println!("{}", serde_json::to_string_pretty(config)?);
    }
    Ok(())
}

async fn run_check(config: &Config, username: &str, password: &str) -> Result<()> {
    let credential = Credential::new(SubscriberId(0), username, password)?;
    let client = HttpPortalClient::new(config.portal.clone());
    let snapshot = client
        .fetch(&credential)
        .await
        .with_context(|| format!("portal check failed for {}", credential.username))?;
    info!(
        available = snapshot.available_count(),
        digest = snapshot.digest(),
        "portal check succeeded"
    );
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

async fn serve(config: Config) -> Result<()> {
    if config.watch.interval_secs == 0 {
        bail!("watch.interval_secs must be greater than zero");
    }
    let bot_token = config.telegram.bot_token.trim();
    if bot_token.is_empty() {
        bail!("telegram.bot_token is required for serve (set BOT_TOKEN)");
    }

    let api = TelegramApi::new(
        &config.telegram.api_base,
        bot_token,
        Duration::from_secs(config.telegram.poll_timeout_secs),
    )
    .context("failed building Telegram client")?;
    let scheduler = WatchScheduler::new(
        Arc::new(SubscriptionStore::new()),
        Arc::new(HttpPortalClient::new(config.portal.clone())),
        Arc::new(TelegramNotifier::new(api.clone())),
        config.watch.clone(),
    );

    let shutdown = CancellationToken::new();
    let ctrl_c = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
            }
            shutdown.cancel();
        })
    };

    let result = if config.telegram.uses_webhook() {
        serve_webhook(&config, api, scheduler.clone(), shutdown.clone()).await
    } else {
        run_polling(
            api,
            scheduler.clone(),
            config.telegram.poll_timeout_secs,
            shutdown.clone(),
        )
        .await
    };

    shutdown.cancel();
    ctrl_c.abort();
    scheduler.shutdown().await;
    result
}

async fn serve_webhook(
    config: &Config,
    api: TelegramApi,
    scheduler: WatchScheduler,
    shutdown: CancellationToken,
) -> Result<()> {
    let bind_address = config.server.bind_address();
    let bind: SocketAddr = bind_address
        .parse()
        .map_err(|e| anyhow!("invalid bind address {bind_address}: {e}"))?;
    let secret = config.telegram.webhook_secret.trim();
    if secret.is_empty() {
        warn!("webhook_secret is empty; webhook calls are not authenticated");
    }

    api.set_webhook(&config.telegram.webhook_url, Some(secret))
        .await
        .context("failed registering webhook")?;
    info!(url = %config.telegram.webhook_url, "webhook registered");
    run_server(bind, router(scheduler, api, secret), shutdown).await
}
