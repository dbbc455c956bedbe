use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cerberus_bot::{install, BotConfig, Cerberus, JobKind};
use cerberus_sched::Scheduler;
use cerberus_wiki::{HttpWiki, HttpWikiConfig, TokenBucketConfig};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(name = "cerberus")]
#[command(about = "Sandbox moderation bot for the wiki")]
struct Cli {
    /// Bot configuration file.
    #[arg(long, global = true, default_value = "config/cerberus.yaml")]
    config: PathBuf,

    /// Wiki API token; overrides CERBERUS_API_TOKEN.
    #[arg(long, global = true)]
    token: Option<String>,

    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every job on its schedule until interrupted.
    Run,
    /// Validate the configuration and print job periods.
    CheckConfig,
    /// Run a single job once and print what it did.
    Once { job: String },
}

fn init_tracing(debug: bool) {
    let default = if debug { "cerberus=debug" } else { "cerberus=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .init();
}

fn wiki_config(config: &BotConfig) -> HttpWikiConfig {
    let mut http = HttpWikiConfig::new(&config.wiki.base_url, &config.api_token);
    http.timeout = Duration::from_secs(config.wiki.timeout_secs);
    http.user_agent = config.wiki.user_agent.clone();
    http.token_bucket = config
        .wiki
        .requests_per_second
        .filter(|rps| *rps > 0)
        .map(|rps| TokenBucketConfig {
            capacity: rps,
            refill_every: Duration::from_secs(1) / rps,
        });
    http
}

fn build_bot(config: Arc<BotConfig>) -> Result<Cerberus> {
    let wiki = HttpWiki::new(wiki_config(&config)).context("building wiki client")?;
    Ok(Cerberus::new(Arc::new(wiki), config))
}

async fn run(config: Arc<BotConfig>) -> Result<()> {
    let bot = Arc::new(build_bot(config.clone())?);
    let scheduler = Scheduler::new(config.tick_interval());
    install(&scheduler, bot)?;
    scheduler.run();

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("interrupt received");
    scheduler.stop();
    if !scheduler.drain(DRAIN_TIMEOUT).await {
        warn!(timeout_secs = DRAIN_TIMEOUT.as_secs(), "in-flight jobs still running at exit");
    }
    Ok(())
}

fn check_config(config: &BotConfig) {
    println!(
        "config ok: name={} version={} wiki={} tick={}s",
        config.name, config.version, config.wiki.base_url, config.runtime.tick_seconds
    );
    for job in JobKind::ALL {
        println!("  {job}: every {} ticks", job.period_ticks(config));
    }
}

async fn run_once(config: Arc<BotConfig>, job: &str) -> Result<()> {
    let job: JobKind = job.parse()?;
    let bot = build_bot(config)?;
    let summary = bot.run_job(job).await?;
    let rendered = serde_json::to_string_pretty(&summary).context("serializing job summary")?;
    println!("{rendered}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let config = BotConfig::load(&cli.config, cli.token.clone())
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let config = Arc::new(config);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::CheckConfig => {
            check_config(&config);
            Ok(())
        }
        Commands::Once { job } => run_once(config, &job).await,
    }
}
