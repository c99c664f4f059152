mod wiring;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tubewatch_core::store::Access;
use tubewatch_core::{ChannelListing, Config};

use crate::wiring::Services;

#[derive(Parser, Debug)]
#[command(name = "tubewatch", about = "Watch YouTube channels and get notified of new uploads")]
struct Args {
    /// Config file (defaults to ~/.config/tubewatch/config.json)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory holding channels.json and handles.json
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll on the configured interval until interrupted
    Run,
    /// Run a single poll cycle and exit
    Poll,
    /// Watch a channel by id, @handle or channel URL
    Add { channel: String },
    /// Stop watching a channel, by id or alias
    Remove { channel: String },
    /// List watched channels
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Change the display alias of a channel
    Rename { channel: String, alias: String },
    /// Resume polling a channel marked invalid or degraded
    Reactivate { channel: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    // Missing .env is fine; variables may come from the environment.
    let _ = dotenv::dotenv();

    let args = Args::parse();
    let config = load_config(&args)?;
    let access = match args.command {
        Command::List { .. } => Access::ReadOnly,
        _ => Access::Exclusive,
    };
    let services = Services::build(&config, access).await?;

    match args.command {
        Command::Run => run(&config, services).await?,
        Command::Poll => {
            let report = services.monitor.poll_once().await;
            println!(
                "{} channels: {} new uploads, {} baselined, {} degraded, {} invalid",
                report.channels, report.events, report.baselined, report.degraded, report.invalidated
            );
        }
        Command::Add { channel } => {
            let added = services.registry.add_channel(&channel).await?;
            println!("Watching {} ({})", added.display_name(), added.id);
        }
        Command::Remove { channel } => {
            let removed = services.registry.remove_channel(&channel).await?;
            println!("Removed {} ({})", removed.display_name(), removed.id);
        }
        Command::List { json } => {
            let listings = services.registry.list_channels().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&listings)?);
            } else {
                print_table(&listings);
            }
        }
        Command::Rename { channel, alias } => {
            let renamed = services.registry.rename_channel(&channel, &alias).await?;
            println!("{} is now shown as {}", renamed.id, renamed.display_name());
        }
        Command::Reactivate { channel } => {
            let channel = services.registry.reactivate_channel(&channel).await?;
            println!("{} will be polled again", channel.display_name());
        }
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn load_config(args: &Args) -> Result<Config> {
    let path = match &args.config {
        Some(path) => path.clone(),
        None => Config::default_path()?,
    };
    let mut config =
        Config::load(&path).with_context(|| format!("failed to load {}", path.display()))?;
    config.apply_env().context("invalid environment override")?;
    if let Some(dir) = &args.data_dir {
        config.data_dir = Some(dir.clone());
    }
    config.validate()?;
    Ok(config)
}

async fn run(config: &Config, services: Services) -> Result<()> {
    let Services {
        monitor, cache, ..
    } = services;
    info!(
        interval_secs = config.poll_interval_secs,
        cache_ttl_secs = config.cache_ttl().as_secs_f64(),
        "starting monitor"
    );
    let sweeper = cache.spawn_sweeper(config.cache_sweep_interval());
    let handle = monitor.spawn();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");

    sweeper.abort();
    handle.stop().await?;
    Ok(())
}

fn print_table(listings: &[ChannelListing]) {
    if listings.is_empty() {
        println!("No channels watched.");
        return;
    }
    let width = listings
        .iter()
        .map(|l| l.alias.as_deref().map_or(0, str::len))
        .max()
        .unwrap_or(0)
        .max("ALIAS".len());
    println!("{:<width$}  {:<24}  {:<8}  LAST POLL", "ALIAS", "CHANNEL ID", "HEALTH");
    for listing in listings {
        let polled = listing
            .last_polled_at
            .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "never".to_owned());
        println!(
            "{:<width$}  {:<24}  {:<8}  {}",
            listing.alias.as_deref().unwrap_or("-"),
            listing.id,
            listing.health.to_string(),
            polled
        );
        if let Some(error) = &listing.last_error {
            println!("{:<width$}  last error: {error}", "");
        }
    }
}
