//! CLI entry point for the downloader tool.

use std::io::{self, IsTerminal};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use downloader_engine::{
    DownloadManager, EngineConfig, EngineError, HttpClient, RecordSnapshot, StoreError,
    TracingSink,
};
use tracing::{debug, info, warn};

mod app_config;
mod cli;
mod terminal;

use cli::{Args, Command};
use terminal::TerminalSink;

/// How often `run` checks whether anything is left to download.
const RUN_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();
    let file_config = app_config::load_default_file_config()?;

    // Priority: RUST_LOG env var > quiet flag > verbose flag > config file > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => file_config.verbosity.map_or("info", |v| v.filter()),
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let mut config = EngineConfig::default();
    file_config.apply(&mut config);
    if let Some(state_dir) = args.state_dir {
        config.state_dir = state_dir;
    }
    debug!(state_dir = %config.state_dir.display(), "engine configuration resolved");

    let transport = Arc::new(
        HttpClient::with_timeouts(config.connect_timeout, config.read_timeout)
            .context("Failed to build HTTP client")?,
    );

    if let Command::Run { urls } = args.command {
        let hidden = args.quiet || !io::stderr().is_terminal();
        return run(config, transport, &urls, hidden).await;
    }

    let manager = DownloadManager::open(config, transport, Arc::new(TracingSink))
        .context("Failed to open download registry")?;
    let result = execute(&manager, args.command).await;
    manager.shutdown().await;
    result
}

async fn execute(manager: &DownloadManager, command: Command) -> Result<()> {
    match command {
        Command::Run { .. } => bail!("`run` drives its own registry session"),
        Command::Add { urls } => {
            let mut failed = 0usize;
            for url in &urls {
                match manager.add(url).await {
                    Ok(record) => println!("added {}", record.url),
                    Err(error) => {
                        eprintln!("error: {error}");
                        failed += 1;
                    }
                }
            }
            if failed > 0 {
                bail!("{failed} of {} URL(s) could not be added", urls.len());
            }
        }
        Command::List { json } => {
            let records = manager.records();
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("no downloads registered");
            } else {
                for record in &records {
                    println!("{}", format_record(record));
                }
            }
        }
        Command::Pause { url } => {
            if !manager.pause(&url, true).await? {
                bail!("no download registered for {url}");
            }
            println!("paused {url}");
        }
        Command::Resume { url } => {
            if !manager.pause(&url, false).await? {
                bail!("no download registered for {url}");
            }
            println!("resumed {url}");
        }
        Command::Delete { url, yes } => {
            if !yes {
                bail!("refusing to delete {url} without --yes");
            }
            if manager.delete(&url, true).await? {
                println!("deleted {url}");
            } else {
                println!("nothing registered for {url}");
            }
        }
        Command::SaveAs { url, dest } => {
            let saved = manager.save_as(&url, &dest).await?;
            println!("saved {url} to {}", saved.display());
        }
    }
    Ok(())
}

async fn run(
    config: EngineConfig,
    transport: Arc<HttpClient>,
    urls: &[String],
    hidden: bool,
) -> Result<()> {
    let sink = Arc::new(TerminalSink::new(hidden));
    let manager =
        DownloadManager::open(config, transport, sink).context("Failed to open download registry")?;

    for url in urls {
        match manager.add(url).await {
            Ok(record) => debug!(url = %record.url, "added"),
            Err(EngineError::Store(StoreError::DuplicateUrl { url })) => {
                warn!(url = %url, "already registered, continuing it");
            }
            Err(error) => warn!(url = %url, error = %error, "skipping URL"),
        }
    }

    if manager.has_pending() {
        manager.start();
        info!("downloading, press Ctrl-C to stop and keep progress");

        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        let mut poll = tokio::time::interval(RUN_POLL_INTERVAL);
        loop {
            tokio::select! {
                result = &mut ctrl_c => {
                    if let Err(error) = result {
                        warn!(error = %error, "could not listen for Ctrl-C");
                    }
                    info!("interrupted, saving progress");
                    break;
                }
                _ = poll.tick() => {
                    if !manager.has_pending() {
                        break;
                    }
                }
            }
        }
    } else {
        info!("nothing to download");
    }

    let records = manager.records();
    manager.shutdown().await;

    let complete: Vec<&RecordSnapshot> = records.iter().filter(|r| r.complete).collect();
    for record in &complete {
        println!("{}", format_record(record));
    }
    if !complete.is_empty() {
        println!("use `downloader save-as <URL> <DEST>` to keep a finished download");
    }
    Ok(())
}

fn format_record(record: &RecordSnapshot) -> String {
    let status = if record.complete {
        "complete"
    } else if record.paused {
        "paused"
    } else if record.last_error.is_some() {
        "retrying"
    } else {
        "pending"
    };
    let total = record
        .total_bytes
        .map_or_else(|| "?".to_string(), |t| t.to_string());
    format!(
        "{status:<9} {:>5.1}% {:>12}/{:<12} {}",
        record.percent, record.downloaded_bytes, total, record.url
    )
}
