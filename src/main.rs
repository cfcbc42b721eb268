//! cacheband - ban engine admin daemon.
//!
//! Reads admin commands from stdin, one per line, and prints `<status> <body>`
//! replies.

use anyhow::Context as _;
use cacheban::ban::{BanEngine, Lurker, spawn_lurker};
use cacheban::config::{Config, validate};
use cacheban::handlers::{Registry, Reply, split_line};
use cacheban::journal::FileJournal;
use cacheban::store::MemStore;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "cacheban.toml".to_string());

    let config = if Path::new(&config_path).exists() {
        Config::load(&config_path).map_err(|e| {
            error!(path = %config_path, error = %e, "Failed to load config");
            e
        })?
    } else {
        info!(path = %config_path, "No config file, using defaults");
        Config::default()
    };

    if let Err(errors) = validate(&config) {
        for e in &errors {
            error!(error = %e, "Invalid configuration");
        }
        anyhow::bail!("{} configuration error(s)", errors.len());
    }

    let mut engine = BanEngine::new(config.bans.dedup);

    if let Some(path) = &config.journal.path {
        let journal = FileJournal::open(path)
            .with_context(|| format!("opening ban journal {}", path.display()))?
            .with_compact_threshold(config.journal.compact_bytes)
            .with_stats(engine.stats().clone());

        // Objects do not survive a restart, so no persisted ban can apply to
        // anything cached from now on.
        if journal.live() > 0 {
            info!(count = journal.live(), "Discarding persisted bans, object store is volatile");
            journal
                .clear()
                .with_context(|| format!("clearing ban journal {}", path.display()))?;
        }
        engine = engine.with_persistence(Arc::new(journal));
    }

    let engine = Arc::new(engine);
    let store = Arc::new(MemStore::new(engine.clone()));

    let lurker = Lurker::new(
        engine.clone(),
        store.clone(),
        config.bans.lurker_sleep(),
        config.bans.lurker_idle(),
    );
    let lurker_handle = spawn_lurker(lurker);

    // Reap objects the lurker expired
    let purge_store = store.clone();
    let purge_every = config.bans.lurker_idle();
    let purge_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(purge_every);
        loop {
            interval.tick().await;
            purge_store.purge_expired();
        }
    });

    info!(dedup = config.bans.dedup, "cacheband ready");

    let registry = Registry::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        let reply = match split_line(&line) {
            Ok(words) if words.is_empty() => continue,
            Ok(words) => {
                let argv: Vec<&str> = words.iter().map(String::as_str).collect();
                registry.dispatch(&engine, &argv)
            }
            Err(e) => Reply::from(e),
        };
        stdout.write_all(format!("{}\n", reply).as_bytes()).await?;
        stdout.flush().await?;
    }

    debug!(stats = ?registry.get_command_stats(), "Admin input closed");
    engine.shutdown();
    lurker_handle.abort();
    purge_handle.abort();
    info!("cacheband shutting down");
    Ok(())
}
