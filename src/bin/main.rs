//! fqdn-identityd binary entry point.

use clap::Parser;
use fqdn_identity::{telemetry, Config, FqdnDaemon, InMemorySelectorCache, LocalIdentityAllocator};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// DNS-driven identity bookkeeping for FQDN network policy.
#[derive(Parser, Debug)]
#[command(name = "fqdn-identityd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML).
    #[arg(short, long, default_value = "fqdn-identityd.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration
    let config: Config = config::Config::builder()
        .add_source(config::File::from(args.config.clone()).required(false))
        .add_source(
            config::Environment::with_prefix("FQDN_IDENTITY")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;
    config.fqdn.validate()?;

    // Initialize telemetry
    telemetry::init(&config.telemetry).map_err(|e| e as Box<dyn std::error::Error>)?;

    info!(
        config_file = %args.config.display(),
        shards = config.fqdn.shard_count,
        min_ttl = config.fqdn.min_ttl,
        selectors = config.fqdn.selectors.len(),
        "Starting fqdn-identityd"
    );

    let allocator = Arc::new(LocalIdentityAllocator::new(
        config.fqdn.identity_range_start,
        config.fqdn.identity_range_size,
    ));
    let selector_cache = Arc::new(InMemorySelectorCache::new());

    // Log selector updates as the policy engine would consume them
    let mut updates = selector_cache.subscribe();
    tokio::spawn(async move {
        while let Some(update) = updates.recv().await {
            debug!(
                selector = %update.selector,
                added = update.added.len(),
                removed = update.removed.len(),
                "selector identities changed"
            );
        }
    });

    let daemon = Arc::new(FqdnDaemon::new(config.fqdn, allocator, selector_cache));
    if let Err(e) = daemon.register_configured_selectors() {
        error!("Failed to register configured selectors: {}", e);
        return Err(e.into());
    }

    // Setup graceful shutdown
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            cancel.cancel();
        }
    });

    daemon.run(cancel).await;

    info!("fqdn-identityd shutdown complete");
    Ok(())
}
