//! `chainpipe check`: probe every backend and validate every source.

use std::path::Path;

use anyhow::{bail, Context, Result};
use chainpipe_core::{ConnectorRegistry, DecoderRegistry, RegistryEntry};

use crate::bootstrap;
use crate::config::AppConfig;

pub async fn run(config_path: Option<&Path>) -> Result<()> {
    let config = AppConfig::load(config_path)?;
    println!("✓ Config loaded{}", config_path.map(|p| format!(" from {}", p.display())).unwrap_or_default());

    let mut errors = 0usize;

    let bus = bootstrap::bus(&config).await?;
    match bus.ping().await {
        Ok(()) => println!("✓ Bus '{}' reachable", bus.name()),
        Err(e) => {
            errors += 1;
            eprintln!("✗ Bus '{}': {e}", bus.name());
        }
    }

    let (cache, _checkpoints) = bootstrap::storage(&config).await?;
    match cache.ping().await {
        Ok(()) => println!("✓ Cache reachable ({:?})", config.cache.kind),
        Err(e) => {
            errors += 1;
            eprintln!("✗ Cache: {e}");
        }
    }
    println!("✓ Checkpoint store opened ({:?})", config.checkpoints.kind);

    let store = bootstrap::registry(&config);
    let snapshot = store
        .list()
        .await
        .with_context(|| format!("listing sources in {}", config.registry.path.display()))?;
    println!(
        "✓ Registry {} holds {} source(s)",
        config.registry.path.display(),
        snapshot.entries.len()
    );

    let decoders = bootstrap::decoders();
    let connectors = bootstrap::connectors(&config);
    let mut entries = snapshot.entries;
    entries.sort_by(|a, b| a.key.cmp(&b.key));
    for entry in &entries {
        match check_entry(entry, &decoders, &connectors) {
            Ok(summary) => println!("  ✓ {}: {summary}", entry.key),
            Err(reason) => {
                errors += 1;
                eprintln!("  ✗ {}: {reason}", entry.key);
            }
        }
    }

    if errors > 0 {
        bail!("{errors} check(s) failed");
    }
    println!("\nAll checks passed");
    Ok(())
}

/// Validate one registry entry the way a worker would before connecting.
pub fn check_entry(
    entry: &RegistryEntry,
    decoders: &DecoderRegistry,
    connectors: &ConnectorRegistry,
) -> Result<String, String> {
    let config = entry.parse().map_err(|e| e.to_string())?;
    if !decoders.contains(&config.chain_type) {
        return Err(format!("no decoder registered for chain type '{}'", config.chain_type));
    }
    connectors.get(&config.chain_type).map_err(|e| e.to_string())?;
    if let Some(reference) = &config.credential_ref {
        chainpipe_core::CredentialRef::parse(reference)
            .and_then(|r| r.resolve())
            .map_err(|e| e.to_string())?;
    }
    let state = if config.enabled { "enabled" } else { "disabled" };
    Ok(format!("{} {} ({state})", config.chain_type, config.endpoint))
}
