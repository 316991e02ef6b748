//! Repair binary - runs the schema consistency repairs on demand
//!
//! Usage:
//!   cargo run --bin repair                  # Run all repairs
//!   cargo run --bin repair -- relations     # Collapse duplicate relation records
//!   cargo run --bin repair -- markers       # Canonicalize field capability markers
//!   cargo run --bin repair -- permissions   # Add missing permission grants
//!
//! Required environment variables:
//! - DATABASE_PATH
//! - COLLECTIONS
//!
//! Optional:
//! - SERVICE_POLICY_ID (defaults to translation-sync)
//!
//! Exits 0 only when every examined tuple is in canonical shape afterwards.

use anyhow::{bail, Context, Result};
use cms_translation_sync::config::{parse_collections, CollectionConfig};
use cms_translation_sync::consistency::{ConsistencyManager, RepairReport};
use cms_translation_sync::store::Store;
use tracing::{error, info};

/// Minimal config for repairs (no server or provider required)
struct RepairConfig {
    database_path: String,
    service_policy_id: String,
    collections: Vec<CollectionConfig>,
}

impl RepairConfig {
    fn from_env() -> Result<Self> {
        Ok(Self {
            database_path: std::env::var("DATABASE_PATH").context("DATABASE_PATH not set")?,
            service_policy_id: std::env::var("SERVICE_POLICY_ID")
                .unwrap_or_else(|_| "translation-sync".to_string()),
            collections: parse_collections(
                &std::env::var("COLLECTIONS").context("COLLECTIONS not set")?,
            )?,
        })
    }
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cms_translation_sync=info".parse()?)
                .add_directive("repair=info".parse()?),
        )
        .init();

    let which = std::env::args().nth(1).unwrap_or_else(|| "all".to_string());

    let config = RepairConfig::from_env()?;
    let store = Store::new(&config.database_path)?;
    store.init_schema(&config.collections)?;

    let manager = ConsistencyManager::new(
        store,
        &config.service_policy_id,
        &config.collections,
    );

    let report: RepairReport = match which.as_str() {
        "all" => manager.repair_all()?,
        "relations" => manager.dedupe_relations()?,
        "markers" => manager.canonicalize_markers()?,
        "permissions" => manager.ensure_permissions()?,
        other => bail!(
            "Unknown repair '{}', expected relations, markers, permissions, or all",
            other
        ),
    };

    info!(
        "Repair '{}' finished: {} examined, {} repaired, {} unrepairable",
        which, report.examined, report.repaired, report.unrepairable
    );

    if !report.is_clean() {
        error!(
            "{} tuple(s) could not be repaired, see warnings above",
            report.unrepairable
        );
        std::process::exit(1);
    }

    Ok(())
}
