use anyhow::Result;
use cms_translation_sync::config::Config;
use cms_translation_sync::consistency::ConsistencyManager;
use cms_translation_sync::orchestrator::SyncOrchestrator;
use cms_translation_sync::provider::HttpTranslationProvider;
use cms_translation_sync::registry::LanguageRegistry;
use cms_translation_sync::retry::RetryConfig;
use cms_translation_sync::server::{serve, AppState};
use cms_translation_sync::store::Store;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (ignored in production)
    let _ = dotenvy::dotenv();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cms_translation_sync=info".parse()?),
        )
        .init();

    info!("Starting translation sync service");

    // Load configuration from environment
    let config = Config::from_env()?;

    // Open the CMS database and provision the schema pieces we own
    let store = Store::new(&config.database_path)?;
    store.init_schema(&config.collections)?;

    let added = store.ensure_languages(&config.locales)?;
    if added > 0 {
        info!("Provisioned {} new language(s)", added);
    }
    for collection in &config.collections {
        store.ensure_relations(collection)?;
        store.ensure_field_markers(collection)?;
    }

    // Heal metadata drift before accepting traffic
    let consistency = ConsistencyManager::new(
        store.clone(),
        &config.service_policy_id,
        &config.collections,
    );
    let report = consistency.repair_all()?;
    info!(
        "Startup consistency sweep: {} examined, {} repaired, {} unrepairable",
        report.examined, report.repaired, report.unrepairable
    );

    let registry = Arc::new(LanguageRegistry::new(store.list_languages()?));
    info!(
        "Language registry holds {} locale(s): {:?}",
        registry.len(),
        registry.codes()
    );

    let provider = Arc::new(HttpTranslationProvider::new(
        reqwest::Client::new(),
        &config.provider_url,
        config.provider_api_key.clone(),
        RetryConfig::new(config.provider_max_attempts, Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(2.0),
    ));

    let port = config.port;
    let orchestrator = Arc::new(SyncOrchestrator::new(config, registry, store, provider));

    serve(AppState { orchestrator }, port).await
}
