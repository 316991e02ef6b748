use crate::config::{CollectionConfig, Config};
use crate::error::SyncError;
use crate::provider::TranslationProvider;
use crate::registry::LanguageRegistry;
use crate::store::Store;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Content mutation kinds delivered by the CMS webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Create,
    Update,
    Delete,
}

impl EventType {
    pub fn parse(raw: &str) -> Option<EventType> {
        match raw {
            "items.create" => Some(EventType::Create),
            "items.update" => Some(EventType::Update),
            "items.delete" => Some(EventType::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Create => "items.create",
            EventType::Update => "items.update",
            EventType::Delete => "items.delete",
        }
    }
}

/// A validated change notification, ready for the pipeline.
#[derive(Debug, Clone)]
pub struct ChangeNotification {
    pub collection: String,
    /// Parent row key, normalized to its string form
    pub key: String,
    pub event: EventType,
    pub payload: Map<String, Value>,
}

/// What happened for one target locale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocaleOutcome {
    /// Provider succeeded; translated row persisted
    Translated,
    /// Provider failed or timed out; source text persisted, flagged degraded
    Degraded,
    /// Locale configured but missing from the registry; nothing persisted
    Skipped,
}

#[derive(Debug, Clone)]
pub struct LocaleResult {
    pub code: String,
    pub outcome: LocaleOutcome,
}

/// Aggregate result of one notification.
#[derive(Debug, Clone)]
pub enum SyncOutcome {
    /// Create/update handled; one entry per target locale
    Synced { locales: Vec<LocaleResult> },
    /// Delete handled; number of translation rows removed
    Removed { rows: usize },
}

impl SyncOutcome {
    /// Locale codes whose rows were persisted (translated or degraded).
    pub fn persisted_locales(&self) -> Vec<&str> {
        match self {
            SyncOutcome::Synced { locales } => locales
                .iter()
                .filter(|l| l.outcome != LocaleOutcome::Skipped)
                .map(|l| l.code.as_str())
                .collect(),
            SyncOutcome::Removed { .. } => Vec::new(),
        }
    }
}

/// Ties ingress, provider, and writer together per event.
///
/// All locale translations for one event run concurrently; a failed locale
/// degrades to source text instead of blocking its siblings. Only a storage
/// failure fails the whole event.
pub struct SyncOrchestrator {
    config: Config,
    registry: Arc<LanguageRegistry>,
    store: Store,
    provider: Arc<dyn TranslationProvider>,
}

impl SyncOrchestrator {
    pub fn new(
        config: Config,
        registry: Arc<LanguageRegistry>,
        store: Store,
        provider: Arc<dyn TranslationProvider>,
    ) -> Self {
        Self {
            config,
            registry,
            store,
            provider,
        }
    }

    /// Process one accepted notification. Safe to replay: the same
    /// notification always converges to the same persisted rows.
    pub async fn handle(&self, notification: &ChangeNotification) -> Result<SyncOutcome, SyncError> {
        let collection = self
            .config
            .collection(&notification.collection)
            .ok_or_else(|| {
                SyncError::validation(format!(
                    "collection '{}' is not configured",
                    notification.collection
                ))
            })?;

        match notification.event {
            EventType::Delete => {
                let rows = self
                    .store
                    .delete_translations(collection, &notification.key)
                    .map_err(SyncError::Persistence)?;
                info!(
                    "Removed {} translation row(s) for {} key {}",
                    rows, collection.name, notification.key
                );
                Ok(SyncOutcome::Removed { rows })
            }
            EventType::Create | EventType::Update => {
                self.sync_translations(collection, notification).await
            }
        }
    }

    async fn sync_translations(
        &self,
        collection: &CollectionConfig,
        notification: &ChangeNotification,
    ) -> Result<SyncOutcome, SyncError> {
        let source_fields = extract_source_fields(collection, &notification.payload);
        if source_fields.is_empty() {
            info!(
                "No translatable fields in {} payload for key {}, nothing to sync",
                collection.name, notification.key
            );
            return Ok(SyncOutcome::Synced {
                locales: Vec::new(),
            });
        }

        let targets: Vec<&str> = self
            .config
            .locales
            .iter()
            .map(|l| l.code.as_str())
            .filter(|code| *code != self.config.source_locale)
            .collect();

        let tasks = targets.into_iter().map(|target| {
            self.sync_locale(collection, &notification.key, &source_fields, target)
        });
        let results = futures::future::join_all(tasks).await;

        let mut locales = Vec::with_capacity(results.len());
        for result in results {
            locales.push(result?);
        }

        info!(
            "Synced {} key {}: {} locale(s), {} degraded, {} skipped",
            collection.name,
            notification.key,
            locales.len(),
            locales
                .iter()
                .filter(|l| l.outcome == LocaleOutcome::Degraded)
                .count(),
            locales
                .iter()
                .filter(|l| l.outcome == LocaleOutcome::Skipped)
                .count(),
        );

        Ok(SyncOutcome::Synced { locales })
    }

    /// Translate and persist one target locale. Provider trouble degrades to
    /// source text; only a failed upsert surfaces as an error.
    async fn sync_locale(
        &self,
        collection: &CollectionConfig,
        key: &str,
        source_fields: &Map<String, Value>,
        target: &str,
    ) -> Result<LocaleResult, SyncError> {
        if !self.registry.contains(target) {
            warn!(
                "Locale {} is not in the language registry, skipping {} key {}",
                target, collection.name, key
            );
            return Ok(LocaleResult {
                code: target.to_string(),
                outcome: LocaleOutcome::Skipped,
            });
        }

        let timeout = Duration::from_secs(self.config.provider_timeout_secs);
        let mut translated = Map::new();
        let mut failure: Option<String> = None;

        for (field, value) in source_fields {
            let Some(text) = value.as_str() else {
                // Non-text configured fields are replicated as-is
                translated.insert(field.clone(), value.clone());
                continue;
            };

            let attempt = tokio::time::timeout(
                timeout,
                self.provider
                    .translate(text, &self.config.source_locale, target),
            )
            .await;

            match attempt {
                Ok(Ok(result)) => {
                    translated.insert(field.clone(), Value::String(result));
                }
                Ok(Err(e)) => {
                    failure = Some(e.to_string());
                    break;
                }
                Err(_) => {
                    failure = Some(format!("timed out after {:?}", timeout));
                    break;
                }
            }
        }

        match failure {
            None => {
                self.store
                    .upsert_translation(collection, key, target, &translated, false)
                    .map_err(SyncError::Persistence)?;
                Ok(LocaleResult {
                    code: target.to_string(),
                    outcome: LocaleOutcome::Translated,
                })
            }
            Some(reason) => {
                warn!(
                    "Degraded translation for {} key {} locale {}: {}",
                    collection.name, key, target, reason
                );
                // Fall back to the untranslated source text, flagged for
                // later reconciliation.
                self.store
                    .upsert_translation(collection, key, target, source_fields, true)
                    .map_err(SyncError::Persistence)?;
                Ok(LocaleResult {
                    code: target.to_string(),
                    outcome: LocaleOutcome::Degraded,
                })
            }
        }
    }
}

/// Configured translatable fields present in the payload, in configured order.
fn extract_source_fields(
    collection: &CollectionConfig,
    payload: &Map<String, Value>,
) -> Map<String, Value> {
    let mut fields = Map::new();
    for name in &collection.translatable_fields {
        if let Some(value) = payload.get(name) {
            fields.insert(name.clone(), value.clone());
        }
    }
    fields
}
