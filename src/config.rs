use anyhow::{bail, Context, Result};

/// Static configuration for one translatable collection.
///
/// Owned by the orchestrator; provisioned once at startup and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionConfig {
    /// Collection name as the CMS knows it (e.g. "map_locations")
    pub name: String,
    /// Primary key field of the parent collection
    pub id_field: String,
    /// Ordered list of fields replicated per locale
    pub translatable_fields: Vec<String>,
}

impl CollectionConfig {
    /// Name of the per-locale table holding this collection's translations
    pub fn translations_table(&self) -> String {
        format!("{}_translations", self.name)
    }
}

/// A locale to provision into the language registry at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocaleSpec {
    pub code: String,
    pub name: String,
    pub direction: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    // Storage
    pub database_path: String,

    // Server
    pub port: u16,

    // Translation provider
    pub provider_url: String,
    pub provider_api_key: Option<String>,
    pub provider_timeout_secs: u64,
    pub provider_max_attempts: u32,

    // Locales
    pub source_locale: String,
    pub locales: Vec<LocaleSpec>,

    // Collections
    pub collections: Vec<CollectionConfig>,

    // Policy the service identity operates under
    pub service_policy_id: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let locales = parse_locales(&std::env::var("LOCALES").context("LOCALES not set")?)?;
        let source_locale = std::env::var("SOURCE_LOCALE").context("SOURCE_LOCALE not set")?;

        if !locales.iter().any(|l| l.code == source_locale) {
            bail!("SOURCE_LOCALE '{}' is not listed in LOCALES", source_locale);
        }

        Ok(Self {
            database_path: std::env::var("DATABASE_PATH").context("DATABASE_PATH not set")?,

            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8080),

            provider_url: std::env::var("PROVIDER_URL").context("PROVIDER_URL not set")?,
            provider_api_key: std::env::var("PROVIDER_API_KEY").ok(),
            provider_timeout_secs: std::env::var("PROVIDER_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            provider_max_attempts: std::env::var("PROVIDER_MAX_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),

            source_locale,
            locales,

            collections: parse_collections(
                &std::env::var("COLLECTIONS").context("COLLECTIONS not set")?,
            )?,

            service_policy_id: std::env::var("SERVICE_POLICY_ID")
                .unwrap_or_else(|_| "translation-sync".to_string()),
        })
    }

    /// Look up the configuration for a collection by name.
    pub fn collection(&self, name: &str) -> Option<&CollectionConfig> {
        self.collections.iter().find(|c| c.name == name)
    }
}

/// Parse the `COLLECTIONS` env format:
/// `collection:idField:field1+field2[,collection2:...]`
///
/// Public so auxiliary binaries can load collection configuration without
/// the full server environment.
pub fn parse_collections(raw: &str) -> Result<Vec<CollectionConfig>> {
    let mut collections = Vec::new();

    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let mut parts = entry.split(':');
        let name = parts.next().unwrap_or_default().trim();
        let id_field = parts.next().unwrap_or_default().trim();
        let fields = parts.next().unwrap_or_default().trim();

        if name.is_empty() || id_field.is_empty() || fields.is_empty() {
            bail!(
                "Invalid COLLECTIONS entry '{}', expected collection:idField:field1+field2",
                entry
            );
        }

        let translatable_fields: Vec<String> = fields
            .split('+')
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(str::to_string)
            .collect();
        if translatable_fields.is_empty() {
            bail!("No translatable fields in COLLECTIONS entry '{}'", entry);
        }

        collections.push(CollectionConfig {
            name: name.to_string(),
            id_field: id_field.to_string(),
            translatable_fields,
        });
    }

    if collections.is_empty() {
        bail!("COLLECTIONS is empty");
    }
    Ok(collections)
}

/// Parse the `LOCALES` env format: `code:Name:ltr|rtl[,...]`
fn parse_locales(raw: &str) -> Result<Vec<LocaleSpec>> {
    let mut locales = Vec::new();

    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let mut parts = entry.split(':');
        let code = parts.next().unwrap_or_default().trim();
        let name = parts.next().unwrap_or_default().trim();
        let direction = parts.next().unwrap_or("ltr").trim();

        if code.is_empty() || name.is_empty() {
            bail!("Invalid LOCALES entry '{}', expected code:Name:ltr|rtl", entry);
        }
        if direction != "ltr" && direction != "rtl" {
            bail!("Invalid direction '{}' for locale '{}'", direction, code);
        }

        locales.push(LocaleSpec {
            code: code.to_string(),
            name: name.to_string(),
            direction: direction.to_string(),
        });
    }

    if locales.is_empty() {
        bail!("LOCALES is empty");
    }
    Ok(locales)
}
