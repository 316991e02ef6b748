//! Content translation synchronization for a headless CMS.
//!
//! On every content mutation the CMS delivers a webhook; the service
//! translates the configured fields into every registered locale and keeps
//! the per-locale rows, relation metadata, field capability markers, and
//! permission grants consistent.

pub mod config;
pub mod consistency;
pub mod error;
pub mod orchestrator;
pub mod provider;
pub mod registry;
pub mod retry;
pub mod server;
pub mod store;

pub use config::{CollectionConfig, Config};
pub use error::SyncError;
