//! Shared types and storage seams for the Polymarket account service.
//!
//! This crate contains:
//! - Common types (Side, AssetType, Channel)
//! - Named settings with a single alias table
//! - Durable key-value stores (memory and file-backed)

pub mod settings;
pub mod store;
pub mod types;

pub use settings::{EnvSettings, MemorySettings, SettingKey, SettingsStore};
pub use store::{FileStore, KeyValueStore, MemoryStore, StoreError};
pub use types::*;
