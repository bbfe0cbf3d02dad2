//! Named string settings and their accepted aliases.
//!
//! Every setting the service reads has exactly one canonical name plus a
//! priority-ordered list of aliases. `SettingKey::aliases` is the only place
//! that list lives; config loading and the settings stores both resolve
//! through it.

use std::collections::HashMap;

use parking_lot::RwLock;

/// A named setting understood by the account service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingKey {
    PrivateKey,
    ApiKey,
    ApiSecret,
    ApiPassphrase,
    ClobApiUrl,
    ClobWsUrl,
    AllowCreateApiKey,
}

impl SettingKey {
    pub const ALL: [SettingKey; 7] = [
        SettingKey::PrivateKey,
        SettingKey::ApiKey,
        SettingKey::ApiSecret,
        SettingKey::ApiPassphrase,
        SettingKey::ClobApiUrl,
        SettingKey::ClobWsUrl,
        SettingKey::AllowCreateApiKey,
    ];

    /// Accepted names, highest priority first. The first entry is canonical.
    pub fn aliases(&self) -> &'static [&'static str] {
        match self {
            SettingKey::PrivateKey => &[
                "POLYMARKET_PRIVATE_KEY",
                "EVM_PRIVATE_KEY",
                "WALLET_PRIVATE_KEY",
                "PRIVATE_KEY",
            ],
            SettingKey::ApiKey => &["CLOB_API_KEY"],
            SettingKey::ApiSecret => &["CLOB_API_SECRET", "CLOB_SECRET"],
            SettingKey::ApiPassphrase => &["CLOB_API_PASSPHRASE", "CLOB_PASS_PHRASE"],
            SettingKey::ClobApiUrl => &["CLOB_API_URL"],
            SettingKey::ClobWsUrl => &["CLOB_WS_URL"],
            SettingKey::AllowCreateApiKey => &["POLYMARKET_ALLOW_CREATE_API_KEY"],
        }
    }

    /// Canonical name used when writing the setting back.
    pub fn name(&self) -> &'static str {
        self.aliases()[0]
    }

    /// Resolve this key against a name lookup, walking aliases in order.
    ///
    /// Blank values count as unset.
    pub fn resolve<F>(&self, lookup: F) -> Option<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.aliases()
            .iter()
            .filter_map(|name| lookup(*name))
            .map(|v| v.trim().to_string())
            .find(|v| !v.is_empty())
    }
}

impl std::fmt::Display for SettingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Read/write access to named settings.
///
/// Reads are synchronous so request-time providers can consult settings
/// without suspending.
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: SettingKey) -> Option<String>;
    fn set(&self, key: SettingKey, value: &str);
    fn delete(&self, key: SettingKey);
}

/// In-memory settings, seeded from resolved configuration.
#[derive(Debug, Default)]
pub struct MemorySettings {
    values: RwLock<HashMap<SettingKey, String>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_values<I>(values: I) -> Self
    where
        I: IntoIterator<Item = (SettingKey, String)>,
    {
        let values = values
            .into_iter()
            .filter(|(_, v)| !v.trim().is_empty())
            .collect();
        Self {
            values: RwLock::new(values),
        }
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: SettingKey) -> Option<String> {
        self.values.read().get(&key).cloned()
    }

    fn set(&self, key: SettingKey, value: &str) {
        self.values.write().insert(key, value.to_string());
    }

    fn delete(&self, key: SettingKey) {
        self.values.write().remove(&key);
    }
}

/// Settings backed by the process environment.
///
/// Writes land in an overlay rather than mutating the environment; a delete
/// masks any environment value for the rest of the process.
#[derive(Debug, Default)]
pub struct EnvSettings {
    overlay: RwLock<HashMap<SettingKey, Option<String>>>,
}

impl EnvSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Environment-backed settings with `values` taking precedence, e.g.
    /// configuration already resolved from file and command line.
    pub fn with_overrides<I>(values: I) -> Self
    where
        I: IntoIterator<Item = (SettingKey, String)>,
    {
        let overlay = values
            .into_iter()
            .filter(|(_, v)| !v.trim().is_empty())
            .map(|(k, v)| (k, Some(v)))
            .collect();
        Self {
            overlay: RwLock::new(overlay),
        }
    }
}

impl SettingsStore for EnvSettings {
    fn get(&self, key: SettingKey) -> Option<String> {
        if let Some(value) = self.overlay.read().get(&key) {
            return value.clone();
        }
        key.resolve(|name| std::env::var(name).ok())
    }

    fn set(&self, key: SettingKey, value: &str) {
        self.overlay.write().insert(key, Some(value.to_string()));
    }

    fn delete(&self, key: SettingKey) {
        self.overlay.write().insert(key, None);
    }
}
