//! CSE configuration, loaded by the `onem2m-cse` binary via the `config`
//! crate (TOML file + `ONEM2M_*` environment overrides) and threaded through
//! to the core and storage crates as a plain value.

use serde::{Deserialize, Serialize};

/// Top-level configuration, one section per subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CseConfig {
    pub cse: CseIdentity,
    pub storage: StorageConfig,
    pub notification: NotificationConfig,
    pub worker: WorkerConfig,
    pub logging: LoggingConfig,
}

impl Default for CseConfig {
    fn default() -> Self {
        CseConfig {
            cse: CseIdentity::default(),
            storage: StorageConfig::default(),
            notification: NotificationConfig::default(),
            worker: WorkerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// CSE identity and registration defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CseIdentity {
    /// CSE-ID, e.g. `/cse-in`
    pub cse_id: String,
    /// Resource name of the CSEBase
    pub cse_rn: String,
    /// The CSE's own originator ID, used for outbound CSE-originated requests
    pub cse_originator: String,
    /// Originator that is always granted full access, in addition to `cse_originator`
    pub admin_originator: String,
    /// AE originators allowed to register (empty = any)
    pub allowed_ae_originators: Vec<String>,
    /// Remote CSE originators allowed to register (empty = any)
    pub allowed_csr_originators: Vec<String>,
    /// Default `et` horizon applied when a create omits `et`
    pub default_expiration_secs: u64,
    /// Upper bound on how far into the future `et` may be set
    pub max_expiration_delta_secs: u64,
    /// Default `exc` applied to a `<sub>` that omits an expiration counter
    pub default_subscription_expiration_counter: u64,
    /// Sort discovered resources by `(ty, lowercased rn)`
    pub sort_discovery_results: bool,
    /// Master switch for the Access-Control Engine; `false` allows everything
    pub acp_checks_enabled: bool,
    /// Truncate all Store tables on startup
    pub reset_at_startup: bool,
    /// Host the `onem2m-cse` binary's health/readiness HTTP surface binds to
    pub listen_host: String,
    /// Port the `onem2m-cse` binary's health/readiness HTTP surface binds to
    pub listen_port: u16,
}

impl CseIdentity {
    /// Whether the Access-Control Engine should evaluate rules at all.
    pub fn acp_checks_enabled(&self) -> bool {
        self.acp_checks_enabled
    }
}

impl Default for CseIdentity {
    fn default() -> Self {
        CseIdentity {
            cse_id: "/cse-in".to_string(),
            cse_rn: "cse-in".to_string(),
            cse_originator: "CCSE".to_string(),
            admin_originator: "CAdmin".to_string(),
            allowed_ae_originators: Vec::new(),
            allowed_csr_originators: Vec::new(),
            default_expiration_secs: 60 * 60 * 24 * 365,
            max_expiration_delta_secs: 60 * 60 * 24 * 365 * 5,
            default_subscription_expiration_counter: 0,
            sort_discovery_results: true,
            acp_checks_enabled: true,
            reset_at_startup: false,
            listen_host: "127.0.0.1".to_string(),
            listen_port: 8080,
        }
    }
}

/// Storage backend selection and tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Which Store implementation to wire up
    pub backend: StorageBackend,
    /// Document-store data directory (one file per logical table)
    pub data_dir: String,
    /// In-memory per-table read cache size for the document-store backend
    pub cache_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            backend: StorageBackend::Memory,
            data_dir: "./data".to_string(),
            cache_size: 1000,
        }
    }
}

/// The two required Store backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Memory,
    Document,
}

/// Notification Manager tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Default ratio of `pei` used to derive `mdt` when a time series omits it
    pub default_missing_data_detection_ratio: f64,
    /// HTTP client timeout for delivering a notification
    pub delivery_timeout_secs: u64,
    /// Retries before a notification target is considered unreachable
    pub delivery_retries: u32,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        NotificationConfig {
            default_missing_data_detection_ratio: 0.5,
            delivery_timeout_secs: 10,
            delivery_retries: 2,
        }
    }
}

/// Background Worker Pool tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Tick period for the expiration sweep
    pub expiration_sweep_interval_secs: u64,
    /// Maximum number of in-flight one-shot actors (cross-resource sliding
    /// windows, batch-notification guard timers)
    pub max_scheduled_actors: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            expiration_sweep_interval_secs: 60,
            max_scheduled_actors: 10_000,
        }
    }
}

/// `tracing-subscriber` setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive string, e.g. `onem2m_core=debug,info`
    pub filter: String,
    /// Emit JSON-formatted log lines instead of the human-readable default
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            filter: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_storage_backend_is_memory() {
        let cfg = CseConfig::default();
        assert_eq!(cfg.storage.backend, StorageBackend::Memory);
    }

    #[test]
    fn default_missing_data_ratio_is_half_of_period() {
        let cfg = CseConfig::default();
        assert_eq!(cfg.notification.default_missing_data_detection_ratio, 0.5);
    }
}
