use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::EngineOptions;
use crate::tenant::TenantSettings;

/// Server configuration, read from `SLOTWISE_*` environment variables.
/// Unset or unparsable values fall back to defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub tenant: TenantSettings,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| lookup(format!("SLOTWISE_{name}").as_str()).filter(|v| !v.is_empty());
        fn parsed<T: FromStr>(raw: Option<String>) -> Option<T> {
            raw.and_then(|s| s.trim().parse().ok())
        }

        let tenant = TenantSettings {
            compact_threshold: parsed(var("COMPACT_THRESHOLD")).unwrap_or(1000),
            sweep_interval: Duration::from_secs(
                parsed::<u64>(var("SWEEP_INTERVAL_SECS")).unwrap_or(60).max(1),
            ),
            lifecycle_interval: Duration::from_secs(
                parsed::<u64>(var("LIFECYCLE_INTERVAL_SECS")).unwrap_or(3600).max(1),
            ),
            engine: EngineOptions {
                admin_secret: var("ADMIN_SECRET"),
                sweep_batch_size: parsed::<usize>(var("SWEEP_BATCH_SIZE")).unwrap_or(500).max(1),
            },
        };

        Self {
            port: parsed(var("PORT")).unwrap_or(5433),
            bind: var("BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: var("DATA_DIR").unwrap_or_else(|| "./data".into()).into(),
            password: var("PASSWORD").unwrap_or_else(|| "slotwise".into()),
            max_connections: parsed(var("MAX_CONNECTIONS")).unwrap_or(256),
            metrics_port: parsed(var("METRICS_PORT")),
            tls_cert: var("TLS_CERT"),
            tls_key: var("TLS_KEY"),
            tenant,
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}
