use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::info;

use crate::adapters::Adapters;
use crate::engine::{Engine, EngineOptions};
use crate::limits::*;
use crate::outbox::Outbox;
use crate::reaper;

/// Per-tenant job schedule and engine knobs.
#[derive(Debug, Clone)]
pub struct TenantSettings {
    /// WAL appends since the last compaction that trigger a new one.
    pub compact_threshold: u64,
    pub sweep_interval: Duration,
    pub lifecycle_interval: Duration,
    pub engine: EngineOptions,
}

impl Default for TenantSettings {
    fn default() -> Self {
        Self {
            compact_threshold: 1000,
            sweep_interval: Duration::from_secs(60),
            lifecycle_interval: Duration::from_secs(3600),
            engine: EngineOptions::default(),
        }
    }
}

/// Manages per-tenant engines. Each tenant gets its own Engine, WAL, outbox
/// and background jobs. Tenant = database name from the pgwire connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    settings: TenantSettings,
    adapters: Adapters,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, settings: TenantSettings, adapters: Adapters) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            settings,
            adapters,
        }
    }

    /// Get or lazily create an engine for the given tenant.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Sanitize tenant name to prevent path traversal
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        // Two connections may race to open the same tenant; only one engine may own the WAL.
        let entry = self.engines.entry(tenant.to_string());
        if let dashmap::mapref::entry::Entry::Occupied(existing) = &entry {
            return Ok(existing.get().clone());
        }

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let outbox = Outbox::spawn(self.adapters.clone());
        let engine = Arc::new(Engine::new(wal_path, outbox, self.settings.engine.clone())?);

        tokio::spawn(reaper::run_sweeper(
            engine.clone(),
            self.settings.sweep_interval,
        ));
        tokio::spawn(reaper::run_lifecycle(
            engine.clone(),
            self.settings.lifecycle_interval,
        ));
        tokio::spawn(reaper::run_compactor(
            engine.clone(),
            self.settings.compact_threshold,
        ));

        entry.or_insert(engine.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        info!(tenant, "tenant loaded");
        Ok(engine)
    }
}
