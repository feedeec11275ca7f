use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::compactor;
use crate::engine::Engine;
use crate::limits::*;
use crate::model::Ms;

/// One engine, WAL and compactor per database name.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    max_span: Ms,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, max_span: Ms) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            max_span,
        }
    }

    /// Get or lazily open the engine for `tenant`.
    ///
    /// Tenants are keyed by their sanitized name, the same name the WAL file
    /// gets, so `a.b` and `ab` are one tenant.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }

        // Only the file name is taken from the client.
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

        if let Some(engine) = self.engines.get(&safe_name) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Two connections racing on a new tenant must share one engine.
        let entry = self.engines.entry(safe_name.clone());
        if let dashmap::mapref::entry::Entry::Occupied(existing) = &entry {
            return Ok(existing.get().clone());
        }
        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let engine = Arc::new(Engine::new(wal_path, self.max_span)?);
        entry.or_insert_with(|| engine.clone());

        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            compactor::run_compactor(compactor_engine, threshold).await;
        });

        tracing::info!("opened tenant {safe_name}");
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}
