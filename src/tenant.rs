use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::cache::ReservationCache;
use crate::config::Policy;
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::sweeper;

/// One tenant's engine plus the read cache in front of it.
pub struct Tenant {
    pub engine: Arc<Engine>,
    pub cache: Arc<ReservationCache>,
}

/// Manages per-tenant engines. Each tenant gets its own Engine + WAL + sweeper.
/// Tenant = database name from the pgwire connection.
pub struct TenantManager {
    tenants: DashMap<String, Arc<Tenant>>,
    data_dir: PathBuf,
    policy: Policy,
    compact_threshold: u64,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, policy: Policy, compact_threshold: u64) -> Self {
        Self {
            tenants: DashMap::new(),
            data_dir,
            policy,
            compact_threshold,
        }
    }

    /// Get or lazily create the tenant for a database name.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Tenant>> {
        if let Some(t) = self.tenants.get(tenant) {
            return Ok(t.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        if self.tenants.len() >= MAX_TENANTS {
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

        // Two connections may race to open the same tenant; only one WAL may be open.
        let entry = match self.tenants.entry(tenant.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(e) => return Ok(e.get().clone()),
            dashmap::mapref::entry::Entry::Vacant(e) => e,
        };

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::new(wal_path, notify, self.policy.clone())?);
        let cache = ReservationCache::new(engine.clone());

        tokio::spawn(sweeper::run_sweeper(engine.clone()));
        tokio::spawn(sweeper::run_compactor(engine.clone(), self.compact_threshold));

        let t = Arc::new(Tenant { engine, cache });
        entry.insert(t.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.tenants.len() as f64);
        tracing::info!("opened tenant {safe_name}");
        Ok(t)
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }
}
