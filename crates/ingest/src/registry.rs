use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use tracepulse_core::config::Config;
use tracepulse_core::error::{Result, TracepulseError};
use tracepulse_core::ids::TenantId;
use tracepulse_core::query::StatusResponse;
use tracing::{info, warn};

use crate::pipeline::TenantPipeline;

/// All tenant pipelines of one process. Tenants share nothing but this map.
pub struct TenantRegistry {
    cfg: Arc<Config>,
    tenants: RwLock<HashMap<TenantId, Arc<TenantPipeline>>>,
    deactivated: RwLock<HashSet<TenantId>>,
}

impl TenantRegistry {
    /// Must be called inside a tokio runtime; configured tenants start
    /// immediately.
    pub fn new(cfg: Arc<Config>) -> Self {
        let registry = Self {
            cfg: cfg.clone(),
            tenants: RwLock::new(HashMap::new()),
            deactivated: RwLock::new(HashSet::new()),
        };
        for raw in &cfg.tenants {
            match TenantId::parse(raw) {
                Ok(tenant) => {
                    registry.activate(&tenant);
                }
                Err(err) => warn!(tenant = %raw, error = %err, "skipping configured tenant"),
            }
        }
        registry
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.cfg
    }

    fn inactive(tenant: &TenantId) -> TracepulseError {
        TracepulseError::TenantInactive(format!("tenant {tenant} is not active"))
    }

    /// Pipeline that accepts events for `tenant`, starting it on first use
    /// when auto-activation is enabled.
    pub fn pipeline_for_ingest(&self, tenant: &TenantId) -> Result<Arc<TenantPipeline>> {
        if let Some(pipeline) = self.get_active(tenant) {
            return Ok(pipeline);
        }
        if !self.cfg.auto_activate_tenants {
            return Err(Self::inactive(tenant));
        }
        let mut tenants = self.tenants.write().expect("tenant registry poisoned");
        // checked under the tenants lock so a concurrent deactivate cannot be undone
        if self.is_deactivated(tenant) {
            return Err(Self::inactive(tenant));
        }
        Ok(self.start_locked(&mut tenants, tenant))
    }

    /// Pipeline for reads and subscriptions. Never creates one.
    pub fn get(&self, tenant: &TenantId) -> Result<Arc<TenantPipeline>> {
        self.get_active(tenant)
            .ok_or_else(|| Self::inactive(tenant))
    }

    fn get_active(&self, tenant: &TenantId) -> Option<Arc<TenantPipeline>> {
        self.tenants
            .read()
            .expect("tenant registry poisoned")
            .get(tenant)
            .filter(|p| p.is_active())
            .cloned()
    }

    fn is_deactivated(&self, tenant: &TenantId) -> bool {
        self.deactivated
            .read()
            .expect("tenant registry poisoned")
            .contains(tenant)
    }

    /// Starts `tenant` (or returns its running pipeline) and clears any
    /// earlier deactivation.
    pub fn activate(&self, tenant: &TenantId) -> Arc<TenantPipeline> {
        let mut tenants = self.tenants.write().expect("tenant registry poisoned");
        self.deactivated
            .write()
            .expect("tenant registry poisoned")
            .remove(tenant);
        self.start_locked(&mut tenants, tenant)
    }

    /// Lock order is `tenants` then `deactivated`; callers hold the former.
    fn start_locked(
        &self,
        tenants: &mut HashMap<TenantId, Arc<TenantPipeline>>,
        tenant: &TenantId,
    ) -> Arc<TenantPipeline> {
        if let Some(existing) = tenants.get(tenant).filter(|p| p.is_active()) {
            return existing.clone();
        }
        let pipeline = TenantPipeline::start(tenant.clone(), self.cfg.clone());
        tenants.insert(tenant.clone(), pipeline.clone());
        info!(tenant = %tenant, "tenant activated");
        pipeline
    }

    /// Stops the tenant and discards its state. Returns false when the tenant
    /// was not running.
    pub fn deactivate(&self, tenant: &TenantId) -> bool {
        let removed = {
            let mut tenants = self.tenants.write().expect("tenant registry poisoned");
            self.deactivated
                .write()
                .expect("tenant registry poisoned")
                .insert(tenant.clone());
            tenants.remove(tenant)
        };
        match removed {
            Some(pipeline) => {
                pipeline.shutdown();
                info!(tenant = %tenant, "tenant deactivated");
                true
            }
            None => false,
        }
    }

    pub fn tenants(&self) -> Vec<Arc<TenantPipeline>> {
        let mut list = self
            .tenants
            .read()
            .expect("tenant registry poisoned")
            .values()
            .cloned()
            .collect::<Vec<_>>();
        list.sort_by(|a, b| a.tenant().cmp(b.tenant()));
        list
    }

    pub fn status(&self) -> StatusResponse {
        let mut deactivated = self
            .deactivated
            .read()
            .expect("tenant registry poisoned")
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        deactivated.sort();
        StatusResponse {
            version: env!("CARGO_PKG_VERSION").to_string(),
            tenants: self.tenants().iter().map(|p| p.status()).collect(),
            deactivated,
        }
    }

    pub fn shutdown_all(&self) {
        let drained = self
            .tenants
            .write()
            .expect("tenant registry poisoned")
            .drain()
            .map(|(_, p)| p)
            .collect::<Vec<_>>();
        for pipeline in drained {
            pipeline.shutdown();
        }
    }
}
