//! Tenant resolution and the project-provider registry.
//!
//! The tenant store is a consumed interface; the built-in implementation
//! is seeded from configuration so the binary runs stand-alone. PM-tool
//! adapters register themselves under the id a tenant's
//! `project_provider_id` points at.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use vl_domain::error::{Error, Result};
use vl_domain::tenant::{ProjectProvider, TenantContext, TenantEntry, TenantStore};

/// Config-seeded tenant store keyed on the dialed number.
pub struct InMemoryTenantStore {
    by_number: HashMap<String, TenantContext>,
}

impl InMemoryTenantStore {
    pub fn from_entries(entries: Vec<TenantEntry>) -> Self {
        let mut by_number = HashMap::with_capacity(entries.len());
        for entry in entries {
            let number = entry.dialed_number.clone();
            if by_number
                .insert(number.clone(), entry.into_context())
                .is_some()
            {
                tracing::warn!(dialed_number = %number, "duplicate tenant number, last wins");
            }
        }
        Self { by_number }
    }

    pub fn len(&self) -> usize {
        self.by_number.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_number.is_empty()
    }
}

#[async_trait]
impl TenantStore for InMemoryTenantStore {
    async fn resolve(&self, dialed_number: &str) -> Result<TenantContext> {
        self.by_number
            .get(dialed_number)
            .cloned()
            .ok_or_else(|| Error::UnknownNumber(dialed_number.to_owned()))
    }
}

/// Process-wide registry of PM integration adapters.
#[derive(Default)]
pub struct ProjectRegistry {
    providers: RwLock<HashMap<String, Arc<dyn ProjectProvider>>>,
}

impl ProjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: impl Into<String>, provider: Arc<dyn ProjectProvider>) {
        self.providers.write().insert(id.into(), provider);
    }

    /// Resolve a tenant's integration handle. `None` for tenants without
    /// one, or when the adapter is not registered in this process.
    pub fn get(&self, id: Option<&str>) -> Option<Arc<dyn ProjectProvider>> {
        let id = id?;
        let provider = self.providers.read().get(id).cloned();
        if provider.is_none() {
            tracing::warn!(provider_id = id, "tenant references unregistered project provider");
        }
        provider
    }
}
