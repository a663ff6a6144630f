//! Per-sandbox auxiliary service provisioning.
//!
//! A provider creates and tears down one kind of isolated resource for a
//! sandbox. Deprovision is idempotent and tolerates partial prior
//! provisioning; sub-errors are logged and cleanup continues.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::Result;
use crate::model::ServiceCredentials;

pub mod postgres;
pub mod redis;

pub use postgres::PostgresProvider;
pub use redis::RedisProvider;

/// Capability set implemented by each auxiliary service backend.
#[async_trait]
pub trait ServiceProvider: Send + Sync {
    /// The service type this provider manages (equals the service name in
    /// templates).
    fn service_type(&self) -> &str;

    /// Create the isolated resource for `sandbox_id` and return its
    /// connection credentials.
    async fn provision(&self, sandbox_id: &str, name: &str) -> Result<ServiceCredentials>;

    /// Tear down whatever `provision` created. Must be safe to call twice
    /// and on half-provisioned state.
    async fn deprovision(&self, sandbox_id: &str, name: &str) -> Result<()>;

    /// Probe the backing service.
    async fn health_check(&self) -> Result<()>;
}

/// Name → provider lookup shared across concurrent provisioning tasks.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: DashMap<String, Arc<dyn ServiceProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, provider: Arc<dyn ServiceProvider>) {
        self.providers
            .insert(provider.service_type().to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ServiceProvider>> {
        self.providers.get(name).map(|entry| entry.value().clone())
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullProvider(&'static str);

    #[async_trait]
    impl ServiceProvider for NullProvider {
        fn service_type(&self) -> &str {
            self.0
        }

        async fn provision(&self, _sandbox_id: &str, _name: &str) -> Result<ServiceCredentials> {
            Ok(ServiceCredentials::default())
        }

        async fn deprovision(&self, _sandbox_id: &str, _name: &str) -> Result<()> {
            Ok(())
        }

        async fn health_check(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn registry_resolves_by_type() {
        let registry = ProviderRegistry::new();
        registry.register(Arc::new(NullProvider("postgres")));
        registry.register(Arc::new(NullProvider("redis")));
        assert!(registry.get("postgres").is_some());
        assert!(registry.get("redis").is_some());
        assert!(registry.get("mongo").is_none());
    }
}
