//! Lookup of other services' instances

use rand::Rng;
use registry_core::{RegistryError, Result, ServiceInstance};
use std::sync::Arc;
use tracing::{debug, error};

use crate::transport::RegistryTransport;

/// Resolves named services to instances through the registry
///
/// Every call goes to the registry; nothing is cached between calls.
#[derive(Clone)]
pub struct ServiceResolver {
    transport: Arc<RegistryTransport>,
}

impl ServiceResolver {
    pub fn new(transport: Arc<RegistryTransport>) -> Self {
        Self { transport }
    }

    /// All instances of `service_name`, optionally only those reporting UP.
    ///
    /// The name is matched case-insensitively. An unknown service and a
    /// service without eligible instances both yield
    /// [`RegistryError::NoInstances`]; a registry that cannot be reached
    /// yields [`RegistryError::Discovery`].
    pub async fn list_instances(&self, service_name: &str, only_healthy: bool) -> Result<Vec<ServiceInstance>> {
        let app_name = service_name.to_uppercase();

        let application = match self.transport.list_instances(&app_name).await {
            Ok(application) => application,
            Err(e) if e.is_not_found() => {
                return Err(RegistryError::NoInstances {
                    service: service_name.to_string(),
                    message: format!("Service not found: {}", service_name),
                });
            }
            Err(source) => {
                return Err(RegistryError::Discovery {
                    service: service_name.to_string(),
                    source,
                });
            }
        };

        let instances: Vec<ServiceInstance> = application
            .instances()
            .into_iter()
            .map(ServiceInstance::from)
            .filter(|instance| !only_healthy || instance.is_up())
            .collect();

        if instances.is_empty() {
            let qualifier = if only_healthy { "UP " } else { "" };
            return Err(RegistryError::NoInstances {
                service: service_name.to_string(),
                message: format!("No {}instances found for service: {}", qualifier, service_name),
            });
        }

        debug!("Found {} instances for {}", instances.len(), service_name);
        Ok(instances)
    }

    /// One UP instance, picked uniformly at random when `load_balance` is set
    pub async fn resolve_one(&self, service_name: &str, load_balance: bool) -> Result<ServiceInstance> {
        let mut instances = self.list_instances(service_name, true).await?;

        let index = if load_balance && instances.len() > 1 {
            rand::thread_rng().gen_range(0..instances.len())
        } else {
            0
        };

        Ok(instances.swap_remove(index))
    }

    /// Base URL (`http://ip:port`) of a load-balanced UP instance
    pub async fn resolve_url(&self, service_name: &str) -> Result<String> {
        let instance = self.resolve_one(service_name, true).await?;
        Ok(instance.base_url())
    }

    /// Names of every registered application; empty when the registry is unreachable
    pub async fn list_service_names(&self) -> Vec<String> {
        match self.transport.list_all_applications().await {
            Ok(applications) => applications.names(),
            Err(e) => {
                error!("Failed to list services: {}", e);
                Vec::new()
            }
        }
    }
}
