//! Registry client: registration agent, service resolver and replica transport
//!
//! This library provides:
//! - RegistryTransport: requests against a set of registry replicas with round-robin failover
//! - RegistrationAgent: registers this process, keeps the lease alive and recovers from eviction
//! - ServiceResolver: finds instances of other services with simple random load spreading

pub mod agent;
pub mod config;
pub mod metrics;
pub mod resolver;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use agent::{AgentOptions, AgentState, RegistrationAgent};
pub use config::ClientConfig;
pub use metrics::RegistryMetrics;
pub use resolver::ServiceResolver;
pub use transport::{
    HttpBackend, HttpRequest, HttpResponse, RegistryEndpointSet, RegistryTransport, ReqwestBackend, ResourcePath,
};
