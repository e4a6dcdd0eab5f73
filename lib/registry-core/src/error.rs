use thiserror::Error;

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Failure of a single request against the registry replicas
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// The replica answered 404: the target is unknown to it. Never triggers failover.
    #[error("Not found at {url}")]
    NotFound { url: String },

    #[error("Registry returned status {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("Request to {url} timed out")]
    Timeout { url: String },

    #[error("Request to {url} failed: {message}")]
    Connect { url: String, message: String },

    #[error("Invalid response body from {url}: {message}")]
    Decode { url: String, message: String },

    #[error("No registry endpoints configured")]
    NoEndpoints,
}

impl TransportError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, TransportError::NotFound { .. })
    }
}

/// Heartbeat failure
///
/// `InstanceNotFound` means the registry was reachable and has evicted the
/// instance; `Transport` means the registry could not be reached.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HeartbeatError {
    #[error("Instance {instance_id} of {app} is not registered")]
    InstanceNotFound { app: String, instance_id: String },

    #[error("Heartbeat failed: {0}")]
    Transport(#[source] TransportError),
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Registration failed: {0}")]
    Registration(#[source] TransportError),

    #[error(transparent)]
    Heartbeat(#[from] HeartbeatError),

    /// Discovery answered, but no eligible instance exists
    #[error("{message}")]
    NoInstances { service: String, message: String },

    /// Discovery could not reach the registry
    #[error("Service discovery for {service} failed: {source}")]
    Discovery {
        service: String,
        #[source]
        source: TransportError,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Agent is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl RegistryError {
    /// True when the registry evicted this instance
    pub fn is_instance_not_found(&self) -> bool {
        matches!(
            self,
            RegistryError::Heartbeat(HeartbeatError::InstanceNotFound { .. })
        )
    }

    /// True for the "no instances for service X" signal, as opposed to a
    /// network-layer failure
    pub fn is_no_instances(&self) -> bool {
        matches!(self, RegistryError::NoInstances { .. })
    }

    /// True for any discovery failure, whether the registry answered or not
    pub fn is_service_discovery(&self) -> bool {
        matches!(
            self,
            RegistryError::NoInstances { .. } | RegistryError::Discovery { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_not_found_is_a_heartbeat_error() {
        let err: RegistryError = HeartbeatError::InstanceNotFound {
            app: "ORDERS".to_string(),
            instance_id: "orders:10.0.0.5:9001".to_string(),
        }
        .into();

        assert!(err.is_instance_not_found());
        assert!(matches!(err, RegistryError::Heartbeat(_)));
    }

    #[test]
    fn test_no_instances_distinct_from_network_failure() {
        let empty = RegistryError::NoInstances {
            service: "ORDERS".to_string(),
            message: "No UP instances found for service: orders".to_string(),
        };
        let unreachable = RegistryError::Discovery {
            service: "ORDERS".to_string(),
            source: TransportError::Timeout { url: "http://r1/eureka/apps/ORDERS".to_string() },
        };

        assert!(empty.is_no_instances());
        assert!(!unreachable.is_no_instances());
        assert!(empty.is_service_discovery());
        assert!(unreachable.is_service_discovery());
        assert_eq!(empty.to_string(), "No UP instances found for service: orders");
    }

    #[test]
    fn test_metrics_failure_is_not_a_config_error() {
        let err: RegistryError = prometheus::Error::AlreadyReg.into();

        assert!(matches!(err, RegistryError::Metrics(_)));
        assert!(err.to_string().starts_with("Metrics error:"));
    }
}
