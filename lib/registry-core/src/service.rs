//! Resolver-side view of a remote instance

use registry_api::InstanceInfo;
use std::collections::BTreeMap;
use std::fmt;

use crate::InstanceStatus;

/// Read-only projection of one instance of another service
///
/// Built fresh from every listing response and never mutated.
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceInstance {
    app: String,
    instance_id: String,
    host_name: String,
    ip_address: String,
    port: u16,
    secure_port: u16,
    status: InstanceStatus,
    metadata: BTreeMap<String, String>,
    home_page_url: Option<String>,
    status_page_url: Option<String>,
    health_check_url: Option<String>,
}

impl ServiceInstance {
    pub fn app(&self) -> &str {
        &self.app
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn ip_address(&self) -> &str {
        &self.ip_address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn secure_port(&self) -> u16 {
        self.secure_port
    }

    pub fn status(&self) -> InstanceStatus {
        self.status
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn home_page_url(&self) -> Option<&str> {
        self.home_page_url.as_deref()
    }

    pub fn status_page_url(&self) -> Option<&str> {
        self.status_page_url.as_deref()
    }

    pub fn health_check_url(&self) -> Option<&str> {
        self.health_check_url.as_deref()
    }

    /// `http://ip:port`; the secure port is never selected here
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.ip_address, self.port)
    }

    pub fn is_up(&self) -> bool {
        self.status == InstanceStatus::Up
    }
}

impl From<InstanceInfo> for ServiceInstance {
    fn from(info: InstanceInfo) -> Self {
        Self {
            status: info.status.parse().unwrap_or(InstanceStatus::Unknown),
            app: info.app,
            instance_id: info.instance_id,
            host_name: info.host_name,
            ip_address: info.ip_addr,
            port: info.port.port,
            secure_port: info.secure_port.port,
            metadata: info.metadata,
            home_page_url: info.home_page_url.filter(|url| !url.is_empty()),
            status_page_url: info.status_page_url.filter(|url| !url.is_empty()),
            health_check_url: info.health_check_url.filter(|url| !url.is_empty()),
        }
    }
}

impl fmt::Display for ServiceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} at {} ({})",
            self.app,
            self.instance_id,
            self.base_url(),
            self.status
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(value: serde_json::Value) -> ServiceInstance {
        serde_json::from_value::<InstanceInfo>(value).unwrap().into()
    }

    #[test]
    fn test_projection_from_registry_instance() {
        let instance = decode(json!({
            "instanceId": "billing:10.0.0.7:8080",
            "app": "BILLING",
            "hostName": "billing-1",
            "ipAddr": "10.0.0.7",
            "status": "UP",
            "port": {"$": 8080, "@enabled": "true"},
            "securePort": {"$": 8443, "@enabled": "false"},
            "healthCheckUrl": "http://10.0.0.7:8080/actuator/health",
            "metadata": {"zone": "a"}
        }));

        assert_eq!(instance.app(), "BILLING");
        assert_eq!(instance.instance_id(), "billing:10.0.0.7:8080");
        assert_eq!(instance.host_name(), "billing-1");
        assert_eq!(instance.port(), 8080);
        assert_eq!(instance.secure_port(), 8443);
        assert_eq!(instance.base_url(), "http://10.0.0.7:8080");
        assert_eq!(instance.health_check_url(), Some("http://10.0.0.7:8080/actuator/health"));
        assert_eq!(instance.home_page_url(), None);
        assert_eq!(instance.metadata().get("zone").map(String::as_str), Some("a"));
        assert!(instance.is_up());
    }

    #[test]
    fn test_unrecognized_status_is_unknown() {
        let instance = decode(json!({"ipAddr": "10.0.0.7", "status": "SLEEPING"}));
        assert_eq!(instance.status(), InstanceStatus::Unknown);
        assert!(!instance.is_up());
    }

    #[test]
    fn test_missing_ports_default() {
        let instance = decode(json!({"ipAddr": "10.0.0.7", "status": "UP"}));
        assert_eq!(instance.port(), 80);
        assert_eq!(instance.secure_port(), 443);
        assert_eq!(instance.base_url(), "http://10.0.0.7:80");
    }
}
