//! This process described as a registrable instance

use registry_api::{DataCenterInfo, InstanceInfo, LeaseInfo, PortInfo, RegistrationEnvelope};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, ToSocketAddrs};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

use crate::{RegistryError, Result};

/// Self-reported health of an instance
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    #[default]
    Up,
    Down,
    Starting,
    OutOfService,
    Unknown,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Up => "UP",
            InstanceStatus::Down => "DOWN",
            InstanceStatus::Starting => "STARTING",
            InstanceStatus::OutOfService => "OUT_OF_SERVICE",
            InstanceStatus::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "UP" => Ok(InstanceStatus::Up),
            "DOWN" => Ok(InstanceStatus::Down),
            "STARTING" => Ok(InstanceStatus::Starting),
            "OUT_OF_SERVICE" => Ok(InstanceStatus::OutOfService),
            "UNKNOWN" => Ok(InstanceStatus::Unknown),
            other => Err(RegistryError::Config(format!("unknown instance status: {}", other))),
        }
    }
}

/// Identity, addressing, lease contract and metadata of this process
#[derive(Clone, Debug, PartialEq)]
pub struct InstanceRecord {
    /// Service group, canonically upper-cased
    pub app_name: String,
    /// Unique within `app_name`
    pub instance_id: String,
    pub host_name: String,
    pub ip_address: String,
    pub vip_address: String,
    pub secure_vip_address: String,
    pub port: u16,
    pub secure_port: u16,
    pub port_enabled: bool,
    pub secure_port_enabled: bool,
    pub status: InstanceStatus,
    /// Heartbeat promised at least this often
    pub lease_renewal_interval_secs: u32,
    /// Registry may evict after this long without a heartbeat
    pub lease_duration_secs: u32,
    pub metadata: BTreeMap<String, String>,
    pub home_page_url: String,
    pub status_page_url: String,
    pub health_check_url: String,
    /// Milliseconds since the epoch at which this record was built
    pub last_dirty_timestamp: i64,
}

impl InstanceRecord {
    pub fn builder(app_name: impl Into<String>) -> InstanceRecordBuilder {
        InstanceRecordBuilder::new(app_name)
    }

    pub fn renewal_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.lease_renewal_interval_secs))
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.lease_duration_secs))
    }

    /// Base URL this instance serves on
    pub fn base_url(&self) -> String {
        self.home_page_url.clone()
    }

    /// Wire representation posted to `POST /apps/{appName}`
    pub fn to_instance_info(&self) -> InstanceInfo {
        InstanceInfo {
            instance_id: self.instance_id.clone(),
            app: self.app_name.clone(),
            app_group_name: None,
            ip_addr: self.ip_address.clone(),
            sid: "na".to_string(),
            home_page_url: Some(self.home_page_url.clone()),
            status_page_url: Some(self.status_page_url.clone()),
            health_check_url: Some(self.health_check_url.clone()),
            secure_health_check_url: None,
            vip_address: self.vip_address.clone(),
            secure_vip_address: self.secure_vip_address.clone(),
            country_id: 1,
            data_center_info: DataCenterInfo::default(),
            host_name: self.host_name.clone(),
            status: self.status.to_string(),
            overridden_status: InstanceStatus::Unknown.to_string(),
            lease_info: Some(LeaseInfo {
                renewal_interval_in_secs: self.lease_renewal_interval_secs,
                duration_in_secs: self.lease_duration_secs,
                ..LeaseInfo::default()
            }),
            metadata: self.metadata.clone(),
            port: PortInfo::new(self.port, self.port_enabled),
            secure_port: PortInfo::new(self.secure_port, self.secure_port_enabled),
            is_coordinating_discovery_server: false,
            last_updated_timestamp: self.last_dirty_timestamp.to_string(),
            last_dirty_timestamp: self.last_dirty_timestamp.to_string(),
            action_type: Some("ADDED".to_string()),
        }
    }

    pub fn registration_payload(&self) -> RegistrationEnvelope {
        RegistrationEnvelope {
            instance: self.to_instance_info(),
        }
    }

    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self.registration_payload())?)
    }
}

/// Builds an [`InstanceRecord`], detecting host name and IP when not supplied
#[derive(Clone, Debug)]
pub struct InstanceRecordBuilder {
    app_name: String,
    instance_id: Option<String>,
    host_name: Option<String>,
    ip_address: Option<String>,
    port: u16,
    secure_port: u16,
    secure: bool,
    prefer_ip_address: bool,
    status: InstanceStatus,
    lease_renewal_interval_secs: u32,
    lease_duration_secs: u32,
    metadata: BTreeMap<String, String>,
}

impl InstanceRecordBuilder {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            instance_id: None,
            host_name: None,
            ip_address: None,
            port: 8080,
            secure_port: 443,
            secure: false,
            prefer_ip_address: true,
            status: InstanceStatus::Up,
            lease_renewal_interval_secs: 30,
            lease_duration_secs: 90,
            metadata: BTreeMap::new(),
        }
    }

    pub fn instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn host_name(mut self, host_name: impl Into<String>) -> Self {
        self.host_name = Some(host_name.into());
        self
    }

    pub fn ip_address(mut self, ip_address: impl Into<String>) -> Self {
        self.ip_address = Some(ip_address.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn secure_port(mut self, secure_port: u16) -> Self {
        self.secure_port = secure_port;
        self
    }

    /// Enable the secure port and advertise https URLs
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Register the IP address in place of the host name
    pub fn prefer_ip_address(mut self, prefer: bool) -> Self {
        self.prefer_ip_address = prefer;
        self
    }

    pub fn status(mut self, status: InstanceStatus) -> Self {
        self.status = status;
        self
    }

    pub fn lease(mut self, renewal_interval_secs: u32, duration_secs: u32) -> Self {
        self.lease_renewal_interval_secs = renewal_interval_secs;
        self.lease_duration_secs = duration_secs;
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn extend_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata.extend(metadata);
        self
    }

    pub fn build(self) -> Result<InstanceRecord> {
        let app_name = self.app_name.trim();
        if app_name.is_empty() {
            return Err(RegistryError::Config("application name must not be empty".to_string()));
        }
        if self.lease_renewal_interval_secs == 0 {
            return Err(RegistryError::Config(
                "lease renewal interval must be at least one second".to_string(),
            ));
        }
        if self.lease_duration_secs < self.lease_renewal_interval_secs {
            warn!(
                "Lease duration {}s is shorter than the renewal interval {}s; the registry may evict between heartbeats",
                self.lease_duration_secs, self.lease_renewal_interval_secs
            );
        }

        let detected_host = match self.host_name {
            Some(host) => host,
            None => detect_host_name(),
        };
        let ip_address = match self.ip_address {
            Some(ip) => ip,
            None => resolve_ip(&detected_host),
        };
        let host_name = if self.prefer_ip_address {
            ip_address.clone()
        } else {
            detected_host
        };

        let lower = app_name.to_lowercase();
        let instance_id = self
            .instance_id
            .unwrap_or_else(|| format!("{}:{}:{}", lower, host_name, self.port));

        let (scheme, url_port) = if self.secure {
            ("https", self.secure_port)
        } else {
            ("http", self.port)
        };
        let base_url = format!("{}://{}:{}", scheme, ip_address, url_port);

        debug!("Built instance record {} for {}", instance_id, base_url);

        Ok(InstanceRecord {
            app_name: app_name.to_uppercase(),
            instance_id,
            host_name,
            ip_address,
            vip_address: lower.clone(),
            secure_vip_address: lower,
            port: self.port,
            secure_port: self.secure_port,
            port_enabled: true,
            secure_port_enabled: self.secure,
            status: self.status,
            lease_renewal_interval_secs: self.lease_renewal_interval_secs,
            lease_duration_secs: self.lease_duration_secs,
            metadata: self.metadata,
            status_page_url: format!("{}/actuator/info", base_url),
            health_check_url: format!("{}/actuator/health", base_url),
            home_page_url: base_url,
            last_dirty_timestamp: chrono::Utc::now().timestamp_millis(),
        })
    }
}

fn detect_host_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "localhost".to_string())
}

/// First IPv4 address the host name resolves to, falling back to loopback
fn resolve_ip(host_name: &str) -> String {
    if let Ok(ip) = host_name.parse::<IpAddr>() {
        return ip.to_string();
    }

    match (host_name, 0).to_socket_addrs() {
        Ok(addrs) => {
            let addrs: Vec<_> = addrs.collect();
            addrs
                .iter()
                .find(|addr| addr.is_ipv4())
                .or_else(|| addrs.first())
                .map(|addr| addr.ip().to_string())
                .unwrap_or_else(|| "127.0.0.1".to_string())
        }
        Err(e) => {
            warn!("Could not resolve {} ({}), using 127.0.0.1", host_name, e);
            "127.0.0.1".to_string()
        }
    }
}
