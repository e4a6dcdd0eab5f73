//! Client configuration: YAML file plus environment overrides

use registry_core::{HeartbeatPolicy, InstanceRecord, RegistryError, Result, RetryPolicy};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::agent::AgentOptions;

/// Replica list used when nothing is configured
pub const DEFAULT_REGISTRY_URL: &str = "http://localhost:8761/eureka/";

/// Names a YAML file loaded before environment overrides
pub const CONFIG_FILE_ENV: &str = "REGISTRY_CONFIG_FILE";

fn default_app_name() -> String {
    "python-service".to_string()
}

fn default_profile() -> String {
    "default".to_string()
}

fn default_registry_urls() -> Vec<String> {
    vec![DEFAULT_REGISTRY_URL.to_string()]
}

/// Registration retry settings, as written in configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    pub multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            initial_interval_ms: 1000,
            max_interval_ms: 2000,
            multiplier: 1.1,
        }
    }
}

/// Heartbeat backoff settings
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct HeartbeatSettings {
    pub growth: f64,
    pub max_factor: f64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            growth: 1.5,
            max_factor: 2.0,
        }
    }
}

/// Everything needed to build the transport, the instance and the agent
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    pub app_name: String,
    pub port: u16,
    pub profile: String,
    pub registry_urls: Vec<String>,
    pub instance_ip: Option<String>,
    pub instance_hostname: Option<String>,
    pub secure: bool,
    pub prefer_ip_address: bool,
    pub fail_fast: bool,
    pub request_timeout_secs: u64,
    pub lease_renewal_interval_secs: u32,
    pub lease_duration_secs: u32,
    pub shutdown_timeout_secs: u64,
    /// Extra instance metadata, merged over the defaults
    pub metadata: BTreeMap<String, String>,
    pub retry: RetrySettings,
    pub heartbeat: HeartbeatSettings,
    /// Services to resolve once at boot
    pub resolve_services: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            port: 8080,
            profile: default_profile(),
            registry_urls: default_registry_urls(),
            instance_ip: None,
            instance_hostname: None,
            secure: false,
            prefer_ip_address: true,
            fail_fast: true,
            request_timeout_secs: 10,
            lease_renewal_interval_secs: 30,
            lease_duration_secs: 90,
            shutdown_timeout_secs: 5,
            metadata: BTreeMap::new(),
            retry: RetrySettings::default(),
            heartbeat: HeartbeatSettings::default(),
            resolve_services: Vec::new(),
        }
    }
}

impl ClientConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| RegistryError::Config(format!("invalid configuration: {}", e)))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| RegistryError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_yaml_str(&contents)
    }

    /// Load from `REGISTRY_CONFIG_FILE` (if set), apply the process
    /// environment, and validate
    pub fn load() -> Result<Self> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    pub fn load_with<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup(CONFIG_FILE_ENV) {
            Some(path) => {
                info!("Loading registry configuration from {}", path);
                Self::from_file(path)?
            }
            None => Self::default(),
        };

        config.apply_env(&lookup)?;

        if config.registry_urls == default_registry_urls() {
            warn!(
                "Using default registry URL ({}). If this is not correct, set EUREKA_SERVER_URL",
                DEFAULT_REGISTRY_URL
            );
        }

        config.validate()?;
        Ok(config)
    }

    /// Override fields from environment variables
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup("SPRING_APPLICATION_NAME").or_else(|| lookup("APP_NAME")) {
            self.app_name = name;
        }
        if let Some(port) = lookup("APP_PORT") {
            self.port = parse_var("APP_PORT", &port)?;
        }
        if let Some(profile) = lookup("SPRING_PROFILES_ACTIVE") {
            self.profile = profile;
        }
        if let Some(urls) = lookup("EUREKA_SERVER_URL") {
            self.registry_urls = split_list(&urls);
        }
        if let Some(ip) = lookup("EUREKA_INSTANCE_IP") {
            self.instance_ip = Some(ip);
        }
        if let Some(host) = lookup("EUREKA_INSTANCE_HOSTNAME") {
            self.instance_hostname = Some(host);
        }
        if let Some(secure) = lookup("EUREKA_INSTANCE_SECURE") {
            self.secure = secure.trim().eq_ignore_ascii_case("true");
        }
        if let Some(prefer) = lookup("EUREKA_PREFER_IP_ADDRESS") {
            self.prefer_ip_address = parse_bool("EUREKA_PREFER_IP_ADDRESS", &prefer)?;
        }
        if let Some(fail_fast) = lookup("REGISTRY_FAIL_FAST") {
            self.fail_fast = parse_bool("REGISTRY_FAIL_FAST", &fail_fast)?;
        }
        if let Some(timeout) = lookup("REGISTRY_REQUEST_TIMEOUT_SECS") {
            self.request_timeout_secs = parse_var("REGISTRY_REQUEST_TIMEOUT_SECS", &timeout)?;
        }
        if let Some(services) = lookup("REGISTRY_RESOLVE_SERVICES") {
            self.resolve_services = split_list(&services);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.app_name.trim().is_empty() {
            return Err(RegistryError::Config("application name must not be empty".to_string()));
        }
        if self.registry_urls.iter().all(|url| url.trim().is_empty()) {
            return Err(RegistryError::Config(
                "at least one registry URL is required".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(RegistryError::Config(
                "request timeout must be at least one second".to_string(),
            ));
        }
        if self.lease_renewal_interval_secs == 0 {
            return Err(RegistryError::Config(
                "lease renewal interval must be at least one second".to_string(),
            ));
        }
        self.retry_policy().validate()?;
        self.heartbeat_policy().validate()?;
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            initial_interval: Duration::from_millis(self.retry.initial_interval_ms),
            max_interval: Duration::from_millis(self.retry.max_interval_ms),
            multiplier: self.retry.multiplier,
        }
    }

    pub fn heartbeat_policy(&self) -> HeartbeatPolicy {
        HeartbeatPolicy {
            growth: self.heartbeat.growth,
            max_factor: self.heartbeat.max_factor,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn agent_options(&self) -> AgentOptions {
        AgentOptions {
            retry: self.retry_policy(),
            heartbeat: self.heartbeat_policy(),
            fail_fast: self.fail_fast,
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
        }
    }

    /// Build this process's instance record.
    ///
    /// Metadata carries `management.port` and `profile` unless overridden.
    pub fn instance_record(&self) -> Result<InstanceRecord> {
        let mut metadata = BTreeMap::new();
        metadata.insert("management.port".to_string(), self.port.to_string());
        metadata.insert("profile".to_string(), self.profile.clone());
        metadata.extend(self.metadata.clone());

        let mut builder = InstanceRecord::builder(self.app_name.as_str())
            .port(self.port)
            .secure(self.secure)
            .prefer_ip_address(self.prefer_ip_address)
            .lease(self.lease_renewal_interval_secs, self.lease_duration_secs)
            .extend_metadata(metadata);

        // The secure listener shares the application port
        if self.secure {
            builder = builder.secure_port(self.port);
        }
        if let Some(ip) = &self.instance_ip {
            builder = builder.ip_address(ip.as_str());
        }
        if let Some(host) = &self.instance_hostname {
            builder = builder.host_name(host.as_str());
        }

        let instance = builder.build()?;
        match &self.instance_ip {
            Some(_) => info!("Using configured IP address {}", instance.ip_address),
            None => info!("Auto-detected IP address {}", instance.ip_address),
        }
        info!("Instance will register as {}", instance.instance_id);
        Ok(instance)
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(String::from)
        .collect()
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| RegistryError::Config(format!("invalid {} {:?}: {}", name, value, e)))
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(RegistryError::Config(format!("invalid {} {:?}: expected true or false", name, value))),
    }
}
