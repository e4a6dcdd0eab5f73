use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::serde_util::{bool_as_string, lenient_bool, lenient_string};
use crate::{DEFAULT_DATA_CENTER_CLASS, DEFAULT_DATA_CENTER_NAME};

/// Body of a registration request: `{"instance": {...}}`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegistrationEnvelope {
    pub instance: InstanceInfo,
}

/// Instance description as the registry renders it
///
/// The same shape is posted on registration and returned inside listing
/// responses. Every field has a default so partially populated listings
/// still decode.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfo {
    #[serde(default)]
    pub instance_id: String,

    /// Application name (upper-cased by convention)
    #[serde(default)]
    pub app: String,

    #[serde(default)]
    pub app_group_name: Option<String>,

    #[serde(default)]
    pub ip_addr: String,

    #[serde(default = "default_sid")]
    pub sid: String,

    #[serde(default)]
    pub home_page_url: Option<String>,

    #[serde(default)]
    pub status_page_url: Option<String>,

    #[serde(default)]
    pub health_check_url: Option<String>,

    #[serde(default)]
    pub secure_health_check_url: Option<String>,

    #[serde(default)]
    pub vip_address: String,

    #[serde(default)]
    pub secure_vip_address: String,

    #[serde(default = "default_country_id")]
    pub country_id: i32,

    #[serde(default)]
    pub data_center_info: DataCenterInfo,

    #[serde(default)]
    pub host_name: String,

    /// UP, DOWN, STARTING, OUT_OF_SERVICE or UNKNOWN
    #[serde(default = "default_status")]
    pub status: String,

    #[serde(default = "default_status")]
    pub overridden_status: String,

    #[serde(default)]
    pub lease_info: Option<LeaseInfo>,

    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    #[serde(default = "PortInfo::default_http")]
    pub port: PortInfo,

    #[serde(default = "PortInfo::default_secure")]
    pub secure_port: PortInfo,

    #[serde(
        default,
        serialize_with = "bool_as_string",
        deserialize_with = "lenient_bool"
    )]
    pub is_coordinating_discovery_server: bool,

    #[serde(default, deserialize_with = "lenient_string")]
    pub last_updated_timestamp: String,

    #[serde(default, deserialize_with = "lenient_string")]
    pub last_dirty_timestamp: String,

    #[serde(default)]
    pub action_type: Option<String>,
}

/// Port with its enabled flag, rendered as `{"$": 8080, "@enabled": "true"}`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "PortRepr")]
pub struct PortInfo {
    #[serde(rename = "$")]
    pub port: u16,

    #[serde(rename = "@enabled", serialize_with = "bool_as_string")]
    pub enabled: bool,
}

impl PortInfo {
    pub fn new(port: u16, enabled: bool) -> Self {
        Self { port, enabled }
    }

    fn default_http() -> Self {
        Self::new(80, true)
    }

    fn default_secure() -> Self {
        Self::new(443, false)
    }
}

// Some registries render the port as a bare number.
#[derive(Deserialize)]
#[serde(untagged)]
enum PortRepr {
    Object {
        #[serde(rename = "$")]
        port: u16,
        #[serde(rename = "@enabled", default = "enabled_by_default", deserialize_with = "lenient_bool")]
        enabled: bool,
    },
    Bare(u16),
}

fn enabled_by_default() -> bool {
    true
}

impl From<PortRepr> for PortInfo {
    fn from(repr: PortRepr) -> Self {
        match repr {
            PortRepr::Object { port, enabled } => PortInfo { port, enabled },
            PortRepr::Bare(port) => PortInfo { port, enabled: true },
        }
    }
}

/// Lease contract between an instance and the registry
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseInfo {
    #[serde(default)]
    pub renewal_interval_in_secs: u32,
    #[serde(default)]
    pub duration_in_secs: u32,
    #[serde(default)]
    pub registration_timestamp: u64,
    #[serde(default)]
    pub last_renewal_timestamp: u64,
    #[serde(default)]
    pub eviction_timestamp: u64,
    #[serde(default)]
    pub service_up_timestamp: u64,
}

/// Data-center marker
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataCenterInfo {
    #[serde(rename = "@class")]
    pub class: String,
    pub name: String,
}

impl Default for DataCenterInfo {
    fn default() -> Self {
        Self {
            class: DEFAULT_DATA_CENTER_CLASS.to_string(),
            name: DEFAULT_DATA_CENTER_NAME.to_string(),
        }
    }
}

// Default values
fn default_sid() -> String {
    "na".to_string()
}

fn default_country_id() -> i32 {
    1
}

fn default_status() -> String {
    "UNKNOWN".to_string()
}
