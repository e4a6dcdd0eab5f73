//! Listing responses for `GET /apps` and `GET /apps/{appName}`

use serde::{Deserialize, Serialize};

use crate::{InstanceInfo, OneOrMany};

/// Response of `GET /apps/{appName}`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApplicationEnvelope {
    pub application: Application,
}

/// Response of `GET /apps`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApplicationsEnvelope {
    pub applications: Applications,
}

/// One registered service and its instances
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Application {
    #[serde(default)]
    pub name: String,

    /// Single object when one instance is registered, list otherwise
    #[serde(default)]
    pub instance: OneOrMany<InstanceInfo>,
}

/// Every registered service
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Applications {
    #[serde(default, rename = "versions__delta")]
    pub versions_delta: Option<String>,

    #[serde(default, rename = "apps__hashcode")]
    pub apps_hashcode: Option<String>,

    /// Single object when one service is registered, list otherwise
    #[serde(default)]
    pub application: OneOrMany<Application>,
}

impl Application {
    /// Instances as a uniform list
    pub fn instances(self) -> Vec<InstanceInfo> {
        self.instance.into_vec()
    }
}

impl Applications {
    /// Names of every registered service
    pub fn names(self) -> Vec<String> {
        self.application
            .into_vec()
            .into_iter()
            .map(|app| app.name)
            .collect()
    }
}
