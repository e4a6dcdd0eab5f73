//! Wire types for the registry REST surface
//!
//! This library defines the JSON shapes exchanged with registry replicas:
//! - InstanceInfo: the instance description sent on registration and returned by listings
//! - Application / Applications: listing responses for one or all services
//! - OneOrMany: normalizer for fields the registry renders as either an object or a list

pub mod applications;
pub mod instance;
pub mod one_or_many;

mod serde_util;

pub use applications::{Application, ApplicationEnvelope, Applications, ApplicationsEnvelope};
pub use instance::{DataCenterInfo, InstanceInfo, LeaseInfo, PortInfo, RegistrationEnvelope};
pub use one_or_many::OneOrMany;

/// Data-center class the registry expects for self-hosted instances
pub const DEFAULT_DATA_CENTER_CLASS: &str = "com.netflix.appinfo.InstanceInfo$DefaultDataCenterInfo";
/// Data-center name for self-hosted instances
pub const DEFAULT_DATA_CENTER_NAME: &str = "MyOwn";
