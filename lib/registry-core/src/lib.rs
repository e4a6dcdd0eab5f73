//! Core registration and discovery types
//!
//! This library provides:
//! - InstanceRecord: this process described as a registrable instance
//! - ServiceInstance: read-only view of a remote instance returned by discovery
//! - RetryPolicy / HeartbeatPolicy and the BackoffExecutor that applies them
//! - The error taxonomy shared by the transport, agent and resolver

pub mod error;
pub mod instance;
pub mod retry;
pub mod service;

pub use error::{HeartbeatError, RegistryError, Result, TransportError};
pub use instance::{InstanceRecord, InstanceRecordBuilder, InstanceStatus};
pub use retry::{BackoffExecutor, HeartbeatPolicy, RetryPolicy};
pub use service::ServiceInstance;
