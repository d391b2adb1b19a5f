//! Core data model for the voxup supervisor
//!
//! This crate defines the managed-unit model, the supervisor configuration,
//! the error taxonomy, and the on-disk unit record store shared by the
//! lifecycle commands and the supervisor loop.

pub mod config;
pub mod error;
pub mod store;
pub mod unit;

pub use config::{ProviderCredentials, ServiceSpec, SupervisorConfig, TimeoutPolicy, TunnelSpec};
pub use error::SupervisorError;
pub use store::{UnitRecord, UnitStore};
pub use unit::{
    BindingScheme, ManagedUnit, ProviderKind, RestartPolicy, TunnelBinding, UnitKind, UnitStatus,
};
