//! Types shared between syswatch modules and the agent embedding them:
//! module configuration and kernel constants.

pub mod config;
pub mod kernel;

pub use config::{ConfigError, ModuleConfig};
