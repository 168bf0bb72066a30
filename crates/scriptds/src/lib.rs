//! scriptds - script-module query datasource
//!
//! This crate lets a typed query host delegate query logic to a JavaScript
//! module and turns the module's loosely-typed output back into typed frames:
//! - Request translation from host queries (`request`)
//! - Script environments, in-process or in a `scriptds-host` process (`runtime`)
//! - The load / resolve / call / await bridge (`bridge`)
//! - Result decoding into columnar frames (`decode`)
//! - Query and health entry points plus instance management

pub mod bridge;
pub mod config;
pub mod datasource;
pub mod decode;
pub mod error;
pub mod frame;
pub mod host;
pub mod instance;
pub mod request;
pub mod runtime;

pub use bridge::Bridge;
pub use config::{load_plugin_settings, PluginSettings, RuntimeSettings, Strategy};
pub use datasource::Datasource;
pub use decode::decode;
pub use error::{BridgeError, ConfigError, DecodeError};
pub use instance::InstanceManager;
pub use request::{translate, CanonicalRequest};
