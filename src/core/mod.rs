//! Core module - error handling, configuration, clock helpers

pub mod config;
pub mod error;
pub mod time;

pub use config::{AdapterConfig, ConfigFile, Opts};
pub use error::{Error, Result};
