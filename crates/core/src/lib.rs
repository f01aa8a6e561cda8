//! Core types for Tessera
//!
//! This crate defines the foundational types shared by every layer:
//! - Error: error taxonomy and `Result` alias
//! - StoreConfig: store-wide configuration (`tessera.toml`)
//! - Record / PutOptions: per-key metadata and write options
//! - ContainerMeta: per-container settings fixed at creation

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod meta;
pub mod record;

pub use config::{CacheBounds, StoreConfig, CONFIG_FILE_NAME};
pub use error::{Error, Result};
pub use meta::{now_millis, now_secs, ContainerMeta};
pub use record::{
    PutOptions, Record, RecordOptions, EOL_NEVER, ID_UNDEFINED, VERSION_INITIAL,
    VERSION_UNDEFINED,
};
