//! Configuration loading and engine bootstrap.

pub mod bootstrap;
pub mod config;

pub use bootstrap::{build_engine, build_pool, load_config, resolve_config_path, watch_debounce};
pub use config::Config;
