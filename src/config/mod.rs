//! YAML configuration: types, loader and validation.

mod loader;
mod types;

pub use loader::{load_config, load_config_from_str};
pub use types::{
    Config, HotReloadConfig, LoggingConfig, MitmConfig, NotifierConfig, NotifierTlsConfig,
};
