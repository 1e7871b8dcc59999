// crates/opal-server/src/config/mod.rs
// Configuration: environment variables + ~/.opal/config.toml

pub mod env;
pub mod file;

pub use env::{EnvConfig, parse_bool_env};
pub use file::OpalConfig;
