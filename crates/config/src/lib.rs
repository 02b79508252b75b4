//! rffmpeg configuration
//!
//! TOML file sections, their defaults, and `RFFMPEG_*` environment overrides.

pub mod config;

pub use config::*;
