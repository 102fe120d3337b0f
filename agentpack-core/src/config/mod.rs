//! Configuration module for agentpack.
//!
//! Settings are read from a JSON file; anything not set falls back to defaults.

mod settings;

pub use settings::Settings;
