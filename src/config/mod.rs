//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → TracerConfig (validated, immutable)
//!     → InstrumentationConfig handed to host::install
//!     → ObservabilityConfig handed to logging/metrics init
//! ```
//!
//! Inside a worker, the tracing runtime deserializes an
//! [`InstrumentationConfig`] from the options object passed to `prepare`.
//!
//! # Design Decisions
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{InstrumentationConfig, LogFormat, ObservabilityConfig, TracerConfig};
pub use validation::{validate_config, ValidationError};
