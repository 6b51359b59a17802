//! # Strand Configuration
//!
//! Operator-facing settings for fibers and the location service, with the
//! defaults they fall back to.
//!
//! ## Usage
//!
//! ```rust
//! use strand_config::{defaults, StrandConfig};
//!
//! let config = StrandConfig::default();
//! assert_eq!(config.rpc.timeout_ms, defaults::rpc::TIMEOUT_MS);
//! assert!(config.validate().is_ok());
//! ```

pub mod defaults;
pub mod settings;

pub use settings::{
    load_config, LocationConfig, LockConfig, LoggingConfig, ProcessConfig, RpcConfig,
    StrandConfig, ENV_PREFIX,
};
