//! Cache configuration with production-ready defaults
//!
//! Configuration for the identity-map cache: session kind, per-type map
//! variant defaults, lock timeouts, and strict synchronization switches.

pub mod types;

pub use types::{
    CacheConfig, ConfigError, IdentityMapKind, SessionKind, SweepErrorPolicy,
};
