//! # TantoKV Core
//!
//! This crate provides the fundamental building blocks for TantoKV:
//! - Error types shared by the engine and the wire surfaces
//! - Configuration loading (environment variables with sane defaults)
//! - The per-database credential store
//! - Admission control for the wire surfaces
//! - Operation metrics
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                   tanto-core                    │
//! ├─────────────────────────────────────────────────┤
//! │  • error      - Error handling                  │
//! │  • config     - Configuration surface           │
//! │  • auth       - API key store & validation      │
//! │  • admission  - In-flight request bounds        │
//! │  • metrics    - Operation counters              │
//! │  • utils      - Shared helpers                  │
//! └─────────────────────────────────────────────────┘
//! ```

pub mod admission;
pub mod auth;
pub mod config;
pub mod error;
pub mod metrics;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
