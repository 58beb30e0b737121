//! Recon Common Library
//!
//! Shared building blocks for the reconciliation workspace members:
//!
//! - **Fingerprints**: truncated SHA-256 content hashes
//! - **Logging**: `tracing` subscriber setup for binaries
//!
//! # Example
//!
//! ```
//! use recon_common::fingerprint::fingerprint;
//!
//! let hash = fingerprint(&["OP-1", "100.00", "2025-01-01 10:00:00", "ACC-1"]);
//! assert_eq!(hash.len(), 16);
//! ```
#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod fingerprint;
pub mod logging;
