//! # Ingest Testing Utils
//!
//! Shared testing utilities for the processing supervisor workspace:
//! in-memory mocks of every repository and collaborator trait, test data
//! builders and a manually advanced clock.
//!
//! ```toml
//! [dev-dependencies]
//! ingest-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod helpers;
pub mod mocks;

// Re-export commonly used items
pub use builders::*;
pub use helpers::*;
pub use mocks::*;
