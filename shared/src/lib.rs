//! Shared types and utilities for the HWPC pipeline
//!
//! This crate contains the hardware performance counter report model, the
//! validator that turns raw store documents into typed reports, and small
//! utilities used by the puller.

pub mod types;
pub mod utils;
pub mod validate;

// Re-export commonly used types
pub use types::{legacy::*, report::*};
pub use validate::{validate, ValidationError};
