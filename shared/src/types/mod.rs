//! Report data structures

pub mod legacy;
pub mod report;
