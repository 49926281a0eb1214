//! Gantry Core
//!
//! Core domain types, traits, and error handling for Gantry.
//! This crate has minimal dependencies and defines the shared vocabulary
//! used across all other crates.

pub mod condition;
pub mod definition;
pub mod error;
pub mod interpolation;
pub mod outcome;
pub mod ports;
pub mod report;

pub use error::{Error, Result};
pub use outcome::{NodeState, Outcome};
