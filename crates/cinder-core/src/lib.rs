//! Cinder Core
//!
//! Core domain types, traits, and error handling for the Cinder task
//! scheduler. This crate has minimal dependencies and defines the shared
//! vocabulary used across all other crates.

pub mod error;
pub mod ids;
pub mod job;
pub mod ports;
pub mod spec;
pub mod status;
pub mod task;

pub use error::{Error, Result};
pub use ids::*;
