//! The `utils` module provides a collection of utility functions and common
//! definitions used across the `edgebus` crate.
//!
//! This module centralizes the crate-wide error type and logging setup.

pub mod error;
pub mod logging;

pub use error::{BusError, Result};
