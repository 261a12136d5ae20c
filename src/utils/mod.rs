//! The `utils` module provides a collection of utility functions and common
//! definitions used across the `switchyard` application.
//!
//! This module centralizes the error types and the logging setup so the rest
//! of the crate shares one error surface and one subscriber configuration.

pub mod error;
pub mod logging;

pub use error::BrokerError;
