//! The `utils` module provides a collection of utility functions and common
//! definitions used across the `mqttd` broker.
//!
//! This module centralizes the error taxonomy and the tracing setup so the
//! broker, the codec and the transport all report failures the same way.

pub mod error;
pub mod logging;

pub use error::{Error, ProtocolError, Result, StoreError};
