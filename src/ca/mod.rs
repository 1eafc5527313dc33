//! CA certificate management for CONNECT tunnel interception.
//!
//! This module provides CA generation or loading and per-host certificate caching.

mod generator;

pub use generator::{CaError, CaResult, CaState, CertCache};
