//! Ratekeeper - Request Rate Limiting
//!
//! This crate classifies inbound HTTP requests into route classes, derives a
//! per-client counter key and decides each request against a shared sliding
//! log store, degrading to in-process fixed windows when the shared store is
//! unavailable. The limiter fails open: an internal fault never rejects a
//! request.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
