//! Azure-oriented adapters and handlers for the processed-PDF transfer function.
//!
//! This crate owns runtime integration details (the custom handler entry point,
//! the object store client cache, and the blob store adapter) and exposes a
//! single runtime module boundary for credential, naming, and contract
//! primitives.

pub mod adapters;
pub mod config;
pub mod handlers;
pub mod runtime;
