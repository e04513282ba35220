//! Shared blob transfer domain primitives.
//!
//! This crate owns deterministic behavior: credential resolution from an
//! environment snapshot, destination naming, and the transfer result contract.
//! It intentionally excludes object store clients and the async runtime.

pub mod contract;
pub mod credentials;
pub mod naming;
