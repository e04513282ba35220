pub mod idempotency;
pub mod transfer;
pub mod trigger;
