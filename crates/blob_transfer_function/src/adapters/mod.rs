pub mod azure;
pub mod client_cache;
pub mod object_store;
