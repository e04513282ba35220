pub use blob_transfer_core::{contract, credentials, naming};
