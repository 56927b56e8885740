//! Core crate for bulkgen: job store, worker, generation adapters, client
//! queue and the HTTP surface.

pub mod api;
pub mod backoff;
pub mod client_queue;
pub mod config;
pub mod events;
pub mod generation;
pub mod logging;
pub mod prompt_import;
pub mod rate_limit;
pub mod server;
pub mod store;
pub mod types;
pub mod worker;
pub mod write_back;
