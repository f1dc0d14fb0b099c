//! Local supervisor core: durable process records, pub/sub topics, log
//! tailing, the HTTP fetch cache and the app build orchestrator.

pub mod compiler;
pub mod error;
pub mod health;
pub mod http_cache;
pub mod platform;
pub mod port_alloc;
pub mod process_manager;
pub mod pubsub;
pub mod settings;
pub mod store;

mod log_tail;

pub use kestrel_process as process;
