pub mod backoff;
pub mod cfg;
pub mod client;
pub mod committee;
pub mod contracts;
pub mod crypto;
pub mod error;
pub mod node;
pub mod period;
pub mod pool;
pub mod registry;
pub mod shard;
pub mod shutdown;
pub mod vote;
