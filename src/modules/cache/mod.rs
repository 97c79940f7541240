pub mod fingerprint;
pub mod memory_cache;
pub mod ttl_cache;

pub use fingerprint::fingerprint;
pub use memory_cache::MemoryCache;
pub use ttl_cache::{CachedPayload, FetchOptions, TtlCache};
