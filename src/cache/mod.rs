//! Result cache: structured keys, typed values and the backing stores.

pub mod keyed;
pub mod keys;
pub mod store;

pub use keyed::KeyedCache;
pub use keys::{CacheKey, CronJobKey, ProxyKey, ProxyResultKey, TesterType};
pub use store::{KvStore, MemoryStore, SqliteStore};
