pub mod reactive_cache;

pub use reactive_cache::{CacheEvent, CacheKey, ReactiveCache};
