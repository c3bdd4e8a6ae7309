//! Response caching for offline reads.
//!
//! This module keeps the last known payload of each remote resource so that:
//! - cache-first reads can skip the network
//! - failed network reads degrade to stale data
//! - writes are reflected locally before the remote confirms them

mod layer;
mod traits;

pub use layer::ResponseCache;
pub use traits::{CachedEntry, KeyScope};
