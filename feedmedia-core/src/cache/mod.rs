pub mod disk;
pub mod live;
pub mod store;

pub use disk::{DiskLimits, DiskSpillover, SweepReport};
pub use live::{LiveCacheControl, LiveHandleCache, LiveResource};
pub use store::{CachePayload, ResourceStore, StorePolicy, partial_count};
