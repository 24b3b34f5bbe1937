mod in_memory;
mod log;
mod segmented;

pub use in_memory::InMemoryLog;
pub use log::index_as_u64;
pub use log::Entry;
pub use log::Index;
pub use log::Log;
pub use segmented::LogSyncPolicy;
pub use segmented::SegmentedDiskLog;
pub use segmented::SegmentedLogOptions;
