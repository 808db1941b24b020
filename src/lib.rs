// External merge sort engine: chunk an oversized record stream, sort the
// chunks concurrently under an admission-controlled task pool, cascade-merge
// the sorted runs pairwise, stream the last run into the destination.
pub mod chunk;
pub mod config;
pub mod constants;
pub mod merger;
pub mod pool;
pub mod progress;
pub mod record;
pub mod sorter;
pub mod store;
pub mod task;

#[cfg(test)]
mod tests;

// Re-export main types for convenience
pub use config::SortConfig;
pub use progress::{ProgressEvent, ProgressNode, ProgressState};
pub use record::{Comparator, Record};
pub use sorter::{external_sort, ExternalSorter, SortPhase, SortStats};
pub use store::{
    FileStore, MemoryStore, RecordSink, RecordSource, Store, TempDirStoreFactory,
    TempStoreFactory, VecSink, VecSource,
};
