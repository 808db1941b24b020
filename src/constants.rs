pub const DEFAULT_PRELOAD_SLACK: usize = 1;
pub const DEFAULT_MEMORY_USAGE_PERCENT: f64 = 60.0;
pub const DEFAULT_BYTES_PER_RECORD_ESTIMATE: usize = 256;
pub const DEFAULT_IO_BUFFER_SIZE_KB: usize = 64;
pub const DEFAULT_FALLBACK_THREADS: usize = 4;

pub const MIN_SORT_THREADS: usize = 1;
pub const MAX_SORT_THREADS: usize = 64;
pub const MAX_PRELOAD_SLACK: usize = 8;
pub const MIN_MEMORY_USAGE_PERCENT: f64 = 10.0;
pub const MAX_MEMORY_USAGE_PERCENT: f64 = 90.0;
pub const MIN_IO_BUFFER_SIZE_KB: usize = 4;
pub const MAX_IO_BUFFER_SIZE_KB: usize = 16 * 1024;

pub const MIN_CHUNK_RECORDS: usize = 1024;
pub const MAX_CHUNK_RECORDS: usize = 64_000_000;
pub const CHUNK_PREALLOC_RECORDS: usize = 65_536;

pub const BYTES_PER_KB: usize = 1024;
pub const BYTES_PER_MB: usize = 1024 * 1024;

pub const MAX_MERGE_DEPTH: usize = 64;
pub const MERGE_PROGRESS_INTERVAL_RECORDS: usize = 8192;
pub const SORT_WRITE_PHASE_PERCENT: u8 = 60;

pub const RUN_FILE_PREFIX: &str = "run_";
pub const RUN_FILE_EXTENSION: &str = ".jsonl";
pub const TEMP_DIR_NAME: &str = "cascade_sort_temp";

pub const SHUTDOWN_CHECK_INTERVAL_MS: u64 = 100;
pub const GRACEFUL_SHUTDOWN_TIMEOUT_MS: u64 = 5000;
