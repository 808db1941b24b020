use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::constants::*;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortConfig {
    pub num_threads: usize,
    pub preload_slack: usize,
    pub max_chunk_records: Option<usize>,
    pub memory_usage_percent: f64,
    pub bytes_per_record_estimate: usize,
    pub io_buffer_size_kb: usize,
    pub temp_directory: PathBuf,
    pub shutdown_timeout_ms: u64,
    pub verbose: bool,
}

impl Default for SortConfig {
    fn default() -> Self {
        Self {
            num_threads: hardware_parallelism(),
            preload_slack: DEFAULT_PRELOAD_SLACK,
            max_chunk_records: None,
            memory_usage_percent: DEFAULT_MEMORY_USAGE_PERCENT,
            bytes_per_record_estimate: DEFAULT_BYTES_PER_RECORD_ESTIMATE,
            io_buffer_size_kb: DEFAULT_IO_BUFFER_SIZE_KB,
            temp_directory: std::env::temp_dir().join(TEMP_DIR_NAME),
            shutdown_timeout_ms: GRACEFUL_SHUTDOWN_TIMEOUT_MS,
            verbose: false,
        }
    }
}

impl SortConfig {
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_file(&self, path: &std::path::Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_threads < MIN_SORT_THREADS || self.num_threads > MAX_SORT_THREADS {
            return Err(anyhow::anyhow!(
                "Worker threads must be between {} and {}",
                MIN_SORT_THREADS,
                MAX_SORT_THREADS
            ));
        }

        if self.num_threads > hardware_parallelism() {
            eprintln!(
                "Warning: {} worker threads configured but only {} hardware threads detected",
                self.num_threads,
                hardware_parallelism()
            );
        }

        if self.preload_slack > MAX_PRELOAD_SLACK {
            return Err(anyhow::anyhow!(
                "Preload slack must be at most {}",
                MAX_PRELOAD_SLACK
            ));
        }

        if self.memory_usage_percent < MIN_MEMORY_USAGE_PERCENT
            || self.memory_usage_percent > MAX_MEMORY_USAGE_PERCENT
        {
            return Err(anyhow::anyhow!(
                "Memory usage percent must be between {} and {}",
                MIN_MEMORY_USAGE_PERCENT,
                MAX_MEMORY_USAGE_PERCENT
            ));
        }

        if self.bytes_per_record_estimate == 0 {
            return Err(anyhow::anyhow!("Bytes-per-record estimate must be positive"));
        }

        if self.io_buffer_size_kb < MIN_IO_BUFFER_SIZE_KB
            || self.io_buffer_size_kb > MAX_IO_BUFFER_SIZE_KB
        {
            return Err(anyhow::anyhow!(
                "I/O buffer size must be between {} and {} KB",
                MIN_IO_BUFFER_SIZE_KB,
                MAX_IO_BUFFER_SIZE_KB
            ));
        }

        if let Some(max_chunk_records) = self.max_chunk_records {
            if max_chunk_records == 0 || max_chunk_records > MAX_CHUNK_RECORDS {
                return Err(anyhow::anyhow!(
                    "Chunk size must be between 1 and {} records",
                    MAX_CHUNK_RECORDS
                ));
            }
        }

        Ok(())
    }

    /// Records per chunk: the explicit setting, or an estimate sized so that
    /// `num_threads + preload_slack` chunks fit in the memory budget at once.
    pub fn effective_chunk_records(&self) -> usize {
        if let Some(max_chunk_records) = self.max_chunk_records {
            return max_chunk_records.max(1);
        }

        use sysinfo::System;
        let mut system = System::new_all();
        system.refresh_memory();

        let budget = system.available_memory() as f64 * self.memory_usage_percent / 100.0;
        let per_slot =
            self.bytes_per_record_estimate * (self.num_threads + self.preload_slack).max(1);
        let records = (budget as usize) / per_slot.max(1);
        records.clamp(MIN_CHUNK_RECORDS, MAX_CHUNK_RECORDS)
    }

    /// Admission bucket size: runnable workers plus preload headroom.
    pub fn admission_capacity(&self) -> usize {
        self.num_threads + self.preload_slack
    }

    pub fn io_buffer_size_bytes(&self) -> usize {
        self.io_buffer_size_kb * BYTES_PER_KB
    }
}

pub fn hardware_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(DEFAULT_FALLBACK_THREADS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_is_valid() {
        let config = SortConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_bounds() {
        let mut config = SortConfig::default();
        config.num_threads = 0;
        assert!(config.validate().is_err());

        config.num_threads = MAX_SORT_THREADS + 1;
        assert!(config.validate().is_err());

        config.num_threads = 2;
        config.memory_usage_percent = 5.0;
        assert!(config.validate().is_err());

        config.memory_usage_percent = 95.0;
        assert!(config.validate().is_err());

        config.memory_usage_percent = 50.0;
        config.max_chunk_records = Some(0);
        assert!(config.validate().is_err());

        config.max_chunk_records = Some(1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_explicit_chunk_size_wins() {
        let mut config = SortConfig::default();
        config.max_chunk_records = Some(123);
        assert_eq!(config.effective_chunk_records(), 123);
    }

    #[test]
    fn test_estimated_chunk_size_is_clamped() {
        let mut config = SortConfig::default();
        config.max_chunk_records = None;
        let records = config.effective_chunk_records();
        assert!(records >= MIN_CHUNK_RECORDS);
        assert!(records <= MAX_CHUNK_RECORDS);
    }

    #[test]
    fn test_admission_capacity() {
        let mut config = SortConfig::default();
        config.num_threads = 4;
        config.preload_slack = 1;
        assert_eq!(config.admission_capacity(), 5);
    }

    #[test]
    fn test_config_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = SortConfig::default();
        config.num_threads = 3;
        config.max_chunk_records = Some(4096);
        config.to_file(&path).unwrap();

        let loaded = SortConfig::from_file(&path).unwrap();
        assert_eq!(loaded.num_threads, 3);
        assert_eq!(loaded.max_chunk_records, Some(4096));
    }
}
