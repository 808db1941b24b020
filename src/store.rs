use anyhow::Result;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::constants::*;

/// A typed, strictly-forward, single-pass record source.
pub trait RecordSource<T>: Send {
    fn next(&mut self) -> Result<Option<T>>;
}

/// A typed, append-only record sink. Dropping a sink releases its
/// underlying resources on every exit path; call `flush` before relying
/// on the written data.
pub trait RecordSink<T>: Send {
    fn write(&mut self, record: T) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

/// A named, reusable location that can be opened for reading or writing,
/// never both at once. Lifecycle: allocate, write and flush, read, delete.
pub trait Store<T>: Send + Sync {
    fn name(&self) -> String;

    /// Backing path, when the store is file-backed. Used for aliasing checks.
    fn path(&self) -> Option<&Path> {
        None
    }

    fn open_reader(&self) -> Result<Box<dyn RecordSource<T>>>;
    fn open_writer(&self) -> Result<Box<dyn RecordSink<T>>>;
    fn delete(&self) -> Result<()>;
}

/// Allocates scratch stores for intermediate runs.
pub trait TempStoreFactory<T>: Send + Sync {
    fn allocate(&self) -> Result<Arc<dyn Store<T>>>;
}

/// File-backed store holding newline-delimited JSON records.
pub struct FileStore<T> {
    path: PathBuf,
    io_buffer_size: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> FileStore<T> {
    pub fn new(path: PathBuf, io_buffer_size: usize) -> Self {
        Self {
            path,
            io_buffer_size: io_buffer_size.max(BYTES_PER_KB),
            _marker: PhantomData,
        }
    }
}

impl<T: Serialize + DeserializeOwned + Send + 'static> Store<T> for FileStore<T> {
    fn name(&self) -> String {
        self.path.display().to_string()
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }

    fn open_reader(&self) -> Result<Box<dyn RecordSource<T>>> {
        let file = File::open(&self.path)?;
        Ok(Box::new(FileSource {
            reader: BufReader::with_capacity(self.io_buffer_size, file),
            line: String::new(),
            _marker: PhantomData,
        }))
    }

    fn open_writer(&self) -> Result<Box<dyn RecordSink<T>>> {
        let file = File::create(&self.path)?;
        Ok(Box::new(FileSink {
            writer: BufWriter::with_capacity(self.io_buffer_size, file),
            _marker: PhantomData,
        }))
    }

    fn delete(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

struct FileSource<T> {
    reader: BufReader<File>,
    line: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned + Send> RecordSource<T> for FileSource<T> {
    fn next(&mut self) -> Result<Option<T>> {
        loop {
            self.line.clear();
            if self.reader.read_line(&mut self.line)? == 0 {
                return Ok(None);
            }
            let trimmed = self.line.trim_end();
            if trimmed.is_empty() {
                continue;
            }
            return Ok(Some(serde_json::from_str(trimmed)?));
        }
    }
}

struct FileSink<T> {
    writer: BufWriter<File>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Serialize + Send> RecordSink<T> for FileSink<T> {
    fn write(&mut self, record: T) -> Result<()> {
        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// In-memory store, mainly for tests and small inputs.
pub struct MemoryStore<T> {
    name: String,
    records: Arc<Mutex<Vec<T>>>,
}

impl<T> Clone for MemoryStore<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            records: Arc::clone(&self.records),
        }
    }
}

impl<T: Clone + Send + 'static> MemoryStore<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            records: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_records(name: impl Into<String>, records: Vec<T>) -> Self {
        Self {
            name: name.into(),
            records: Arc::new(Mutex::new(records)),
        }
    }

    pub fn contents(&self) -> Vec<T> {
        self.records.lock().clone()
    }
}

impl<T: Clone + Send + Sync + 'static> Store<T> for MemoryStore<T> {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn open_reader(&self) -> Result<Box<dyn RecordSource<T>>> {
        Ok(Box::new(VecSource::new(self.records.lock().clone())))
    }

    fn open_writer(&self) -> Result<Box<dyn RecordSink<T>>> {
        self.records.lock().clear();
        Ok(Box::new(MemorySink {
            records: Arc::clone(&self.records),
        }))
    }

    fn delete(&self) -> Result<()> {
        self.records.lock().clear();
        Ok(())
    }
}

struct MemorySink<T> {
    records: Arc<Mutex<Vec<T>>>,
}

impl<T: Send> RecordSink<T> for MemorySink<T> {
    fn write(&mut self, record: T) -> Result<()> {
        self.records.lock().push(record);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Adapts an owned `Vec` into a record source.
pub struct VecSource<T> {
    items: std::vec::IntoIter<T>,
}

impl<T> VecSource<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items: items.into_iter(),
        }
    }
}

impl<T: Send> RecordSource<T> for VecSource<T> {
    fn next(&mut self) -> Result<Option<T>> {
        Ok(self.items.next())
    }
}

/// Collects written records into a shared `Vec`, for tests and callers that
/// want the sorted output in memory.
pub struct VecSink<T> {
    records: Arc<Mutex<Vec<T>>>,
}

impl<T> VecSink<T> {
    pub fn new() -> Self {
        Self {
            records: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn handle(&self) -> Arc<Mutex<Vec<T>>> {
        Arc::clone(&self.records)
    }
}

impl<T> Default for VecSink<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> RecordSink<T> for VecSink<T> {
    fn write(&mut self, record: T) -> Result<()> {
        self.records.lock().push(record);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Allocates counter-named run files (`run_<n>.jsonl`) under one directory.
pub struct TempDirStoreFactory {
    directory: PathBuf,
    io_buffer_size: usize,
    counter: AtomicUsize,
}

impl TempDirStoreFactory {
    pub fn new(directory: PathBuf, io_buffer_size: usize) -> Result<Self> {
        std::fs::create_dir_all(&directory)?;
        Ok(Self {
            directory,
            io_buffer_size,
            counter: AtomicUsize::new(0),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

impl<T: Serialize + DeserializeOwned + Send + 'static> TempStoreFactory<T> for TempDirStoreFactory {
    fn allocate(&self) -> Result<Arc<dyn Store<T>>> {
        let id = self.counter.fetch_add(1, Ordering::Relaxed);
        let path = self
            .directory
            .join(format!("{}{}{}", RUN_FILE_PREFIX, id, RUN_FILE_EXTENSION));
        Ok(Arc::new(FileStore::new(path, self.io_buffer_size)))
    }
}
