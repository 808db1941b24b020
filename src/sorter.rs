use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::chunk::Chunker;
use crate::config::SortConfig;
use crate::constants::*;
use crate::pool::TaskPool;
use crate::progress::{ProgressNode, ProgressState};
use crate::record::{Comparator, Record};
use crate::store::{RecordSink, RecordSource, Store, TempDirStoreFactory, TempStoreFactory};
use crate::task::{
    run_delete_task, run_merge_task, run_sort_task, trap, Run, TaskEvent, TaskKind, TaskOutcome,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortPhase {
    Idle,
    Chunking,
    SortingAndMerging,
    Finalizing,
    Done,
    Failed,
}

#[derive(Debug, Clone, Default)]
pub struct SortStats {
    pub records_in: usize,
    pub records_out: usize,
    pub chunks_sorted: usize,
    pub merges_completed: usize,
    pub max_merge_depth: usize,
    pub peak_in_flight: usize,
    pub sort_time_ms: u64,
    pub merge_time_ms: u64,
    pub total_time_ms: u64,
}

/// Drives one external sort: chunk the input, sort chunks concurrently
/// under the admission bucket, cascade-merge finished runs pairwise, stream
/// the last run into the destination sink.
pub struct ExternalSorter<T: Record> {
    config: SortConfig,
    factory: Arc<dyn TempStoreFactory<T>>,
    pool: TaskPool,
    root: ProgressNode,
    phase: SortPhase,
}

/// Per-job bookkeeping. Only the coordinator thread touches this; workers
/// communicate through the completion channel.
struct JobState<T> {
    tx: UnboundedSender<TaskEvent<T>>,
    rx: UnboundedReceiver<TaskEvent<T>>,
    slots: Vec<Option<Run<T>>>,
    final_mode: bool,
    final_runs: Vec<Run<T>>,
    outstanding: usize,
    first_error: Option<anyhow::Error>,
    live_stores: HashMap<String, Arc<dyn Store<T>>>,
    level_nodes: Vec<Option<ProgressNode>>,
    cleanup_node: Option<ProgressNode>,
    finalize_leaf: ProgressNode,
    next_chunk_id: usize,
    stats: SortStats,
}

impl<T: Record> ExternalSorter<T> {
    pub fn new(config: SortConfig, factory: Arc<dyn TempStoreFactory<T>>) -> Result<Self> {
        config.validate()?;
        let pool = TaskPool::new(config.num_threads, config.preload_slack);
        Ok(Self {
            config,
            factory,
            pool,
            root: ProgressNode::new_root("external sort"),
            phase: SortPhase::Idle,
        })
    }

    /// Root of the progress tree; attach listeners here.
    pub fn progress(&self) -> ProgressNode {
        self.root.clone()
    }

    pub fn phase(&self) -> SortPhase {
        self.phase
    }

    pub fn config(&self) -> &SortConfig {
        &self.config
    }

    /// Stop admissions and let in-flight tasks drain, bounded by the
    /// configured timeout; stragglers are force-cancelled. The sorter cannot
    /// run further jobs afterwards.
    pub async fn shutdown(&self) -> bool {
        self.pool
            .shutdown(std::time::Duration::from_millis(
                self.config.shutdown_timeout_ms,
            ))
            .await
    }

    /// Sort `input` into `output`, refusing stores that alias the same
    /// resource (the output would be read while written).
    pub async fn sort_stores(
        &mut self,
        input: &dyn Store<T>,
        output: &dyn Store<T>,
        comparator: Comparator<T>,
    ) -> Result<SortStats> {
        if let (Some(input_path), Some(output_path)) = (input.path(), output.path()) {
            if input_path == output_path {
                return Err(anyhow::anyhow!(
                    "input and output stores alias the same resource: {}",
                    input_path.display()
                ));
            }
        }
        let source = input.open_reader()?;
        let mut sink = output.open_writer()?;
        self.sort(source, sink.as_mut(), comparator).await
    }

    /// Run the full job. Returns normally only with the output fully
    /// written and flushed; on error the destination must not be consumed.
    pub async fn sort(
        &mut self,
        source: Box<dyn RecordSource<T>>,
        sink: &mut dyn RecordSink<T>,
        comparator: Comparator<T>,
    ) -> Result<SortStats> {
        self.config.validate()?;
        let started = Instant::now();
        let chunk_records = self.config.effective_chunk_records();

        if self.config.verbose {
            println!(
                "🚀 Starting external sort: {} worker threads, {} admission slots, {} records per chunk",
                self.pool.workers(),
                self.pool.capacity(),
                chunk_records
            );
        }

        let (tx, rx) = unbounded_channel();
        let finalize_leaf = self.root.add_leaf("finalize output");
        let mut job = JobState {
            tx,
            rx,
            slots: (0..MAX_MERGE_DEPTH).map(|_| None).collect(),
            final_mode: false,
            final_runs: Vec::new(),
            outstanding: 0,
            first_error: None,
            live_stores: HashMap::new(),
            level_nodes: Vec::new(),
            cleanup_node: None,
            finalize_leaf,
            next_chunk_id: 0,
            stats: SortStats::default(),
        };

        // Chunk the input, reacting to completions between submissions so
        // merging starts while chunks are still being read.
        self.phase = SortPhase::Chunking;
        let mut chunker = Chunker::new(source, chunk_records);
        loop {
            if job.first_error.is_some() {
                break;
            }
            match chunker.next_chunk() {
                Ok(Some(chunk)) => {
                    job.stats.records_in += chunk.len();
                    self.drain_ready(&mut job, &comparator).await;
                    self.submit_sort(&mut job, chunk, &comparator).await;
                }
                Ok(None) => break,
                Err(error) => {
                    Self::record_failure(&mut job, error);
                    break;
                }
            }
        }

        self.phase = SortPhase::SortingAndMerging;
        self.drain_until_idle(&mut job, &comparator).await;

        // Leftover runs (chunk count not a power of two): merge the lowest
        // remaining depths until a single run survives.
        if job.first_error.is_none() {
            job.final_mode = true;
            for slot in job.slots.iter_mut() {
                if let Some(run) = slot.take() {
                    job.final_runs.push(run);
                }
            }
            while job.final_runs.len() > 1 && job.first_error.is_none() {
                job.final_runs.sort_by_key(|run| run.depth);
                let left = job.final_runs.remove(0);
                let right = job.final_runs.remove(0);
                self.submit_merge(&mut job, left, right, &comparator).await;
                self.drain_until_idle(&mut job, &comparator).await;
            }
        }

        if job.first_error.is_none() {
            self.phase = SortPhase::Finalizing;
            match Self::finalize_output(&self.config, &mut job, sink) {
                Ok(()) => job.finalize_leaf.set_state(ProgressState::Completed),
                Err(error) => {
                    job.finalize_leaf.set_state(ProgressState::Error);
                    Self::record_failure(&mut job, error);
                }
            }
        }

        // Intermediate stores are gone by job end on both paths.
        self.cleanup_temp(&mut job);

        job.stats.total_time_ms = started.elapsed().as_millis() as u64;
        job.stats.peak_in_flight = self.pool.high_water();

        if let Some(error) = job.first_error.take() {
            self.phase = SortPhase::Failed;
            if self.config.verbose {
                println!("🛑 External sort failed: {}", error);
            }
            return Err(error);
        }

        self.phase = SortPhase::Done;
        if self.config.verbose {
            println!(
                "✅ External sort completed: {} records in, {} out, {} chunks, {} merges, {} ms",
                job.stats.records_in,
                job.stats.records_out,
                job.stats.chunks_sorted,
                job.stats.merges_completed,
                job.stats.total_time_ms
            );
        }
        Ok(job.stats)
    }

    fn record_failure(job: &mut JobState<T>, error: anyhow::Error) {
        // First failure wins; later ones would only obscure the cause.
        if job.first_error.is_none() {
            job.first_error = Some(error);
        }
    }

    async fn submit_sort(
        &self,
        job: &mut JobState<T>,
        chunk: Vec<T>,
        comparator: &Comparator<T>,
    ) {
        let output = match self.factory.allocate() {
            Ok(store) => store,
            Err(error) => {
                Self::record_failure(job, error);
                return;
            }
        };
        job.live_stores.insert(output.name(), Arc::clone(&output));

        let chunk_id = job.next_chunk_id;
        job.next_chunk_id += 1;
        let leaf = self
            .level_node(job, 0)
            .add_leaf(format!("sort chunk {} ({} records)", chunk_id, chunk.len()));

        let comparator = comparator.clone();
        let events = job.tx.clone();
        let task_leaf = leaf.clone();
        let work = move || run_sort_task(chunk, output, comparator, leaf);
        match self.pool.submit(trap(TaskKind::Sort, events, task_leaf, work)).await {
            Ok(_handle) => job.outstanding += 1,
            Err(error) => Self::record_failure(job, error),
        }
    }

    async fn submit_merge(
        &self,
        job: &mut JobState<T>,
        left: Run<T>,
        right: Run<T>,
        comparator: &Comparator<T>,
    ) {
        let depth = left.depth.max(right.depth) + 1;
        let output = match self.factory.allocate() {
            Ok(store) => store,
            Err(error) => {
                Self::record_failure(job, error);
                return;
            }
        };
        job.live_stores.insert(output.name(), Arc::clone(&output));
        job.stats.max_merge_depth = job.stats.max_merge_depth.max(depth);

        if self.config.verbose {
            println!(
                "🔗 Merging {} + {} records into a depth-{} run",
                left.records, right.records, depth
            );
        }

        let leaf = self.level_node(job, depth).add_leaf(format!(
            "merge {} + {} records",
            left.records, right.records
        ));

        let comparator = comparator.clone();
        let events = job.tx.clone();
        let task_leaf = leaf.clone();
        let work = move || run_merge_task(left, right, output, comparator, leaf);
        match self.pool.submit(trap(TaskKind::Merge, events, task_leaf, work)).await {
            Ok(_handle) => job.outstanding += 1,
            Err(error) => Self::record_failure(job, error),
        }
    }

    async fn submit_delete(&self, job: &mut JobState<T>, store: Arc<dyn Store<T>>) {
        let leaf = self
            .cleanup_node(job)
            .add_leaf(format!("delete {}", store.name()));
        let events = job.tx.clone();
        let task_leaf = leaf.clone();
        let work = move || run_delete_task(store, leaf);
        match self.pool.submit(trap(TaskKind::Delete, events, task_leaf, work)).await {
            Ok(_handle) => job.outstanding += 1,
            Err(error) => eprintln!("Warning: could not schedule cleanup task: {}", error),
        }
    }

    /// Handle every completion already waiting, without blocking.
    async fn drain_ready(&self, job: &mut JobState<T>, comparator: &Comparator<T>) {
        while let Ok(event) = job.rx.try_recv() {
            self.handle_event(job, event, comparator).await;
        }
    }

    /// Block until every submitted task has reported back.
    async fn drain_until_idle(&self, job: &mut JobState<T>, comparator: &Comparator<T>) {
        while job.outstanding > 0 {
            match job.rx.recv().await {
                Some(event) => self.handle_event(job, event, comparator).await,
                None => break,
            }
        }
    }

    async fn handle_event(
        &self,
        job: &mut JobState<T>,
        event: TaskEvent<T>,
        comparator: &Comparator<T>,
    ) {
        job.outstanding = job.outstanding.saturating_sub(1);
        match event.result {
            Ok(TaskOutcome::Sorted { run, elapsed_ms }) => {
                job.stats.chunks_sorted += 1;
                job.stats.sort_time_ms += elapsed_ms;
                self.place_run(job, run, comparator).await;
            }
            Ok(TaskOutcome::Merged {
                output,
                consumed,
                elapsed_ms,
            }) => {
                job.stats.merges_completed += 1;
                job.stats.merge_time_ms += elapsed_ms;
                if job.first_error.is_none() {
                    for store in consumed {
                        self.submit_delete(job, store).await;
                    }
                }
                self.place_run(job, output, comparator).await;
            }
            Ok(TaskOutcome::Deleted { name }) => {
                job.live_stores.remove(&name);
            }
            Err(error) => match event.kind {
                TaskKind::Delete => {
                    eprintln!("Warning: failed to delete intermediate run: {}", error);
                }
                _ => Self::record_failure(job, error),
            },
        }
    }

    /// The cascade rule: park a run whose depth slot is empty, otherwise
    /// pair it with the parked sibling and merge one level deeper.
    async fn place_run(&self, job: &mut JobState<T>, run: Run<T>, comparator: &Comparator<T>) {
        if job.first_error.is_some() {
            // Store stays registered; the failure path deletes it.
            return;
        }
        if job.final_mode {
            job.final_runs.push(run);
            return;
        }
        if run.depth >= MAX_MERGE_DEPTH {
            Self::record_failure(
                job,
                anyhow::anyhow!(
                    "merge depth {} exceeds the {}-level merge tree",
                    run.depth,
                    MAX_MERGE_DEPTH
                ),
            );
            return;
        }
        match job.slots[run.depth].take() {
            Some(partner) => self.submit_merge(job, partner, run, comparator).await,
            None => {
                let depth = run.depth;
                job.slots[depth] = Some(run);
            }
        }
    }

    fn finalize_output(
        config: &SortConfig,
        job: &mut JobState<T>,
        sink: &mut dyn RecordSink<T>,
    ) -> Result<()> {
        if let Some(run) = job.final_runs.pop() {
            if config.verbose {
                println!("📦 Writing {} records to the destination", run.records);
            }
            let mut reader = run.store.open_reader()?;
            let mut copied = 0usize;
            let mut next_tick = MERGE_PROGRESS_INTERVAL_RECORDS;
            while let Some(record) = reader.next()? {
                sink.write(record)?;
                copied += 1;
                if copied >= next_tick {
                    next_tick += MERGE_PROGRESS_INTERVAL_RECORDS;
                    let percent = (copied * 100 / run.records.max(1)).min(99) as u8;
                    job.finalize_leaf.set_percent(percent);
                }
            }
            sink.flush()?;
            job.stats.records_out = copied;

            let name = run.store.name();
            match run.store.delete() {
                Ok(()) => {
                    job.live_stores.remove(&name);
                }
                Err(error) => {
                    eprintln!("Warning: failed to delete final run {}: {}", name, error);
                }
            }
        } else {
            // Empty input: a valid, flushed, empty output.
            sink.flush()?;
            job.stats.records_out = 0;
        }
        Ok(())
    }

    /// Best-effort deletion of everything still registered. Failures are a
    /// temp-space leak, not a correctness problem; log and keep going.
    fn cleanup_temp(&self, job: &mut JobState<T>) {
        for (name, store) in job.live_stores.drain() {
            if let Err(error) = store.delete() {
                eprintln!("Warning: failed to delete intermediate store {}: {}", name, error);
            }
        }
    }

    fn level_node(&self, job: &mut JobState<T>, depth: usize) -> ProgressNode {
        if job.level_nodes.len() <= depth {
            job.level_nodes.resize_with(depth + 1, || None);
        }
        if let Some(node) = &job.level_nodes[depth] {
            return node.clone();
        }
        let label = if depth == 0 {
            "sort chunks".to_string()
        } else {
            format!("merge level {}", depth)
        };
        let node = self.root.add_aggregate(label);
        job.level_nodes[depth] = Some(node.clone());
        node
    }

    fn cleanup_node(&self, job: &mut JobState<T>) -> ProgressNode {
        if let Some(node) = &job.cleanup_node {
            return node.clone();
        }
        let node = self.root.add_aggregate("cleanup");
        job.cleanup_node = Some(node.clone());
        node
    }
}

/// One-call entry point: scratch runs go to `config.temp_directory`.
pub async fn external_sort<T>(
    source: Box<dyn RecordSource<T>>,
    sink: &mut dyn RecordSink<T>,
    comparator: Comparator<T>,
    config: SortConfig,
) -> Result<SortStats>
where
    T: Record + Serialize + DeserializeOwned,
{
    let factory = Arc::new(TempDirStoreFactory::new(
        config.temp_directory.clone(),
        config.io_buffer_size_bytes(),
    )?);
    let mut sorter = ExternalSorter::new(config, factory)?;
    sorter.sort(source, sink, comparator).await
}
