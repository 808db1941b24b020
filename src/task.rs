use anyhow::Result;
use rayon::prelude::*;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;

use crate::constants::*;
use crate::merger::merge_records;
use crate::progress::{ProgressNode, ProgressState};
use crate::record::{Comparator, Record};
use crate::store::Store;

/// A store known to hold sorted records, tagged with its merge-tree depth
/// (0 = freshly sorted chunk, d+1 = merge of two depth-d runs).
pub struct Run<T> {
    pub store: Arc<dyn Store<T>>,
    pub depth: usize,
    pub records: usize,
}

impl<T> Clone for Run<T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            depth: self.depth,
            records: self.records,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskKind {
    Sort,
    Merge,
    Delete,
}

pub enum TaskOutcome<T> {
    Sorted {
        run: Run<T>,
        elapsed_ms: u64,
    },
    Merged {
        output: Run<T>,
        consumed: [Arc<dyn Store<T>>; 2],
        elapsed_ms: u64,
    },
    Deleted {
        name: String,
    },
}

/// One completion report per pool-managed task. Worker-thread failures are
/// carried here instead of being thrown at the coordinator's stack.
pub struct TaskEvent<T> {
    pub kind: TaskKind,
    pub result: Result<TaskOutcome<T>>,
}

/// Wrap task work so every exit path, panics included, turns into exactly
/// one event on the completion channel. Trapping never throws.
pub fn trap<T, F>(
    kind: TaskKind,
    events: UnboundedSender<TaskEvent<T>>,
    progress: ProgressNode,
    work: F,
) -> impl FnOnce() + Send + 'static
where
    T: Record,
    F: FnOnce() -> Result<TaskOutcome<T>> + Send + 'static,
{
    move || {
        let result = match catch_unwind(AssertUnwindSafe(work)) {
            Ok(result) => result,
            Err(payload) => Err(anyhow::anyhow!("task panicked: {}", panic_message(&payload))),
        };
        if result.is_err() {
            progress.set_state(ProgressState::Error);
        }
        let _ = events.send(TaskEvent { kind, result });
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Sort one materialized chunk and spill it as a depth-0 run.
pub fn run_sort_task<T: Record>(
    mut records: Vec<T>,
    output: Arc<dyn Store<T>>,
    comparator: Comparator<T>,
    progress: ProgressNode,
) -> Result<TaskOutcome<T>> {
    let started = Instant::now();
    progress.set_state(ProgressState::Running);

    records.par_sort_by(|a, b| comparator.compare(a, b));
    progress.set_percent(SORT_WRITE_PHASE_PERCENT);

    let count = records.len();
    let mut writer = output.open_writer()?;
    for record in records {
        writer.write(record)?;
    }
    writer.flush()?;
    drop(writer);

    progress.set_state(ProgressState::Completed);
    Ok(TaskOutcome::Sorted {
        run: Run {
            store: output,
            depth: 0,
            records: count,
        },
        elapsed_ms: started.elapsed().as_millis() as u64,
    })
}

/// Merge two sorted runs into one run a level deeper. The inputs are
/// reported back as consumed so the coordinator can schedule their deletion.
pub fn run_merge_task<T: Record>(
    left: Run<T>,
    right: Run<T>,
    output: Arc<dyn Store<T>>,
    comparator: Comparator<T>,
    progress: ProgressNode,
) -> Result<TaskOutcome<T>> {
    let started = Instant::now();
    progress.set_state(ProgressState::Running);

    let reader_left = left.store.open_reader()?;
    let reader_right = right.store.open_reader()?;
    let mut writer = output.open_writer()?;
    let total = left.records + right.records;
    let written = merge_records(
        reader_left,
        reader_right,
        writer.as_mut(),
        &comparator,
        total,
        Some(&progress),
    )?;
    drop(writer);

    let depth = left.depth.max(right.depth) + 1;
    progress.set_state(ProgressState::Completed);
    Ok(TaskOutcome::Merged {
        output: Run {
            store: output,
            depth,
            records: written,
        },
        consumed: [left.store, right.store],
        elapsed_ms: started.elapsed().as_millis() as u64,
    })
}

/// Delete one consumed store. Scheduled through the pool so cleanup shows
/// up in the progress tree and in the failure-trapping discipline.
pub fn run_delete_task<T: Record>(
    store: Arc<dyn Store<T>>,
    progress: ProgressNode,
) -> Result<TaskOutcome<T>> {
    progress.set_state(ProgressState::Running);
    let name = store.name();
    store.delete()?;
    progress.set_state(ProgressState::Completed);
    Ok(TaskOutcome::Deleted { name })
}
