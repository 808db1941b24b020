use anyhow::Result;
use std::cmp::Ordering;

use crate::constants::*;
use crate::progress::ProgressNode;
use crate::record::Comparator;
use crate::store::{RecordSink, RecordSource};

/// Classic 2-way merge of two sorted sources into one sink.
///
/// Output is a multiset union of the inputs: nothing dropped, nothing
/// deduplicated. Equal keys preserve both records, left before right.
/// Returns the number of records written; the sink is flushed before
/// returning.
pub fn merge_records<T: 'static>(
    mut left: Box<dyn RecordSource<T>>,
    mut right: Box<dyn RecordSource<T>>,
    sink: &mut dyn RecordSink<T>,
    comparator: &Comparator<T>,
    total_records: usize,
    progress: Option<&ProgressNode>,
) -> Result<usize> {
    let mut head_left = left.next()?;
    let mut head_right = right.next()?;
    let mut written = 0usize;
    let mut next_tick = MERGE_PROGRESS_INTERVAL_RECORDS;

    loop {
        match (head_left.take(), head_right.take()) {
            (Some(a), Some(b)) => match comparator.compare(&a, &b) {
                Ordering::Less => {
                    sink.write(a)?;
                    written += 1;
                    head_left = left.next()?;
                    head_right = Some(b);
                }
                Ordering::Greater => {
                    sink.write(b)?;
                    written += 1;
                    head_left = Some(a);
                    head_right = right.next()?;
                }
                Ordering::Equal => {
                    sink.write(a)?;
                    sink.write(b)?;
                    written += 2;
                    head_left = left.next()?;
                    head_right = right.next()?;
                }
            },
            (Some(a), None) => {
                sink.write(a)?;
                written += 1;
                head_left = left.next()?;
            }
            (None, Some(b)) => {
                sink.write(b)?;
                written += 1;
                head_right = right.next()?;
            }
            (None, None) => break,
        }

        if written >= next_tick {
            next_tick += MERGE_PROGRESS_INTERVAL_RECORDS;
            if let Some(node) = progress {
                let percent = (written * 100 / total_records.max(1)).min(99) as u8;
                node.set_percent(percent);
            }
        }
    }

    sink.flush()?;
    Ok(written)
}
