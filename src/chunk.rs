use anyhow::Result;

use crate::constants::*;
use crate::store::RecordSource;

/// Splits a record source into bounded-size batches in encounter order.
/// Lazy, finite, non-restartable; each chunk is sorted later by a sort task.
pub struct Chunker<T> {
    source: Box<dyn RecordSource<T>>,
    max_records: usize,
    exhausted: bool,
    chunks_produced: usize,
    records_read: usize,
}

impl<T> Chunker<T> {
    pub fn new(source: Box<dyn RecordSource<T>>, max_records: usize) -> Self {
        Self {
            source,
            max_records: max_records.max(1),
            exhausted: false,
            chunks_produced: 0,
            records_read: 0,
        }
    }

    pub fn next_chunk(&mut self) -> Result<Option<Vec<T>>> {
        if self.exhausted {
            return Ok(None);
        }

        let mut chunk = Vec::with_capacity(self.max_records.min(CHUNK_PREALLOC_RECORDS));
        while chunk.len() < self.max_records {
            match self.source.next()? {
                Some(record) => chunk.push(record),
                None => {
                    self.exhausted = true;
                    break;
                }
            }
        }

        if chunk.is_empty() {
            return Ok(None);
        }

        self.chunks_produced += 1;
        self.records_read += chunk.len();
        Ok(Some(chunk))
    }

    pub fn chunks_produced(&self) -> usize {
        self.chunks_produced
    }

    pub fn records_read(&self) -> usize {
        self.records_read
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::VecSource;

    fn chunker_over(values: Vec<i32>, max_records: usize) -> Chunker<i32> {
        Chunker::new(Box::new(VecSource::new(values)), max_records)
    }

    #[test]
    fn test_exact_division() {
        let mut chunker = chunker_over((0..9).collect(), 3);
        assert_eq!(chunker.next_chunk().unwrap().unwrap().len(), 3);
        assert_eq!(chunker.next_chunk().unwrap().unwrap().len(), 3);
        assert_eq!(chunker.next_chunk().unwrap().unwrap().len(), 3);
        assert!(chunker.next_chunk().unwrap().is_none());
        assert_eq!(chunker.chunks_produced(), 3);
        assert_eq!(chunker.records_read(), 9);
    }

    #[test]
    fn test_remainder_chunk() {
        let mut chunker = chunker_over((0..10).collect(), 4);
        assert_eq!(chunker.next_chunk().unwrap().unwrap().len(), 4);
        assert_eq!(chunker.next_chunk().unwrap().unwrap().len(), 4);
        assert_eq!(chunker.next_chunk().unwrap().unwrap().len(), 2);
        assert!(chunker.next_chunk().unwrap().is_none());
    }

    #[test]
    fn test_empty_source() {
        let mut chunker = chunker_over(Vec::new(), 8);
        assert!(chunker.next_chunk().unwrap().is_none());
        assert_eq!(chunker.chunks_produced(), 0);
    }

    #[test]
    fn test_preserves_encounter_order() {
        let mut chunker = chunker_over(vec![5, 3, 8, 1], 2);
        assert_eq!(chunker.next_chunk().unwrap().unwrap(), vec![5, 3]);
        assert_eq!(chunker.next_chunk().unwrap().unwrap(), vec![8, 1]);
    }

    #[test]
    fn test_single_record_chunks() {
        let mut chunker = chunker_over(vec![2, 1], 1);
        assert_eq!(chunker.next_chunk().unwrap().unwrap(), vec![2]);
        assert_eq!(chunker.next_chunk().unwrap().unwrap(), vec![1]);
        assert!(chunker.next_chunk().unwrap().is_none());
    }
}
