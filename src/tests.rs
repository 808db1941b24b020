use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

use crate::config::SortConfig;
use crate::progress::ProgressState;
use crate::record::Comparator;
use crate::sorter::{external_sort, ExternalSorter, SortPhase, SortStats};
use crate::store::{TempDirStoreFactory, VecSink, VecSource};

fn shuffled(count: usize) -> Vec<i64> {
    let mut values: Vec<i64> = (0..count as i64).collect();
    let mut state = 0x2545_F491_4F6C_DD1Du64;
    for i in (1..values.len()).rev() {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        let j = ((state >> 33) as usize) % (i + 1);
        values.swap(i, j);
    }
    values
}

fn config_for(temp: &Path, chunk_records: usize, threads: usize) -> SortConfig {
    let mut config = SortConfig::default();
    config.temp_directory = temp.join("runs");
    config.max_chunk_records = Some(chunk_records);
    config.num_threads = threads;
    config.preload_slack = 1;
    config.verbose = false;
    config
}

async fn sort_values(
    values: Vec<i64>,
    chunk_records: usize,
    threads: usize,
) -> (SortStats, Vec<i64>, usize) {
    let dir = tempdir().unwrap();
    let config = config_for(dir.path(), chunk_records, threads);
    let runs_dir = config.temp_directory.clone();

    let mut sink = VecSink::new();
    let collected = sink.handle();
    let stats = external_sort(
        Box::new(VecSource::new(values)),
        &mut sink,
        Comparator::natural(),
        config,
    )
    .await
    .unwrap();

    let leftover_runs = std::fs::read_dir(&runs_dir)
        .map(|entries| entries.count())
        .unwrap_or(0);
    let output = collected.lock().clone();
    (stats, output, leftover_runs)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_sorts_random_input_across_eleven_chunks() {
    let (stats, output, leftover_runs) = sort_values(shuffled(10_050), 1000, 4).await;

    assert_eq!(stats.records_in, 10_050);
    assert_eq!(stats.records_out, 10_050);
    assert_eq!(stats.chunks_sorted, 11);
    // Pairwise merging of n runs always takes exactly n - 1 merges.
    assert_eq!(stats.merges_completed, 10);

    let expected: Vec<i64> = (0..10_050).collect();
    assert_eq!(output, expected);
    assert_eq!(leftover_runs, 0, "intermediate runs must be deleted by job end");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_empty_input_yields_empty_flushed_output() {
    let (stats, output, leftover_runs) = sort_values(Vec::new(), 1000, 4).await;

    assert_eq!(stats.records_in, 0);
    assert_eq!(stats.records_out, 0);
    assert_eq!(stats.chunks_sorted, 0);
    assert_eq!(stats.merges_completed, 0);
    assert!(output.is_empty());
    assert_eq!(leftover_runs, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_admission_bound_is_respected() {
    let (stats, _, _) = sort_values(shuffled(5_000), 200, 4).await;
    // 4 workers + 1 preload slack.
    assert!(stats.peak_in_flight <= 5, "peak was {}", stats.peak_in_flight);
    assert!(stats.peak_in_flight >= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_chunk_size_does_not_change_output() {
    let values: Vec<i64> = shuffled(300).into_iter().map(|v| v % 47).collect();

    let mut outputs = Vec::new();
    for chunk_records in [1usize, 7, 64, 1000] {
        let (_, output, _) = sort_values(values.clone(), chunk_records, 3).await;
        outputs.push(output);
    }
    for output in &outputs[1..] {
        assert_eq!(output, &outputs[0]);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_sorting_sorted_input_is_idempotent() {
    let (_, first, _) = sort_values(shuffled(2_000), 128, 2).await;
    let (_, second, _) = sort_values(first.clone(), 128, 2).await;
    assert_eq!(first, second);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_duplicates_survive_as_a_multiset() {
    let values: Vec<i64> = shuffled(1_000).into_iter().map(|v| v % 10).collect();
    let (stats, output, _) = sort_values(values.clone(), 100, 3).await;

    assert_eq!(stats.records_out, values.len());
    let mut expected = values;
    expected.sort();
    assert_eq!(output, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_panicking_comparator_fails_the_job() {
    let dir = tempdir().unwrap();
    let config = config_for(dir.path(), 100, 2);
    let runs_dir = config.temp_directory.clone();

    let comparator: Comparator<i64> = Comparator::new(|a: &i64, b: &i64| {
        if *a == 13 || *b == 13 {
            panic!("comparator blew up");
        }
        a.cmp(b)
    });

    let mut sink = VecSink::new();
    let result = external_sort(
        Box::new(VecSource::new(shuffled(500))),
        &mut sink,
        comparator,
        config,
    )
    .await;

    let error = result.err().expect("job must fail, output must not be trusted");
    assert!(error.to_string().contains("comparator blew up"));

    let leftover_runs = std::fs::read_dir(&runs_dir)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftover_runs, 0, "failure path must clean up intermediate runs");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_progress_is_monotone_and_completes_with_the_job() {
    let dir = tempdir().unwrap();
    let config = config_for(dir.path(), 250, 3);
    let factory = Arc::new(
        TempDirStoreFactory::new(config.temp_directory.clone(), config.io_buffer_size_bytes())
            .unwrap(),
    );
    let mut sorter: ExternalSorter<i64> = ExternalSorter::new(config, factory).unwrap();

    let percents = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&percents);
    sorter
        .progress()
        .add_listener(move |event| recorded.lock().push(event.percent));

    let mut sink = VecSink::new();
    sorter
        .sort(
            Box::new(VecSource::new(shuffled(3_000))),
            &mut sink,
            Comparator::natural(),
        )
        .await
        .unwrap();

    assert_eq!(sorter.phase(), SortPhase::Done);
    assert_eq!(sorter.progress().percent(), 100);
    assert_eq!(sorter.progress().state(), ProgressState::Completed);

    let seen = percents.lock().clone();
    assert!(!seen.is_empty());
    assert_eq!(*seen.last().unwrap(), 100);
    for window in seen.windows(2) {
        assert!(window[0] <= window[1], "progress regressed: {:?}", seen);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_phase_is_failed_after_an_error() {
    let dir = tempdir().unwrap();
    let config = config_for(dir.path(), 50, 2);
    let factory = Arc::new(
        TempDirStoreFactory::new(config.temp_directory.clone(), config.io_buffer_size_bytes())
            .unwrap(),
    );
    let mut sorter: ExternalSorter<i64> = ExternalSorter::new(config, factory).unwrap();

    let comparator: Comparator<i64> = Comparator::new(|_, _| panic!("always broken"));
    let mut sink = VecSink::new();
    let result = sorter
        .sort(
            Box::new(VecSource::new(shuffled(200))),
            &mut sink,
            comparator,
        )
        .await;

    assert!(result.is_err());
    assert_eq!(sorter.phase(), SortPhase::Failed);
}
