use anyhow::Result;
use clap::Parser;
use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering as AtomicOrdering};
use std::sync::Arc;

use cascade_sort::{
    Comparator, ExternalSorter, RecordSink, RecordSource, SortConfig, TempDirStoreFactory,
};

#[derive(Parser)]
#[command(name = "cascade-sort")]
#[command(about = "🌊 Cascade Sort: external merge sort for line files of any size")]
#[command(version)]
struct Args {
    #[arg(help = "Input file, one record per line")]
    input: PathBuf,

    #[arg(help = "Output file for the sorted records")]
    output: PathBuf,

    #[arg(short, long, help = "Worker threads (defaults to hardware parallelism)")]
    threads: Option<usize>,

    #[arg(long, help = "Records per chunk (defaults to a memory-based estimate)")]
    chunk_records: Option<usize>,

    #[arg(long, help = "Directory for intermediate runs")]
    temp_dir: Option<PathBuf>,

    #[arg(short, long, help = "Compare lines numerically, falling back to text order")]
    numeric: bool,

    #[arg(short, long, help = "Reverse the sort order")]
    reverse: bool,

    #[arg(short, long, help = "Verbose output")]
    verbose: bool,
}

struct LineSource {
    reader: BufReader<File>,
    buffer: String,
}

impl RecordSource<String> for LineSource {
    fn next(&mut self) -> Result<Option<String>> {
        self.buffer.clear();
        if self.reader.read_line(&mut self.buffer)? == 0 {
            return Ok(None);
        }
        while self.buffer.ends_with('\n') || self.buffer.ends_with('\r') {
            self.buffer.pop();
        }
        Ok(Some(self.buffer.clone()))
    }
}

struct LineSink {
    writer: BufWriter<File>,
}

impl RecordSink<String> for LineSink {
    fn write(&mut self, record: String) -> Result<()> {
        writeln!(self.writer, "{}", record)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

fn numeric_then_text(a: &String, b: &String) -> Ordering {
    match (a.trim().parse::<f64>(), b.trim().parse::<f64>()) {
        (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => a.cmp(b),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if !args.input.exists() {
        anyhow::bail!("Input file does not exist: {}", args.input.display());
    }

    let mut config = SortConfig::default();
    if let Some(threads) = args.threads {
        config.num_threads = threads;
    }
    if args.chunk_records.is_some() {
        config.max_chunk_records = args.chunk_records;
    }
    if let Some(temp_dir) = args.temp_dir {
        config.temp_directory = temp_dir;
    }
    config.verbose = args.verbose;
    config.validate()?;

    let mut comparator: Comparator<String> = if args.numeric {
        Comparator::new(numeric_then_text)
    } else {
        Comparator::natural()
    };
    if args.reverse {
        comparator = comparator.reversed();
    }

    let source = Box::new(LineSource {
        reader: BufReader::new(File::open(&args.input)?),
        buffer: String::new(),
    });
    let mut sink = LineSink {
        writer: BufWriter::new(File::create(&args.output)?),
    };

    println!(
        "🚀 Sorting {} into {}",
        args.input.display(),
        args.output.display()
    );

    let factory = Arc::new(TempDirStoreFactory::new(
        config.temp_directory.clone(),
        config.io_buffer_size_bytes(),
    )?);
    let mut sorter: ExternalSorter<String> = ExternalSorter::new(config, factory)?;

    if args.verbose {
        let last_printed = Arc::new(AtomicU8::new(0));
        sorter.progress().add_listener(move |event| {
            let previous = last_printed.load(AtomicOrdering::Relaxed);
            if event.percent >= previous.saturating_add(5) || event.percent == 100 {
                last_printed.store(event.percent, AtomicOrdering::Relaxed);
                println!("⏳ Progress: {}% ({:?})", event.percent, event.state);
            }
        });
    }

    let stats = sorter.sort(source, &mut sink, comparator).await?;

    println!(
        "✅ Sorted {} records in {} ms ({} chunks, {} merges, peak {} tasks in flight)",
        stats.records_out,
        stats.total_time_ms,
        stats.chunks_sorted,
        stats.merges_completed,
        stats.peak_in_flight
    );

    Ok(())
}
