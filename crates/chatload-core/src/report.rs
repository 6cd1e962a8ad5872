use crate::error::RunError;
use crate::metrics::{LatencyRecord, LatencyStatistics, PhaseReport, ThroughputBucket, BUCKET_SECS};
use crate::orchestrator::RunSummary;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use tracing::info;

pub const LATENCY_HEADER: [&str; 5] = ["timestamp", "messageType", "latency", "statusCode", "roomId"];
pub const THROUGHPUT_HEADER: [&str; 3] = ["time_seconds", "messages", "throughput_per_second"];

/// One row per latency record, in log order. Returns the number of rows written.
pub fn write_latency_csv<W: Write>(records: &[LatencyRecord], writer: W) -> Result<usize, RunError> {
    let mut csv = csv::Writer::from_writer(writer);
    csv.write_record(LATENCY_HEADER)?;
    for r in records {
        csv.write_record([
            r.timestamp_ms.to_string(),
            r.message_type.to_string(),
            r.latency_ms.to_string(),
            r.status.to_string(),
            r.room.to_string(),
        ])?;
    }
    csv.flush()?;
    Ok(records.len())
}

pub fn write_throughput_csv<W: Write>(buckets: &[ThroughputBucket], writer: W) -> Result<usize, RunError> {
    let mut csv = csv::Writer::from_writer(writer);
    csv.write_record(THROUGHPUT_HEADER)?;
    for b in buckets {
        csv.write_record([
            b.start_secs.to_string(),
            b.messages.to_string(),
            format!("{:.1}", b.per_second()),
        ])?;
    }
    csv.flush()?;
    Ok(buckets.len())
}

pub fn export_latency(records: &[LatencyRecord], path: &Path) -> Result<(), RunError> {
    let rows = write_latency_csv(records, create(path)?)?;
    info!("Latency CSV written: {} ({} records)", path.display(), rows);
    Ok(())
}

pub fn export_throughput(buckets: &[ThroughputBucket], path: &Path) -> Result<(), RunError> {
    let rows = write_throughput_csv(buckets, create(path)?)?;
    info!("Throughput CSV written: {} ({} buckets)", path.display(), rows);
    Ok(())
}

fn create(path: &Path) -> Result<File, RunError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    Ok(File::create(path)?)
}

fn banner(title: &str) {
    println!();
    println!("========================================");
    println!("  {title}");
    println!("========================================");
}

fn rule() {
    println!("========================================");
}

pub fn print_phase_report(report: &PhaseReport) {
    banner(&format!("{} Phase Results", report.phase));
    println!("  Successful messages : {}", report.successes);
    println!("  Failed messages     : {}", report.failures);
    println!("  Total runtime       : {:.2} seconds", report.duration_secs);
    println!("  Throughput          : {:.0} msg/s", report.throughput);
    println!("  Connections opened  : {}", report.connections);
    println!("  Reconnections       : {}", report.reconnections);
    rule();
}

pub fn print_statistics(stats: &LatencyStatistics) {
    banner("Latency Statistics");
    println!("  Samples       : {} ({:?})", stats.count, stats.policy);
    if stats.failures_in_sample > 0 {
        println!("  Failures (-1) : {}", stats.failures_in_sample);
    }
    println!("  Mean          : {:.2} ms", stats.mean_ms);
    println!("  Median        : {} ms", stats.median_ms);
    println!("  P95           : {} ms", stats.p95_ms);
    println!("  P99           : {} ms", stats.p99_ms);
    println!("  Min           : {} ms", stats.min_ms);
    println!("  Max           : {} ms", stats.max_ms);
    rule();

    banner("Throughput Per Room");
    for (room, count) in &stats.per_room {
        println!("  Room {:2} : {} messages", room, count);
    }
    rule();

    banner("Message Type Distribution");
    let total = stats.total_records.max(1) as f64;
    for (message_type, count) in &stats.per_type {
        println!(
            "  {:<6} : {} ({:.1}%)",
            message_type.as_str(),
            count,
            100.0 * *count as f64 / total
        );
    }
    rule();
}

pub fn print_throughput_over_time(buckets: &[ThroughputBucket]) {
    if buckets.is_empty() {
        return;
    }
    banner(&format!("Throughput Over Time ({BUCKET_SECS}s buckets)"));
    println!("  Time(s)   | Messages | Throughput(msg/s)");
    println!("  ----------+----------+------------------");
    for b in buckets {
        println!(
            "  {:4}-{:4} | {:8} | {:.0} msg/s",
            b.start_secs,
            b.start_secs + BUCKET_SECS,
            b.messages,
            b.per_second()
        );
    }
    rule();
}

pub fn print_run_summary(summary: &RunSummary) {
    print_phase_report(&summary.warmup);
    print_phase_report(&summary.main);

    banner("Overall Summary");
    println!("  Total successful    : {}", summary.total_success);
    println!("  Total failed        : {}", summary.total_fail);
    println!("  Total wall time     : {:.2} seconds", summary.wall_time_secs);
    println!("  Overall throughput  : {:.0} msg/s", summary.throughput);
    println!("  Total connections   : {}", summary.connections);
    println!("  Reconnections       : {}", summary.reconnections);
    rule();

    if let Some(stats) = &summary.statistics {
        print_statistics(stats);
    }
    print_throughput_over_time(&summary.throughput_over_time);
}
