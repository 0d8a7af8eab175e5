//! Rendering of run reports and workload listings.

use chrono::{DateTime, Utc};
use comfy_table::{presets::UTF8_FULL, Cell, Color, Table};
use loadtest_engine::{RunReport, WorkloadFactory};
use serde::Serialize;

/// JSON document emitted by `run --format json`.
#[derive(Debug, Serialize)]
pub struct RunDocument<'a> {
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    #[serde(flatten)]
    pub report: &'a RunReport,
    pub throughput: f64,
    pub error_rate: f64,
}

impl<'a> RunDocument<'a> {
    pub fn new(report: &'a RunReport, started_at: DateTime<Utc>, completed_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            completed_at,
            report,
            throughput: report.metrics.throughput(),
            error_rate: report.metrics.error_rate(),
        }
    }
}

/// Format a run report as tables.
pub fn format_table(
    report: &RunReport,
    started_at: DateTime<Utc>,
    completed_at: DateTime<Utc>,
) -> String {
    let metrics = &report.metrics;
    let mut output = String::new();

    output.push_str(&format!(
        "Workload '{}' {} ({} -> {})\n",
        report.workload,
        report.state,
        started_at.format("%Y-%m-%d %H:%M:%S UTC"),
        completed_at.format("%H:%M:%S UTC")
    ));

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec![
        "Workers",
        "Connections",
        "Duration",
        "Completed",
        "Errors",
        "Ops/sec",
        "Error rate",
    ]);

    let errors_cell = if metrics.errors == 0 {
        Cell::new("0").fg(Color::Green)
    } else {
        Cell::new(format_number(metrics.errors)).fg(Color::Red)
    };
    table.add_row(vec![
        Cell::new(report.workers),
        Cell::new(report.connections),
        Cell::new(format_duration(metrics.elapsed.as_secs_f64())),
        Cell::new(format_number(metrics.completed)),
        errors_cell,
        Cell::new(format!("{:.1}", metrics.throughput())),
        Cell::new(format!("{:.2}%", metrics.error_rate() * 100.0)),
    ]);
    output.push_str(&table.to_string());
    output.push('\n');

    if let Some(latency) = &metrics.latency {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["Latency", "min", "mean", "p50", "p95", "p99", "max"]);
        table.add_row(vec![
            Cell::new("ms").fg(Color::Cyan),
            Cell::new(format_micros(latency.min_us)),
            Cell::new(format_micros(latency.mean_us)),
            Cell::new(format_micros(latency.p50_us)),
            Cell::new(format_micros(latency.p95_us)),
            Cell::new(format_micros(latency.p99_us)),
            Cell::new(format_micros(latency.max_us)),
        ]);
        output.push('\n');
        output.push_str(&table.to_string());
        output.push_str("\nPercentiles are histogram bucket upper bounds\n");
    }

    if !metrics.error_types.is_empty() {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["Error category", "Count"]);
        for (category, count) in &metrics.error_types {
            table.add_row(vec![
                Cell::new(category).fg(Color::Red),
                Cell::new(format_number(*count)),
            ]);
        }
        output.push('\n');
        output.push_str(&table.to_string());
        output.push('\n');
    }

    if report.cancelled_externally {
        output.push_str("\nRun was interrupted before its duration elapsed\n");
    }
    if report.aborted_workers > 0 {
        output.push_str(&format!(
            "\n{} worker(s) did not stop within the grace period and were aborted\n",
            report.aborted_workers
        ));
    }
    if metrics.late_writes > 0 {
        output.push_str(&format!(
            "\n{} metrics write(s) arrived after the run ended and were discarded\n",
            format_number(metrics.late_writes)
        ));
    }

    output
}

/// One row of `pgstress list`.
#[derive(Debug, Serialize)]
pub struct WorkloadListing {
    pub name: String,
    pub source: String,
    pub description: String,
}

/// Every workload the factory knows, sorted by name.
pub fn workload_listing(factory: &WorkloadFactory) -> Vec<WorkloadListing> {
    factory
        .registry()
        .entries()
        .map(|(name, source)| WorkloadListing {
            name: name.to_string(),
            source: source.describe(),
            description: source.description().to_string(),
        })
        .collect()
}

/// Format the workload listing as a table.
pub fn format_listing(listing: &[WorkloadListing]) -> String {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Workload", "Source", "Description"]);
    for entry in listing {
        let source = if entry.source == "builtin" {
            Cell::new(&entry.source).fg(Color::Green)
        } else {
            Cell::new(&entry.source).fg(Color::Cyan)
        };
        table.add_row(vec![
            Cell::new(&entry.name),
            source,
            Cell::new(&entry.description),
        ]);
    }
    table.to_string()
}

fn format_micros(us: u64) -> String {
    format!("{:.2}", us as f64 / 1000.0)
}

/// Format duration in human-readable format.
fn format_duration(secs: f64) -> String {
    if secs < 60.0 {
        format!("{secs:.1}s")
    } else if secs < 3600.0 {
        let mins = (secs / 60.0).floor();
        let remaining_secs = secs - (mins * 60.0);
        format!("{}m {:02.0}s", mins as u64, remaining_secs)
    } else {
        let hours = (secs / 3600.0).floor();
        let remaining = secs - (hours * 3600.0);
        let mins = (remaining / 60.0).floor();
        format!("{}h {:02}m", hours as u64, mins as u64)
    }
}

/// Format number with thousands separators.
fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().enumerate() {
        if i > 0 && (s.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result
}
