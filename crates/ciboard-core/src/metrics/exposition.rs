//! Text exposition rendering for aggregated snapshots
//!
//! Formats an [`AggregatedSnapshot`] in the Prometheus text exposition
//! format: a `# TYPE` header per family, one `name{labels} value` line
//! per counter series, and cumulative `_bucket`/`_sum`/`_count` lines per
//! histogram series.

use crate::metrics::{AggregatedSnapshot, SampleValue};
use std::collections::BTreeMap;
use std::fmt::Write;

/// Content type served by the scrape endpoint.
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Render a snapshot to exposition text.
pub fn render(snapshot: &AggregatedSnapshot) -> String {
    let mut out = String::new();
    let mut last_family: Option<&str> = None;

    // Samples are sorted by (name, labels), so a family's series are
    // contiguous and the TYPE header is emitted once per family.
    for sample in &snapshot.samples {
        if last_family != Some(sample.name.as_str()) {
            let kind = match sample.value {
                SampleValue::Counter { .. } => "counter",
                SampleValue::Histogram { .. } => "histogram",
            };
            let _ = writeln!(out, "# TYPE {} {}", sample.name, kind);
            last_family = Some(sample.name.as_str());
        }

        match &sample.value {
            SampleValue::Counter { value } => {
                let _ = writeln!(
                    out,
                    "{}{} {}",
                    sample.name,
                    format_labels(&sample.labels, None),
                    value
                );
            }
            SampleValue::Histogram {
                bounds,
                counts,
                sum,
                count,
            } => {
                let mut cumulative: u64 = 0;
                for (bound, bucket) in bounds.iter().zip(counts.iter()) {
                    cumulative += bucket;
                    let _ = writeln!(
                        out,
                        "{}_bucket{} {}",
                        sample.name,
                        format_labels(&sample.labels, Some(("le", &format_value(*bound)))),
                        cumulative
                    );
                }
                cumulative += counts.last().copied().unwrap_or(0);
                let _ = writeln!(
                    out,
                    "{}_bucket{} {}",
                    sample.name,
                    format_labels(&sample.labels, Some(("le", "+Inf"))),
                    cumulative
                );
                let _ = writeln!(
                    out,
                    "{}_sum{} {}",
                    sample.name,
                    format_labels(&sample.labels, None),
                    format_value(*sum)
                );
                let _ = writeln!(
                    out,
                    "{}_count{} {}",
                    sample.name,
                    format_labels(&sample.labels, None),
                    count
                );
            }
        }
    }

    out
}

fn format_labels(labels: &BTreeMap<String, String>, extra: Option<(&str, &str)>) -> String {
    if labels.is_empty() && extra.is_none() {
        return String::new();
    }

    let mut parts: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, escape_label_value(v)))
        .collect();
    if let Some((k, v)) = extra {
        parts.push(format!("{}=\"{}\"", k, escape_label_value(v)));
    }

    format!("{{{}}}", parts.join(","))
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn format_value(v: f64) -> String {
    // f64 Display renders the shortest round-trip form (8.0 -> "8")
    format!("{}", v)
}
