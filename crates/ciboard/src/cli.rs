//! CLI output formatting for cache maintenance commands

use ciboard_core::store::StoreStats;
use comfy_table::{Cell, ContentArrangement, Table};

/// Format cache statistics as a table or JSON.
pub fn format_stats(stats: &StoreStats, json: bool) -> String {
    if json {
        return serde_json::json!({
            "totalEntries": stats.total_entries,
            "liveEntries": stats.live_entries,
            "totalSizeBytes": stats.total_size_bytes,
            "namespaceCount": stats.namespace_count,
            "evictions": stats.evictions,
        })
        .to_string();
    }

    let mut table = Table::new();
    table
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Metric", "Value"]);

    table.add_row(vec![
        Cell::new("Entries"),
        Cell::new(stats.total_entries.to_string()),
    ]);
    table.add_row(vec![
        Cell::new("Live entries"),
        Cell::new(stats.live_entries.to_string()),
    ]);
    table.add_row(vec![
        Cell::new("Size"),
        Cell::new(format_size(stats.total_size_bytes as u64)),
    ]);
    table.add_row(vec![
        Cell::new("Namespaces"),
        Cell::new(stats.namespace_count.to_string()),
    ]);
    table.add_row(vec![
        Cell::new("Evictions"),
        Cell::new(stats.evictions.to_string()),
    ]);

    table.to_string()
}

pub fn format_size(bytes: u64) -> String {
    if bytes >= 1_048_576 {
        format!("{:.1}MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1_024 {
        format!("{:.1}KB", bytes as f64 / 1_024.0)
    } else {
        format!("{}B", bytes)
    }
}
