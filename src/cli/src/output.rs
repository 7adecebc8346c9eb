//! Formatting helpers for CLI output.

use comfy_table::{ContentArrangement, Table};

/// Create a styled table with the given headers.
pub fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.load_preset(comfy_table::presets::NOTHING);
    table.set_header(headers);
    table
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Shorten `algo:hex` to the first 12 hex characters, as `docker pull` does.
/// Anything else is returned unchanged.
pub fn short_digest(item: &str) -> String {
    match item.split_once(':') {
        Some((algo, hex))
            if algo.starts_with("sha") && hex.len() > 12 && hex.bytes().all(|b| b.is_ascii_hexdigit()) =>
        {
            hex[..12].to_string()
        }
        _ => item.to_string(),
    }
}
