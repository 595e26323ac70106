//! Human-readable output helpers for the CLI.

use std::time::{SystemTime, UNIX_EPOCH};

use storage::FileEntry;

/// Format a byte count with binary units, e.g. `1.5 MiB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

/// Seconds since the Unix epoch, or 0 for earlier times.
fn epoch_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Render a directory listing as an aligned table.
pub fn format_listing(entries: &[FileEntry]) -> String {
    if entries.is_empty() {
        return "Empty directory.\n".to_string();
    }

    let name_width = entries
        .iter()
        .map(|e| e.name.len() + usize::from(e.is_dir))
        .max()
        .unwrap_or(4)
        .max(4);

    let mut out = format!("{:<name_width$}  {:>10}  {:>12}\n", "NAME", "SIZE", "MODIFIED");
    for entry in entries {
        let name = if entry.is_dir {
            format!("{}/", entry.name)
        } else {
            entry.name.clone()
        };
        let size = if entry.is_dir {
            "-".to_string()
        } else {
            format_bytes(entry.size)
        };
        out.push_str(&format!(
            "{:<name_width$}  {:>10}  {:>12}\n",
            name,
            size,
            epoch_secs(entry.modified)
        ));
    }
    out
}
