//! Capture result formatters (text tables and JSON).

use crate::error::ApiError;
use crate::tree::{CapturedImage, Dentry};
use crate::volume::filetime_to_datetime;
use comfy_table::Table;
use serde::Serialize;
use serde_json::json;

/// Digest prefix length shown in tables
const SHORT_DIGEST_LEN: usize = 16;

/// One listed manifest node
#[derive(Debug, Serialize)]
struct EntryRow {
    path: String,
    kind: &'static str,
    size: Option<u64>,
    digest: Option<String>,
    named_streams: usize,
    security_id: Option<u32>,
    modified: Option<String>,
}

fn entry_kind(node: &Dentry) -> &'static str {
    if node.is_reparse_point() {
        "reparse"
    } else if node.is_directory() {
        "dir"
    } else {
        "file"
    }
}

fn entry_rows(image: &CapturedImage) -> Vec<EntryRow> {
    let mut rows = Vec::with_capacity(image.root.node_count());
    image.root.walk(&mut |path, node| {
        let record = node.stream.as_ref().and_then(|hash| image.streams.get(hash));
        rows.push(EntryRow {
            path: path.to_string(),
            kind: entry_kind(node),
            size: record.map(|r| r.size()),
            digest: node.stream.map(hex::encode),
            named_streams: node.named_streams.len(),
            security_id: node.security_id,
            modified: filetime_to_datetime(node.last_write_time).map(|t| t.to_rfc3339()),
        });
    });
    rows
}

pub fn format_capture_text(device: &str, image: &CapturedImage, list: bool) -> String {
    let stats = &image.stats;
    let mut table = Table::new();
    table.load_preset(comfy_table::presets::UTF8_FULL);
    table.set_header(vec!["Capture", device]);
    let rows: Vec<(&str, String)> = vec![
        ("Objects", stats.objects.to_string()),
        ("Directories", stats.directories.to_string()),
        ("Files", stats.files.to_string()),
        ("Reparse points", stats.reparse_points.to_string()),
        ("Named streams", stats.named_streams.to_string()),
        ("Unique streams", stats.unique_streams.to_string()),
        ("Shared references", stats.shared_references.to_string()),
        ("Inline streams", stats.inline_streams.to_string()),
        ("Bytes hashed", stats.bytes_hashed.to_string()),
        ("Unique bytes", image.streams.unique_bytes().to_string()),
        ("Security descriptors", stats.security_descriptors.to_string()),
        ("Security table bytes", image.security.total_length().to_string()),
        ("Duration (ms)", stats.duration_ms.to_string()),
    ];
    for (label, value) in rows {
        table.add_row(vec![label.to_string(), value]);
    }
    let mut out = table.to_string();

    if list {
        let mut entries = Table::new();
        entries.load_preset(comfy_table::presets::UTF8_FULL);
        entries.set_header(vec!["Path", "Kind", "Size", "Digest", "ADS", "SecID", "Modified"]);
        for row in entry_rows(image) {
            let digest = row
                .digest
                .map(|d| d[..SHORT_DIGEST_LEN].to_string())
                .unwrap_or_else(|| "-".to_string());
            entries.add_row(vec![
                row.path,
                row.kind.to_string(),
                row.size.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string()),
                digest,
                row.named_streams.to_string(),
                row.security_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                row.modified.unwrap_or_else(|| "-".to_string()),
            ]);
        }
        out.push('\n');
        out.push_str(&entries.to_string());
    }
    out
}

pub fn format_capture_json(
    device: &str,
    image: &CapturedImage,
    list: bool,
) -> Result<String, ApiError> {
    let mut out = json!({
        "device": device,
        "stats": image.stats,
        "unique_bytes": image.streams.unique_bytes(),
        "security_table_bytes": image.security.total_length(),
    });
    if list {
        out["entries"] = json!(entry_rows(image));
    }
    serde_json::to_string_pretty(&out).map_err(|e| ApiError::Output(e.to_string()))
}
