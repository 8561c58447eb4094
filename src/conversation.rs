//! Conversation persistence
//!
//! On completion each connection's merged byte stream is written twice:
//! raw, and ANSI-colored with client bytes in red and server bytes in
//! blue. Debug mode adds per-fragment timestamp markers.

use std::fs;
use std::path::{Path, PathBuf};

use colored::Colorize;

use crate::core::Direction;
use crate::error::Result;
use crate::stream::StreamData;

/// Merge fragments of both directions by capture timestamp
pub fn merge_sorted(client: &[StreamData], server: &[StreamData]) -> Vec<StreamData> {
    let mut merged: Vec<StreamData> = client.iter().chain(server.iter()).cloned().collect();
    merged.sort_by_key(|d| d.ts);
    merged
}

/// Render the merged conversation as raw bytes and an ANSI-colored string
pub fn render(merged: &[StreamData], debug: bool) -> (Vec<u8>, String) {
    // Artifacts must carry the color codes even when stdout is not a tty
    colored::control::set_override(true);

    let mut raw = Vec::new();
    let mut colored_out = String::new();

    for frag in merged {
        raw.extend_from_slice(&frag.raw);

        let text = String::from_utf8_lossy(&frag.raw);
        let painted = match frag.dir {
            Direction::ClientToServer => text.red().to_string(),
            Direction::ServerToClient => text.blue().to_string(),
        };
        colored_out.push_str(&painted);
        if debug {
            colored_out.push_str(&format!("\n[{}]\n", frag.ts.to_rfc3339()));
        }
    }

    (raw, colored_out)
}

fn artifact_path(out_dir: &str, ident: &str, extension: &str) -> PathBuf {
    let name = ident.replace(" -> ", "-").replace([':', '/'], "_");
    Path::new(out_dir)
        .join("conversations")
        .join(format!("{name}.{extension}"))
}

/// Write the `<ident>.raw` and `<ident>.ansi` artifacts
pub fn save(out_dir: &str, ident: &str, raw: &[u8], colored_text: &str) -> Result<()> {
    let raw_path = artifact_path(out_dir, ident, "raw");
    if let Some(parent) = raw_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&raw_path, raw)?;
    fs::write(artifact_path(out_dir, ident, "ansi"), colored_text)?;
    Ok(())
}
