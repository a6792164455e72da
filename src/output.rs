//! Files a run leaves at the top of its output directory.

use std::fs;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use crate::errors::IoContext;
use crate::errors::StoreError;
use crate::trace::delete_trace_files;

/// Extensions of files a fresh run clears from the output directory.
const OUTPUT_EXTENSIONS: [&str; 6] = ["csv", "txt", "json", "prom", "yaml", "prof"];

/// Remove what a previous run left in `output_dir`: its trace files
/// and every top level file with an output extension, except those
/// named in `keep`. Subdirectories are left alone.
pub fn delete_output_files(output_dir: &Path, keep: &[&str]) -> Result<usize, StoreError> {
    let mut removed = delete_trace_files(output_dir)?;
    if !output_dir.exists() {
        return Ok(removed);
    }
    for entry in fs::read_dir(output_dir).reraise_at("can't list output dir", output_dir)? {
        let path = entry.reraise_at("can't list output dir", output_dir)?.path();
        if !path.is_file() {
            continue;
        }
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        if OUTPUT_EXTENSIONS.contains(&ext) && !keep.contains(&name) {
            fs::remove_file(&path).reraise_at("can't remove output file", &path)?;
            removed += 1;
        }
    }
    tracing::info!("Removed {removed} output files of a previous run from {output_dir:?}");
    Ok(removed)
}

/// Append `lines` to a CSV file, writing `header` first when the file
/// is new or empty.
pub(crate) fn append_csv(path: &Path, header: &str, lines: &str) -> Result<(), StoreError> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .reraise_at("can't open log file", path)?;
    let empty = file.metadata().reraise_at("can't stat log file", path)?.len() == 0;
    let mut text = String::with_capacity(header.len() + lines.len());
    if empty {
        text.push_str(header);
    }
    text.push_str(lines);
    file.write_all(text.as_bytes())
        .reraise_at("can't append to log file", path)
}
