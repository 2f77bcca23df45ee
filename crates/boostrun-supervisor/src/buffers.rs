//! Buffer discovery in a data root.

use std::fs;
use std::io;
use std::path::Path;

/// Directory the ensemble trainer writes its results to; never a buffer.
const RESULT_DIR: &str = "res";

/// List the buffers stored under `data_root`, sorted.
///
/// Every immediate subdirectory is a buffer, except hidden directories and
/// the ensemble's `res/` output directory.
pub fn discover_buffers(data_root: &Path) -> io::Result<Vec<String>> {
    let mut buffers = Vec::new();

    for entry in fs::read_dir(data_root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }

        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        if name.starts_with('.') || name == RESULT_DIR {
            continue;
        }

        buffers.push(name);
    }

    buffers.sort();
    Ok(buffers)
}
