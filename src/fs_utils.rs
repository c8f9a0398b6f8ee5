//! Filesystem helpers shared by the configuration and trust-store code.

use std::io::Write;
use std::path::Path;

/// Write a file atomically: write to a sibling temp file, fsync, then rename
/// over the destination. A crash mid-write never leaves a truncated file.
pub fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;

    let tmp = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}
